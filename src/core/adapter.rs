//! Per-provider wire adapters
//!
//! Each provider dialect gets one small adapter implementing a uniform
//! contract: endpoint layout, auth headers, outbound payload shaping, and
//! inbound event parsing. The relay never branches on provider identity;
//! it asks the registry for the provider record and this module for the
//! matching adapter.
//!
//! `parse_event` is total: wire noise (keep-alives, unknown event kinds,
//! unparseable payloads) maps to `Ignored` and never terminates a session.

use base64::Engine;
use serde_json::{json, Value};

use crate::api::{
    AnthropicRequestBody, AnthropicStreamEvent, ChatRequestBody, ChatResponse, WireMessage,
};
use crate::core::config::GenerationParams;
use crate::core::constants::MAX_INLINE_IMAGE_BYTES;
use crate::core::error::GatewayError;
use crate::core::message::{Message, MessageContent, MessagePart, Role};
use crate::core::provider::{Provider, SystemPromptStyle};
use crate::utils::url::construct_api_url;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// One normalized unit of provider output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamIncrement {
    Token(String),
    Done,
    Error(String),
    Ignored,
}

pub trait ProviderAdapter: Send + Sync {
    fn chat_endpoint(&self, base_url: &str) -> String;
    fn models_endpoint(&self, base_url: &str) -> String;
    fn apply_auth(
        &self,
        request: reqwest::RequestBuilder,
        api_key: &str,
    ) -> reqwest::RequestBuilder;
    fn request_body(
        &self,
        provider: &Provider,
        messages: &[Message],
        system_prompt: Option<&str>,
        model: &str,
        params: &GenerationParams,
    ) -> Value;
    fn parse_event(&self, payload: &str) -> StreamIncrement;
}

static OPENAI_ADAPTER: OpenAiAdapter = OpenAiAdapter;
static ANTHROPIC_ADAPTER: AnthropicAdapter = AnthropicAdapter;

/// Select the adapter matching a provider's wire dialect.
pub fn adapter_for(provider: &Provider) -> &'static dyn ProviderAdapter {
    if provider.is_anthropic_mode() {
        &ANTHROPIC_ADAPTER
    } else {
        &OPENAI_ADAPTER
    }
}

/// Reject inline media the relay cannot safely forward: non-HTTP schemes,
/// malformed data URLs, and oversized inline payloads.
pub fn validate_image_ref(url: &str) -> Result<(), GatewayError> {
    if let Some((_, payload)) = parse_data_url(url) {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|_| GatewayError::invalid_spec("image data URL is not valid base64"))?;
        if decoded.len() > MAX_INLINE_IMAGE_BYTES {
            return Err(GatewayError::invalid_spec(format!(
                "inline image of {} bytes exceeds the {} byte limit",
                decoded.len(),
                MAX_INLINE_IMAGE_BYTES
            )));
        }
        return Ok(());
    }
    if url.starts_with("data:") {
        return Err(GatewayError::invalid_spec(
            "image data URL must be base64-encoded",
        ));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(());
    }
    Err(GatewayError::invalid_spec(format!(
        "unsupported image URL scheme in '{url}'"
    )))
}

fn parse_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (media_type, payload) = rest.split_once(";base64,")?;
    Some((media_type, payload))
}

/// Pull a terse human-readable summary out of a provider error payload.
pub(crate) fn extract_error_summary(value: &Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                Value::String(s) => Some(s.to_string()),
                Value::Object(map) => map
                    .get("message")
                    .and_then(|message| message.as_str().map(str::to_owned)),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary.map(|text| {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.trim().to_string()
    })
}

/// Human-readable rendering of an upstream error body, JSON or not.
pub(crate) fn format_upstream_error(error_text: &str) -> String {
    let trimmed = error_text.trim();
    if trimmed.is_empty() {
        return "upstream returned an empty error body".to_string();
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(summary) = extract_error_summary(&value) {
            if !summary.is_empty() {
                return summary;
            }
        }
    }
    trimmed.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub struct OpenAiAdapter;

impl OpenAiAdapter {
    fn content_value(provider: &Provider, content: &MessageContent) -> Value {
        match content {
            MessageContent::Text(text) => Value::String(text.clone()),
            MessageContent::Parts(parts) if provider.supports_vision => {
                let values: Vec<Value> = parts
                    .iter()
                    .map(|part| match part {
                        MessagePart::Text { text } => json!({"type": "text", "text": text}),
                        MessagePart::ImageUrl { image_url } => {
                            json!({"type": "image_url", "image_url": {"url": image_url.url}})
                        }
                    })
                    .collect();
                Value::Array(values)
            }
            MessageContent::Parts(_) => {
                tracing::debug!(
                    provider = %provider.name,
                    "degrading multi-part message to text for non-vision provider"
                );
                Value::String(content.flattened_text())
            }
        }
    }
}

impl ProviderAdapter for OpenAiAdapter {
    fn chat_endpoint(&self, base_url: &str) -> String {
        construct_api_url(base_url, "chat/completions")
    }

    fn models_endpoint(&self, base_url: &str) -> String {
        construct_api_url(base_url, "models")
    }

    fn apply_auth(
        &self,
        request: reqwest::RequestBuilder,
        api_key: &str,
    ) -> reqwest::RequestBuilder {
        request.header("Authorization", format!("Bearer {api_key}"))
    }

    fn request_body(
        &self,
        provider: &Provider,
        messages: &[Message],
        system_prompt: Option<&str>,
        model: &str,
        params: &GenerationParams,
    ) -> Value {
        let mut wire: Vec<WireMessage> = Vec::with_capacity(messages.len() + 1);
        let merge_into_first_user = matches!(
            provider.effective_system_prompt_style(),
            SystemPromptStyle::MergeFirstUser
        );

        if let Some(prompt) = system_prompt.filter(|p| !p.is_empty()) {
            if !merge_into_first_user {
                wire.push(WireMessage {
                    role: Role::System.as_str().to_string(),
                    content: Value::String(prompt.to_string()),
                });
            }
        }

        let mut pending_merge = merge_into_first_user
            .then(|| system_prompt.filter(|p| !p.is_empty()))
            .flatten();

        for message in messages {
            let mut content = Self::content_value(provider, &message.content);
            if message.role == Role::User {
                if let Some(prompt) = pending_merge.take() {
                    content = merge_prompt_into_content(prompt, content);
                }
            }
            wire.push(WireMessage {
                role: message.role.as_str().to_string(),
                content,
            });
        }

        let body = ChatRequestBody {
            model: model.to_string(),
            messages: wire,
            stream: true,
            temperature: Some(params.temperature),
            top_p: Some(params.top_p),
            max_tokens: Some(params.max_tokens),
            presence_penalty: Some(params.presence_penalty),
            frequency_penalty: Some(params.frequency_penalty),
        };
        serde_json::to_value(body).expect("chat request body serializes")
    }

    fn parse_event(&self, payload: &str) -> StreamIncrement {
        if payload == "[DONE]" {
            return StreamIncrement::Done;
        }

        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(_) => return StreamIncrement::Ignored,
        };

        if value.get("error").is_some() {
            let message = extract_error_summary(&value)
                .unwrap_or_else(|| format_upstream_error(payload));
            return StreamIncrement::Error(message);
        }

        match serde_json::from_value::<ChatResponse>(value) {
            Ok(response) => match response
                .choices
                .first()
                .and_then(|choice| choice.delta.content.clone())
            {
                Some(content) if !content.is_empty() => StreamIncrement::Token(content),
                _ => StreamIncrement::Ignored,
            },
            Err(_) => StreamIncrement::Ignored,
        }
    }
}

fn merge_prompt_into_content(prompt: &str, content: Value) -> Value {
    match content {
        Value::String(text) => Value::String(format!("{prompt}\n\n{text}")),
        Value::Array(mut parts) => {
            parts.insert(0, json!({"type": "text", "text": prompt}));
            Value::Array(parts)
        }
        other => other,
    }
}

pub struct AnthropicAdapter;

impl AnthropicAdapter {
    fn content_blocks(provider: &Provider, content: &MessageContent) -> Vec<Value> {
        match content {
            MessageContent::Text(text) => vec![json!({"type": "text", "text": text})],
            MessageContent::Parts(parts) if provider.supports_vision => parts
                .iter()
                .map(|part| match part {
                    MessagePart::Text { text } => json!({"type": "text", "text": text}),
                    MessagePart::ImageUrl { image_url } => image_block(&image_url.url),
                })
                .collect(),
            MessageContent::Parts(_) => {
                tracing::debug!(
                    provider = %provider.name,
                    "degrading multi-part message to text for non-vision provider"
                );
                vec![json!({"type": "text", "text": content.flattened_text()})]
            }
        }
    }
}

fn image_block(url: &str) -> Value {
    match parse_data_url(url) {
        Some((media_type, payload)) => json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": media_type,
                "data": payload,
            }
        }),
        None => json!({
            "type": "image",
            "source": {"type": "url", "url": url}
        }),
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn chat_endpoint(&self, base_url: &str) -> String {
        construct_api_url(base_url, "messages")
    }

    fn models_endpoint(&self, base_url: &str) -> String {
        construct_api_url(base_url, "models")
    }

    fn apply_auth(
        &self,
        request: reqwest::RequestBuilder,
        api_key: &str,
    ) -> reqwest::RequestBuilder {
        request
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }

    fn request_body(
        &self,
        provider: &Provider,
        messages: &[Message],
        system_prompt: Option<&str>,
        model: &str,
        params: &GenerationParams,
    ) -> Value {
        // System content is a top-level field in this dialect; system-role
        // history messages fold into it as well.
        let mut system_parts: Vec<String> = Vec::new();
        if let Some(prompt) = system_prompt.filter(|p| !p.is_empty()) {
            system_parts.push(prompt.to_string());
        }

        let mut wire: Vec<WireMessage> = Vec::with_capacity(messages.len());
        for message in messages {
            if message.role == Role::System {
                system_parts.push(message.content.flattened_text());
                continue;
            }
            wire.push(WireMessage {
                role: message.role.as_str().to_string(),
                content: Value::Array(Self::content_blocks(provider, &message.content)),
            });
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };

        let body = AnthropicRequestBody {
            model: model.to_string(),
            max_tokens: params.max_tokens,
            messages: wire,
            stream: true,
            system,
            temperature: Some(params.temperature),
            top_p: Some(params.top_p),
        };
        serde_json::to_value(body).expect("anthropic request body serializes")
    }

    fn parse_event(&self, payload: &str) -> StreamIncrement {
        let event: AnthropicStreamEvent = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(_) => return StreamIncrement::Ignored,
        };

        match event.kind.as_str() {
            "content_block_delta" => match event.delta.and_then(|delta| delta.text) {
                Some(text) if !text.is_empty() => StreamIncrement::Token(text),
                _ => StreamIncrement::Ignored,
            },
            "message_stop" => StreamIncrement::Done,
            "error" => {
                let message = event
                    .error
                    .and_then(|body| body.message)
                    .unwrap_or_else(|| "unspecified provider error".to_string());
                StreamIncrement::Error(message)
            }
            // ping, message_start, content_block_start, message_delta,
            // content_block_stop, and anything newer.
            _ => StreamIncrement::Ignored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::ImageRef;
    use crate::utils::test_utils::sample_provider;

    fn params() -> GenerationParams {
        GenerationParams {
            temperature: 0.7,
            top_p: 1.0,
            max_tokens: 256,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
        }
    }

    fn vision_provider() -> Provider {
        Provider {
            supports_vision: true,
            ..sample_provider()
        }
    }

    fn multipart_message() -> Message {
        Message {
            role: Role::User,
            content: MessageContent::Parts(vec![
                MessagePart::Text {
                    text: "what is this".into(),
                },
                MessagePart::ImageUrl {
                    image_url: ImageRef {
                        url: "https://example.com/cat.png".into(),
                    },
                },
            ]),
        }
    }

    #[test]
    fn openai_system_prompt_uses_dedicated_role() {
        let provider = sample_provider();
        let body = OpenAiAdapter.request_body(
            &provider,
            &[Message::text(Role::User, "hi")],
            Some("be brief"),
            "demo-mini",
            &params(),
        );

        assert_eq!(body["model"], "demo-mini");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "be brief");
        assert_eq!(body["messages"][1]["role"], "user");
    }

    #[test]
    fn openai_system_prompt_merges_into_first_user_turn() {
        let provider = Provider {
            system_prompt_style: Some(SystemPromptStyle::MergeFirstUser),
            ..sample_provider()
        };
        let messages = [
            Message::text(Role::Assistant, "welcome"),
            Message::text(Role::User, "hi"),
        ];
        let body =
            OpenAiAdapter.request_body(&provider, &messages, Some("be brief"), "m", &params());

        let wire = body["messages"].as_array().unwrap();
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0]["role"], "assistant");
        assert_eq!(wire[1]["content"], "be brief\n\nhi");
    }

    #[test]
    fn openai_vision_passes_parts_through() {
        let body = OpenAiAdapter.request_body(
            &vision_provider(),
            &[multipart_message()],
            None,
            "m",
            &params(),
        );

        let content = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["type"], "image_url");
        assert_eq!(
            content[1]["image_url"]["url"],
            "https://example.com/cat.png"
        );
    }

    #[test]
    fn openai_degrades_media_for_non_vision_provider() {
        let body = OpenAiAdapter.request_body(
            &sample_provider(),
            &[multipart_message()],
            None,
            "m",
            &params(),
        );

        // Media dropped, text kept, no error.
        assert_eq!(body["messages"][0]["content"], "what is this");
    }

    #[test]
    fn openai_parse_event_handles_tokens_done_and_noise() {
        let adapter = OpenAiAdapter;
        assert_eq!(
            adapter.parse_event(r#"{"choices":[{"delta":{"content":"Hello"}}]}"#),
            StreamIncrement::Token("Hello".into())
        );
        assert_eq!(adapter.parse_event("[DONE]"), StreamIncrement::Done);
        assert_eq!(
            adapter.parse_event(r#"{"choices":[{"delta":{}}]}"#),
            StreamIncrement::Ignored
        );
        assert_eq!(adapter.parse_event("not json at all"), StreamIncrement::Ignored);
        assert_eq!(
            adapter.parse_event(r#"{"unknown_event":true}"#),
            StreamIncrement::Ignored
        );
    }

    #[test]
    fn openai_parse_event_surfaces_provider_errors() {
        let adapter = OpenAiAdapter;
        let increment =
            adapter.parse_event(r#"{"error":{"message":"model  overloaded","type":"busy"}}"#);
        assert_eq!(
            increment,
            StreamIncrement::Error("model overloaded".into())
        );
    }

    #[test]
    fn anthropic_system_prompt_is_top_level() {
        let provider = Provider {
            mode: Some("anthropic".into()),
            ..sample_provider()
        };
        let messages = [
            Message::text(Role::System, "history rule"),
            Message::text(Role::User, "hi"),
        ];
        let body = AnthropicAdapter.request_body(
            &provider,
            &messages,
            Some("be brief"),
            "m",
            &params(),
        );

        assert_eq!(body["system"], "be brief\n\nhistory rule");
        assert_eq!(body["max_tokens"], 256);
        let wire = body["messages"].as_array().unwrap();
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[0]["content"][0]["type"], "text");
        // Penalties are not part of this dialect.
        assert!(body.get("presence_penalty").is_none());
    }

    #[test]
    fn anthropic_inline_images_become_base64_sources() {
        let provider = Provider {
            mode: Some("anthropic".into()),
            supports_vision: true,
            ..sample_provider()
        };
        let message = Message {
            role: Role::User,
            content: MessageContent::Parts(vec![MessagePart::ImageUrl {
                image_url: ImageRef {
                    url: "data:image/png;base64,aGVsbG8=".into(),
                },
            }]),
        };
        let body =
            AnthropicAdapter.request_body(&provider, &[message], None, "m", &params());

        let block = &body["messages"][0]["content"][0];
        assert_eq!(block["type"], "image");
        assert_eq!(block["source"]["type"], "base64");
        assert_eq!(block["source"]["media_type"], "image/png");
        assert_eq!(block["source"]["data"], "aGVsbG8=");
    }

    #[test]
    fn anthropic_parse_event_is_total() {
        let adapter = AnthropicAdapter;
        assert_eq!(
            adapter.parse_event(
                r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hi"}}"#
            ),
            StreamIncrement::Token("Hi".into())
        );
        assert_eq!(
            adapter.parse_event(r#"{"type":"message_stop"}"#),
            StreamIncrement::Done
        );
        assert_eq!(
            adapter.parse_event(r#"{"type":"ping"}"#),
            StreamIncrement::Ignored
        );
        assert_eq!(
            adapter.parse_event(r#"{"type":"error","error":{"message":"overloaded"}}"#),
            StreamIncrement::Error("overloaded".into())
        );
        assert_eq!(adapter.parse_event("garbage"), StreamIncrement::Ignored);
    }

    #[test]
    fn auth_headers_match_dialect() {
        let client = reqwest::Client::new();

        let request = OpenAiAdapter
            .apply_auth(client.get("https://example.com"), "sk-test")
            .build()
            .unwrap();
        assert_eq!(
            request.headers().get("Authorization").unwrap(),
            "Bearer sk-test"
        );

        let request = AnthropicAdapter
            .apply_auth(client.get("https://example.com"), "sk-test")
            .build()
            .unwrap();
        assert_eq!(request.headers().get("x-api-key").unwrap(), "sk-test");
        assert_eq!(
            request.headers().get("anthropic-version").unwrap(),
            ANTHROPIC_VERSION
        );
    }

    #[test]
    fn image_validation_rejects_bad_payloads() {
        assert!(validate_image_ref("https://example.com/a.png").is_ok());
        assert!(validate_image_ref("data:image/png;base64,aGVsbG8=").is_ok());
        assert!(validate_image_ref("data:image/png;base64,@@@").is_err());
        assert!(validate_image_ref("data:image/png,plain").is_err());
        assert!(validate_image_ref("file:///etc/passwd").is_err());

        let oversized = base64::engine::general_purpose::STANDARD
            .encode(vec![0u8; MAX_INLINE_IMAGE_BYTES + 1]);
        let url = format!("data:image/png;base64,{oversized}");
        assert!(validate_image_ref(&url).is_err());
    }

    #[test]
    fn upstream_error_formatting_prefers_summaries() {
        assert_eq!(
            format_upstream_error(r#"{"error":{"message":"rate   limited"}}"#),
            "rate limited"
        );
        assert_eq!(
            format_upstream_error(r#"{"message":"plain"}"#),
            "plain"
        );
        assert_eq!(format_upstream_error("  socket closed  "), "socket closed");
        assert_eq!(
            format_upstream_error(""),
            "upstream returned an empty error body"
        );
    }
}
