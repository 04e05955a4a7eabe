//! Gateway facade
//!
//! Accepts a normalized chat request, validates it synchronously, resolves
//! the effective provider+model, shapes the outbound payload, and spawns
//! the relay. Everything that can be rejected is rejected here, before a
//! session ever opens; once `submit` returns a handle, the caller is
//! guaranteed a terminal event unless it cancels.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::core::adapter::{adapter_for, validate_image_ref};
use crate::core::chat_stream::{spawn_stream, SessionHandle, StreamParams};
use crate::core::config::{GatewayConfig, GenerationDefaults};
use crate::core::constants::{DERIVED_TITLE_MAX_CHARS, STREAM_READ_TIMEOUT};
use crate::core::error::GatewayError;
use crate::core::message::ChatTurnRequest;
use crate::core::registry::ProviderRegistry;
use crate::core::selection::{resolve_selection, ModelPolicy};
use crate::core::store::{ConversationStore, SqliteStore};

pub struct Gateway {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn ConversationStore>,
    defaults: GenerationDefaults,
    policies: HashMap<String, ModelPolicy>,
    client: reqwest::Client,
    read_timeout: Duration,
}

impl Gateway {
    pub fn new(config: &GatewayConfig, store: Arc<dyn ConversationStore>) -> Self {
        Self::with_registry(config, store, ProviderRegistry::new(config))
    }

    /// Like [`Gateway::new`], but registry mutations write through to the
    /// given config file.
    pub fn with_persistence(
        config: &GatewayConfig,
        store: Arc<dyn ConversationStore>,
        config_path: PathBuf,
    ) -> Self {
        let registry = ProviderRegistry::new(config).with_config_path(config_path);
        Self::with_registry(config, store, registry)
    }

    fn with_registry(
        config: &GatewayConfig,
        store: Arc<dyn ConversationStore>,
        registry: ProviderRegistry,
    ) -> Self {
        Gateway {
            registry: Arc::new(registry),
            store,
            defaults: config.defaults.clone(),
            policies: config.policies.clone(),
            client: reqwest::Client::new(),
            read_timeout: STREAM_READ_TIMEOUT,
        }
    }

    /// Open the conversation database named by the config (or the platform
    /// default location) and build a gateway over it.
    pub fn open(config: &GatewayConfig) -> Result<Gateway, GatewayError> {
        let path = config
            .database_path
            .clone()
            .unwrap_or_else(GatewayConfig::default_database_path);
        let store = Arc::new(SqliteStore::open(&path)?);
        Ok(Self::new(config, store))
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn store(&self) -> Arc<dyn ConversationStore> {
        self.store.clone()
    }

    /// Validate and dispatch one streaming request. Returns as soon as the
    /// payload is built and the relay task is spawned; increments flow
    /// through the returned handle.
    pub async fn submit(&self, request: ChatTurnRequest) -> Result<SessionHandle, GatewayError> {
        let provider = self.registry.require(&request.provider)?;

        if request.messages.is_empty() {
            return Err(GatewayError::invalid_spec("messages must not be empty"));
        }
        for message in &request.messages {
            for url in message.content.image_urls() {
                validate_image_ref(url)?;
            }
        }

        let policy = self
            .policies
            .get(&provider.name)
            .copied()
            .unwrap_or_default();
        let selection = resolve_selection(&provider, policy, request.model.as_deref());
        if selection.model.is_empty() {
            return Err(GatewayError::invalid_spec(format!(
                "no model requested and provider '{}' has no default",
                provider.name
            )));
        }

        let params = self.defaults.materialize(
            request.temperature,
            request.top_p,
            request.max_tokens,
            request.presence_penalty,
            request.frequency_penalty,
        )?;

        let body = adapter_for(&provider).request_body(
            &provider,
            &request.messages,
            request.system_prompt.as_deref(),
            &selection.model,
            &params,
        );

        let (conversation_id, announce_conversation) = match &request.conversation_id {
            Some(id) => {
                // Fail before dispatch rather than mid-stream.
                self.store.get_conversation(id).await?;
                (id.clone(), false)
            }
            None => {
                let title = request.first_user_text().and_then(derive_title);
                let conversation = self
                    .store
                    .create_conversation(title, request.system_prompt.clone())
                    .await?;
                tracing::debug!(conversation_id = %conversation.id, "conversation auto-created");
                (conversation.id, true)
            }
        };

        Ok(spawn_stream(StreamParams {
            client: self.client.clone(),
            provider,
            model: selection.model,
            body,
            store: self.store.clone(),
            conversation_id,
            announce_conversation,
            user_text: request.last_user_text(),
            read_timeout: self.read_timeout,
        }))
    }
}

fn derive_title(first_user_text: String) -> Option<String> {
    let trimmed = first_user_text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let clipped: String = trimmed.chars().take(DERIVED_TITLE_MAX_CHARS).collect();
    if trimmed.chars().count() > DERIVED_TITLE_MAX_CHARS {
        Some(format!("{clipped}..."))
    } else {
        Some(clipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chat_stream::{GatewayEvent, SessionOutcome};
    use crate::core::provider::Provider;
    use crate::utils::test_utils::{sample_provider, spawn_sse_server, SseAction};

    fn token_payload(text: &str) -> String {
        format!(r#"{{"choices":[{{"delta":{{"content":"{text}"}}}}]}}"#)
    }

    fn gateway_with_provider(provider: Provider) -> Gateway {
        let config = GatewayConfig {
            custom_providers: vec![provider],
            ..GatewayConfig::default()
        };
        let store: Arc<dyn ConversationStore> =
            Arc::new(SqliteStore::open_in_memory().unwrap());
        Gateway::new(&config, store)
    }

    fn simple_request(provider: &str) -> ChatTurnRequest {
        serde_json::from_value(serde_json::json!({
            "provider": provider,
            "model": "demo-mini",
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn dispatch_validation_rejects_before_opening_a_session() {
        let gateway = gateway_with_provider(sample_provider());

        let err = gateway.submit(simple_request("missing")).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownProvider(_)));

        let mut request = simple_request("demo");
        request.messages.clear();
        let err = gateway.submit(request).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidSpec(_)));

        let request: ChatTurnRequest = serde_json::from_value(serde_json::json!({
            "provider": "demo",
            "messages": [{"role": "user", "content": [
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,@@@"}}
            ]}],
        }))
        .unwrap();
        let err = gateway.submit(request).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidSpec(_)));

        let mut request = simple_request("demo");
        request.temperature = Some(9.0);
        let err = gateway.submit(request).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidSpec(_)));

        let mut request = simple_request("demo");
        request.conversation_id = Some("never-created".into());
        let err = gateway.submit(request).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn full_round_trip_creates_conversation_and_persists_turn() {
        let base_url = spawn_sse_server(vec![
            SseAction::Event(token_payload("He")),
            SseAction::Event(token_payload("llo")),
            SseAction::Event("[DONE]".to_string()),
        ])
        .await;
        let gateway = gateway_with_provider(Provider {
            base_url,
            ..sample_provider()
        });

        let mut handle = gateway.submit(simple_request("demo")).await.unwrap();

        let first = handle.next_event().await.unwrap();
        let conversation_id = match first {
            GatewayEvent::ConversationId { ref id } => id.clone(),
            other => panic!("expected conversation announcement, got {other:?}"),
        };

        let mut tokens = String::new();
        let mut saw_done = false;
        while let Some(event) = handle.next_event().await {
            match event {
                GatewayEvent::Token { content } => tokens.push_str(&content),
                GatewayEvent::Done {
                    conversation_id: done_id,
                } => {
                    assert_eq!(done_id, conversation_id);
                    saw_done = true;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(tokens, "Hello");
        assert!(saw_done);
        assert_eq!(handle.outcome().await, SessionOutcome::Completed);

        let detail = gateway
            .store()
            .get_conversation(&conversation_id)
            .await
            .unwrap();
        assert_eq!(detail.title, "hi");
        assert_eq!(detail.messages.len(), 2);
        assert_eq!(detail.messages[0].role, "user");
        assert_eq!(detail.messages[0].content, "hi");
        assert_eq!(detail.messages[1].role, "assistant");
        assert_eq!(detail.messages[1].content, "Hello");
        assert_eq!(detail.messages[1].provider.as_deref(), Some("demo"));
        assert_eq!(detail.messages[1].model.as_deref(), Some("demo-mini"));
    }

    #[tokio::test]
    async fn policies_shape_the_dispatched_model() {
        let base_url = spawn_sse_server(vec![
            SseAction::Event(token_payload("ok")),
            SseAction::Event("[DONE]".to_string()),
        ])
        .await;
        let config = GatewayConfig {
            custom_providers: vec![Provider {
                base_url,
                models: vec!["paid".into(), "small:free".into()],
                ..sample_provider()
            }],
            policies: [(
                "demo".to_string(),
                ModelPolicy {
                    free_only: true,
                    auto_choose: false,
                },
            )]
            .into_iter()
            .collect(),
            ..GatewayConfig::default()
        };
        let store: Arc<dyn ConversationStore> =
            Arc::new(SqliteStore::open_in_memory().unwrap());
        let gateway = Gateway::new(&config, store);

        let mut request = simple_request("demo");
        request.model = Some("paid".into());
        let mut handle = gateway.submit(request).await.unwrap();
        while handle.next_event().await.is_some() {}
        assert_eq!(handle.outcome().await, SessionOutcome::Completed);

        let listed = gateway.store().list_conversations().await.unwrap();
        let detail = gateway
            .store()
            .get_conversation(&listed[0].id)
            .await
            .unwrap();
        assert_eq!(detail.messages[1].model.as_deref(), Some("small:free"));
    }

    #[tokio::test]
    async fn cancelling_one_session_leaves_others_untouched() {
        let slow_url = spawn_sse_server(vec![
            SseAction::Event(token_payload("slow")),
            SseAction::Delay(Duration::from_secs(30)),
            SseAction::Event("[DONE]".to_string()),
        ])
        .await;
        let fast_url = spawn_sse_server(vec![
            SseAction::Event(token_payload("fast")),
            SseAction::Event("[DONE]".to_string()),
        ])
        .await;

        let store: Arc<dyn ConversationStore> =
            Arc::new(SqliteStore::open_in_memory().unwrap());
        let slow_gateway = Gateway::new(
            &GatewayConfig {
                custom_providers: vec![Provider {
                    base_url: slow_url,
                    ..sample_provider()
                }],
                ..GatewayConfig::default()
            },
            store.clone(),
        );
        let fast_gateway = Gateway::new(
            &GatewayConfig {
                custom_providers: vec![Provider {
                    base_url: fast_url,
                    ..sample_provider()
                }],
                ..GatewayConfig::default()
            },
            store.clone(),
        );

        let mut slow = slow_gateway.submit(simple_request("demo")).await.unwrap();
        let mut fast = fast_gateway.submit(simple_request("demo")).await.unwrap();

        // Wait for the slow session's first token, then abandon it.
        loop {
            match slow.next_event().await {
                Some(GatewayEvent::Token { .. }) => break,
                Some(_) => continue,
                None => panic!("slow session ended early"),
            }
        }
        slow.cancel();
        assert_eq!(slow.outcome().await, SessionOutcome::Aborted);

        let mut tokens = String::new();
        while let Some(event) = fast.next_event().await {
            if let GatewayEvent::Token { content } = event {
                tokens.push_str(&content);
            }
        }
        assert_eq!(tokens, "fast");
        assert_eq!(fast.outcome().await, SessionOutcome::Completed);
    }

    #[test]
    fn titles_clip_at_fifty_characters() {
        assert_eq!(derive_title("hi".into()).as_deref(), Some("hi"));
        assert_eq!(derive_title("   ".into()), None);

        let long = "x".repeat(80);
        let title = derive_title(long).unwrap();
        assert!(title.ends_with("..."));
        assert_eq!(title.chars().count(), DERIVED_TITLE_MAX_CHARS + 3);
    }
}
