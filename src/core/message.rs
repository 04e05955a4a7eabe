//! Internal message representation shared by the request surface, the
//! per-provider adapters, and the conversation store.

use serde::{Deserialize, Serialize};

use crate::core::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl TryFrom<&str> for Role {
    type Error = GatewayError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(GatewayError::invalid_spec(format!(
                "unknown message role '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    ImageUrl { image_url: ImageRef },
}

/// Message content as the caller supplies it: either a plain string or an
/// ordered list of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<MessagePart>),
}

impl MessageContent {
    /// The text portion of the content, with media parts dropped. Used when
    /// degrading multi-part messages for providers without vision support,
    /// and for titles/previews.
    pub fn flattened_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => {
                let texts: Vec<&str> = parts
                    .iter()
                    .filter_map(|part| match part {
                        MessagePart::Text { text } => Some(text.as_str()),
                        MessagePart::ImageUrl { .. } => None,
                    })
                    .collect();
                texts.join("\n")
            }
        }
    }

    pub fn has_image_parts(&self) -> bool {
        match self {
            MessageContent::Text(_) => false,
            MessageContent::Parts(parts) => parts
                .iter()
                .any(|part| matches!(part, MessagePart::ImageUrl { .. })),
        }
    }

    pub fn image_urls(&self) -> Vec<&str> {
        match self {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    MessagePart::ImageUrl { image_url } => Some(image_url.url.as_str()),
                    MessagePart::Text { .. } => None,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Message {
            role,
            content: MessageContent::Text(content.into()),
        }
    }
}

/// Inbound request shape from the UI collaborator. Generation parameters
/// left unset fall back to configured defaults at dispatch time.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatTurnRequest {
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub presence_penalty: Option<f64>,
    #[serde(default)]
    pub frequency_penalty: Option<f64>,
}

impl ChatTurnRequest {
    /// Text of the first user message, used to derive a title for
    /// auto-created conversations.
    pub fn first_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.flattened_text())
    }

    /// Text of the most recent user message, persisted as the user half of
    /// the turn.
    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.flattened_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_deserializes_from_string_or_parts() {
        let plain: Message = serde_json::from_str(r#"{"role":"user","content":"hi"}"#).unwrap();
        assert!(matches!(plain.content, MessageContent::Text(ref t) if t == "hi"));

        let parts: Message = serde_json::from_str(
            r#"{"role":"user","content":[
                {"type":"text","text":"look at this"},
                {"type":"image_url","image_url":{"url":"https://example.com/cat.png"}}
            ]}"#,
        )
        .unwrap();
        assert!(parts.content.has_image_parts());
        assert_eq!(parts.content.image_urls(), vec!["https://example.com/cat.png"]);
        assert_eq!(parts.content.flattened_text(), "look at this");
    }

    #[test]
    fn flattened_text_joins_multiple_text_parts() {
        let content = MessageContent::Parts(vec![
            MessagePart::Text {
                text: "first".into(),
            },
            MessagePart::ImageUrl {
                image_url: ImageRef {
                    url: "data:image/png;base64,AAAA".into(),
                },
            },
            MessagePart::Text {
                text: "second".into(),
            },
        ]);
        assert_eq!(content.flattened_text(), "first\nsecond");
    }

    #[test]
    fn user_text_helpers_pick_the_right_messages() {
        let request: ChatTurnRequest = serde_json::from_str(
            r#"{
                "provider": "demo",
                "messages": [
                    {"role":"system","content":"be terse"},
                    {"role":"user","content":"first question"},
                    {"role":"assistant","content":"answer"},
                    {"role":"user","content":"second question"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(request.first_user_text().as_deref(), Some("first question"));
        assert_eq!(request.last_user_text().as_deref(), Some("second question"));
        assert!(request.model.is_none());
    }

    #[test]
    fn unknown_role_is_rejected() {
        let result: Result<Message, _> =
            serde_json::from_str(r#"{"role":"tool","content":"x"}"#);
        assert!(result.is_err());
    }
}
