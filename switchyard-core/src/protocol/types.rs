//! Canonical protocol types for relayed chat traffic
//!
//! These structures are the provider-agnostic form the relay operates on:
//! requests arrive in this shape, provider adapters translate them to a wire
//! envelope, and upstream responses are normalized back into it. Cost and
//! token accounting only ever look at these types.

use serde::{Deserialize, Serialize};

/// Role of a message in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instructions that guide the model's behavior
    System,
    /// User input message
    User,
    /// Assistant (model) response
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// A role-tagged message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender
    pub role: MessageRole,

    /// Text content of the message
    pub content: String,

    /// Optional name for the message sender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Canonical chat request as handed to the relay by the web layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChatRequest {
    /// Model name requested by the caller
    #[serde(default)]
    pub model: String,

    /// Ordered conversation
    #[serde(default)]
    pub messages: Vec<Message>,

    /// Sampling temperature (0.0 to 2.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Nucleus sampling parameter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Stop sequences
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,

    /// Whether the caller wants a streamed response
    #[serde(default)]
    pub stream: bool,

    /// Caller's user id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Channel group hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// Complete (unary) chat response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Response ID (provider's, or generated when the provider has none)
    pub id: String,

    /// Model that produced the response
    pub model: String,

    /// Creation timestamp (unix seconds)
    pub created: i64,

    /// Response choices
    pub choices: Vec<ResponseChoice>,

    /// Token usage reported by the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<CompletionUsage>,
}

/// Response choice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseChoice {
    pub index: usize,
    pub message: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// One streamed delta in canonical form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatStreamChunk {
    /// Response ID the chunk belongs to
    pub id: String,

    /// Model producing the stream
    pub model: String,

    /// Content delta
    pub delta: MessageDelta,

    /// Finish reason (only on the final content chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,

    /// Usage, when the provider reports it in-stream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<CompletionUsage>,
}

/// Delta message for streaming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MessageDelta {
    /// Role (usually only on the first chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<MessageRole>,

    /// Content delta
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Token usage information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompletionUsage {
    /// Tokens in the prompt
    pub prompt_tokens: u32,

    /// Tokens in the completion
    pub completion_tokens: u32,

    /// Total tokens used
    pub total_tokens: u32,
}

impl CompletionUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

// ============================================================================
// Convenience constructors
// ============================================================================

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Set the name field
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl ChatRequest {
    /// Create a new chat request with model and messages
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Default::default()
        }
    }

    /// Enable streaming
    pub fn with_streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Set temperature
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set max tokens
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the caller's user id
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Restrict routing to channels carrying this group tag
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// System messages concatenated in order, if any
    pub fn system_prompt(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| m.content.as_str())
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }
}

impl ChatResponse {
    /// Text of the first choice
    pub fn content(&self) -> &str {
        self.choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("")
    }

    /// Build a single-choice assistant response
    pub fn single(
        id: impl Into<String>,
        model: impl Into<String>,
        content: impl Into<String>,
        finish_reason: Option<String>,
        usage: Option<CompletionUsage>,
    ) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
            choices: vec![ResponseChoice {
                index: 0,
                message: Message::assistant(content),
                finish_reason,
            }],
            usage,
        }
    }
}

impl ChatStreamChunk {
    /// Content carried by this chunk, or empty
    pub fn text(&self) -> &str {
        self.delta.content.as_deref().unwrap_or("")
    }

    /// Whether the chunk carries nothing the caller can see
    pub fn is_empty(&self) -> bool {
        self.text().is_empty()
            && self.delta.role.is_none()
            && self.finish_reason.is_none()
            && self.usage.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = ChatRequest::new("gpt-4o", vec![Message::user("hi")])
            .with_temperature(0.2)
            .with_max_tokens(64)
            .with_streaming()
            .with_group("vip");

        assert_eq!(request.model, "gpt-4o");
        assert_eq!(request.temperature, Some(0.2));
        assert_eq!(request.max_tokens, Some(64));
        assert!(request.stream);
        assert_eq!(request.group.as_deref(), Some("vip"));
    }

    #[test]
    fn test_system_prompt_joins_in_order() {
        let request = ChatRequest::new(
            "m",
            vec![
                Message::system("first"),
                Message::user("question"),
                Message::system("second"),
            ],
        );
        assert_eq!(request.system_prompt().as_deref(), Some("first\n\nsecond"));

        let no_system = ChatRequest::new("m", vec![Message::user("q")]);
        assert!(no_system.system_prompt().is_none());
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let json = r#"{"model":"claude-3-haiku","messages":[{"role":"user","content":"hello"}]}"#;
        let request: ChatRequest = serde_json::from_str(json).unwrap();
        assert!(!request.stream);
        assert!(request.temperature.is_none());
        assert_eq!(request.messages[0].role, MessageRole::User);
    }

    #[test]
    fn test_empty_chunk_detection() {
        let chunk = ChatStreamChunk {
            id: "x".to_string(),
            model: "m".to_string(),
            delta: MessageDelta::default(),
            finish_reason: None,
            usage: None,
        };
        assert!(chunk.is_empty());

        let with_text = ChatStreamChunk {
            delta: MessageDelta {
                role: None,
                content: Some("hi".to_string()),
            },
            ..chunk
        };
        assert!(!with_text.is_empty());
        assert_eq!(with_text.text(), "hi");
    }
}
