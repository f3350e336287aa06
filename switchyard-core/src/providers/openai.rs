//! OpenAI-compatible adapter
//!
//! Bearer auth, `/chat/completions`, message-array envelope and SSE deltas
//! terminated by `data: [DONE]`. Also serves any OpenAI-compatible gateway
//! through a channel `base_url`.

use super::adapter::{canonical_finish_reason, ProviderAdapter, StreamFraming};
use super::error::ProtocolError;
use super::ProviderType;
use crate::channel::Channel;
use crate::http::ProviderRequest;
use crate::protocol::types::{
    ChatRequest, ChatResponse, ChatStreamChunk, CompletionUsage, Message, MessageDelta,
    MessageRole, ResponseChoice,
};
use serde::{Deserialize, Serialize};

/// OpenAI adapter
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAIAdapter;

#[derive(Debug, Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAIMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage<'a> {
    role: &'static str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    created: i64,
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    #[serde(default)]
    index: usize,
    message: OpenAIResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    #[serde(default)]
    role: Option<MessageRole>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct OpenAIUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl From<OpenAIUsage> for CompletionUsage {
    fn from(usage: OpenAIUsage) -> Self {
        CompletionUsage::new(usage.prompt_tokens, usage.completion_tokens)
    }
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: OpenAIDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIDelta {
    #[serde(default)]
    role: Option<MessageRole>,
    #[serde(default)]
    content: Option<String>,
}

impl ProviderAdapter for OpenAIAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::OpenAI
    }

    fn default_base_url(&self) -> &'static str {
        "https://api.openai.com/v1"
    }

    fn stream_framing(&self) -> StreamFraming {
        StreamFraming::Sse
    }

    fn build_request(
        &self,
        channel: &Channel,
        request: &ChatRequest,
    ) -> Result<ProviderRequest, ProtocolError> {
        let body = OpenAIRequest {
            model: channel.upstream_model(&request.model),
            messages: request
                .messages
                .iter()
                .map(|m| OpenAIMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                    name: m.name.as_deref(),
                })
                .collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
            stop: request.stop.as_deref(),
            stream: request.stream,
            stream_options: request.stream.then_some(StreamOptions {
                include_usage: true,
            }),
            user: request.user.as_deref(),
        };

        let body = serde_json::to_value(&body)
            .map_err(|e| ProtocolError::new(self.provider_type(), e.to_string(), ""))?;

        let url = format!("{}/chat/completions", self.base_url(channel));
        Ok(ProviderRequest::post(url, body)
            .with_header("Authorization", format!("Bearer {}", channel.key.expose_secret()))
            .with_header("Content-Type", "application/json"))
    }

    fn parse_response(&self, raw: &str) -> Result<ChatResponse, ProtocolError> {
        let response: OpenAIResponse = serde_json::from_str(raw)
            .map_err(|e| ProtocolError::malformed(self.provider_type(), &e, raw))?;

        if response.choices.is_empty() {
            return Err(ProtocolError::new(
                self.provider_type(),
                "response has no choices",
                raw,
            ));
        }

        let choices = response
            .choices
            .into_iter()
            .map(|c| ResponseChoice {
                index: c.index,
                message: Message::new(
                    c.message.role.unwrap_or(MessageRole::Assistant),
                    c.message.content.unwrap_or_default(),
                ),
                finish_reason: c.finish_reason.as_deref().map(canonical_finish_reason),
            })
            .collect();

        Ok(ChatResponse {
            id: response.id,
            model: response.model,
            created: response.created,
            choices,
            usage: response.usage.map(Into::into),
        })
    }

    fn parse_stream_event(&self, payload: &str) -> Result<Option<ChatStreamChunk>, ProtocolError> {
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            return Ok(None);
        }

        let value: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| ProtocolError::malformed(self.provider_type(), &e, payload))?;
        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("error event in stream");
            return Err(ProtocolError::new(self.provider_type(), message, payload));
        }

        let chunk: OpenAIStreamChunk = serde_json::from_value(value)
            .map_err(|e| ProtocolError::malformed(self.provider_type(), &e, payload))?;

        let (delta, finish_reason) = match chunk.choices.into_iter().next() {
            Some(choice) => (
                MessageDelta {
                    role: choice.delta.role,
                    content: choice.delta.content.filter(|c| !c.is_empty()),
                },
                choice.finish_reason.as_deref().map(canonical_finish_reason),
            ),
            None => (MessageDelta::default(), None),
        };

        let canonical = ChatStreamChunk {
            id: chunk.id,
            model: chunk.model,
            delta,
            finish_reason,
            usage: chunk.usage.map(Into::into),
        };

        Ok((!canonical.is_empty()).then_some(canonical))
    }

    fn probe_request(&self, channel: &Channel) -> ProviderRequest {
        ProviderRequest::get(format!("{}/models", self.base_url(channel)))
            .with_header("Authorization", format!("Bearer {}", channel.key.expose_secret()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;

    fn channel() -> Channel {
        ChannelConfig::new("oa", "openai")
            .with_key("sk-test-key-123456")
            .with_models(["gpt-4o"])
            .with_model_mapping("gpt-4o", "gpt-4o-2024-08-06")
            .resolve()
            .unwrap()
    }

    #[test]
    fn test_build_request_shape() {
        let request = ChatRequest::new(
            "gpt-4o",
            vec![Message::system("be brief"), Message::user("hello")],
        )
        .with_temperature(0.5);

        let built = OpenAIAdapter.build_request(&channel(), &request).unwrap();
        assert_eq!(built.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(
            built.headers.get("Authorization").map(String::as_str),
            Some("Bearer sk-test-key-123456")
        );

        let body = built.body.unwrap();
        assert_eq!(body["model"], "gpt-4o-2024-08-06");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["stream"], false);
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn test_parse_response() {
        let raw = r#"{
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1700000000,
            "model": "gpt-4o",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hi there"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 9, "completion_tokens": 2, "total_tokens": 11}
        }"#;

        let response = OpenAIAdapter.parse_response(raw).unwrap();
        assert_eq!(response.content(), "Hi there");
        assert_eq!(response.usage, Some(CompletionUsage::new(9, 2)));
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_malformed_response_keeps_fragment() {
        let raw = r#"{"id": "x", "choices": "#;
        let error = OpenAIAdapter.parse_response(raw).unwrap_err();
        assert_eq!(error.provider, ProviderType::OpenAI);
        assert_eq!(error.fragment, raw);
    }

    #[test]
    fn test_stream_events() {
        let delta = r#"{"id":"c1","model":"gpt-4o","choices":[{"index":0,"delta":{"content":"Hel"},"finish_reason":null}]}"#;
        let chunk = OpenAIAdapter.parse_stream_event(delta).unwrap().unwrap();
        assert_eq!(chunk.text(), "Hel");

        let empty = r#"{"id":"c1","model":"gpt-4o","choices":[{"index":0,"delta":{},"finish_reason":null}]}"#;
        assert!(OpenAIAdapter.parse_stream_event(empty).unwrap().is_none());

        let usage = r#"{"id":"c1","model":"gpt-4o","choices":[],"usage":{"prompt_tokens":3,"completion_tokens":5}}"#;
        let chunk = OpenAIAdapter.parse_stream_event(usage).unwrap().unwrap();
        assert_eq!(chunk.usage, Some(CompletionUsage::new(3, 5)));

        assert!(OpenAIAdapter.parse_stream_event("[DONE]").unwrap().is_none());
    }

    #[test]
    fn test_stream_error_event() {
        let payload = r#"{"error":{"message":"overloaded"}}"#;
        let error = OpenAIAdapter.parse_stream_event(payload).unwrap_err();
        assert_eq!(error.message, "overloaded");
    }
}
