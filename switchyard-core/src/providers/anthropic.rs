//! Anthropic Messages API adapter
//!
//! `x-api-key` auth, `/v1/messages` with the system prompt lifted into its own
//! field, and typed SSE events (`message_start`, `content_block_delta`,
//! `message_delta`, ...).

use super::adapter::{canonical_finish_reason, ProviderAdapter, StreamFraming};
use super::error::ProtocolError;
use super::ProviderType;
use crate::channel::Channel;
use crate::http::ProviderRequest;
use crate::protocol::types::{
    ChatRequest, ChatResponse, ChatStreamChunk, CompletionUsage, MessageDelta, MessageRole,
};
use serde::{Deserialize, Serialize};

/// Messages API version sent on every call
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// `max_tokens` is mandatory upstream; used when the caller sets none
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic adapter
#[derive(Debug, Default, Clone, Copy)]
pub struct AnthropicAdapter;

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<AnthropicMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<&'a [String]>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    #[serde(default)]
    model: String,
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StreamMessage,
    },
    ContentBlockStart {},
    ContentBlockDelta {
        delta: BlockDelta,
    },
    ContentBlockStop {},
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: StreamErrorBody,
    },
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct BlockDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamErrorBody {
    #[serde(default)]
    message: String,
}

impl AnthropicAdapter {
    fn with_auth(request: ProviderRequest, channel: &Channel) -> ProviderRequest {
        request
            .with_header("x-api-key", channel.key.expose_secret())
            .with_header("anthropic-version", ANTHROPIC_VERSION)
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Anthropic
    }

    fn default_base_url(&self) -> &'static str {
        "https://api.anthropic.com"
    }

    fn stream_framing(&self) -> StreamFraming {
        StreamFraming::Sse
    }

    fn build_request(
        &self,
        channel: &Channel,
        request: &ChatRequest,
    ) -> Result<ProviderRequest, ProtocolError> {
        let messages = request
            .messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| AnthropicMessage {
                role: m.role.as_str(),
                content: &m.content,
            })
            .collect();

        let body = AnthropicRequest {
            model: channel.upstream_model(&request.model),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system: request.system_prompt(),
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop.as_deref(),
            stream: request.stream,
        };

        let body = serde_json::to_value(&body)
            .map_err(|e| ProtocolError::new(self.provider_type(), e.to_string(), ""))?;

        let url = format!("{}/v1/messages", self.base_url(channel));
        Ok(Self::with_auth(ProviderRequest::post(url, body), channel)
            .with_header("content-type", "application/json"))
    }

    fn parse_response(&self, raw: &str) -> Result<ChatResponse, ProtocolError> {
        let response: AnthropicResponse = serde_json::from_str(raw)
            .map_err(|e| ProtocolError::malformed(self.provider_type(), &e, raw))?;

        let text: String = response
            .content
            .iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();

        let usage = response
            .usage
            .map(|u| CompletionUsage::new(u.input_tokens, u.output_tokens));

        Ok(ChatResponse::single(
            response.id,
            response.model,
            text,
            response.stop_reason.as_deref().map(canonical_finish_reason),
            usage,
        ))
    }

    fn parse_stream_event(&self, payload: &str) -> Result<Option<ChatStreamChunk>, ProtocolError> {
        let payload = payload.trim();
        if payload.is_empty() {
            return Ok(None);
        }

        let event: StreamEvent = serde_json::from_str(payload)
            .map_err(|e| ProtocolError::malformed(self.provider_type(), &e, payload))?;

        let chunk = match event {
            StreamEvent::MessageStart { message } => ChatStreamChunk {
                id: message.id,
                model: message.model,
                delta: MessageDelta {
                    role: Some(MessageRole::Assistant),
                    content: None,
                },
                finish_reason: None,
                usage: message
                    .usage
                    .map(|u| CompletionUsage::new(u.input_tokens, u.output_tokens)),
            },
            StreamEvent::ContentBlockDelta { delta } => match delta.text {
                Some(text) if !text.is_empty() => ChatStreamChunk {
                    id: String::new(),
                    model: String::new(),
                    delta: MessageDelta {
                        role: None,
                        content: Some(text),
                    },
                    finish_reason: None,
                    usage: None,
                },
                _ => return Ok(None),
            },
            StreamEvent::MessageDelta { delta, usage } => ChatStreamChunk {
                id: String::new(),
                model: String::new(),
                delta: MessageDelta::default(),
                finish_reason: delta.stop_reason.as_deref().map(canonical_finish_reason),
                // output_tokens here is cumulative; the prompt count came with message_start
                usage: usage.map(|u| CompletionUsage::new(u.input_tokens, u.output_tokens)),
            },
            StreamEvent::Error { error } => {
                return Err(ProtocolError::new(self.provider_type(), error.message, payload));
            }
            StreamEvent::ContentBlockStart {}
            | StreamEvent::ContentBlockStop {}
            | StreamEvent::MessageStop
            | StreamEvent::Ping => return Ok(None),
        };

        Ok((!chunk.is_empty()).then_some(chunk))
    }

    fn probe_request(&self, channel: &Channel) -> ProviderRequest {
        let url = format!("{}/v1/models", self.base_url(channel));
        Self::with_auth(ProviderRequest::get(url), channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::protocol::types::Message;

    fn channel() -> Channel {
        ChannelConfig::new("an", "anthropic")
            .with_key("ant-test-key-123456")
            .with_models(["claude-3-5-sonnet"])
            .resolve()
            .unwrap()
    }

    #[test]
    fn test_system_prompt_lifted_out() {
        let request = ChatRequest::new(
            "claude-3-5-sonnet",
            vec![
                Message::system("you are terse"),
                Message::user("hi"),
                Message::assistant("hello"),
                Message::user("bye"),
            ],
        );

        let built = AnthropicAdapter.build_request(&channel(), &request).unwrap();
        assert_eq!(built.url, "https://api.anthropic.com/v1/messages");
        assert_eq!(
            built.headers.get("x-api-key").map(String::as_str),
            Some("ant-test-key-123456")
        );
        assert_eq!(
            built.headers.get("anthropic-version").map(String::as_str),
            Some(ANTHROPIC_VERSION)
        );

        let body = built.body.unwrap();
        assert_eq!(body["system"], "you are terse");
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["messages"].as_array().unwrap().len(), 3);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][2]["content"], "bye");
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn test_parse_response_joins_text_blocks() {
        let raw = r#"{
            "id": "msg_1", "type": "message", "role": "assistant", "model": "claude-3-5-sonnet",
            "content": [{"type": "text", "text": "Hello, "}, {"type": "text", "text": "world"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 4}
        }"#;

        let response = AnthropicAdapter.parse_response(raw).unwrap();
        assert_eq!(response.content(), "Hello, world");
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.usage, Some(CompletionUsage::new(12, 4)));
    }

    #[test]
    fn test_stream_event_sequence() {
        let start = r#"{"type":"message_start","message":{"id":"msg_1","model":"claude-3-5-sonnet","usage":{"input_tokens":10,"output_tokens":1}}}"#;
        let chunk = AnthropicAdapter.parse_stream_event(start).unwrap().unwrap();
        assert_eq!(chunk.id, "msg_1");
        assert_eq!(chunk.delta.role, Some(MessageRole::Assistant));

        let block_start = r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#;
        assert!(AnthropicAdapter.parse_stream_event(block_start).unwrap().is_none());

        let delta = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#;
        let chunk = AnthropicAdapter.parse_stream_event(delta).unwrap().unwrap();
        assert_eq!(chunk.text(), "Hi");

        let message_delta = r#"{"type":"message_delta","delta":{"stop_reason":"max_tokens"},"usage":{"output_tokens":7}}"#;
        let chunk = AnthropicAdapter.parse_stream_event(message_delta).unwrap().unwrap();
        assert_eq!(chunk.finish_reason.as_deref(), Some("length"));
        assert_eq!(chunk.usage.map(|u| u.completion_tokens), Some(7));

        let ping = r#"{"type":"ping"}"#;
        assert!(AnthropicAdapter.parse_stream_event(ping).unwrap().is_none());
    }

    #[test]
    fn test_stream_error_event() {
        let payload = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        let error = AnthropicAdapter.parse_stream_event(payload).unwrap_err();
        assert_eq!(error.message, "Overloaded");
    }
}
