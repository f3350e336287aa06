//! Ollama adapter
//!
//! Local `/api/chat` endpoint, no credentials, newline-delimited JSON
//! streaming. Ollama streams by default, so `stream` is always sent.

use super::adapter::{canonical_finish_reason, ProviderAdapter, StreamFraming};
use super::error::ProtocolError;
use super::ProviderType;
use crate::channel::Channel;
use crate::http::ProviderRequest;
use crate::protocol::types::{
    ChatRequest, ChatResponse, ChatStreamChunk, CompletionUsage, MessageDelta, MessageRole,
};
use serde::{Deserialize, Serialize};

/// Ollama adapter
#[derive(Debug, Default, Clone, Copy)]
pub struct OllamaAdapter;

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "OllamaOptions::is_empty")]
    options: OllamaOptions<'a>,
}

#[derive(Debug, Serialize)]
struct OllamaMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Default, Serialize)]
struct OllamaOptions<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
}

impl OllamaOptions<'_> {
    fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.num_predict.is_none()
            && self.top_p.is_none()
            && self.stop.is_none()
    }
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    message: Option<OllamaResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
}

impl OllamaResponse {
    fn usage(&self) -> Option<CompletionUsage> {
        match (self.prompt_eval_count, self.eval_count) {
            (None, None) => None,
            (prompt, completion) => Some(CompletionUsage::new(
                prompt.unwrap_or(0),
                completion.unwrap_or(0),
            )),
        }
    }

    fn finish_reason(&self) -> Option<String> {
        if !self.done {
            return None;
        }
        Some(
            self.done_reason
                .as_deref()
                .map(canonical_finish_reason)
                .unwrap_or_else(|| "stop".to_string()),
        )
    }
}

impl ProviderAdapter for OllamaAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Ollama
    }

    fn default_base_url(&self) -> &'static str {
        "http://localhost:11434"
    }

    fn stream_framing(&self) -> StreamFraming {
        StreamFraming::Ndjson
    }

    fn build_request(
        &self,
        channel: &Channel,
        request: &ChatRequest,
    ) -> Result<ProviderRequest, ProtocolError> {
        let body = OllamaRequest {
            model: channel.upstream_model(&request.model),
            messages: request
                .messages
                .iter()
                .map(|m| OllamaMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            stream: request.stream,
            options: OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
                top_p: request.top_p,
                stop: request.stop.as_deref(),
            },
        };

        let body = serde_json::to_value(&body)
            .map_err(|e| ProtocolError::new(self.provider_type(), e.to_string(), ""))?;

        let mut built = ProviderRequest::post(format!("{}/api/chat", self.base_url(channel)), body)
            .with_header("Content-Type", "application/json");
        // Reverse proxies in front of Ollama commonly expect a bearer token
        if !channel.key.is_empty() {
            built = built.with_header(
                "Authorization",
                format!("Bearer {}", channel.key.expose_secret()),
            );
        }
        Ok(built)
    }

    fn parse_response(&self, raw: &str) -> Result<ChatResponse, ProtocolError> {
        let response: OllamaResponse = serde_json::from_str(raw)
            .map_err(|e| ProtocolError::malformed(self.provider_type(), &e, raw))?;

        if let Some(error) = response.error.as_deref() {
            return Err(ProtocolError::new(self.provider_type(), error, raw));
        }

        let Some(message) = response.message.as_ref() else {
            return Err(ProtocolError::new(
                self.provider_type(),
                "response has no message",
                raw,
            ));
        };

        Ok(ChatResponse::single(
            format!("ollama-{}", uuid::Uuid::new_v4()),
            response.model.clone(),
            message.content.clone(),
            response.finish_reason(),
            response.usage(),
        ))
    }

    fn parse_stream_event(&self, payload: &str) -> Result<Option<ChatStreamChunk>, ProtocolError> {
        let payload = payload.trim();
        if payload.is_empty() {
            return Ok(None);
        }

        let response: OllamaResponse = serde_json::from_str(payload)
            .map_err(|e| ProtocolError::malformed(self.provider_type(), &e, payload))?;

        if let Some(error) = response.error.as_deref() {
            return Err(ProtocolError::new(self.provider_type(), error, payload));
        }

        let content = response
            .message
            .as_ref()
            .map(|m| m.content.clone())
            .filter(|c| !c.is_empty());

        let chunk = ChatStreamChunk {
            id: String::new(),
            model: response.model.clone(),
            delta: MessageDelta {
                role: content.as_ref().map(|_| MessageRole::Assistant),
                content,
            },
            finish_reason: response.finish_reason(),
            usage: if response.done { response.usage() } else { None },
        };

        Ok((!chunk.is_empty()).then_some(chunk))
    }

    fn probe_request(&self, channel: &Channel) -> ProviderRequest {
        ProviderRequest::get(format!("{}/api/tags", self.base_url(channel)))
    }
}
