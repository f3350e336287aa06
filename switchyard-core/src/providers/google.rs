//! Google Gemini adapter
//!
//! Key in the `key` query parameter, `contents` array envelope with `model`
//! in place of `assistant`, and SSE via `:streamGenerateContent?alt=sse`.

use super::adapter::{canonical_finish_reason, ProviderAdapter, StreamFraming};
use super::error::ProtocolError;
use super::ProviderType;
use crate::channel::Channel;
use crate::http::ProviderRequest;
use crate::protocol::types::{
    ChatRequest, ChatResponse, ChatStreamChunk, CompletionUsage, MessageDelta, MessageRole,
};
use serde::{Deserialize, Serialize};
use url::form_urlencoded;

/// Google adapter
#[derive(Debug, Default, Clone, Copy)]
pub struct GoogleAdapter;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystem>,
    #[serde(skip_serializing_if = "GenerationConfig::is_empty")]
    generation_config: GenerationConfig<'a>,
}

#[derive(Debug, Serialize)]
struct GeminiContent<'a> {
    role: &'static str,
    parts: [GeminiPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct GeminiSystem {
    parts: [GeminiOwnedPart; 1],
}

#[derive(Debug, Serialize)]
struct GeminiOwnedPart {
    text: String,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<&'a [String]>,
}

impl GenerationConfig<'_> {
    fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.max_output_tokens.is_none()
            && self.top_p.is_none()
            && self.stop_sequences.is_none()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    response_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

impl GeminiResponse {
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn finish_reason(&self) -> Option<String> {
        self.candidates
            .first()
            .and_then(|c| c.finish_reason.as_deref())
            .map(canonical_finish_reason)
    }

    fn usage(&self) -> Option<CompletionUsage> {
        self.usage_metadata
            .map(|u| CompletionUsage::new(u.prompt_token_count, u.candidates_token_count))
    }
}

fn encoded_key(channel: &Channel) -> String {
    form_urlencoded::byte_serialize(channel.key.expose_secret().as_bytes()).collect()
}

impl ProviderAdapter for GoogleAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Google
    }

    fn default_base_url(&self) -> &'static str {
        "https://generativelanguage.googleapis.com"
    }

    fn stream_framing(&self) -> StreamFraming {
        StreamFraming::Sse
    }

    fn build_request(
        &self,
        channel: &Channel,
        request: &ChatRequest,
    ) -> Result<ProviderRequest, ProtocolError> {
        let contents = request
            .messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| GeminiContent {
                role: match m.role {
                    MessageRole::Assistant => "model",
                    _ => "user",
                },
                parts: [GeminiPart { text: &m.content }],
            })
            .collect();

        let body = GeminiRequest {
            contents,
            system_instruction: request.system_prompt().map(|text| GeminiSystem {
                parts: [GeminiOwnedPart { text }],
            }),
            generation_config: GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
                top_p: request.top_p,
                stop_sequences: request.stop.as_deref(),
            },
        };

        let body = serde_json::to_value(&body)
            .map_err(|e| ProtocolError::new(self.provider_type(), e.to_string(), ""))?;

        let model = channel.upstream_model(&request.model);
        let url = if request.stream {
            format!(
                "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
                self.base_url(channel),
                model,
                encoded_key(channel)
            )
        } else {
            format!(
                "{}/v1beta/models/{}:generateContent?key={}",
                self.base_url(channel),
                model,
                encoded_key(channel)
            )
        };

        Ok(ProviderRequest::post(url, body).with_header("Content-Type", "application/json"))
    }

    fn parse_response(&self, raw: &str) -> Result<ChatResponse, ProtocolError> {
        let response: GeminiResponse = serde_json::from_str(raw)
            .map_err(|e| ProtocolError::malformed(self.provider_type(), &e, raw))?;

        if response.candidates.is_empty() {
            return Err(ProtocolError::new(
                self.provider_type(),
                "response has no candidates",
                raw,
            ));
        }

        let id = response
            .response_id
            .clone()
            .unwrap_or_else(|| format!("gemini-{}", uuid::Uuid::new_v4()));

        Ok(ChatResponse::single(
            id,
            response.model_version.clone().unwrap_or_default(),
            response.text(),
            response.finish_reason(),
            response.usage(),
        ))
    }

    fn parse_stream_event(&self, payload: &str) -> Result<Option<ChatStreamChunk>, ProtocolError> {
        let payload = payload.trim();
        if payload.is_empty() {
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

        let response: GeminiResponse = serde_json::from_value(value)
            .map_err(|e| ProtocolError::malformed(self.provider_type(), &e, payload))?;

        let text = response.text();
        let chunk = ChatStreamChunk {
            id: response.response_id.clone().unwrap_or_default(),
            model: response.model_version.clone().unwrap_or_default(),
            delta: MessageDelta {
                role: None,
                content: (!text.is_empty()).then_some(text),
            },
            finish_reason: response.finish_reason(),
            usage: response.usage(),
        };

        Ok((!chunk.is_empty()).then_some(chunk))
    }

    fn probe_request(&self, channel: &Channel) -> ProviderRequest {
        ProviderRequest::get(format!(
            "{}/v1beta/models?key={}",
            self.base_url(channel),
            encoded_key(channel)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::protocol::types::Message;

    fn channel() -> Channel {
        ChannelConfig::new("gg", "google")
            .with_key("AIza key/with+chars")
            .with_models(["gemini-1.5-flash"])
            .resolve()
            .unwrap()
    }

    #[test]
    fn test_build_request_uses_query_key_and_contents() {
        let request = ChatRequest::new(
            "gemini-1.5-flash",
            vec![
                Message::system("sys"),
                Message::user("q1"),
                Message::assistant("a1"),
            ],
        )
        .with_max_tokens(100);

        let built = GoogleAdapter.build_request(&channel(), &request).unwrap();
        assert_eq!(
            built.url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-flash:generateContent?key=AIza+key%2Fwith%2Bchars"
        );
        assert!(!built.headers.contains_key("Authorization"));

        let body = built.body.unwrap();
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][1]["parts"][0]["text"], "a1");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 100);
    }

    #[test]
    fn test_stream_url() {
        let request = ChatRequest::new("gemini-1.5-flash", vec![Message::user("q")]).with_streaming();
        let built = GoogleAdapter.build_request(&channel(), &request).unwrap();
        assert!(built.url.contains(":streamGenerateContent?alt=sse&key="));
        assert!(built.body.unwrap().get("generationConfig").is_none());
    }

    #[test]
    fn test_parse_response() {
        let raw = r#"{
            "candidates": [{"content": {"role": "model", "parts": [{"text": "4"}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 1, "totalTokenCount": 6},
            "modelVersion": "gemini-1.5-flash-002"
        }"#;

        let response = GoogleAdapter.parse_response(raw).unwrap();
        assert_eq!(response.content(), "4");
        assert_eq!(response.model, "gemini-1.5-flash-002");
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.usage, Some(CompletionUsage::new(5, 1)));
        assert!(response.id.starts_with("gemini-"));
    }

    #[test]
    fn test_no_candidates_is_protocol_error() {
        let raw = r#"{"promptFeedback": {"blockReason": "SAFETY"}}"#;
        let error = GoogleAdapter.parse_response(raw).unwrap_err();
        assert!(error.message.contains("no candidates"));
    }

    #[test]
    fn test_stream_event() {
        let payload = r#"{"candidates": [{"content": {"parts": [{"text": "Hel"}], "role": "model"}}]}"#;
        let chunk = GoogleAdapter.parse_stream_event(payload).unwrap().unwrap();
        assert_eq!(chunk.text(), "Hel");
        assert!(chunk.finish_reason.is_none());
    }
}
