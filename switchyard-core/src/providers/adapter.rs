//! Provider adapter trait
//!
//! One adapter per provider type turns a canonical request into that
//! provider's wire envelope and maps its responses and stream events back.
//! Adapters are stateless; the transformer hands out `'static` instances.

use super::error::ProtocolError;
use super::ProviderType;
use crate::channel::Channel;
use crate::http::ProviderRequest;
use crate::protocol::types::{ChatRequest, ChatResponse, ChatStreamChunk};

/// Framing of a provider's streamed body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFraming {
    /// Server-sent events, payload in `data:` lines
    Sse,
    /// One JSON document per line
    Ndjson,
}

/// Core trait every upstream provider type implements
pub trait ProviderAdapter: Send + Sync {
    fn provider_type(&self) -> ProviderType;

    /// Endpoint root used when a channel does not set one
    fn default_base_url(&self) -> &'static str;

    fn stream_framing(&self) -> StreamFraming;

    /// Build the upstream call for `request` on `channel`
    ///
    /// `request.model` is the canonical model name; the channel's model
    /// mapping is applied here.
    fn build_request(
        &self,
        channel: &Channel,
        request: &ChatRequest,
    ) -> Result<ProviderRequest, ProtocolError>;

    /// Normalize a unary response body
    fn parse_response(&self, raw: &str) -> Result<ChatResponse, ProtocolError>;

    /// Normalize one stream payload (an SSE `data` field or an NDJSON line)
    ///
    /// `Ok(None)` means the payload carries nothing for the caller.
    fn parse_stream_event(&self, payload: &str) -> Result<Option<ChatStreamChunk>, ProtocolError>;

    /// Lightweight call used by the health checker
    fn probe_request(&self, channel: &Channel) -> ProviderRequest;

    /// Channel endpoint root without a trailing slash
    fn base_url(&self, channel: &Channel) -> String {
        channel
            .base_url
            .as_deref()
            .unwrap_or(self.default_base_url())
            .trim_end_matches('/')
            .to_string()
    }
}

/// Map provider finish reasons onto the canonical vocabulary
pub(crate) fn canonical_finish_reason(raw: &str) -> String {
    match raw {
        "end_turn" | "stop_sequence" | "STOP" | "stop" => "stop".to_string(),
        "max_tokens" | "MAX_TOKENS" | "length" => "length".to_string(),
        "SAFETY" | "RECITATION" | "content_filter" => "content_filter".to_string(),
        "tool_use" | "tool_calls" => "tool_calls".to_string(),
        other => other.to_ascii_lowercase(),
    }
}
