//! Protocol transformer facade over the per-provider adapters

use super::adapter::ProviderAdapter;
use super::error::ProtocolError;
use super::pricing::{self, PricingTable};
use super::ProviderType;
use crate::channel::Channel;
use crate::http::ProviderRequest;
use crate::protocol::types::{ChatRequest, ChatResponse, ChatStreamChunk, CompletionUsage};

/// Canonical <-> provider translation plus token and cost accounting
///
/// Dispatch goes through the channel's provider type, so callers never
/// branch on provider themselves.
#[derive(Debug, Clone, Default)]
pub struct ProtocolTransformer {
    pricing: PricingTable,
}

impl ProtocolTransformer {
    pub fn new(pricing: PricingTable) -> Self {
        Self { pricing }
    }

    pub fn adapter(provider: ProviderType) -> &'static dyn ProviderAdapter {
        provider.adapter()
    }

    pub fn to_provider_request(
        &self,
        channel: &Channel,
        request: &ChatRequest,
    ) -> Result<ProviderRequest, ProtocolError> {
        channel.provider.adapter().build_request(channel, request)
    }

    pub fn from_provider_response(
        &self,
        provider: ProviderType,
        raw: &str,
    ) -> Result<ChatResponse, ProtocolError> {
        provider.adapter().parse_response(raw)
    }

    /// `Ok(None)` means no user-visible content; keep reading
    pub fn transform_stream_chunk(
        &self,
        provider: ProviderType,
        raw: &str,
    ) -> Result<Option<ChatStreamChunk>, ProtocolError> {
        provider.adapter().parse_stream_event(raw)
    }

    pub fn count_tokens(&self, request: &ChatRequest) -> u32 {
        pricing::count_tokens(&request.messages)
    }

    pub fn count_completion_tokens(&self, text: &str) -> u32 {
        pricing::count_text_tokens(text)
    }

    /// Reported usage, or an estimate from the prompt count and reply text
    pub fn usage_or_estimate(
        &self,
        reported: Option<CompletionUsage>,
        prompt_tokens: u32,
        completion: &str,
    ) -> CompletionUsage {
        match reported {
            Some(usage) if usage.total_tokens > 0 => usage,
            _ => CompletionUsage::new(prompt_tokens, self.count_completion_tokens(completion)),
        }
    }

    pub fn calculate_cost(
        &self,
        provider: ProviderType,
        model: &str,
        usage: &CompletionUsage,
    ) -> f64 {
        self.pricing.calculate_cost(provider, model, usage)
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }
}
