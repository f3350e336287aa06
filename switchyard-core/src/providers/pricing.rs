//! Token counting and cost estimation on canonical messages
//!
//! Counting uses the `cl100k_base` BPE for every provider; it is an estimate
//! used only when the upstream reports no usage. Prices are USD per 1K tokens,
//! looked up by provider type and longest matching model-name prefix.

use super::ProviderType;
use crate::config::PriceOverride;
use crate::protocol::types::{CompletionUsage, Message};
use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;
use tracing::warn;

/// Tokens added per message for role and separators
const TOKENS_PER_MESSAGE: usize = 4;

/// Tokens priming the assistant reply
const REPLY_PRIMER_TOKENS: usize = 3;

static TOKENIZER: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn tokenizer() -> Option<&'static CoreBPE> {
    TOKENIZER
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                warn!("cl100k_base unavailable, falling back to length heuristic: {}", e);
                None
            }
        })
        .as_ref()
}

/// Count tokens in a piece of text
pub fn count_text_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    let count = match tokenizer() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.chars().count().div_ceil(4),
    };
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Count prompt tokens for an ordered conversation
pub fn count_tokens(messages: &[Message]) -> u32 {
    let content: u32 = messages
        .iter()
        .map(|m| count_text_tokens(&m.content).saturating_add(TOKENS_PER_MESSAGE as u32))
        .fold(0u32, u32::saturating_add);
    content.saturating_add(REPLY_PRIMER_TOKENS as u32)
}

/// Price of one model family
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPrice {
    pub provider: ProviderType,
    /// Model name prefix this price applies to
    pub model_prefix: String,
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelPrice {
    fn new(provider: ProviderType, model_prefix: &str, input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            provider,
            model_prefix: model_prefix.to_string(),
            input_per_1k,
            output_per_1k,
        }
    }

    pub fn cost(&self, usage: &CompletionUsage) -> f64 {
        (usage.prompt_tokens as f64 / 1000.0) * self.input_per_1k
            + (usage.completion_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

/// Pricing lookup table
#[derive(Debug, Clone)]
pub struct PricingTable {
    /// Operator overrides, consulted before the built-ins
    overrides: Vec<ModelPrice>,
    builtin: Vec<ModelPrice>,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl PricingTable {
    pub fn new(overrides: &[PriceOverride]) -> Self {
        Self {
            overrides: overrides
                .iter()
                .map(|o| {
                    ModelPrice::new(
                        o.provider,
                        &o.model.to_ascii_lowercase(),
                        o.input_per_1k,
                        o.output_per_1k,
                    )
                })
                .collect(),
            builtin: builtin_prices(),
        }
    }

    /// Longest-prefix price for `model`, overrides first
    pub fn lookup(&self, provider: ProviderType, model: &str) -> Option<&ModelPrice> {
        let model = model.to_ascii_lowercase();
        longest_prefix(&self.overrides, provider, &model)
            .or_else(|| longest_prefix(&self.builtin, provider, &model))
    }

    /// Estimated USD cost; zero for free or unknown models
    pub fn calculate_cost(
        &self,
        provider: ProviderType,
        model: &str,
        usage: &CompletionUsage,
    ) -> f64 {
        if provider == ProviderType::Ollama {
            return 0.0;
        }
        self.lookup(provider, model)
            .map(|price| price.cost(usage))
            .unwrap_or(0.0)
    }
}

fn longest_prefix<'a>(
    prices: &'a [ModelPrice],
    provider: ProviderType,
    model: &str,
) -> Option<&'a ModelPrice> {
    prices
        .iter()
        .filter(|p| p.provider == provider && model.starts_with(&p.model_prefix))
        .max_by_key(|p| p.model_prefix.len())
}

fn builtin_prices() -> Vec<ModelPrice> {
    use ProviderType::{Anthropic, Google, OpenAI};

    vec![
        ModelPrice::new(OpenAI, "gpt-4o-mini", 0.000_15, 0.000_6),
        ModelPrice::new(OpenAI, "gpt-4o", 0.002_5, 0.01),
        ModelPrice::new(OpenAI, "gpt-4-turbo", 0.01, 0.03),
        ModelPrice::new(OpenAI, "gpt-4", 0.03, 0.06),
        ModelPrice::new(OpenAI, "gpt-3.5-turbo", 0.000_5, 0.001_5),
        ModelPrice::new(OpenAI, "o1-mini", 0.003, 0.012),
        ModelPrice::new(OpenAI, "o1", 0.015, 0.06),
        ModelPrice::new(Anthropic, "claude-3-5-sonnet", 0.003, 0.015),
        ModelPrice::new(Anthropic, "claude-3-5-haiku", 0.000_8, 0.004),
        ModelPrice::new(Anthropic, "claude-3-opus", 0.015, 0.075),
        ModelPrice::new(Anthropic, "claude-3-sonnet", 0.003, 0.015),
        ModelPrice::new(Anthropic, "claude-3-haiku", 0.000_25, 0.001_25),
        ModelPrice::new(Google, "gemini-1.5-pro", 0.001_25, 0.005),
        ModelPrice::new(Google, "gemini-1.5-flash", 0.000_075, 0.000_3),
        ModelPrice::new(Google, "gemini-2.0-flash", 0.000_1, 0.000_4),
    ]
}
