//! Provider adapters and protocol translation
//!
//! This module provides:
//! - `ProviderType`, the closed set of supported upstream wire protocols
//! - One [`ProviderAdapter`] per type (OpenAI, Anthropic, Google, Ollama)
//! - [`ProtocolTransformer`], the facade the orchestrator talks to
//! - Stream framing and token/cost accounting

pub mod adapter;
pub mod anthropic;
pub mod error;
pub mod google;
pub mod ollama;
pub mod openai;
pub mod pricing;
pub mod stream;
pub mod transformer;

pub use adapter::{ProviderAdapter, StreamFraming};
pub use anthropic::AnthropicAdapter;
pub use error::ProtocolError;
pub use google::GoogleAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAIAdapter;
pub use pricing::{count_tokens, ModelPrice, PricingTable};
pub use stream::{decode_payloads, PayloadStream};
pub use transformer::ProtocolTransformer;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

static OPENAI: OpenAIAdapter = OpenAIAdapter;
static ANTHROPIC: AnthropicAdapter = AnthropicAdapter;
static GOOGLE: GoogleAdapter = GoogleAdapter;
static OLLAMA: OllamaAdapter = OllamaAdapter;

/// Upstream provider type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// OpenAI and OpenAI-compatible gateways
    OpenAI,
    Anthropic,
    Google,
    Ollama,
}

impl ProviderType {
    pub const ALL: [ProviderType; 4] = [
        ProviderType::OpenAI,
        ProviderType::Anthropic,
        ProviderType::Google,
        ProviderType::Ollama,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::OpenAI => "openai",
            ProviderType::Anthropic => "anthropic",
            ProviderType::Google => "google",
            ProviderType::Ollama => "ollama",
        }
    }

    /// The adapter implementing this provider's wire format
    pub fn adapter(&self) -> &'static dyn ProviderAdapter {
        match self {
            ProviderType::OpenAI => &OPENAI,
            ProviderType::Anthropic => &ANTHROPIC,
            ProviderType::Google => &GOOGLE,
            ProviderType::Ollama => &OLLAMA,
        }
    }

    /// Whether channels of this type need a credential
    pub fn requires_key(&self) -> bool {
        !matches!(self, ProviderType::Ollama)
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized provider type name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown provider type '{0}'")]
pub struct UnknownProviderType(pub String);

impl FromStr for ProviderType {
    type Err = UnknownProviderType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" | "openai-compatible" | "openai_compatible" => Ok(ProviderType::OpenAI),
            "anthropic" | "claude" => Ok(ProviderType::Anthropic),
            "google" | "gemini" => Ok(ProviderType::Google),
            "ollama" => Ok(ProviderType::Ollama),
            _ => Err(UnknownProviderType(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_type_parsing() {
        assert_eq!("OpenAI".parse::<ProviderType>().unwrap(), ProviderType::OpenAI);
        assert_eq!("gemini".parse::<ProviderType>().unwrap(), ProviderType::Google);
        assert_eq!(
            "cohere".parse::<ProviderType>().unwrap_err(),
            UnknownProviderType("cohere".to_string())
        );
    }

    #[test]
    fn test_adapter_dispatch_matches_type() {
        for provider in ProviderType::ALL {
            assert_eq!(provider.adapter().provider_type(), provider);
        }
    }
}
