//! Protocol error for malformed upstream payloads

use super::ProviderType;
use thiserror::Error;

/// Longest raw fragment kept on a [`ProtocolError`]
pub const MAX_FRAGMENT_LEN: usize = 512;

/// An upstream payload that could not be mapped to canonical form
///
/// `fragment` holds the offending raw text, truncated for diagnostics.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{provider} protocol error: {message}")]
pub struct ProtocolError {
    pub provider: ProviderType,
    pub message: String,
    pub fragment: String,
}

impl ProtocolError {
    pub fn new(provider: ProviderType, message: impl Into<String>, raw: &str) -> Self {
        Self {
            provider,
            message: message.into(),
            fragment: truncate_fragment(raw, MAX_FRAGMENT_LEN),
        }
    }

    /// A payload that failed to deserialize
    pub fn malformed(provider: ProviderType, error: &serde_json::Error, raw: &str) -> Self {
        Self::new(provider, format!("malformed payload: {}", error), raw)
    }
}

/// Cut `raw` to at most `max` bytes on a char boundary, marking the cut
pub fn truncate_fragment(raw: &str, max: usize) -> String {
    if raw.len() <= max {
        return raw.to_string();
    }

    let mut end = max;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &raw[..end])
}
