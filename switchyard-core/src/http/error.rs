//! Upstream error taxonomy and HTTP error mapping

use crate::providers::error::{truncate_fragment, ProtocolError};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Longest provider error message carried into an error value
const MAX_MESSAGE_LEN: usize = 200;

/// Errors of a single upstream attempt
///
/// These never cross the orchestrator boundary; the orchestrator classifies
/// them and folds the last one into its own terminal error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UpstreamError {
    #[error("upstream timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("upstream server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("rate limited by upstream: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("upstream rejected credentials ({status}): {message}")]
    Auth { status: u16, message: String },

    #[error("upstream rejected request ({status}): {message}")]
    Validation { status: u16, message: String },

    #[error("upstream quota exhausted: {message}")]
    QuotaExhausted { message: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// How an attempt failure affects the fail-over loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; back off, then try another channel
    Retryable,
    /// The channel cannot serve this request; try another channel immediately
    ChannelTerminal,
}

impl UpstreamError {
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::Timeout { .. }
            | Self::Transport { .. }
            | Self::Server { .. }
            | Self::RateLimited { .. }
            | Self::Protocol(_) => ErrorClass::Retryable,
            Self::Auth { .. } | Self::Validation { .. } | Self::QuotaExhausted { .. } => {
                ErrorClass::ChannelTerminal
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classify() == ErrorClass::Retryable
    }

    /// Server-provided wait hint, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Stable short code used in logs and usage records
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Transport { .. } => "transport",
            Self::Server { .. } => "server_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::Auth { .. } => "auth",
            Self::Validation { .. } => "validation",
            Self::QuotaExhausted { .. } => "quota_exhausted",
            Self::Protocol(_) => "protocol",
        }
    }
}

/// Map HTTP status code and response body to an UpstreamError
///
/// `retry_after` is the parsed `Retry-After` header; a JSON `retry_after`
/// field in the body is used when the header is absent.
pub fn map_http_error(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: Option<&str>,
) -> UpstreamError {
    let details = body
        .and_then(|b| serde_json::from_str::<Value>(b).ok())
        .and_then(|v| extract_error_details(&v));

    let message = details
        .as_ref()
        .map(|d| truncate_fragment(&d.message, MAX_MESSAGE_LEN))
        .unwrap_or_else(|| format!("HTTP error {}", status.as_u16()));

    let quota_hint = details.as_ref().is_some_and(|d| d.is_quota());

    match status {
        StatusCode::PAYMENT_REQUIRED => UpstreamError::QuotaExhausted { message },

        StatusCode::TOO_MANY_REQUESTS if quota_hint => UpstreamError::QuotaExhausted { message },

        StatusCode::TOO_MANY_REQUESTS => UpstreamError::RateLimited {
            retry_after: retry_after.or_else(|| {
                details
                    .as_ref()
                    .and_then(|d| d.retry_after_seconds)
                    .map(Duration::from_secs)
            }),
            message,
        },

        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => UpstreamError::Auth {
            status: status.as_u16(),
            message,
        },

        status if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT => {
            UpstreamError::Server {
                status: status.as_u16(),
                message,
            }
        }

        status => UpstreamError::Validation {
            status: status.as_u16(),
            message,
        },
    }
}

/// Error details extracted from response body
struct ErrorDetails {
    message: String,
    code: Option<String>,
    retry_after_seconds: Option<u64>,
}

impl ErrorDetails {
    fn is_quota(&self) -> bool {
        self.code
            .as_deref()
            .is_some_and(|c| c == "insufficient_quota" || c == "billing_hard_limit_reached")
    }
}

/// Extract error details from the common JSON error envelopes
fn extract_error_details(json: &Value) -> Option<ErrorDetails> {
    // OpenAI: { "error": { "message", "type", "code" } }
    // Anthropic: { "type": "error", "error": { "type", "message" } }
    // Google: { "error": { "code", "message", "status" } }
    if let Some(error) = json.get("error") {
        if let Some(message) = error.get("message").and_then(|v| v.as_str()) {
            let code = error
                .get("code")
                .and_then(|v| v.as_str())
                .or_else(|| error.get("type").and_then(|v| v.as_str()))
                .map(str::to_string);
            return Some(ErrorDetails {
                message: message.to_string(),
                code,
                retry_after_seconds: error.get("retry_after").and_then(|v| v.as_u64()),
            });
        }

        // Ollama: { "error": "..." }
        if let Some(message) = error.as_str() {
            return Some(ErrorDetails {
                message: message.to_string(),
                code: None,
                retry_after_seconds: None,
            });
        }
    }

    if let Some(message) = json.get("message").and_then(|v| v.as_str()) {
        return Some(ErrorDetails {
            message: message.to_string(),
            code: None,
            retry_after_seconds: json.get("retry_after").and_then(|v| v.as_u64()),
        });
    }

    None
}

/// Parse Retry-After header value
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    // Only the delta-seconds form is honored
    header_value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
