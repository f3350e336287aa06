//! Terminal errors surfaced to relay callers

use crate::http::UpstreamError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Stable error code for a terminal relay failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoAvailableChannel,
    BudgetExhausted,
    DeadlineExceeded,
    Cancelled,
    StreamInterrupted,
    Configuration,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NoAvailableChannel => "no_available_channel",
            ErrorKind::BudgetExhausted => "budget_exhausted",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::StreamInterrupted => "stream_interrupted",
            ErrorKind::Configuration => "configuration",
        }
    }

    /// HTTP status a front end would answer with
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::NoAvailableChannel => 503,
            ErrorKind::BudgetExhausted => 502,
            ErrorKind::DeadlineExceeded => 504,
            ErrorKind::Cancelled => 499,
            ErrorKind::StreamInterrupted => 502,
            ErrorKind::Configuration => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The one error that crosses the relay boundary
///
/// Messages carry upstream error summaries, never raw provider bodies.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RelayError {
    #[error("No available channel for model '{model}' (tried: {})", format_tried(.tried))]
    NoAvailableChannel {
        model: String,
        tried: Vec<String>,
        last_error: Option<UpstreamError>,
    },

    #[error("Retry budget exhausted after {attempts} attempts (tried: {}): {last_error}", format_tried(.tried))]
    BudgetExhausted {
        attempts: u32,
        tried: Vec<String>,
        last_error: UpstreamError,
    },

    #[error("Deadline exceeded after {elapsed_ms}ms (tried: {})", format_tried(.tried))]
    DeadlineExceeded { elapsed_ms: u64, tried: Vec<String> },

    #[error("Request cancelled by caller")]
    Cancelled,

    #[error("Stream from channel '{channel_id}' interrupted: {reason}")]
    StreamInterrupted { channel_id: String, reason: String },

    #[error("Relay misconfigured: {message}")]
    Configuration { message: String },
}

fn format_tried(tried: &[String]) -> String {
    if tried.is_empty() {
        "none".to_string()
    } else {
        tried.join(", ")
    }
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::NoAvailableChannel { .. } => ErrorKind::NoAvailableChannel,
            RelayError::BudgetExhausted { .. } => ErrorKind::BudgetExhausted,
            RelayError::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            RelayError::Cancelled => ErrorKind::Cancelled,
            RelayError::StreamInterrupted { .. } => ErrorKind::StreamInterrupted,
            RelayError::Configuration { .. } => ErrorKind::Configuration,
        }
    }

    /// Channel ids tried before the failure, in order
    pub fn tried(&self) -> &[String] {
        match self {
            RelayError::NoAvailableChannel { tried, .. }
            | RelayError::BudgetExhausted { tried, .. }
            | RelayError::DeadlineExceeded { tried, .. } => tried,
            _ => &[],
        }
    }

    /// Last per-attempt error, when one was seen
    pub fn last_upstream_error(&self) -> Option<&UpstreamError> {
        match self {
            RelayError::NoAvailableChannel { last_error, .. } => last_error.as_ref(),
            RelayError::BudgetExhausted { last_error, .. } => Some(last_error),
            _ => None,
        }
    }
}
