//! Usage and cost records for the accounting collaborator

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

/// How the attempt that produced a record ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageOutcome {
    Success,
    Failure,
    /// The caller went away; not counted as a channel failure
    Cancelled,
}

/// One usage/cost log record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub user_id: Option<String>,
    /// Empty when no channel was ever selected
    pub channel_id: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    /// Estimated USD cost
    pub cost: f64,
    pub latency_ms: u64,
    pub attempts: u32,
    pub stream: bool,
    pub success: bool,
    pub outcome: UsageOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Destination for usage records
///
/// Called inline on the request path and from drop handlers, so
/// implementations must not block; queue and return.
pub trait UsageSink: Send + Sync {
    fn record(&self, record: UsageRecord);
}

/// Writes usage records as structured tracing events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingUsageSink;

impl UsageSink for TracingUsageSink {
    fn record(&self, record: UsageRecord) {
        info!(
            target: "switchyard::usage",
            request_id = %record.request_id,
            user_id = record.user_id.as_deref().unwrap_or(""),
            channel_id = %record.channel_id,
            model = %record.model,
            prompt_tokens = record.prompt_tokens,
            completion_tokens = record.completion_tokens,
            cost = record.cost,
            latency_ms = record.latency_ms,
            attempts = record.attempts,
            stream = record.stream,
            outcome = ?record.outcome,
            error_kind = record.error_kind.as_deref().unwrap_or(""),
            "usage"
        );
    }
}
