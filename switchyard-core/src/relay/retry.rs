//! Retry budget and backoff between fail-over attempts
//!
//! Every failed attempt moves on to another channel. Only retryable failures
//! wait first: exponential backoff with jitter, or the upstream's
//! `Retry-After` hint when present.

use crate::config::RetrySettings;
use crate::http::{ErrorClass, UpstreamError};
use rand::Rng;
use std::time::Duration;

/// Attempt budget and backoff configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum attempts per request, initial attempt included
    pub budget: u32,

    /// Delay before the first retry (milliseconds)
    pub initial_delay_ms: u64,

    /// Maximum delay between attempts (milliseconds)
    pub max_delay_ms: u64,

    /// Base for exponential backoff (e.g., 2.0 for doubling)
    pub exponential_base: f64,

    /// Jitter factor (0.0 to 1.0) to randomize delays
    pub jitter_factor: f64,

    /// Whether to honour upstream retry-after hints
    pub respect_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            budget: settings.budget.max(1),
            initial_delay_ms: settings.initial_delay_ms,
            max_delay_ms: settings.max_delay_ms,
            exponential_base: settings.exponential_base,
            jitter_factor: settings.jitter_factor,
            respect_retry_after: settings.respect_retry_after,
        }
    }
}

impl RetryPolicy {
    /// Fail over without waiting
    pub fn immediate(budget: u32) -> Self {
        Self {
            budget: budget.max(1),
            initial_delay_ms: 0,
            max_delay_ms: 0,
            jitter_factor: 0.0,
            respect_retry_after: false,
            ..Default::default()
        }
    }

    /// Whether another attempt fits in the budget after `attempts` were made
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.budget
    }

    /// Wait before the next attempt, `None` to fail over immediately
    ///
    /// `retry` is zero-based: 0 is the wait before the second attempt.
    pub fn calculate_delay(&self, retry: u32, error: &UpstreamError) -> Option<Duration> {
        if error.classify() == ErrorClass::ChannelTerminal {
            return None;
        }

        if self.respect_retry_after {
            if let Some(retry_after) = error.retry_after() {
                return Some(retry_after.min(Duration::from_millis(self.max_delay_ms.max(1))));
            }
        }

        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay_ms as f64 * self.exponential_base.powi(exponent);
        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let delay_with_jitter = if self.jitter_factor > 0.0 && capped_delay > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped_delay * self.jitter_factor;
            let jitter = rng.gen_range(-jitter_range..=jitter_range);
            (capped_delay + jitter).max(0.0)
        } else {
            capped_delay
        };

        if delay_with_jitter < 1.0 {
            return None;
        }
        Some(Duration::from_millis(delay_with_jitter as u64))
    }
}
