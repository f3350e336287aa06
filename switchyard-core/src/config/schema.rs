//! Relay settings schema with serde support
//!
//! Settings describe how the relay behaves (retry budget, timeouts, breaker
//! thresholds, routing policy). They never describe channels: the channel set
//! comes from a [`crate::channel::ChannelSource`].

use super::error::{ValidationError, ValidationErrorKind};
use crate::providers::ProviderType;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Settings schema version understood by this crate
pub const SETTINGS_VERSION: &str = "0.1";

/// Root settings structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RelaySettings {
    /// Schema version (required - no default)
    pub version: String,

    #[serde(default)]
    pub routing: RoutingSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub timeouts: TimeoutSettings,

    #[serde(default)]
    pub circuit_breaker: BreakerSettings,

    #[serde(default)]
    pub health_check: HealthCheckSettings,

    #[serde(default)]
    pub registry: RegistrySettings,

    #[serde(default)]
    pub events: EventSettings,

    /// Price overrides layered over the built-in table
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pricing: Vec<PriceOverride>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION.to_string(),
            routing: RoutingSettings::default(),
            retry: RetrySettings::default(),
            timeouts: TimeoutSettings::default(),
            circuit_breaker: BreakerSettings::default(),
            health_check: HealthCheckSettings::default(),
            registry: RegistrySettings::default(),
            events: EventSettings::default(),
            pricing: Vec::new(),
        }
    }
}

/// Channel selection policy among same-priority candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// Weight-proportional rotation with a per-tier cursor
    #[default]
    WeightedRoundRobin,
    /// Fewest in-flight requests wins
    LeastConnections,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingSettings {
    #[serde(default)]
    pub policy: RoutingPolicy,

    /// Alias -> canonical model name
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_aliases: HashMap<String, String>,
}

/// Retry budget and backoff between fail-over attempts
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    /// Maximum attempts per request context, initial attempt included
    #[serde(default = "default_budget")]
    pub budget: u32,

    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,

    /// Jitter factor in [0, 1]
    #[serde(default = "default_jitter")]
    pub jitter_factor: f64,

    #[serde(default = "default_true")]
    pub respect_retry_after: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            budget: default_budget(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            exponential_base: default_exponential_base(),
            jitter_factor: default_jitter(),
            respect_retry_after: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutSettings {
    /// Per-attempt timeout
    #[serde(default = "default_attempt_timeout")]
    pub attempt_ms: u64,

    /// Overall deadline for one request context
    #[serde(default = "default_context_timeout")]
    pub context_ms: u64,

    /// TCP/TLS connect timeout for the HTTP client
    #[serde(default = "default_connect_timeout")]
    pub connect_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            attempt_ms: default_attempt_timeout(),
            context_ms: default_context_timeout(),
            connect_ms: default_connect_timeout(),
        }
    }
}

impl TimeoutSettings {
    pub fn attempt(&self) -> Duration {
        Duration::from_millis(self.attempt_ms)
    }

    pub fn context(&self) -> Duration {
        Duration::from_millis(self.context_ms)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open breaker rejects traffic before half-opening
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,

    /// A failure streak older than this starts over
    #[serde(default = "default_window")]
    pub window_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown(),
            window_ms: default_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    /// Budget for a single probe
    #[serde(default = "default_probe_timeout")]
    pub timeout_ms: u64,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_health_interval(),
            timeout_ms: default_probe_timeout(),
        }
    }
}

impl HealthCheckSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RegistrySettings {
    /// Consecutive errors after which a channel is flagged `error`
    #[serde(default = "default_error_streak")]
    pub error_streak_threshold: u32,

    /// EMA smoothing factor for latency, in (0, 1]
    #[serde(default = "default_latency_smoothing")]
    pub latency_smoothing: f64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            error_streak_threshold: default_error_streak(),
            latency_smoothing: default_latency_smoothing(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EventSettings {
    /// Bounded queue size for the observer channel
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

/// Price override for one provider/model pair
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PriceOverride {
    pub provider: ProviderType,

    /// Model name or prefix
    pub model: String,

    /// USD per 1K prompt tokens
    pub input_per_1k: f64,

    /// USD per 1K completion tokens
    pub output_per_1k: f64,
}

// Default value functions for serde
fn default_true() -> bool { true }
fn default_budget() -> u32 { 3 }
fn default_initial_delay() -> u64 { 100 }
fn default_max_delay() -> u64 { 2_000 }
fn default_exponential_base() -> f64 { 2.0 }
fn default_jitter() -> f64 { 0.1 }
fn default_attempt_timeout() -> u64 { 30_000 }
fn default_context_timeout() -> u64 { 120_000 }
fn default_connect_timeout() -> u64 { 10_000 }
fn default_failure_threshold() -> u32 { 5 }
fn default_cooldown() -> u64 { 30_000 }
fn default_window() -> u64 { 60_000 }
fn default_health_interval() -> u64 { 30 }
fn default_probe_timeout() -> u64 { 5_000 }
fn default_error_streak() -> u32 { 3 }
fn default_latency_smoothing() -> f64 { 0.2 }
fn default_event_capacity() -> usize { 1024 }

impl RelaySettings {
    /// Validate the settings
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.version.is_empty() {
            return Err(ValidationError::required("version"));
        }

        if self.version != SETTINGS_VERSION {
            return Err(ValidationError::new(
                "version",
                ValidationErrorKind::InvalidVersion {
                    expected: SETTINGS_VERSION.to_string(),
                    actual: self.version.clone(),
                },
            ));
        }

        self.retry.validate("retry")?;
        self.timeouts.validate("timeouts")?;
        self.circuit_breaker.validate("circuit_breaker")?;

        if self.health_check.interval_secs == 0 {
            return Err(ValidationError::out_of_range(
                "health_check.interval_secs",
                "Must be greater than 0",
            ));
        }

        if self.health_check.timeout_ms == 0 {
            return Err(ValidationError::out_of_range(
                "health_check.timeout_ms",
                "Must be greater than 0",
            ));
        }

        if self.registry.error_streak_threshold == 0 {
            return Err(ValidationError::out_of_range(
                "registry.error_streak_threshold",
                "Must be greater than 0",
            ));
        }

        let alpha = self.registry.latency_smoothing;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(ValidationError::out_of_range(
                "registry.latency_smoothing",
                "Must be in (0.0, 1.0]",
            ));
        }

        if self.events.capacity == 0 {
            return Err(ValidationError::out_of_range(
                "events.capacity",
                "Must be greater than 0",
            ));
        }

        let mut seen = HashSet::new();
        for (i, price) in self.pricing.iter().enumerate() {
            let path = format!("pricing[{}]", i);
            if price.model.is_empty() {
                return Err(ValidationError::required(format!("{}.model", path)));
            }
            if price.input_per_1k < 0.0 || price.output_per_1k < 0.0 {
                return Err(ValidationError::out_of_range(path, "Prices must be non-negative"));
            }
            if !seen.insert((price.provider, price.model.as_str())) {
                return Err(ValidationError::duplicate(
                    format!("{}.model", path),
                    format!("{}/{}", price.provider, price.model),
                ));
            }
        }

        Ok(())
    }
}

impl RetrySettings {
    pub fn validate(&self, path: &str) -> Result<(), ValidationError> {
        if self.budget == 0 {
            return Err(ValidationError::out_of_range(
                format!("{}.budget", path),
                "Must allow at least one attempt",
            ));
        }

        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ValidationError::incompatible(
                format!("{}.max_delay_ms", path),
                "Must be >= initial_delay_ms",
            ));
        }

        if self.exponential_base < 1.0 {
            return Err(ValidationError::out_of_range(
                format!("{}.exponential_base", path),
                "Must be at least 1.0",
            ));
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ValidationError::out_of_range(
                format!("{}.jitter_factor", path),
                "Must be between 0.0 and 1.0",
            ));
        }

        Ok(())
    }
}

impl TimeoutSettings {
    pub fn validate(&self, path: &str) -> Result<(), ValidationError> {
        if self.attempt_ms == 0 {
            return Err(ValidationError::out_of_range(
                format!("{}.attempt_ms", path),
                "Must be greater than 0",
            ));
        }

        if self.context_ms < self.attempt_ms {
            return Err(ValidationError::incompatible(
                format!("{}.context_ms", path),
                "Must be >= attempt_ms",
            ));
        }

        Ok(())
    }
}

impl BreakerSettings {
    pub fn validate(&self, path: &str) -> Result<(), ValidationError> {
        if self.failure_threshold == 0 {
            return Err(ValidationError::out_of_range(
                format!("{}.failure_threshold", path),
                "Must be greater than 0",
            ));
        }

        if self.cooldown_ms == 0 {
            return Err(ValidationError::out_of_range(
                format!("{}.cooldown_ms", path),
                "Must be greater than 0",
            ));
        }

        Ok(())
    }
}
