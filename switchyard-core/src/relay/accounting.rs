//! Outcome accounting shared by live traffic and health probes
//!
//! Both paths go through these two functions so a probe failure and a
//! request failure count the same way against a channel.

use crate::breaker::{BreakerState, CircuitBreakers};
use crate::channel::{ChannelRegistry, FailureKind, Outcome};

/// Record a successful attempt or probe
///
/// A success that closes a half-open breaker also brings an `error` channel
/// back to `active`.
pub(crate) fn record_success(
    registry: &ChannelRegistry,
    breakers: &CircuitBreakers,
    channel_id: &str,
    latency_ms: u64,
) {
    registry.record_outcome(channel_id, Outcome::success(latency_ms));
    if breakers.record_success(channel_id) {
        registry.restore_active(channel_id, "circuit breaker closed");
    }
}

/// Record a failed attempt or probe; returns the breaker state if it opened
pub(crate) fn record_failure(
    registry: &ChannelRegistry,
    breakers: &CircuitBreakers,
    channel_id: &str,
    kind: FailureKind,
    latency_ms: u64,
) -> Option<BreakerState> {
    registry.record_outcome(channel_id, Outcome::failure(kind, latency_ms));
    breakers.record_failure(channel_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, ChannelStatus};
    use crate::config::{BreakerSettings, RegistrySettings};

    #[test]
    fn test_breaker_close_restores_error_channel() {
        let registry = ChannelRegistry::new(RegistrySettings::default());
        registry
            .load(vec![ChannelConfig::new("a", "ollama").with_models(["*"])])
            .unwrap();
        let breakers = CircuitBreakers::new(BreakerSettings {
            failure_threshold: 3,
            cooldown_ms: 10,
            window_ms: 60_000,
        });

        for _ in 0..3 {
            record_failure(&registry, &breakers, "a", FailureKind::Server, 5);
        }
        assert_eq!(registry.get("a").unwrap().stats.status(), ChannelStatus::Error);
        assert_eq!(breakers.state("a"), Some(BreakerState::Open));

        std::thread::sleep(std::time::Duration::from_millis(30));
        record_success(&registry, &breakers, "a", 5);
        assert_eq!(breakers.state("a"), Some(BreakerState::Closed));
        assert_eq!(registry.get("a").unwrap().stats.status(), ChannelStatus::Active);
    }
}
