//! Channel selection among eligible candidates
//!
//! Candidates come from the registry in priority order. Channels already
//! tried by the context, channels with an open breaker, administratively
//! unroutable channels and channels at their per-minute caps are dropped.
//! The lowest priority tier left is handed to the configured policy.

use crate::breaker::CircuitBreakers;
use crate::channel::{ChannelEntry, ChannelRegistry};
use crate::config::RoutingPolicy;
use crate::relay::RelayError;
use crate::routing::RelayContext;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Picks the next channel for a relay context
pub struct ChannelSelector {
    registry: Arc<ChannelRegistry>,
    breakers: Arc<CircuitBreakers>,
    policy: RoutingPolicy,
    /// Weighted round robin cursor per tier, keyed by priority and member ids
    cursors: DashMap<String, AtomicU64>,
    /// Registry epoch the cursors belong to; a reload clears them
    cursor_epoch: AtomicU64,
}

impl ChannelSelector {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        breakers: Arc<CircuitBreakers>,
        policy: RoutingPolicy,
    ) -> Self {
        let cursor_epoch = AtomicU64::new(registry.epoch());
        Self {
            registry,
            breakers,
            policy,
            cursors: DashMap::new(),
            cursor_epoch,
        }
    }

    pub fn policy(&self) -> RoutingPolicy {
        self.policy
    }

    /// Every channel the context could be routed to right now, in priority order
    pub fn candidates(&self, ctx: &RelayContext) -> Vec<ChannelEntry> {
        self.registry
            .get_channels_for_model(&ctx.model, ctx.group.as_deref())
            .into_iter()
            .filter(|entry| !ctx.has_tried(&entry.channel.id))
            .filter(|entry| entry.stats.status().is_routable())
            .filter(|entry| self.breakers.is_eligible(&entry.channel.id))
            .filter(|entry| {
                !entry
                    .stats
                    .is_over_limits(entry.channel.rpm_limit, entry.channel.tpm_limit)
            })
            .collect()
    }

    /// Select a channel or fail with `NoAvailableChannel`
    pub fn select(&self, ctx: &RelayContext) -> Result<ChannelEntry, RelayError> {
        let candidates = self.candidates(ctx);
        let Some(first) = candidates.first() else {
            return Err(RelayError::NoAvailableChannel {
                model: ctx.model.clone(),
                tried: ctx.used_channels().to_vec(),
                last_error: None,
            });
        };

        let priority = first.channel.priority;
        let tier: Vec<ChannelEntry> = candidates
            .into_iter()
            .take_while(|entry| entry.channel.priority == priority)
            .collect();

        let chosen = match self.policy {
            RoutingPolicy::WeightedRoundRobin => self.weighted_round_robin(priority, tier),
            RoutingPolicy::LeastConnections => least_connections(tier),
        };

        match chosen {
            Some(entry) => {
                debug!(
                    request_id = %ctx.request_id,
                    channel_id = %entry.channel.id,
                    model = %ctx.model,
                    priority,
                    "Channel selected"
                );
                Ok(entry)
            }
            None => Err(RelayError::NoAvailableChannel {
                model: ctx.model.clone(),
                tried: ctx.used_channels().to_vec(),
                last_error: None,
            }),
        }
    }

    /// Cumulative-weight pick at a cursor that advances once per call
    fn weighted_round_robin(&self, priority: i32, tier: Vec<ChannelEntry>) -> Option<ChannelEntry> {
        let total: u64 = tier.iter().map(|e| u64::from(e.channel.weight)).sum();
        if total == 0 {
            return tier.into_iter().next();
        }

        let epoch = self.registry.epoch();
        if self.cursor_epoch.swap(epoch, Ordering::AcqRel) != epoch {
            self.cursors.clear();
        }

        let mut ids: Vec<&str> = tier.iter().map(|e| e.channel.id.as_str()).collect();
        ids.sort_unstable();
        let key = format!("{}|{}", priority, ids.join(","));
        let tick = match self.cursors.get(&key) {
            Some(cursor) => cursor.fetch_add(1, Ordering::Relaxed),
            None => self
                .cursors
                .entry(key)
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(1, Ordering::Relaxed),
        };

        let mut point = tick % total;
        for entry in tier {
            let weight = u64::from(entry.channel.weight);
            if point < weight {
                return Some(entry);
            }
            point -= weight;
        }
        None
    }
}

/// Fewest in-flight requests, then lowest average latency, then id
///
/// A channel without latency samples ranks as fastest so it gets measured.
fn least_connections(tier: Vec<ChannelEntry>) -> Option<ChannelEntry> {
    tier.into_iter().min_by(|a, b| {
        a.stats
            .in_flight()
            .cmp(&b.stats.in_flight())
            .then_with(|| {
                let la = a.stats.avg_latency_ms().unwrap_or(0.0);
                let lb = b.stats.avg_latency_ms().unwrap_or(0.0);
                la.total_cmp(&lb)
            })
            .then_with(|| a.channel.id.cmp(&b.channel.id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, ChannelStatus};
    use crate::config::{BreakerSettings, RegistrySettings};

    fn config(id: &str, priority: i32, weight: u32) -> ChannelConfig {
        ChannelConfig::new(id, "openai")
            .with_key("sk-abcdef1234567890")
            .with_models(["x"])
            .with_priority(priority)
            .with_weight(weight)
    }

    fn selector(configs: Vec<ChannelConfig>, policy: RoutingPolicy) -> ChannelSelector {
        let registry = Arc::new(ChannelRegistry::new(RegistrySettings::default()));
        registry.load(configs).unwrap();
        let breakers = Arc::new(CircuitBreakers::new(BreakerSettings {
            failure_threshold: 1,
            cooldown_ms: 60_000,
            window_ms: 60_000,
        }));
        ChannelSelector::new(registry, breakers, policy)
    }

    #[test]
    fn test_wrr_cycles_in_weight_proportion() {
        let selector = selector(
            vec![config("a", 1, 3), config("b", 1, 1)],
            RoutingPolicy::WeightedRoundRobin,
        );
        let ctx = RelayContext::new("x");
        let picks: Vec<String> = (0..8)
            .map(|_| selector.select(&ctx).unwrap().channel.id.clone())
            .collect();
        assert_eq!(picks, vec!["a", "a", "a", "b", "a", "a", "a", "b"]);
    }

    #[test]
    fn test_excludes_used_channels() {
        let selector = selector(
            vec![config("a", 1, 1), config("b", 1, 1)],
            RoutingPolicy::WeightedRoundRobin,
        );
        let mut ctx = RelayContext::new("x");
        ctx.mark_used("a");
        for _ in 0..5 {
            assert_eq!(selector.select(&ctx).unwrap().channel.id, "b");
        }
        ctx.mark_used("b");
        assert!(matches!(
            selector.select(&ctx),
            Err(RelayError::NoAvailableChannel { .. })
        ));
    }

    #[test]
    fn test_lower_tier_only_when_upper_unavailable() {
        let selector = selector(
            vec![config("a", 1, 1), config("c", 2, 1)],
            RoutingPolicy::WeightedRoundRobin,
        );
        let ctx = RelayContext::new("x");
        assert_eq!(selector.select(&ctx).unwrap().channel.id, "a");

        selector.breakers.record_failure("a");
        assert_eq!(selector.select(&ctx).unwrap().channel.id, "c");
    }

    #[test]
    fn test_disabled_and_exhausted_skipped_but_error_kept() {
        let selector = selector(
            vec![
                config("a", 1, 1).with_status(ChannelStatus::Disabled),
                config("b", 1, 1).with_balance(0.0),
                config("c", 1, 1),
            ],
            RoutingPolicy::LeastConnections,
        );
        selector.registry.set_status("c", ChannelStatus::Error);
        let ctx = RelayContext::new("x");
        assert_eq!(selector.select(&ctx).unwrap().channel.id, "c");
    }

    #[test]
    fn test_testing_channel_stays_routable() {
        let selector = selector(vec![config("a", 1, 1)], RoutingPolicy::WeightedRoundRobin);
        selector.registry.set_status("a", ChannelStatus::Testing);
        assert!(ChannelStatus::Testing.is_routable());
        assert_eq!(
            selector.select(&RelayContext::new("x")).unwrap().channel.id,
            "a"
        );
    }

    #[test]
    fn test_least_connections_prefers_idle() {
        let selector = selector(
            vec![config("a", 1, 1), config("b", 1, 1), config("c", 1, 1)],
            RoutingPolicy::LeastConnections,
        );
        let _g1 = selector.registry.begin_request("a", 0).unwrap();
        let _g2 = selector.registry.begin_request("b", 0).unwrap();
        let ctx = RelayContext::new("x");
        assert_eq!(selector.select(&ctx).unwrap().channel.id, "c");
    }

    #[test]
    fn test_least_connections_latency_tiebreak() {
        use crate::channel::Outcome;

        let selector = selector(
            vec![config("a", 1, 1), config("b", 1, 1)],
            RoutingPolicy::LeastConnections,
        );
        selector.registry.record_outcome("a", Outcome::success(300));
        selector.registry.record_outcome("b", Outcome::success(100));
        let ctx = RelayContext::new("x");
        assert_eq!(selector.select(&ctx).unwrap().channel.id, "b");
    }

    #[test]
    fn test_rpm_capped_channel_skipped() {
        let selector = selector(
            vec![config("a", 1, 1).with_rpm_limit(1), config("b", 2, 1)],
            RoutingPolicy::WeightedRoundRobin,
        );
        let ctx = RelayContext::new("x");
        let _guard = selector.registry.begin_request("a", 0).unwrap();
        assert_eq!(selector.select(&ctx).unwrap().channel.id, "b");
    }

    #[test]
    fn test_group_hint_filters() {
        let selector = selector(
            vec![config("a", 1, 1), config("vip", 2, 1).with_groups(["vip"])],
            RoutingPolicy::WeightedRoundRobin,
        );
        let ctx = RelayContext::new("x").with_group("vip");
        assert_eq!(selector.select(&ctx).unwrap().channel.id, "vip");
    }

    #[test]
    fn test_wrr_cursors_bounded_by_tiers() {
        let selector = selector(
            vec![ChannelConfig::new("any", "openai")
                .with_key("sk-abcdef1234567890")
                .with_models(["*"])],
            RoutingPolicy::WeightedRoundRobin,
        );
        for i in 0..1000 {
            let ctx = RelayContext::new(format!("model-{}", i));
            assert_eq!(selector.select(&ctx).unwrap().channel.id, "any");
        }
        assert_eq!(selector.cursors.len(), 1);

        selector
            .registry
            .load(vec![config("a", 1, 1), config("b", 1, 1)])
            .unwrap();
        selector.select(&RelayContext::new("x")).unwrap();
        assert_eq!(selector.cursors.len(), 1);
        assert!(selector.cursors.contains_key("1|a,b"));
    }
}
