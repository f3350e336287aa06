//! Channel selection properties: exclusion, weighted share, least connections,
//! and the breaker gate in front of them

use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use switchyard_core::breaker::{BreakerState, CircuitBreaker, CircuitBreakers};
use switchyard_core::channel::{ChannelConfig, ChannelRegistry, InFlightGuard};
use switchyard_core::config::{BreakerSettings, RegistrySettings, RoutingPolicy};
use switchyard_core::relay::RelayError;
use switchyard_core::routing::{ChannelSelector, RelayContext};

fn channel(id: &str, priority: i32, weight: u32) -> ChannelConfig {
    ChannelConfig::new(id, "openai")
        .with_key("sk-test-abcdef123456")
        .with_models(["gpt-4o"])
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
fn test_weighted_share_over_many_selections() {
    let selector = selector(
        vec![channel("a", 1, 3), channel("b", 1, 1)],
        RoutingPolicy::WeightedRoundRobin,
    );
    let ctx = RelayContext::new("gpt-4o");

    let mut counts: HashMap<String, u32> = HashMap::new();
    for _ in 0..4000 {
        let entry = selector.select(&ctx).unwrap();
        *counts.entry(entry.channel.id.clone()).or_default() += 1;
    }

    assert_eq!(counts["a"], 3000);
    assert_eq!(counts["b"], 1000);
}

#[test]
fn test_least_connections_picks_a_least_loaded_channel() {
    let registry = Arc::new(ChannelRegistry::new(RegistrySettings::default()));
    registry
        .load(vec![channel("a", 1, 1), channel("b", 1, 1), channel("c", 1, 1)])
        .unwrap();
    let selector = ChannelSelector::new(
        registry.clone(),
        Arc::new(CircuitBreakers::default()),
        RoutingPolicy::LeastConnections,
    );

    let mut guards: Vec<InFlightGuard> = Vec::new();
    for (id, n) in [("a", 5), ("b", 2), ("c", 2)] {
        for _ in 0..n {
            guards.push(registry.begin_request(id, 0).unwrap());
        }
    }

    let chosen = selector.select(&RelayContext::new("gpt-4o")).unwrap();
    assert!(["b", "c"].contains(&chosen.channel.id.as_str()));
    assert_eq!(chosen.stats.in_flight(), 2);
}

#[test]
fn test_guards_release_in_flight_on_drop() {
    let registry = ChannelRegistry::new(RegistrySettings::default());
    registry.load(vec![channel("a", 1, 1)]).unwrap();

    let guard = registry.begin_request("a", 10).unwrap();
    assert_eq!(registry.get("a").unwrap().stats.in_flight(), 1);
    drop(guard);
    assert_eq!(registry.get("a").unwrap().stats.in_flight(), 0);
}

proptest! {
    #[test]
    fn prop_breaker_opens_exactly_at_threshold(threshold in 1u32..12) {
        let breaker = CircuitBreaker::new(
            "a",
            &BreakerSettings {
                failure_threshold: threshold,
                cooldown_ms: 60_000,
                window_ms: 60_000,
            },
        );
        for _ in 1..threshold {
            prop_assert_eq!(breaker.record_failure(), None);
            prop_assert!(breaker.is_eligible());
        }
        prop_assert_eq!(breaker.record_failure(), Some(BreakerState::Open));
        prop_assert!(!breaker.is_eligible());
    }

    #[test]
    fn prop_never_selects_tried_or_open_channels(
        specs in prop::collection::vec((1i32..4, 1u32..5, any::<bool>(), any::<bool>()), 1..8),
        least_connections in any::<bool>(),
    ) {
        let configs: Vec<ChannelConfig> = specs
            .iter()
            .enumerate()
            .map(|(i, (priority, weight, _, _))| channel(&format!("ch{}", i), *priority, *weight))
            .collect();
        let policy = if least_connections {
            RoutingPolicy::LeastConnections
        } else {
            RoutingPolicy::WeightedRoundRobin
        };
        let registry = Arc::new(ChannelRegistry::new(RegistrySettings::default()));
        registry.load(configs).unwrap();
        let breakers = Arc::new(CircuitBreakers::new(BreakerSettings {
            failure_threshold: 1,
            cooldown_ms: 60_000,
            window_ms: 60_000,
        }));
        let selector = ChannelSelector::new(registry, breakers.clone(), policy);

        let mut ctx = RelayContext::new("gpt-4o");
        let mut excluded = Vec::new();
        for (i, (_, _, tried, open)) in specs.iter().enumerate() {
            let id = format!("ch{}", i);
            if *tried {
                ctx.mark_used(&id);
                excluded.push(id.clone());
            }
            if *open {
                breakers.record_failure(&id);
                excluded.push(id);
            }
        }

        let eligible = specs.iter().filter(|(_, _, tried, open)| !tried && !open).count();
        for _ in 0..10 {
            match selector.select(&ctx) {
                Ok(entry) => {
                    prop_assert!(!excluded.contains(&entry.channel.id));
                    let best = specs
                        .iter()
                        .filter(|(_, _, tried, open)| !tried && !open)
                        .map(|(priority, _, _, _)| *priority)
                        .min();
                    prop_assert_eq!(Some(entry.channel.priority), best);
                }
                Err(RelayError::NoAvailableChannel { .. }) => prop_assert_eq!(eligible, 0),
                Err(other) => prop_assert!(false, "unexpected error {:?}", other),
            }
        }
    }
}
