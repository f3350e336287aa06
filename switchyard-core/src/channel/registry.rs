//! In-memory channel registry
//!
//! The channel set is an immutable snapshot behind an `ArcSwap`: readers load
//! it without locking and a reload swaps in a complete new set at once.
//! Per-channel counters are atomics in [`ChannelStats`], shared across
//! snapshots for ids present in both, so a reload never loses in-flight
//! counts or history.

use super::model::{Channel, ChannelConfig, ChannelStatus};
use super::source::ChannelSource;
use super::stats::{ChannelStats, InFlightGuard};
use crate::breaker::BreakerState;
use crate::config::{ConfigError, ConfigValidator, RegistrySettings};
use crate::events::{EventBus, RelayEvent};
use crate::http::UpstreamError;
use crate::providers::ProviderType;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Failure category reported with an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Transport,
    Server,
    RateLimited,
    Auth,
    Validation,
    QuotaExhausted,
    Protocol,
}

impl From<&UpstreamError> for FailureKind {
    fn from(error: &UpstreamError) -> Self {
        match error {
            UpstreamError::Timeout { .. } => FailureKind::Timeout,
            UpstreamError::Transport { .. } => FailureKind::Transport,
            UpstreamError::Server { .. } => FailureKind::Server,
            UpstreamError::RateLimited { .. } => FailureKind::RateLimited,
            UpstreamError::Auth { .. } => FailureKind::Auth,
            UpstreamError::Validation { .. } => FailureKind::Validation,
            UpstreamError::QuotaExhausted { .. } => FailureKind::QuotaExhausted,
            UpstreamError::Protocol(_) => FailureKind::Protocol,
        }
    }
}

/// Result of one attempt or probe against a channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outcome {
    pub success: bool,
    pub latency_ms: u64,
    pub error_kind: Option<FailureKind>,
}

impl Outcome {
    pub fn success(latency_ms: u64) -> Self {
        Self {
            success: true,
            latency_ms,
            error_kind: None,
        }
    }

    pub fn failure(kind: FailureKind, latency_ms: u64) -> Self {
        Self {
            success: false,
            latency_ms,
            error_kind: Some(kind),
        }
    }
}

/// A channel together with its live counters
#[derive(Debug, Clone)]
pub struct ChannelEntry {
    pub channel: Arc<Channel>,
    pub stats: Arc<ChannelStats>,
}

#[derive(Debug, Default)]
struct RegistrySnapshot {
    entries: HashMap<String, ChannelEntry>,
    epoch: u64,
}

/// Point-in-time view of one channel for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub id: String,
    pub name: String,
    pub provider: ProviderType,
    pub status: ChannelStatus,
    pub priority: i32,
    pub weight: u32,
    pub success_count: u64,
    pub error_count: u64,
    pub consecutive_errors: u32,
    pub avg_latency_ms: Option<f64>,
    pub in_flight: u32,
    pub minute_requests: u32,
    pub minute_tokens: u64,
    pub total_cost: f64,
    pub remaining_balance: Option<f64>,
    pub last_used: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
    /// Filled in by callers that also own the breakers
    pub breaker: Option<BreakerState>,
}

/// Channel registry: the source of truth for routing eligibility
pub struct ChannelRegistry {
    current: ArcSwap<RegistrySnapshot>,
    settings: RegistrySettings,
    validator: ConfigValidator,
    events: Option<EventBus>,
    /// Serializes reloads against each other; readers never take it
    reload: Mutex<()>,
}

impl ChannelRegistry {
    pub fn new(settings: RegistrySettings) -> Self {
        Self {
            current: ArcSwap::from_pointee(RegistrySnapshot::default()),
            settings,
            validator: ConfigValidator::new(),
            events: None,
            reload: Mutex::new(()),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Atomically replace the channel set
    ///
    /// Fails without touching the current set if any channel is invalid or
    /// references an unknown provider type.
    pub fn load(&self, configs: Vec<ChannelConfig>) -> Result<usize, ConfigError> {
        let channels = self.validator.validate_channels(configs)?;

        let _guard = self.reload.lock();
        let previous = self.current.load_full();
        let mut entries = HashMap::with_capacity(channels.len());
        let mut changes = Vec::new();

        for channel in channels {
            let desired = channel.starting_status();
            let stats = match previous.entries.get(&channel.id) {
                Some(existing) => {
                    let current = existing.stats.status();
                    let spent = matches!(
                        channel.balance,
                        Some(balance) if existing.stats.total_cost() >= balance
                    );
                    let next = match (current, desired) {
                        (_, desired) if desired != ChannelStatus::Active => desired,
                        _ if spent => ChannelStatus::Exhausted,
                        (ChannelStatus::Error | ChannelStatus::Testing, _) => current,
                        _ => ChannelStatus::Active,
                    };
                    if let Some(from) = existing.stats.transition(next, |_| true) {
                        changes.push((channel.id.clone(), from, next));
                    }
                    existing.stats.clone()
                }
                None => Arc::new(ChannelStats::new(desired)),
            };

            entries.insert(
                channel.id.clone(),
                ChannelEntry {
                    channel: Arc::new(channel),
                    stats,
                },
            );
        }

        let count = entries.len();
        let epoch = previous.epoch + 1;
        self.current.store(Arc::new(RegistrySnapshot { entries, epoch }));
        info!(channels = count, epoch, "Channel registry loaded");

        for (channel_id, from, to) in changes {
            self.announce(&channel_id, from, to, "reload");
        }

        Ok(count)
    }

    /// Fetch channels from a collaborator and load them
    pub async fn reload_from(&self, source: &dyn ChannelSource) -> Result<usize, ConfigError> {
        let configs = source
            .list_channels()
            .await
            .map_err(|e| ConfigError::SourceFailed {
                message: format!("{:#}", e),
            })?;
        self.load(configs)
    }

    /// Monotonic counter bumped by every successful load
    pub fn epoch(&self) -> u64 {
        self.current.load().epoch
    }

    pub fn len(&self) -> usize {
        self.current.load().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<ChannelEntry> {
        self.current.load().entries.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.current.load().entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// All channels serving `model`, optionally restricted to a group
    ///
    /// Ordered by ascending priority, then descending weight, then id.
    /// Status is not filtered here.
    pub fn get_channels_for_model(&self, model: &str, group: Option<&str>) -> Vec<ChannelEntry> {
        let snapshot = self.current.load();
        let mut matches: Vec<ChannelEntry> = snapshot
            .entries
            .values()
            .filter(|e| e.channel.supports_model(model) && e.channel.in_group(group))
            .cloned()
            .collect();

        matches.sort_by(|a, b| {
            a.channel
                .priority
                .cmp(&b.channel.priority)
                .then_with(|| b.channel.weight.cmp(&a.channel.weight))
                .then_with(|| a.channel.id.cmp(&b.channel.id))
        });
        matches
    }

    /// Fold an attempt or probe outcome into the channel's counters
    ///
    /// A quota failure exhausts the channel; a streak of
    /// `error_streak_threshold` failures flags it `error`.
    pub fn record_outcome(&self, id: &str, outcome: Outcome) {
        let Some(entry) = self.get(id) else {
            debug!(channel_id = id, "Outcome for unknown channel ignored");
            return;
        };

        if outcome.success {
            entry
                .stats
                .record_success(outcome.latency_ms, self.settings.latency_smoothing);
            return;
        }

        let streak = entry.stats.record_failure();
        if outcome.error_kind == Some(FailureKind::QuotaExhausted) {
            self.move_status(&entry, ChannelStatus::Exhausted, "quota exhausted", |s| {
                s != ChannelStatus::Disabled
            });
        } else if streak >= self.settings.error_streak_threshold {
            self.move_status(&entry, ChannelStatus::Error, "consecutive errors", |s| {
                matches!(s, ChannelStatus::Active | ChannelStatus::Testing)
            });
        }
    }

    /// Admin override to any status
    pub fn set_status(&self, id: &str, status: ChannelStatus) -> bool {
        let Some(entry) = self.get(id) else {
            return false;
        };
        if status == ChannelStatus::Active {
            entry.stats.reset_streak();
        }
        self.move_status(&entry, status, "admin", |_| true);
        true
    }

    /// Return an `error`/`testing` channel to `active`
    ///
    /// Used by a passing probe or a closing breaker. Disabled and exhausted
    /// channels need an admin action.
    pub fn restore_active(&self, id: &str, reason: &str) -> bool {
        let Some(entry) = self.get(id) else {
            return false;
        };
        entry.stats.reset_streak();
        self.move_status(&entry, ChannelStatus::Active, reason, |s| {
            matches!(s, ChannelStatus::Error | ChannelStatus::Testing)
        })
    }

    /// Flag an `error` channel as under test while a probe runs
    pub fn mark_testing(&self, id: &str) -> bool {
        let Some(entry) = self.get(id) else {
            return false;
        };
        self.move_status(&entry, ChannelStatus::Testing, "probe", |s| {
            s == ChannelStatus::Error
        })
    }

    /// Put a `testing` channel back to `error` after a failed probe
    pub fn mark_probe_failed(&self, id: &str) -> bool {
        let Some(entry) = self.get(id) else {
            return false;
        };
        self.move_status(&entry, ChannelStatus::Error, "probe failed", |s| {
            s == ChannelStatus::Testing
        })
    }

    /// Start tracking a request on a channel
    pub fn begin_request(&self, id: &str, estimated_tokens: u64) -> Option<InFlightGuard> {
        self.get(id)
            .map(|entry| InFlightGuard::new(id.to_string(), entry.stats, estimated_tokens))
    }

    /// Add completion tokens and spend after a request finished
    ///
    /// A channel whose spend reaches its balance becomes `exhausted`.
    pub fn record_usage(&self, id: &str, extra_tokens: u64, cost: f64) {
        let Some(entry) = self.get(id) else {
            return;
        };
        if extra_tokens > 0 {
            entry.stats.add_tokens(extra_tokens);
        }
        let total = entry.stats.add_cost(cost);
        if let Some(balance) = entry.channel.balance {
            if total >= balance {
                self.move_status(&entry, ChannelStatus::Exhausted, "balance spent", |s| {
                    s != ChannelStatus::Disabled
                });
            }
        }
    }

    pub fn snapshot(&self) -> Vec<ChannelSnapshot> {
        let snapshot = self.current.load();
        let mut views: Vec<ChannelSnapshot> = snapshot
            .entries
            .values()
            .map(|entry| {
                let stats = &entry.stats;
                let channel = &entry.channel;
                let total_cost = stats.total_cost();
                ChannelSnapshot {
                    id: channel.id.clone(),
                    name: channel.name.clone(),
                    provider: channel.provider,
                    status: stats.status(),
                    priority: channel.priority,
                    weight: channel.weight,
                    success_count: stats.success_count(),
                    error_count: stats.error_count(),
                    consecutive_errors: stats.consecutive_errors(),
                    avg_latency_ms: stats.avg_latency_ms(),
                    in_flight: stats.in_flight(),
                    minute_requests: stats.minute_requests(),
                    minute_tokens: stats.minute_tokens(),
                    total_cost,
                    remaining_balance: channel.balance.map(|b| b - total_cost),
                    last_used: stats.last_used(),
                    last_error: stats.last_error(),
                    breaker: None,
                }
            })
            .collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }

    fn move_status(
        &self,
        entry: &ChannelEntry,
        to: ChannelStatus,
        reason: &str,
        allowed: impl Fn(ChannelStatus) -> bool,
    ) -> bool {
        match entry.stats.transition(to, allowed) {
            Some(from) => {
                self.announce(&entry.channel.id, from, to, reason);
                true
            }
            None => false,
        }
    }

    fn announce(&self, channel_id: &str, from: ChannelStatus, to: ChannelStatus, reason: &str) {
        if to == ChannelStatus::Active {
            info!(channel_id, %from, %to, reason, "Channel status changed");
        } else {
            warn!(channel_id, %from, %to, reason, "Channel status changed");
        }

        if let Some(events) = &self.events {
            events.emit(RelayEvent::ChannelStatusChanged {
                channel_id: channel_id.to_string(),
                from,
                to,
                reason: reason.to_string(),
            });
        }
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new(RegistrySettings::default())
    }
}
