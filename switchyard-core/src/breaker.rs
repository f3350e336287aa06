//! Per-channel circuit breakers
//!
//! A breaker opens after `failure_threshold` consecutive failures that fall
//! inside `window_ms` of the first one. Once `cooldown_ms` has passed, an open
//! breaker reads as half-open; the next outcome either closes it or reopens
//! it with a fresh cooldown.
//!
//! The state and open timestamp are mirrored in atomics so
//! [`CircuitBreaker::is_eligible`] never takes the lock.

use crate::config::BreakerSettings;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum BreakerState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl BreakerState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    first_failure: Option<Instant>,
    opened_at: Option<Instant>,
}

/// Failure gate for one channel
#[derive(Debug)]
pub struct CircuitBreaker {
    channel_id: String,
    failure_threshold: u32,
    cooldown: Duration,
    window: Duration,
    /// Reference point for `opened_at_ms`
    origin: Instant,
    state: AtomicU8,
    opened_at_ms: AtomicU64,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(channel_id: impl Into<String>, settings: &BreakerSettings) -> Self {
        Self {
            channel_id: channel_id.into(),
            failure_threshold: settings.failure_threshold.max(1),
            cooldown: Duration::from_millis(settings.cooldown_ms),
            window: Duration::from_millis(settings.window_ms),
            origin: Instant::now(),
            state: AtomicU8::new(BreakerState::Closed as u8),
            opened_at_ms: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                first_failure: None,
                opened_at: None,
            }),
        }
    }

    /// Current state, reporting an open breaker past its cooldown as half-open
    pub fn state(&self) -> BreakerState {
        match BreakerState::from_raw(self.state.load(Ordering::Acquire)) {
            BreakerState::Open if self.cooled_down() => BreakerState::HalfOpen,
            state => state,
        }
    }

    /// Whether the channel may be selected
    pub fn is_eligible(&self) -> bool {
        self.state() != BreakerState::Open
    }

    /// Consecutive failures counted toward opening
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failures
    }

    fn cooled_down(&self) -> bool {
        let opened_ms = self.opened_at_ms.load(Ordering::Acquire);
        let now_ms = self.origin.elapsed().as_millis() as u64;
        now_ms.saturating_sub(opened_ms) >= self.cooldown.as_millis() as u64
    }

    /// Record a success; returns true when it closed a half-open breaker
    pub fn record_success(&self) -> bool {
        let mut inner = self.inner.lock();
        self.settle(&mut inner);

        match inner.state {
            BreakerState::HalfOpen => {
                inner.failures = 0;
                inner.first_failure = None;
                inner.opened_at = None;
                self.publish(&mut inner, BreakerState::Closed);
                info!(channel_id = %self.channel_id, "Circuit breaker closed");
                true
            }
            BreakerState::Closed => {
                inner.failures = 0;
                inner.first_failure = None;
                false
            }
            // A request that started before the breaker opened; wait for the cooldown
            BreakerState::Open => false,
        }
    }

    /// Record a failure; returns the new state when it opened the breaker
    pub fn record_failure(&self) -> Option<BreakerState> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.settle(&mut inner);

        match inner.state {
            BreakerState::Closed => {
                let stale = inner
                    .first_failure
                    .is_some_and(|first| now.duration_since(first) > self.window);
                if stale || inner.failures == 0 {
                    inner.failures = 0;
                    inner.first_failure = Some(now);
                }
                inner.failures += 1;

                if inner.failures >= self.failure_threshold {
                    self.open(&mut inner, now);
                    warn!(
                        channel_id = %self.channel_id,
                        failures = inner.failures,
                        cooldown_ms = self.cooldown.as_millis() as u64,
                        "Circuit breaker opened"
                    );
                    return Some(BreakerState::Open);
                }
                None
            }
            BreakerState::HalfOpen => {
                inner.failures += 1;
                self.open(&mut inner, now);
                warn!(channel_id = %self.channel_id, "Circuit breaker reopened after half-open failure");
                Some(BreakerState::Open)
            }
            BreakerState::Open => None,
        }
    }

    /// Force the breaker closed, e.g. after an admin reset
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.failures = 0;
        inner.first_failure = None;
        inner.opened_at = None;
        self.publish(&mut inner, BreakerState::Closed);
    }

    /// Apply a pending open -> half-open move under the lock
    fn settle(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open
            && inner
                .opened_at
                .is_some_and(|opened| opened.elapsed() >= self.cooldown)
        {
            self.publish(inner, BreakerState::HalfOpen);
        }
    }

    fn open(&self, inner: &mut Inner, now: Instant) {
        inner.opened_at = Some(now);
        let opened_ms = now.duration_since(self.origin).as_millis() as u64;
        self.opened_at_ms.store(opened_ms, Ordering::Release);
        self.publish(inner, BreakerState::Open);
    }

    fn publish(&self, inner: &mut Inner, state: BreakerState) {
        inner.state = state;
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Breakers for every channel, created on first use
#[derive(Debug)]
pub struct CircuitBreakers {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    settings: BreakerSettings,
}

impl CircuitBreakers {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            breakers: DashMap::new(),
            settings,
        }
    }

    pub fn get_or_create(&self, channel_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(channel_id) {
            return breaker.clone();
        }
        self.breakers
            .entry(channel_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(channel_id, &self.settings)))
            .clone()
    }

    /// A channel without a breaker has never failed and is eligible
    pub fn is_eligible(&self, channel_id: &str) -> bool {
        self.breakers
            .get(channel_id)
            .map_or(true, |breaker| breaker.is_eligible())
    }

    pub fn state(&self, channel_id: &str) -> Option<BreakerState> {
        self.breakers.get(channel_id).map(|breaker| breaker.state())
    }

    pub fn record_success(&self, channel_id: &str) -> bool {
        match self.breakers.get(channel_id) {
            Some(breaker) => breaker.record_success(),
            None => false,
        }
    }

    pub fn record_failure(&self, channel_id: &str) -> Option<BreakerState> {
        self.get_or_create(channel_id).record_failure()
    }

    pub fn reset(&self, channel_id: &str) {
        if let Some(breaker) = self.breakers.get(channel_id) {
            breaker.reset();
        }
    }

    /// Drop breakers for channels that are no longer loaded
    pub fn retain_channels(&self, ids: &[String]) {
        self.breakers.retain(|id, _| ids.iter().any(|keep| keep == id));
    }
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}
