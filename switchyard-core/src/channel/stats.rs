//! Lock-free runtime statistics for one channel
//!
//! Every counter is an atomic, so outcome reports for the same channel never
//! lose updates and readers never block writers. Counters use `Relaxed`
//! ordering: routing tolerates slightly stale values. The latency average is
//! an f64 stored as bits and updated with a CAS loop.

use super::model::ChannelStatus;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Micro-dollars per dollar for the integer spend counter
const MICROS_PER_USD: f64 = 1_000_000.0;

/// Runtime state of a channel
#[derive(Debug)]
pub struct ChannelStats {
    status: AtomicU8,
    success_count: AtomicU64,
    error_count: AtomicU64,
    consecutive_errors: AtomicU32,
    /// EMA latency in ms as f64 bits; `u64::MAX` until the first sample
    avg_latency_bits: AtomicU64,
    /// Unix millis, 0 when never
    last_used_ms: AtomicI64,
    last_error_ms: AtomicI64,
    in_flight: AtomicU32,
    /// Unix minute the per-minute counters belong to
    window_minute: AtomicU64,
    minute_requests: AtomicU32,
    minute_tokens: AtomicU64,
    total_cost_micros: AtomicU64,
}

const NO_LATENCY: u64 = u64::MAX;

impl ChannelStats {
    pub fn new(status: ChannelStatus) -> Self {
        Self {
            status: AtomicU8::new(status.into()),
            success_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            consecutive_errors: AtomicU32::new(0),
            avg_latency_bits: AtomicU64::new(NO_LATENCY),
            last_used_ms: AtomicI64::new(0),
            last_error_ms: AtomicI64::new(0),
            in_flight: AtomicU32::new(0),
            window_minute: AtomicU64::new(current_minute()),
            minute_requests: AtomicU32::new(0),
            minute_tokens: AtomicU64::new(0),
            total_cost_micros: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.load(Ordering::Acquire).into()
    }

    /// Move to `to` if the current status satisfies `allowed`
    ///
    /// Returns the previous status when a change happened.
    pub(crate) fn transition(
        &self,
        to: ChannelStatus,
        allowed: impl Fn(ChannelStatus) -> bool,
    ) -> Option<ChannelStatus> {
        let to_raw: u8 = to.into();
        self.status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                let current = ChannelStatus::from(raw);
                (current != to && allowed(current)).then_some(to_raw)
            })
            .ok()
            .map(ChannelStatus::from)
    }

    pub fn success_count(&self) -> u64 {
        self.success_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Relaxed)
    }

    /// Smoothed latency, `None` before the first successful sample
    pub fn avg_latency_ms(&self) -> Option<f64> {
        match self.avg_latency_bits.load(Ordering::Relaxed) {
            NO_LATENCY => None,
            bits => Some(f64::from_bits(bits)),
        }
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn last_used(&self) -> Option<DateTime<Utc>> {
        millis_to_datetime(self.last_used_ms.load(Ordering::Relaxed))
    }

    pub fn last_error(&self) -> Option<DateTime<Utc>> {
        millis_to_datetime(self.last_error_ms.load(Ordering::Relaxed))
    }

    pub fn total_cost(&self) -> f64 {
        self.total_cost_micros.load(Ordering::Relaxed) as f64 / MICROS_PER_USD
    }

    /// Record a successful outcome
    pub(crate) fn record_success(&self, latency_ms: u64, smoothing: f64) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_errors.store(0, Ordering::Relaxed);
        self.last_used_ms.store(now_millis(), Ordering::Relaxed);
        self.update_latency(latency_ms as f64, smoothing);
    }

    /// Record a failure; returns the new consecutive-error streak
    pub(crate) fn record_failure(&self) -> u32 {
        let now = now_millis();
        self.error_count.fetch_add(1, Ordering::Relaxed);
        self.last_used_ms.store(now, Ordering::Relaxed);
        self.last_error_ms.store(now, Ordering::Relaxed);
        self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reset_streak(&self) {
        self.consecutive_errors.store(0, Ordering::Relaxed);
    }

    fn update_latency(&self, sample: f64, smoothing: f64) {
        // fetch_update retries on contention, so concurrent samples all land
        let _ = self
            .avg_latency_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let next = if bits == NO_LATENCY {
                    sample
                } else {
                    let previous = f64::from_bits(bits);
                    previous + smoothing * (sample - previous)
                };
                Some(next.to_bits())
            });
    }

    /// Count a started request against the per-minute window
    pub(crate) fn begin(&self, estimated_tokens: u64) {
        self.roll_window();
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        self.minute_requests.fetch_add(1, Ordering::Relaxed);
        self.minute_tokens.fetch_add(estimated_tokens, Ordering::Relaxed);
    }

    pub(crate) fn end(&self) {
        // Never underflows
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub(crate) fn add_tokens(&self, tokens: u64) {
        self.roll_window();
        self.minute_tokens.fetch_add(tokens, Ordering::Relaxed);
    }

    /// Add spend; returns the new total in USD
    pub(crate) fn add_cost(&self, cost: f64) -> f64 {
        if cost <= 0.0 || !cost.is_finite() {
            return self.total_cost();
        }
        let micros = (cost * MICROS_PER_USD).round() as u64;
        let total = self.total_cost_micros.fetch_add(micros, Ordering::Relaxed) + micros;
        total as f64 / MICROS_PER_USD
    }

    /// Whether the current minute's usage has reached either cap
    pub fn is_over_limits(&self, rpm_limit: Option<u32>, tpm_limit: Option<u64>) -> bool {
        if rpm_limit.is_none() && tpm_limit.is_none() {
            return false;
        }
        self.roll_window();
        let over_rpm = rpm_limit.is_some_and(|cap| self.minute_requests.load(Ordering::Relaxed) >= cap);
        let over_tpm = tpm_limit.is_some_and(|cap| self.minute_tokens.load(Ordering::Relaxed) >= cap);
        over_rpm || over_tpm
    }

    pub fn minute_requests(&self) -> u32 {
        self.roll_window();
        self.minute_requests.load(Ordering::Relaxed)
    }

    pub fn minute_tokens(&self) -> u64 {
        self.roll_window();
        self.minute_tokens.load(Ordering::Relaxed)
    }

    /// Start a fresh window when the minute has changed
    ///
    /// Only the thread that wins the CAS clears the counters; an increment
    /// racing the clear may be dropped, which caps tolerate.
    fn roll_window(&self) {
        let now = current_minute();
        let seen = self.window_minute.load(Ordering::Relaxed);
        if seen != now
            && self
                .window_minute
                .compare_exchange(seen, now, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            self.minute_requests.store(0, Ordering::Relaxed);
            self.minute_tokens.store(0, Ordering::Relaxed);
        }
    }
}

/// RAII marker for an in-flight request on a channel
///
/// Least-connections routing reads the counter this guard maintains.
#[derive(Debug)]
pub struct InFlightGuard {
    channel_id: String,
    stats: Arc<ChannelStats>,
}

impl InFlightGuard {
    pub(crate) fn new(channel_id: String, stats: Arc<ChannelStats>, estimated_tokens: u64) -> Self {
        stats.begin(estimated_tokens);
        Self { channel_id, stats }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.stats.end();
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn current_minute() -> u64 {
    (Utc::now().timestamp() / 60).max(0) as u64
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}
