//! Relay orchestrator
//!
//! Owns the attempt loop: select a channel, translate the request, call the
//! upstream, and on failure account the outcome and fail over until the
//! attempt budget or the context deadline runs out. Every request ends in
//! exactly one usage record, including requests the caller abandons.

use super::accounting;
use super::error::RelayError;
use super::retry::RetryPolicy;
use super::usage::{TracingUsageSink, UsageOutcome, UsageRecord, UsageSink};
use crate::breaker::CircuitBreakers;
use crate::channel::{
    Channel, ChannelConfig, ChannelEntry, ChannelRegistry, ChannelSnapshot, ChannelSource,
    FailureKind, InFlightGuard,
};
use crate::config::{
    ConfigError, ConfigValidator, HealthCheckSettings, RelaySettings, RoutingSettings,
    TimeoutSettings,
};
use crate::events::{EventBus, RelayEvent};
use crate::health::HealthChecker;
use crate::http::{HttpClient, HttpExecutor, UpstreamError};
use crate::protocol::types::{ChatRequest, ChatResponse, ChatStreamChunk, CompletionUsage};
use crate::providers::{decode_payloads, PayloadStream, PricingTable, ProtocolTransformer};
use crate::routing::{ChannelSelector, RelayContext};
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Canonical chunks as the caller sees them; at most one trailing error
pub type ChunkStream = BoxStream<'static, Result<ChatStreamChunk, RelayError>>;

/// Connection pool size per upstream host for the default client
const DEFAULT_MAX_IDLE_PER_HOST: usize = 32;

enum AttemptError {
    Upstream(UpstreamError),
    Cancelled,
}

impl From<UpstreamError> for AttemptError {
    fn from(error: UpstreamError) -> Self {
        AttemptError::Upstream(error)
    }
}

struct RelayInner {
    registry: Arc<ChannelRegistry>,
    breakers: Arc<CircuitBreakers>,
    selector: ChannelSelector,
    transformer: ProtocolTransformer,
    http: Arc<dyn HttpExecutor>,
    retry: RetryPolicy,
    timeouts: TimeoutSettings,
    routing: RoutingSettings,
    health: HealthCheckSettings,
    usage: Arc<dyn UsageSink>,
    events: Option<EventBus>,
}

/// Public entry point for relaying canonical chat requests
///
/// Cheap to clone; clones share registry, breakers and client.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

/// Builder wiring a [`Relay`] from settings and collaborators
pub struct RelayBuilder {
    settings: RelaySettings,
    http: Option<Arc<dyn HttpExecutor>>,
    registry: Option<Arc<ChannelRegistry>>,
    usage: Option<Arc<dyn UsageSink>>,
    events: Option<EventBus>,
    retry: Option<RetryPolicy>,
}

impl RelayBuilder {
    pub fn new(settings: RelaySettings) -> Self {
        Self {
            settings,
            http: None,
            registry: None,
            usage: None,
            events: None,
            retry: None,
        }
    }

    /// Upstream transport; defaults to a reqwest-backed [`HttpClient`]
    pub fn http_executor(mut self, http: Arc<dyn HttpExecutor>) -> Self {
        self.http = Some(http);
        self
    }

    /// Share an existing registry instead of creating one
    pub fn registry(mut self, registry: Arc<ChannelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Usage record destination; defaults to [`TracingUsageSink`]
    pub fn usage_sink(mut self, usage: Arc<dyn UsageSink>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the retry policy derived from settings
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> Result<Relay, ConfigError> {
        let settings = self.settings;
        ConfigValidator::new().validate(&settings)?;

        let http: Arc<dyn HttpExecutor> = match self.http {
            Some(http) => http,
            None => Arc::new(
                HttpClient::with_config(settings.timeouts.connect(), DEFAULT_MAX_IDLE_PER_HOST)
                    .map_err(|e| ConfigError::Invalid {
                        message: e.to_string(),
                    })?,
            ),
        };

        let registry = match self.registry {
            Some(registry) => registry,
            None => {
                let mut registry = ChannelRegistry::new(settings.registry.clone());
                if let Some(events) = &self.events {
                    registry = registry.with_events(events.clone());
                }
                Arc::new(registry)
            }
        };

        let breakers = Arc::new(CircuitBreakers::new(settings.circuit_breaker.clone()));
        let selector =
            ChannelSelector::new(registry.clone(), breakers.clone(), settings.routing.policy);

        Ok(Relay {
            inner: Arc::new(RelayInner {
                registry,
                breakers,
                selector,
                transformer: ProtocolTransformer::new(PricingTable::new(&settings.pricing)),
                http,
                retry: self
                    .retry
                    .unwrap_or_else(|| RetryPolicy::from(&settings.retry)),
                timeouts: settings.timeouts.clone(),
                routing: settings.routing.clone(),
                health: settings.health_check.clone(),
                usage: self.usage.unwrap_or_else(|| Arc::new(TracingUsageSink)),
                events: self.events,
            }),
        })
    }
}

impl Relay {
    pub fn builder(settings: RelaySettings) -> RelayBuilder {
        RelayBuilder::new(settings)
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.inner.registry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.inner.breakers
    }

    pub fn selector(&self) -> &ChannelSelector {
        &self.inner.selector
    }

    pub fn transformer(&self) -> &ProtocolTransformer {
        &self.inner.transformer
    }

    /// Replace the channel set; breakers of removed channels are dropped
    pub fn load_channels(&self, channels: Vec<ChannelConfig>) -> Result<usize, ConfigError> {
        let count = self.inner.registry.load(channels)?;
        self.inner.breakers.retain_channels(&self.inner.registry.ids());
        Ok(count)
    }

    /// Reload the channel set from a collaborator
    pub async fn reload_from(&self, source: &dyn ChannelSource) -> Result<usize, ConfigError> {
        let count = self.inner.registry.reload_from(source).await?;
        self.inner.breakers.retain_channels(&self.inner.registry.ids());
        Ok(count)
    }

    /// Per-channel stats with breaker state
    pub fn health_snapshot(&self) -> Vec<ChannelSnapshot> {
        let mut snapshot = self.inner.registry.snapshot();
        for channel in &mut snapshot {
            channel.breaker = self.inner.breakers.state(&channel.id);
        }
        snapshot
    }

    /// Health checker sharing this relay's registry, breakers and client
    pub fn health_checker(&self) -> HealthChecker {
        HealthChecker::new(
            self.inner.registry.clone(),
            self.inner.breakers.clone(),
            self.inner.http.clone(),
            self.inner.health.clone(),
        )
    }

    /// Routing context for a canonical request, with aliases applied
    pub fn context_for(&self, request: &ChatRequest) -> RelayContext {
        RelayContext::from_request(request, &self.inner.routing)
    }

    /// Relay a unary request with a fresh context
    pub async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, RelayError> {
        let mut ctx = self.context_for(&request);
        self.relay(&mut ctx, request).await
    }

    /// Relay a streaming request with a fresh context
    pub fn stream(&self, request: ChatRequest) -> ChunkStream {
        let ctx = self.context_for(&request).with_streaming(true);
        self.relay_stream(ctx, request)
    }

    /// Relay a unary request, failing over between channels
    ///
    /// Dropping the returned future cancels the in-flight upstream call and
    /// records the request as cancelled.
    pub async fn relay(
        &self,
        ctx: &mut RelayContext,
        request: ChatRequest,
    ) -> Result<ChatResponse, RelayError> {
        let inner = &self.inner;
        let request = inner.canonical(ctx, request, false);
        let mut ledger = RequestLedger::new(inner.clone(), ctx, inner.transformer.count_tokens(&request));
        let mut last_error = None;

        loop {
            let (entry, remaining) = match inner.next_channel(ctx, &mut last_error) {
                Ok(next) => next,
                Err(err) => return Err(ledger.fail(err)),
            };
            ledger.attempt(&entry, ctx.retry_count());

            let started = Instant::now();
            match inner
                .attempt_unary(ctx, &entry, &request, remaining, ledger.prompt_tokens)
                .await
            {
                Ok(response) => {
                    ledger.observe_usage(response.usage);
                    ledger.push_text(response.content());
                    ledger.succeed(ctx, &entry, started);
                    return Ok(response);
                }
                Err(AttemptError::Cancelled) => return Err(ledger.fail(RelayError::Cancelled)),
                Err(AttemptError::Upstream(error)) => {
                    inner.attempt_failed(ctx, &entry, &error, started);
                    if !inner.backoff(ctx, &error).await {
                        return Err(ledger.fail(RelayError::Cancelled));
                    }
                    last_error = Some(error);
                }
            }
        }
    }

    /// Relay a streaming request
    ///
    /// Fail-over happens only before the first visible chunk reaches the
    /// caller; after that an upstream failure ends the stream with a single
    /// `StreamInterrupted` error. Dropping the stream tears down the upstream
    /// connection and records the request as cancelled, not failed.
    pub fn relay_stream(&self, ctx: RelayContext, request: ChatRequest) -> ChunkStream {
        let inner = self.inner.clone();

        Box::pin(async_stream::stream! {
            let mut ctx = ctx;
            let request = inner.canonical(&ctx, request, true);
            let mut ledger =
                RequestLedger::new(inner.clone(), &ctx, inner.transformer.count_tokens(&request));
            let mut last_error = None;

            loop {
                let (entry, remaining) = match inner.next_channel(&mut ctx, &mut last_error) {
                    Ok(next) => next,
                    Err(err) => {
                        yield Err(ledger.fail(err));
                        return;
                    }
                };
                ledger.attempt(&entry, ctx.retry_count());

                let started = Instant::now();
                let opened = inner
                    .open_stream(&ctx, &entry, &request, remaining, ledger.prompt_tokens)
                    .await;
                let (mut payloads, _in_flight) = match opened {
                    Ok(opened) => opened,
                    Err(AttemptError::Cancelled) => {
                        yield Err(ledger.fail(RelayError::Cancelled));
                        return;
                    }
                    Err(AttemptError::Upstream(error)) => {
                        inner.attempt_failed(&ctx, &entry, &error, started);
                        if !inner.backoff(&ctx, &error).await {
                            yield Err(ledger.fail(RelayError::Cancelled));
                            return;
                        }
                        last_error = Some(error);
                        continue;
                    }
                };

                let provider = entry.channel.provider;
                let mut response_id = format!("chatcmpl-{}", ctx.request_id.simple());
                // Chunks without text wait here until the first visible one
                let mut pending: Vec<ChatStreamChunk> = Vec::new();
                let mut delivered = false;

                let failure: Option<UpstreamError> = loop {
                    let Some(remaining) = ctx.remaining(inner.timeouts.context()) else {
                        break Some(UpstreamError::timeout(inner.timeouts.context()));
                    };
                    let idle = inner.timeouts.attempt().min(remaining);

                    let next = tokio::select! {
                        biased;
                        _ = ctx.cancellation().cancelled() => None,
                        next = tokio::time::timeout(idle, payloads.next()) => Some(next),
                    };
                    let Some(next) = next else {
                        yield Err(ledger.fail(RelayError::Cancelled));
                        return;
                    };

                    let payload = match next {
                        Err(_) => break Some(UpstreamError::timeout(idle)),
                        Ok(None) => break None,
                        Ok(Some(Err(error))) => break Some(error),
                        Ok(Some(Ok(payload))) => payload,
                    };

                    let mut chunk = match inner.transformer.transform_stream_chunk(provider, &payload) {
                        Ok(Some(chunk)) => chunk,
                        Ok(None) => continue,
                        Err(error) => break Some(UpstreamError::from(error)),
                    };

                    if chunk.id.is_empty() {
                        chunk.id = response_id.clone();
                    } else {
                        response_id = chunk.id.clone();
                    }
                    if chunk.model.is_empty() {
                        chunk.model = ctx.upstream_model.clone();
                    }
                    ledger.observe_usage(chunk.usage);
                    ledger.push_text(chunk.text());

                    let visible = !chunk.text().is_empty() || chunk.finish_reason.is_some();
                    pending.push(chunk);
                    if visible {
                        delivered = true;
                        for ready in std::mem::take(&mut pending) {
                            yield Ok(ready);
                        }
                    }
                };

                match failure {
                    None => {
                        for ready in std::mem::take(&mut pending) {
                            yield Ok(ready);
                        }
                        ledger.succeed(&ctx, &entry, started);
                        return;
                    }
                    Some(error) if !delivered => {
                        drop(payloads);
                        inner.attempt_failed(&ctx, &entry, &error, started);
                        if !inner.backoff(&ctx, &error).await {
                            yield Err(ledger.fail(RelayError::Cancelled));
                            return;
                        }
                        last_error = Some(error);
                    }
                    Some(error) => {
                        drop(payloads);
                        inner.attempt_failed(&ctx, &entry, &error, started);
                        yield Err(ledger.fail(RelayError::StreamInterrupted {
                            channel_id: entry.channel.id.clone(),
                            reason: error.to_string(),
                        }));
                        return;
                    }
                }
            }
        })
    }
}

impl RelayInner {
    fn canonical(&self, ctx: &RelayContext, mut request: ChatRequest, stream: bool) -> ChatRequest {
        request.model = ctx.upstream_model.clone();
        request.stream = stream;
        request
    }

    fn emit(&self, event: RelayEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    /// Pick the next channel, or the terminal error that ends the loop
    fn next_channel(
        &self,
        ctx: &mut RelayContext,
        last_error: &mut Option<UpstreamError>,
    ) -> Result<(ChannelEntry, Duration), RelayError> {
        if ctx.is_cancelled() {
            return Err(RelayError::Cancelled);
        }

        let Some(remaining) = ctx.remaining(self.timeouts.context()) else {
            return Err(RelayError::DeadlineExceeded {
                elapsed_ms: ctx.elapsed().as_millis() as u64,
                tried: ctx.used_channels().to_vec(),
            });
        };

        if !self.retry.should_retry(ctx.retry_count()) {
            return Err(match last_error.take() {
                Some(error) => RelayError::BudgetExhausted {
                    attempts: ctx.retry_count(),
                    tried: ctx.used_channels().to_vec(),
                    last_error: error,
                },
                None => RelayError::NoAvailableChannel {
                    model: ctx.model.clone(),
                    tried: ctx.used_channels().to_vec(),
                    last_error: None,
                },
            });
        }

        let entry = self.selector.select(ctx).map_err(|err| match err {
            RelayError::NoAvailableChannel { model, tried, .. } => RelayError::NoAvailableChannel {
                model,
                tried,
                last_error: last_error.clone(),
            },
            other => other,
        })?;

        ctx.mark_used(&entry.channel.id);
        self.emit(RelayEvent::ChannelSelected {
            request_id: ctx.request_id.to_string(),
            channel_id: entry.channel.id.clone(),
            model: ctx.model.clone(),
            attempt: ctx.retry_count(),
        });

        Ok((entry, remaining))
    }

    async fn attempt_unary(
        &self,
        ctx: &RelayContext,
        entry: &ChannelEntry,
        request: &ChatRequest,
        remaining: Duration,
        prompt_tokens: u32,
    ) -> Result<ChatResponse, AttemptError> {
        let channel = &entry.channel;
        let provider_request = self
            .transformer
            .to_provider_request(channel, request)
            .map_err(UpstreamError::from)?
            .with_request_id(ctx.request_id);

        let _in_flight = self
            .registry
            .begin_request(&channel.id, u64::from(prompt_tokens));
        let budget = self.timeouts.attempt().min(remaining);

        debug!(
            "[request_id: {}] Attempt {} on channel {} ({})",
            ctx.request_id,
            ctx.retry_count(),
            channel.id,
            channel.provider
        );

        let call = tokio::time::timeout(budget, self.http.execute(provider_request, budget));
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => None,
            result = call => Some(result),
        };
        let Some(result) = outcome else {
            return Err(AttemptError::Cancelled);
        };

        let raw = result.map_err(|_| UpstreamError::timeout(budget))??;
        let response = self
            .transformer
            .from_provider_response(channel.provider, &raw)
            .map_err(UpstreamError::from)?;
        Ok(response)
    }

    async fn open_stream(
        &self,
        ctx: &RelayContext,
        entry: &ChannelEntry,
        request: &ChatRequest,
        remaining: Duration,
        prompt_tokens: u32,
    ) -> Result<(PayloadStream, Option<InFlightGuard>), AttemptError> {
        let channel = &entry.channel;
        let provider_request = self
            .transformer
            .to_provider_request(channel, request)
            .map_err(UpstreamError::from)?
            .with_request_id(ctx.request_id);

        let in_flight = self
            .registry
            .begin_request(&channel.id, u64::from(prompt_tokens));
        let budget = self.timeouts.attempt().min(remaining);

        debug!(
            "[request_id: {}] Streaming attempt {} on channel {} ({})",
            ctx.request_id,
            ctx.retry_count(),
            channel.id,
            channel.provider
        );

        let call = tokio::time::timeout(budget, self.http.execute_stream(provider_request, budget));
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => None,
            result = call => Some(result),
        };
        let Some(result) = outcome else {
            return Err(AttemptError::Cancelled);
        };

        let body = result.map_err(|_| UpstreamError::timeout(budget))??;
        let framing = channel.provider.adapter().stream_framing();
        Ok((decode_payloads(framing, body), in_flight))
    }

    fn attempt_failed(
        &self,
        ctx: &RelayContext,
        entry: &ChannelEntry,
        error: &UpstreamError,
        started: Instant,
    ) {
        let latency_ms = started.elapsed().as_millis() as u64;
        let opened = accounting::record_failure(
            &self.registry,
            &self.breakers,
            &entry.channel.id,
            FailureKind::from(error),
            latency_ms,
        );

        warn!(
            request_id = %ctx.request_id,
            channel_id = %entry.channel.id,
            attempt = ctx.retry_count(),
            error_kind = error.kind(),
            retryable = error.is_retryable(),
            breaker_opened = opened.is_some(),
            "Attempt failed: {}",
            error
        );
    }

    /// Wait before the next attempt; false when the caller cancelled meanwhile
    async fn backoff(&self, ctx: &RelayContext, error: &UpstreamError) -> bool {
        if !self.retry.should_retry(ctx.retry_count()) {
            return true;
        }
        let retry = ctx.retry_count().saturating_sub(1);
        let Some(delay) = self.retry.calculate_delay(retry, error) else {
            return !ctx.is_cancelled();
        };
        let Some(remaining) = ctx.remaining(self.timeouts.context()) else {
            return true;
        };
        let delay = delay.min(remaining);

        debug!(
            request_id = %ctx.request_id,
            delay_ms = delay.as_millis() as u64,
            "Backing off before fail-over"
        );

        tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Accounting for one relay request
///
/// Writes exactly one usage record: through `succeed`, `fail`, or on drop
/// when the caller abandoned the request.
struct RequestLedger {
    inner: Arc<RelayInner>,
    request_id: String,
    user_id: Option<String>,
    model: String,
    stream: bool,
    prompt_tokens: u32,
    started: Instant,
    channel: Option<Arc<Channel>>,
    attempts: u32,
    reported: Option<CompletionUsage>,
    completion: String,
    settled: bool,
}

impl RequestLedger {
    fn new(inner: Arc<RelayInner>, ctx: &RelayContext, prompt_tokens: u32) -> Self {
        Self {
            inner,
            request_id: ctx.request_id.to_string(),
            user_id: ctx.user_id.clone(),
            model: ctx.model.clone(),
            stream: ctx.stream,
            prompt_tokens,
            started: Instant::now(),
            channel: None,
            attempts: 0,
            reported: None,
            completion: String::new(),
            settled: false,
        }
    }

    fn attempt(&mut self, entry: &ChannelEntry, attempts: u32) {
        self.channel = Some(entry.channel.clone());
        self.attempts = attempts;
        self.reported = None;
        self.completion.clear();
    }

    fn push_text(&mut self, text: &str) {
        self.completion.push_str(text);
    }

    /// Keep the largest counts seen; streamed usage can arrive in pieces
    fn observe_usage(&mut self, usage: Option<CompletionUsage>) {
        let Some(usage) = usage else {
            return;
        };
        self.reported = Some(match self.reported {
            None => usage,
            Some(seen) => CompletionUsage::new(
                seen.prompt_tokens.max(usage.prompt_tokens),
                seen.completion_tokens.max(usage.completion_tokens),
            ),
        });
    }

    fn usage(&self) -> CompletionUsage {
        self.inner
            .transformer
            .usage_or_estimate(self.reported, self.prompt_tokens, &self.completion)
    }

    /// Charge usage to the channel; returns the estimated cost
    fn charge(&self, usage: &CompletionUsage) -> f64 {
        let Some(channel) = &self.channel else {
            return 0.0;
        };
        let upstream_model = channel.upstream_model(&self.model);
        let cost = self
            .inner
            .transformer
            .calculate_cost(channel.provider, upstream_model, usage);
        self.inner
            .registry
            .record_usage(&channel.id, u64::from(usage.completion_tokens), cost);
        cost
    }

    fn succeed(&mut self, ctx: &RelayContext, entry: &ChannelEntry, attempt_started: Instant) {
        let attempt_ms = attempt_started.elapsed().as_millis() as u64;
        accounting::record_success(
            &self.inner.registry,
            &self.inner.breakers,
            &entry.channel.id,
            attempt_ms,
        );

        let usage = self.usage();
        let cost = self.charge(&usage);
        let latency_ms = self.started.elapsed().as_millis() as u64;

        info!(
            request_id = %ctx.request_id,
            channel_id = %entry.channel.id,
            model = %self.model,
            attempts = self.attempts,
            latency_ms,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            stream = self.stream,
            "Relay succeeded"
        );

        self.inner.emit(RelayEvent::RelaySucceeded {
            request_id: self.request_id.clone(),
            channel_id: entry.channel.id.clone(),
            model: self.model.clone(),
            latency_ms,
            attempts: self.attempts,
            stream: self.stream,
        });
        self.write(UsageOutcome::Success, usage, cost, None);
    }

    /// Record a terminal error and hand it back for the caller
    fn fail(&mut self, error: RelayError) -> RelayError {
        let outcome = match error {
            RelayError::Cancelled => UsageOutcome::Cancelled,
            _ => UsageOutcome::Failure,
        };
        let (usage, cost) = self.partial_usage();

        if outcome == UsageOutcome::Cancelled {
            debug!(request_id = %self.request_id, "Relay cancelled by caller");
        } else {
            warn!(
                request_id = %self.request_id,
                model = %self.model,
                error_kind = %error.kind(),
                tried = ?error.tried(),
                "Relay failed: {}",
                error
            );
            self.inner.emit(RelayEvent::RelayFailed {
                request_id: self.request_id.clone(),
                model: self.model.clone(),
                error_kind: error.kind().to_string(),
                reason: error.to_string(),
                tried: error.tried().to_vec(),
            });
        }

        self.write(outcome, usage, cost, Some(error.kind().to_string()));
        error
    }

    /// Usage for an attempt that produced some output before ending early
    fn partial_usage(&self) -> (CompletionUsage, f64) {
        if self.completion.is_empty() && self.reported.is_none() {
            return (CompletionUsage::new(0, 0), 0.0);
        }
        let usage = self.usage();
        let cost = self.charge(&usage);
        (usage, cost)
    }

    fn write(
        &mut self,
        outcome: UsageOutcome,
        usage: CompletionUsage,
        cost: f64,
        error_kind: Option<String>,
    ) {
        self.settled = true;
        self.inner.usage.record(UsageRecord {
            request_id: self.request_id.clone(),
            user_id: self.user_id.clone(),
            channel_id: self
                .channel
                .as_ref()
                .map(|c| c.id.clone())
                .unwrap_or_default(),
            model: self.model.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cost,
            latency_ms: self.started.elapsed().as_millis() as u64,
            attempts: self.attempts,
            stream: self.stream,
            success: outcome == UsageOutcome::Success,
            outcome,
            error_kind,
            timestamp: Utc::now(),
        });
    }
}

impl Drop for RequestLedger {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        debug!(request_id = %self.request_id, "Relay abandoned by caller");
        let (usage, cost) = self.partial_usage();
        self.write(UsageOutcome::Cancelled, usage, cost, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{ByteStream, ProviderRequest};
    use crate::protocol::types::Message;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Answers every call with the same OpenAI-style body
    struct FixedExecutor {
        body: String,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HttpExecutor for FixedExecutor {
        async fn execute(
            &self,
            request: ProviderRequest,
            _timeout: Duration,
        ) -> Result<String, UpstreamError> {
            self.calls.lock().push(request.url);
            Ok(self.body.clone())
        }

        async fn execute_stream(
            &self,
            _request: ProviderRequest,
            _timeout: Duration,
        ) -> Result<ByteStream, UpstreamError> {
            Err(UpstreamError::transport("streaming not scripted"))
        }
    }

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<UsageRecord>>);

    impl UsageSink for CollectingSink {
        fn record(&self, record: UsageRecord) {
            self.0.lock().push(record);
        }
    }

    #[tokio::test]
    async fn test_unary_success_records_usage_and_mapping() {
        let executor = Arc::new(FixedExecutor {
            body: r#"{"id":"c1","object":"chat.completion","created":1,"model":"gpt-4o-2024",
                "choices":[{"index":0,"message":{"role":"assistant","content":"hi there"},"finish_reason":"stop"}],
                "usage":{"prompt_tokens":9,"completion_tokens":2,"total_tokens":11}}"#
                .to_string(),
            calls: Mutex::new(Vec::new()),
        });
        let sink = Arc::new(CollectingSink::default());
        let relay = Relay::builder(RelaySettings::default())
            .http_executor(executor.clone())
            .usage_sink(sink.clone())
            .build()
            .unwrap();
        relay
            .load_channels(vec![ChannelConfig::new("a", "openai")
                .with_key("sk-abcdef1234567890")
                .with_base_url("http://upstream.test/v1")
                .with_models(["gpt-4o"])])
            .unwrap();

        let response = relay
            .complete(ChatRequest::new("OpenAI/GPT-4o", vec![Message::user("hello")]).with_user("u1"))
            .await
            .unwrap();
        assert_eq!(response.content(), "hi there");
        assert_eq!(
            executor.calls.lock().as_slice(),
            ["http://upstream.test/v1/chat/completions"]
        );

        let records = sink.0.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, UsageOutcome::Success);
        assert_eq!(records[0].prompt_tokens, 9);
        assert_eq!(records[0].user_id.as_deref(), Some("u1"));
        assert!(records[0].cost > 0.0);

        let snapshot = relay.health_snapshot();
        assert_eq!(snapshot[0].success_count, 1);
        assert_eq!(snapshot[0].in_flight, 0);
    }

    #[tokio::test]
    async fn test_no_channel_for_model() {
        let sink = Arc::new(CollectingSink::default());
        let relay = Relay::builder(RelaySettings::default())
            .http_executor(Arc::new(FixedExecutor {
                body: String::new(),
                calls: Mutex::new(Vec::new()),
            }))
            .usage_sink(sink.clone())
            .build()
            .unwrap();

        let err = relay
            .complete(ChatRequest::new("missing", vec![Message::user("hello")]))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NoAvailableChannel { .. }));
        assert_eq!(sink.0.lock()[0].outcome, UsageOutcome::Failure);
        assert_eq!(sink.0.lock()[0].channel_id, "");
    }

    #[test]
    fn test_invalid_settings_rejected_at_build() {
        let mut settings = RelaySettings::default();
        settings.retry.budget = 0;
        assert!(Relay::builder(settings).build().is_err());
    }
}
