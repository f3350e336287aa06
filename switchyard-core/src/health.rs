//! Background health probes
//!
//! Every interval each channel that is not disabled gets one lightweight
//! provider call under a short timeout. Probe outcomes go through the same
//! accounting as live requests. A failing probe never stops the loop.

use crate::breaker::CircuitBreakers;
use crate::channel::{ChannelEntry, ChannelRegistry, ChannelStatus, FailureKind};
use crate::config::HealthCheckSettings;
use crate::http::{HttpExecutor, UpstreamError};
use crate::relay::accounting;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of probing one channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub channel_id: String,
    pub success: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Periodic channel prober
pub struct HealthChecker {
    registry: Arc<ChannelRegistry>,
    breakers: Arc<CircuitBreakers>,
    http: Arc<dyn HttpExecutor>,
    settings: HealthCheckSettings,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        breakers: Arc<CircuitBreakers>,
        http: Arc<dyn HttpExecutor>,
        settings: HealthCheckSettings,
    ) -> Self {
        Self {
            registry,
            breakers,
            http,
            settings,
        }
    }

    /// Run the probe loop until `shutdown` is cancelled
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.settings.enabled {
                info!("Health checks disabled");
                return;
            }

            let mut ticker = tokio::time::interval(self.settings.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = self.settings.interval_secs,
                timeout_ms = self.settings.timeout_ms,
                "Health checker started"
            );

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                // Shutdown drops any probes still running
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    results = self.run_once() => {
                        let failed = results.iter().filter(|r| !r.success).count();
                        debug!(probed = results.len(), failed, "Health check round complete");
                    }
                }
            }

            info!("Health checker stopped");
        })
    }

    /// Probe every non-disabled channel once, concurrently
    pub async fn run_once(&self) -> Vec<ProbeResult> {
        let targets: Vec<ChannelEntry> = self
            .registry
            .ids()
            .iter()
            .filter_map(|id| self.registry.get(id))
            .filter(|entry| entry.stats.status() != ChannelStatus::Disabled)
            .collect();

        join_all(targets.iter().map(|entry| self.probe(entry))).await
    }

    async fn probe(&self, entry: &ChannelEntry) -> ProbeResult {
        let channel = &entry.channel;
        self.registry.mark_testing(&channel.id);

        let request = channel.provider.adapter().probe_request(channel);
        let timeout = self.settings.timeout();
        let started = Instant::now();

        let result = match tokio::time::timeout(timeout, self.http.execute(request, timeout)).await
        {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(UpstreamError::timeout(timeout)),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                accounting::record_success(&self.registry, &self.breakers, &channel.id, latency_ms);
                self.registry.restore_active(&channel.id, "probe passed");
                debug!(channel_id = %channel.id, latency_ms, "Probe passed");
                ProbeResult {
                    channel_id: channel.id.clone(),
                    success: true,
                    latency_ms,
                    error: None,
                }
            }
            Err(error) => {
                accounting::record_failure(
                    &self.registry,
                    &self.breakers,
                    &channel.id,
                    FailureKind::from(&error),
                    latency_ms,
                );
                self.registry.mark_probe_failed(&channel.id);
                warn!(channel_id = %channel.id, error_kind = error.kind(), "Probe failed: {}", error);
                ProbeResult {
                    channel_id: channel.id.clone(),
                    success: false,
                    latency_ms,
                    error: Some(error.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::config::{BreakerSettings, RegistrySettings};
    use crate::http::{ByteStream, ProviderRequest};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Fails for URLs containing "bad", hangs for "slow", succeeds otherwise
    struct ProbeExecutor;

    #[async_trait]
    impl HttpExecutor for ProbeExecutor {
        async fn execute(
            &self,
            request: ProviderRequest,
            _timeout: Duration,
        ) -> Result<String, UpstreamError> {
            if request.url.contains("bad") {
                Err(UpstreamError::Server {
                    status: 503,
                    message: "down".to_string(),
                })
            } else if request.url.contains("slow") {
                futures::future::pending().await
            } else {
                Ok("{}".to_string())
            }
        }

        async fn execute_stream(
            &self,
            _request: ProviderRequest,
            _timeout: Duration,
        ) -> Result<ByteStream, UpstreamError> {
            Err(UpstreamError::transport("unused"))
        }
    }

    fn checker(channels: Vec<ChannelConfig>) -> HealthChecker {
        let registry = Arc::new(ChannelRegistry::new(RegistrySettings::default()));
        registry.load(channels).unwrap();
        HealthChecker::new(
            registry,
            Arc::new(CircuitBreakers::new(BreakerSettings::default())),
            Arc::new(ProbeExecutor),
            HealthCheckSettings {
                enabled: true,
                interval_secs: 1,
                timeout_ms: 50,
            },
        )
    }

    fn channel(id: &str, base_url: &str) -> ChannelConfig {
        ChannelConfig::new(id, "ollama")
            .with_models(["*"])
            .with_base_url(base_url)
    }

    #[tokio::test]
    async fn test_probe_failures_are_isolated() {
        let checker = checker(vec![
            channel("good", "http://good.test"),
            channel("bad", "http://bad.test"),
            channel("slow", "http://slow.test"),
        ]);

        let mut results = checker.run_once().await;
        results.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));

        assert_eq!(results.len(), 3);
        assert!(!results[0].success); // bad
        assert!(results[1].success); // good
        assert!(!results[2].success); // slow, timed out
        assert_eq!(checker.registry.get("bad").unwrap().stats.error_count(), 1);
    }

    #[tokio::test]
    async fn test_passing_probe_restores_error_channel() {
        let checker = checker(vec![channel("good", "http://good.test")]);
        checker.registry.set_status("good", ChannelStatus::Error);

        checker.run_once().await;
        assert_eq!(
            checker.registry.get("good").unwrap().stats.status(),
            ChannelStatus::Active
        );
    }

    #[tokio::test]
    async fn test_failed_probe_returns_testing_to_error() {
        let checker = checker(vec![channel("bad", "http://bad.test")]);
        checker.registry.set_status("bad", ChannelStatus::Error);

        checker.run_once().await;
        assert_eq!(
            checker.registry.get("bad").unwrap().stats.status(),
            ChannelStatus::Error
        );
    }

    #[tokio::test]
    async fn test_disabled_channels_skipped() {
        let checker = checker(vec![
            channel("off", "http://bad.test").with_status(ChannelStatus::Disabled)
        ]);
        assert!(checker.run_once().await.is_empty());
    }

    #[tokio::test]
    async fn test_spawned_loop_stops_on_shutdown() {
        let checker = checker(vec![channel("good", "http://good.test")]);
        let registry = checker.registry.clone();
        let shutdown = CancellationToken::new();
        let handle = checker.spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(registry.get("good").unwrap().stats.success_count(), 1);
    }
}
