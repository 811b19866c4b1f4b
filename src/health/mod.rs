use crate::config::HealthConfig;
use crate::events::bus::EventPublisher;
use crate::events::RefreshKind;
use crate::registry::model::ChangeEvent;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;

/// A service to probe: the logical name and the backend base URL taken
/// from its routes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HealthTarget {
    pub service: String,
    pub uri: String,
}

struct ServiceHealth {
    healthy: bool,
    consecutive_successes: u32,
    consecutive_failures: u32,
}

/// Active health monitor. Each round probes every distinct backend with
/// bounded concurrency; a service flips state only after the configured
/// number of consecutive results, and each flip publishes a health event
/// and triggers a local route refresh.
///
/// Services are assumed healthy until a probe proves otherwise, so a slow
/// first round never blackholes traffic.
pub struct HealthMonitor {
    config: HealthConfig,
    client: reqwest::Client,
    states: DashMap<String, ServiceHealth>,
    publisher: EventPublisher,
    refresh_tx: mpsc::UnboundedSender<RefreshKind>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        publisher: EventPublisher,
        refresh_tx: mpsc::UnboundedSender<RefreshKind>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .no_proxy()
            .build()
            .expect("failed to build health check client");

        Self {
            config,
            client,
            states: DashMap::new(),
            publisher,
            refresh_tx,
        }
    }

    /// Run one probe round. The caller owns the loop and scheduling.
    pub async fn run_round(&self, targets: &[HealthTarget]) {
        self.prune(targets);

        let flips: Vec<String> = stream::iter(targets.iter().cloned())
            .map(|target| async move {
                let ok = self.probe(&target).await;
                self.record_result(&target.service, ok)
                    .then(|| target.service.clone())
            })
            .buffer_unordered(self.config.concurrency)
            .filter_map(|flip| async move { flip })
            .collect()
            .await;

        if !flips.is_empty() {
            tracing::info!("health: services flipped, services={:?}", flips);
            self.publisher.publish(ChangeEvent::health_change(flips));
            let _ = self.refresh_tx.send(RefreshKind::Routes);
        }
    }

    /// Probe the primary endpoint, then the fallback. Any 2xx means
    /// healthy.
    async fn probe(&self, target: &HealthTarget) -> bool {
        let primary = format!("{}/actuator/health", target.uri.trim_end_matches('/'));
        if self.probe_url(&primary).await {
            return true;
        }
        let fallback = format!("{}/v1/health", target.uri.trim_end_matches('/'));
        self.probe_url(&fallback).await
    }

    async fn probe_url(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!("health: probe failed, url={}, err={}", url, e);
                false
            }
        }
    }

    /// Update consecutive counters; returns true when the service state
    /// flipped this round.
    pub(crate) fn record_result(&self, service: &str, ok: bool) -> bool {
        let mut state = self.states.entry(service.to_string()).or_insert(ServiceHealth {
            healthy: true,
            consecutive_successes: 0,
            consecutive_failures: 0,
        });

        if ok {
            state.consecutive_successes += 1;
            state.consecutive_failures = 0;
            if !state.healthy && state.consecutive_successes >= self.config.healthy_threshold {
                state.healthy = true;
                tracing::info!(
                    "health: service recovered, service={}, consecutive_successes={}",
                    service,
                    state.consecutive_successes
                );
                return true;
            }
        } else {
            state.consecutive_failures += 1;
            state.consecutive_successes = 0;
            if state.healthy && state.consecutive_failures >= self.config.unhealthy_threshold {
                state.healthy = false;
                tracing::warn!(
                    "health: service marked unhealthy, service={}, consecutive_failures={}",
                    service,
                    state.consecutive_failures
                );
                metrics::counter!("portico_health_flips_total", "service" => service.to_string())
                    .increment(1);
                return true;
            }
        }
        false
    }

    pub fn is_healthy(&self, service: &str) -> bool {
        self.states.get(service).map(|s| s.healthy).unwrap_or(true)
    }

    /// Drop state for services no longer present in the route table.
    fn prune(&self, targets: &[HealthTarget]) {
        self.states
            .retain(|service, _| targets.iter().any(|t| &t.service == service));
    }

    pub fn snapshot(&self) -> Vec<(String, bool)> {
        self.states
            .iter()
            .map(|e| (e.key().clone(), e.value().healthy))
            .collect()
    }
}
