use crate::access::{load_yaml_overrides, merge_policies, AccessControlCache};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::events::bus::EventPublisher;
use crate::events::RefreshKind;
use crate::filter::{FilterChain, ResponseCache};
use crate::health::{HealthMonitor, HealthTarget};
use crate::limit::{CounterStore, MemoryCounterStore, RateLimitIndex, RateLimiter, RedisCounterStore};
use crate::registry::client::RegistryClient;
use crate::registry::model::{
    validate_rate_limit_batch, validate_route_batch, RouteDefinition,
};
use crate::routing::RouteTable;
use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Everything the request path and the refresh loops share. Snapshots
/// (route table, rule index, policy cache) are swapped wholesale; the
/// rest is immutable after startup.
pub struct GatewayState {
    pub config: GatewayConfig,
    pub request_id_header: String,
    pub routes: ArcSwap<RouteTable>,
    /// Last validated registry fetch, before health filtering. Health
    /// probe targets derive from this.
    pub definitions: ArcSwap<Vec<RouteDefinition>>,
    pub limit_index: Arc<ArcSwap<RateLimitIndex>>,
    /// Shared with the rate-limit filter; held here so refresh passes can
    /// check rule resolver names against the registered strategies.
    pub limiter: Arc<RateLimiter>,
    pub access_cache: Arc<AccessControlCache>,
    pub response_cache: Arc<ResponseCache>,
    pub chain: FilterChain,
    pub registry: RegistryClient,
    pub upstream: reqwest::Client,
    pub publisher: EventPublisher,
    pub health: Arc<HealthMonitor>,
    /// Hands refresh triggers to the coordinator; the admin endpoint and
    /// the event subscriber share it.
    pub refresh_tx: mpsc::UnboundedSender<RefreshKind>,
}

impl GatewayState {
    pub async fn new(
        config: GatewayConfig,
        publisher: EventPublisher,
        refresh_tx: mpsc::UnboundedSender<RefreshKind>,
    ) -> Result<Arc<Self>, GatewayError> {
        let store = if config.redis.url.is_empty() {
            tracing::info!("limit: no redis configured, using in-memory counter store");
            let store = Arc::new(CounterStore::Memory(MemoryCounterStore::new()));
            MemoryCounterStore::start_gc(store.clone());
            store
        } else {
            Arc::new(CounterStore::Redis(
                RedisCounterStore::connect(&config.redis.url).await?,
            ))
        };

        let limiter = Arc::new(RateLimiter::new(
            store,
            &config.redis.key_prefix,
            &config.rate_limit,
        ));
        let limit_index = Arc::new(ArcSwap::from_pointee(RateLimitIndex::empty(
            &config.rate_limit,
        )));
        let access_cache = Arc::new(AccessControlCache::new());
        let response_cache = Arc::new(ResponseCache::new(&config.cache));

        let chain = FilterChain::assemble(
            &config,
            limiter.clone(),
            limit_index.clone(),
            access_cache.clone(),
            response_cache.clone(),
        )?;

        let registry = RegistryClient::new(&config.registry);

        // Connection pooling and keep-alive live here; per-request
        // deadlines are enforced in the handler.
        let upstream = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs_f64(config.proxy.connect_timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("failed to build upstream http client");

        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            publisher.clone(),
            refresh_tx.clone(),
        ));

        let request_id_header = config.headers.request_id_header.clone();

        Ok(Arc::new(Self {
            config,
            request_id_header,
            routes: ArcSwap::from_pointee(RouteTable::empty()),
            definitions: ArcSwap::from_pointee(Vec::new()),
            limit_index,
            limiter,
            access_cache,
            response_cache,
            chain,
            registry,
            upstream,
            publisher,
            health,
            refresh_tx,
        }))
    }

    /// Re-fetch routes from the registry and swap the table. A batch
    /// that fails validation leaves the previous snapshot serving.
    pub async fn refresh_routes(&self) {
        let definitions = match self.registry.fetch_routes().await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("refresh: route fetch failed, err={}", e);
                metrics::counter!("portico_refresh_failures_total", "kind" => "routes")
                    .increment(1);
                return;
            }
        };

        if let Err(e) = validate_route_batch(&definitions) {
            tracing::warn!("refresh: route batch rejected, err={}", e);
            metrics::counter!("portico_refresh_failures_total", "kind" => "routes")
                .increment(1);
            return;
        }

        self.definitions.store(Arc::new(definitions));
        self.rebuild_route_table();
    }

    /// Rebuild the serving table from the last validated fetch, dropping
    /// routes whose backend is currently unhealthy. Health flips call
    /// this through a routes refresh.
    pub fn rebuild_route_table(&self) {
        let definitions = self.definitions.load();
        let serving: Vec<RouteDefinition> = definitions
            .iter()
            .filter(|d| self.health.is_healthy(&d.service))
            .cloned()
            .collect();

        let table = RouteTable::build(&serving);
        let count = table.route_count();
        self.routes.store(Arc::new(table));

        metrics::gauge!("portico_routes_active").set(count as f64);
        tracing::info!(
            "refresh: route table swapped, serving={}, fetched={}",
            count,
            definitions.len()
        );
    }

    pub async fn refresh_rate_limits(&self) {
        let rules = match self.registry.fetch_rate_limits().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("refresh: rate limit fetch failed, err={}", e);
                metrics::counter!("portico_refresh_failures_total", "kind" => "rate_limits")
                    .increment(1);
                return;
            }
        };

        if let Err(e) = validate_rate_limit_batch(&rules, &self.config.rate_limit) {
            tracing::warn!("refresh: rate limit batch rejected, err={}", e);
            metrics::counter!("portico_refresh_failures_total", "kind" => "rate_limits")
                .increment(1);
            return;
        }

        // A rule naming a resolver nobody registered is misconfiguration;
        // surface it here, not per request.
        if let Some(rule) = rules
            .iter()
            .find(|r| !self.limiter.resolvers().contains(&r.key_resolver))
        {
            tracing::warn!(
                "refresh: rate limit batch rejected, unknown key resolver, rule={}, resolver={}",
                rule.key(),
                rule.key_resolver
            );
            metrics::counter!("portico_refresh_failures_total", "kind" => "rate_limits")
                .increment(1);
            return;
        }

        let index = RateLimitIndex::build(&rules, &self.config.rate_limit);
        let count = index.rule_count();
        self.limit_index.store(Arc::new(index));

        metrics::gauge!("portico_rate_limit_rules").set(count as f64);
        tracing::info!("refresh: rate limit index swapped, rules={}", count);
    }

    pub async fn refresh_access_policies(&self) {
        if !self.config.access_control.enabled {
            return;
        }

        let db_policies = match self.registry.fetch_access_policies().await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("refresh: access policy fetch failed, err={}", e);
                metrics::counter!("portico_refresh_failures_total", "kind" => "access_control")
                    .increment(1);
                return;
            }
        };

        let overrides = match &self.config.access_control.overrides_file {
            Some(path) => match load_yaml_overrides(Path::new(path)) {
                Ok(o) => o,
                Err(e) => {
                    // A broken override file must not wipe the
                    // database-backed policies.
                    tracing::error!("refresh: override file rejected, path={}, err={}", path, e);
                    metrics::counter!(
                        "portico_refresh_failures_total",
                        "kind" => "access_control",
                    )
                    .increment(1);
                    return;
                }
            },
            None => Vec::new(),
        };

        let merged = merge_policies(db_policies, overrides);
        let count = merged.len();
        self.access_cache.rebuild(merged);

        metrics::gauge!("portico_access_clients").set(count as f64);
        tracing::info!("refresh: access policy cache swapped, clients={}", count);
    }

    pub async fn refresh(&self, kind: RefreshKind) {
        match kind {
            RefreshKind::Routes => self.refresh_routes().await,
            RefreshKind::RateLimits => self.refresh_rate_limits().await,
            RefreshKind::AccessControl => self.refresh_access_policies().await,
        }
    }

    pub async fn refresh_all(&self) {
        self.refresh_routes().await;
        self.refresh_rate_limits().await;
        self.refresh_access_policies().await;
    }

    /// Distinct (service, uri) pairs from the last fetch. Unhealthy
    /// backends stay probed so recovery can be observed.
    pub fn health_targets(&self) -> Vec<HealthTarget> {
        let definitions = self.definitions.load();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut targets = Vec::new();
        for def in definitions.iter() {
            if seen.insert(def.service.as_str()) {
                targets.push(HealthTarget {
                    service: def.service.clone(),
                    uri: def.uri.clone(),
                });
            }
        }
        targets
    }

    pub fn ready(&self) -> bool {
        self.routes.load().route_count() > 0
    }
}

/// Drains refresh triggers from the event subscriber, health monitor,
/// and admin endpoint. Duplicate kinds queued while a refresh runs
/// collapse into one pass.
pub async fn run_refresh_coordinator(
    state: Arc<GatewayState>,
    mut rx: mpsc::UnboundedReceiver<RefreshKind>,
    shutdown: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            _ = shutdown.cancelled() => return,
            kind = rx.recv() => match kind {
                Some(k) => k,
                None => return,
            },
        };

        let mut kinds = vec![first];
        while let Ok(kind) = rx.try_recv() {
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }

        for kind in kinds {
            metrics::counter!("portico_refresh_total", "kind" => kind.as_str()).increment(1);
            state.refresh(kind).await;
        }
    }
}
