pub mod access_control;
pub mod access_log;
pub mod cache;
pub mod headers;
pub mod rate_limit;

use crate::access::AccessControlCache;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::limit::{RateLimitIndex, RateLimiter};
use crate::proxy::context::{BoxBody, Exchange};
use crate::routing::CompiledRoute;
use arc_swap::ArcSwap;
use http::StatusCode;
use std::sync::Arc;

/// Filter names a route's filter specs may reference. Specs naming
/// anything else are rejected at the registry boundary.
pub const KNOWN_FILTER_NAMES: &[&str] =
    &["access_log", "headers", "access_control", "rate_limit", "cache"];

pub use access_control::AccessControlFilter;
pub use access_log::AccessLogFilter;
pub use cache::{CacheFilter, ResponseCache};
pub use headers::HeaderFilter;
pub use rate_limit::RateLimitFilter;

/// Result of a filter's request phase.
pub enum FilterResult {
    Continue,
    /// Short-circuit: return this response immediately.
    Reject(hyper::Response<BoxBody>),
}

/// Enum-based filter — static dispatch, exhaustive match. Filters are
/// built once at startup; everything mutable behind them (rule indexes,
/// policy caches) is swapped atomically on refresh, so the chain itself
/// never rebuilds.
pub enum Filter {
    AccessLog(AccessLogFilter),
    Headers(HeaderFilter),
    AccessControl(AccessControlFilter),
    RateLimit(RateLimitFilter),
    Cache(CacheFilter),
}

impl Filter {
    /// Explicit chain position. Lower runs earlier in the request phase
    /// and later in the response phase.
    pub fn order(&self) -> i32 {
        match self {
            Filter::AccessLog(_) => -100,
            Filter::Headers(_) => 10,
            Filter::AccessControl(_) => 20,
            Filter::RateLimit(_) => 30,
            Filter::Cache(_) => 40,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Filter::AccessLog(_) => "access_log",
            Filter::Headers(_) => "headers",
            Filter::AccessControl(_) => "access_control",
            Filter::RateLimit(_) => "rate_limit",
            Filter::Cache(_) => "cache",
        }
    }

    pub async fn on_request(
        &self,
        ex: &mut Exchange,
        headers: &mut http::HeaderMap,
    ) -> Result<FilterResult, GatewayError> {
        match self {
            Filter::AccessLog(f) => f.on_request(ex),
            Filter::Headers(f) => f.on_request(ex, headers),
            Filter::AccessControl(f) => f.on_request(ex, headers),
            Filter::RateLimit(f) => f.on_request(ex, headers).await,
            Filter::Cache(f) => f.on_request(ex, headers),
        }
    }

    pub fn on_response(&self, ex: &Exchange, resp: &mut hyper::Response<BoxBody>) {
        match self {
            Filter::AccessLog(f) => f.on_response(ex, resp),
            Filter::Headers(_) => {}
            Filter::AccessControl(_) => {}
            Filter::RateLimit(f) => f.on_response(ex, resp),
            Filter::Cache(_) => {}
        }
    }
}

struct ChainEntry {
    filter: Filter,
    /// Whether the filter runs when the route carries no spec for it.
    /// Globally disabled filters stay in the chain so a route can turn
    /// them on for itself.
    default_on: bool,
}

/// The global chain, stable-sorted by `order()` at assembly. Request
/// filters run in ascending order; response filters run over the same
/// sequence reversed, so the first filter to see a request is the last
/// to touch its response.
///
/// A route's filter specs overlay the global chain per request: a spec
/// can enable a globally-off filter, disable a globally-on one, or move
/// it with an explicit `order` argument. Specs never instantiate new
/// filter state, so the chain itself stays immutable.
pub struct FilterChain {
    entries: Vec<ChainEntry>,
}

impl FilterChain {
    pub fn assemble(
        config: &GatewayConfig,
        limiter: Arc<RateLimiter>,
        limit_index: Arc<ArcSwap<RateLimitIndex>>,
        access_cache: Arc<AccessControlCache>,
        response_cache: Arc<ResponseCache>,
    ) -> Result<Self, GatewayError> {
        let mut entries = vec![
            ChainEntry {
                filter: Filter::AccessLog(AccessLogFilter::new()),
                default_on: true,
            },
            ChainEntry {
                filter: Filter::Headers(HeaderFilter::from_config(&config.headers)?),
                default_on: true,
            },
            ChainEntry {
                filter: Filter::AccessControl(AccessControlFilter::from_config(
                    &config.access_control,
                    access_cache,
                )?),
                default_on: config.access_control.enabled,
            },
            ChainEntry {
                filter: Filter::RateLimit(RateLimitFilter::new(limiter, limit_index)),
                default_on: true,
            },
            ChainEntry {
                filter: Filter::Cache(CacheFilter::new(
                    &config.cache.key_template,
                    response_cache,
                )),
                default_on: config.cache.enabled,
            },
        ];

        entries.sort_by_key(|e| e.filter.order());

        tracing::info!(
            "filter: chain assembled, filters={:?}",
            entries
                .iter()
                .filter(|e| e.default_on)
                .map(|e| e.filter.name())
                .collect::<Vec<_>>()
        );

        Ok(Self { entries })
    }

    /// The execution sequence for one request: global defaults overlaid
    /// with the route's filter specs, re-sorted when an order override is
    /// present. Deterministic for a given route, so the request and
    /// response phases always agree.
    fn plan(&self, route: Option<&CompiledRoute>) -> Vec<usize> {
        let overrides = route.map(|r| r.filter_overrides.as_slice()).unwrap_or(&[]);
        let mut seq: Vec<(i32, usize)> = Vec::with_capacity(self.entries.len());
        for (idx, entry) in self.entries.iter().enumerate() {
            let ov = overrides.iter().find(|o| o.name == entry.filter.name());
            let on = ov.map(|o| o.enabled).unwrap_or(entry.default_on);
            if !on {
                continue;
            }
            let order = ov
                .and_then(|o| o.order)
                .unwrap_or_else(|| entry.filter.order());
            seq.push((order, idx));
        }
        seq.sort_by_key(|&(order, _)| order);
        seq.into_iter().map(|(_, idx)| idx).collect()
    }

    /// Run request filters in order. A filter error never takes the
    /// gateway down with it: the request gets a 500 and the chain stops.
    pub async fn on_request(
        &self,
        ex: &mut Exchange,
        headers: &mut http::HeaderMap,
    ) -> Option<hyper::Response<BoxBody>> {
        let route = ex.route.clone();
        for idx in self.plan(route.as_deref()) {
            let filter = &self.entries[idx].filter;
            match filter.on_request(ex, headers).await {
                Ok(FilterResult::Continue) => {}
                Ok(FilterResult::Reject(resp)) => return Some(resp),
                Err(e) => {
                    tracing::error!(
                        "filter: {} failed, route={}, err={}",
                        filter.name(),
                        ex.route_id,
                        e
                    );
                    metrics::counter!(
                        "portico_filter_errors_total",
                        "filter" => filter.name(),
                    )
                    .increment(1);
                    return Some(
                        ex.error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error"),
                    );
                }
            }
        }
        None
    }

    pub fn on_response(&self, ex: &Exchange, resp: &mut hyper::Response<BoxBody>) {
        for idx in self.plan(ex.route.as_deref()).into_iter().rev() {
            self.entries[idx].filter.on_response(ex, resp);
        }
    }

    /// Names in execution order for the given route; `None` gives the
    /// global default sequence.
    pub fn filter_names(&self, route: Option<&CompiledRoute>) -> Vec<&'static str> {
        self.plan(route)
            .into_iter()
            .map(|idx| self.entries[idx].filter.name())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitSettings;
    use crate::limit::{CounterStore, MemoryCounterStore};

    fn chain(config: &GatewayConfig) -> FilterChain {
        let settings = RateLimitSettings::default();
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(CounterStore::Memory(MemoryCounterStore::new())),
            "test:ratelimit",
            &settings,
        ));
        let index = Arc::new(ArcSwap::from_pointee(RateLimitIndex::empty(&settings)));
        FilterChain::assemble(
            config,
            limiter,
            index,
            Arc::new(AccessControlCache::new()),
            Arc::new(ResponseCache::new(&config.cache)),
        )
        .unwrap()
    }

    fn route_with_filters(specs: Vec<crate::registry::model::FilterSpec>) -> Arc<CompiledRoute> {
        use crate::registry::model::{RouteDefinition, RoutePredicates};
        use crate::routing::RouteTable;
        use std::collections::HashMap;

        let def = RouteDefinition {
            id: "r1".to_string(),
            service: "svc".to_string(),
            uri: "http://backend".to_string(),
            predicates: RoutePredicates {
                path: "/*".to_string(),
                methods: vec![],
                headers: vec![],
            },
            filters: specs,
            metadata: HashMap::new(),
            active: true,
            api_docs: false,
        };
        let table = RouteTable::build(&[def]);
        table.all_routes()[0].clone()
    }

    fn spec(name: &str, args: &[(&str, &str)]) -> crate::registry::model::FilterSpec {
        crate::registry::model::FilterSpec {
            name: name.to_string(),
            args: args
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_chain_sorted_by_order() {
        let mut config = GatewayConfig::default();
        config.access_control.enabled = true;
        config.cache.enabled = true;

        let chain = chain(&config);
        assert_eq!(
            chain.filter_names(None),
            vec!["access_log", "headers", "access_control", "rate_limit", "cache"]
        );
    }

    #[test]
    fn test_disabled_filters_skipped() {
        let mut config = GatewayConfig::default();
        config.access_control.enabled = false;
        config.cache.enabled = false;

        let chain = chain(&config);
        assert_eq!(
            chain.filter_names(None),
            vec!["access_log", "headers", "rate_limit"]
        );
    }

    #[test]
    fn test_route_spec_enables_globally_off_filter() {
        let config = GatewayConfig::default();
        let chain = chain(&config);
        let route = route_with_filters(vec![spec("cache", &[])]);
        assert_eq!(
            chain.filter_names(Some(&route)),
            vec!["access_log", "headers", "rate_limit", "cache"]
        );
    }

    #[test]
    fn test_route_spec_disables_filter() {
        let config = GatewayConfig::default();
        let chain = chain(&config);
        let route = route_with_filters(vec![spec("rate_limit", &[("enabled", "false")])]);
        assert_eq!(
            chain.filter_names(Some(&route)),
            vec!["access_log", "headers"]
        );
    }

    #[test]
    fn test_route_spec_order_override_resequences() {
        let config = GatewayConfig::default();
        let chain = chain(&config);
        // Push the rate limiter in front of header validation.
        let route = route_with_filters(vec![spec("rate_limit", &[("order", "5")])]);
        assert_eq!(
            chain.filter_names(Some(&route)),
            vec!["access_log", "rate_limit", "headers"]
        );
    }
}
