use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Histogram bucket boundaries for response body size (bytes).
const SIZE_BUCKETS: &[f64] = &[
    100.0, 500.0, 1000.0, 5000.0, 10000.0, 50000.0, 100000.0, 500000.0, 1000000.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called once at startup, before any macro use.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Full(
                    "portico_http_response_size_bytes".to_string(),
                ),
                SIZE_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // request path
        describe_counter!(
            "portico_http_requests_total",
            Unit::Count,
            "Total HTTP requests processed"
        );
        describe_histogram!(
            "portico_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from client perspective"
        );
        describe_histogram!(
            "portico_upstream_request_duration_seconds",
            Unit::Seconds,
            "Upstream request duration (time spent waiting for upstream)"
        );
        describe_gauge!(
            "portico_http_requests_in_flight",
            Unit::Count,
            "Number of requests currently being processed"
        );
        describe_histogram!(
            "portico_http_response_size_bytes",
            Unit::Bytes,
            "Response body size in bytes"
        );
        describe_counter!(
            "portico_upstream_errors_total",
            Unit::Count,
            "Upstream requests that failed or timed out"
        );
        describe_counter!(
            "portico_filter_errors_total",
            Unit::Count,
            "Filter evaluation failures isolated to a 500 response"
        );

        // rate limiting
        describe_counter!(
            "portico_rate_limit_rejected_total",
            Unit::Count,
            "Total requests rejected by the rate limiter"
        );
        describe_counter!(
            "portico_rate_limit_allowed_total",
            Unit::Count,
            "Total requests allowed by the rate limiter"
        );
        describe_counter!(
            "portico_rate_limit_store_errors_total",
            Unit::Count,
            "Counter store failures degraded to fail-open"
        );
        describe_gauge!(
            "portico_rate_limit_rules",
            Unit::Count,
            "Rate limit rules in the active index"
        );

        // access control / headers
        describe_counter!(
            "portico_access_denied_total",
            Unit::Count,
            "Requests denied by client access control"
        );
        describe_counter!(
            "portico_header_rejected_total",
            Unit::Count,
            "Requests rejected by mandatory header validation"
        );
        describe_gauge!(
            "portico_access_clients",
            Unit::Count,
            "Clients in the active access policy cache"
        );

        // response cache
        describe_counter!("portico_cache_hits_total", Unit::Count, "Response cache hits");
        describe_counter!(
            "portico_cache_misses_total",
            Unit::Count,
            "Response cache misses"
        );
        describe_gauge!(
            "portico_cache_entries",
            Unit::Count,
            "Entries in the response cache"
        );

        // config refresh and events
        describe_counter!(
            "portico_refresh_total",
            Unit::Count,
            "Snapshot refresh passes by kind"
        );
        describe_counter!(
            "portico_refresh_failures_total",
            Unit::Count,
            "Refresh passes that kept the previous snapshot"
        );
        describe_gauge!(
            "portico_routes_active",
            Unit::Count,
            "Routes in the serving table"
        );
        describe_counter!(
            "portico_events_received_total",
            Unit::Count,
            "Change events received on the event channel"
        );
        describe_counter!(
            "portico_events_published_total",
            Unit::Count,
            "Change events published after debounce"
        );
        describe_counter!(
            "portico_events_dropped_total",
            Unit::Count,
            "Change events dropped after exhausting publish retries"
        );

        // health
        describe_counter!(
            "portico_health_flips_total",
            Unit::Count,
            "Services flipped to unhealthy"
        );

        // connections
        describe_gauge!(
            "portico_connections_active",
            Unit::Count,
            "Active downstream connections"
        );
        describe_counter!(
            "portico_connections_total",
            Unit::Count,
            "Total connections accepted"
        );

        Self { handle }
    }

    /// Render the current state in Prometheus exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
