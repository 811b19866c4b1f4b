use crate::limit::RateLimitDecision;
use crate::routing::CompiledRoute;
use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
// Unsync because upstream bodies stream out of reqwest, whose stream
// type is Send but not Sync. Hyper only needs Send here.
pub type BoxBody = http_body_util::combinators::UnsyncBoxBody<Bytes, BoxError>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Per-request state threaded through the filter chain and proxy phases.
pub struct Exchange {
    pub host: String,
    pub path: String,
    pub method: String,
    pub client_ip: IpAddr,
    pub request_id: String,
    /// From the configured client id header, when present.
    pub client_id: Option<String>,
    pub route_id: String,
    pub service: String,
    pub upstream_uri: String,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
    pub route: Option<Arc<CompiledRoute>>,
    /// Set by the rate-limit filter so the response phase can attach
    /// X-RateLimit headers.
    pub rate_limit: Option<RateLimitDecision>,
    /// Set by the cache filter on a miss; the handler stores the upstream
    /// response under this key.
    pub cache_key: Option<String>,
    pub served_from_cache: bool,
    finalized: AtomicBool,
}

impl Exchange {
    pub fn new(
        host: String,
        path: String,
        method: String,
        client_ip: IpAddr,
        request_id: String,
    ) -> Self {
        Self {
            host,
            path,
            method,
            client_ip,
            request_id,
            client_id: None,
            route_id: String::new(),
            service: String::new(),
            upstream_uri: String::new(),
            start: Instant::now(),
            upstream_start: None,
            route: None,
            rate_limit: None,
            cache_key: None,
            served_from_cache: false,
            finalized: AtomicBool::new(false),
        }
    }

    pub fn error_response(&self, status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
        self.finalize_metrics(status.as_u16());
        json_error(status, msg)
    }

    /// Counts the request once. A synthesized error response finalizes at
    /// rejection time and the access log hook finalizes at the end of the
    /// chain; whichever runs first wins, the other is a no-op.
    pub fn finalize_metrics(&self, resp_status: u16) {
        if self.finalized.swap(true, Ordering::Relaxed) {
            return;
        }
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "portico_http_requests_total",
            "route" => self.route_id.clone(),
            "service" => self.service.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!(
            "portico_http_request_duration_seconds",
            "route" => self.route_id.clone(),
            "service" => self.service.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!(
                "portico_upstream_request_duration_seconds",
                "route" => self.route_id.clone(),
                "service" => self.service.clone(),
            )
            .record(upstream_start.elapsed().as_secs_f64());
        }
    }

    #[cfg(test)]
    pub(crate) fn metrics_finalized(&self) -> bool {
        self.finalized.load(Ordering::Relaxed)
    }
}

pub fn json_error(status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
    hyper::Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(format!(r#"{{"error":"{}"}}"#, msg)))
        .unwrap_or_else(|_| {
            let mut resp = hyper::Response::new(empty_body());
            *resp.status_mut() = status;
            resp
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn exchange() -> Exchange {
        Exchange::new(
            "api.example.com".to_string(),
            "/v1/orders".to_string(),
            "GET".to_string(),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            "req-1".to_string(),
        )
    }

    #[test]
    fn test_exchange_new_defaults() {
        let ex = exchange();
        assert_eq!(ex.path, "/v1/orders");
        assert!(ex.client_id.is_none());
        assert!(ex.route.is_none());
        assert!(ex.rate_limit.is_none());
        assert!(!ex.served_from_cache);
    }

    #[test]
    fn test_error_response_shape() {
        let ex = exchange();
        let resp = ex.error_response(StatusCode::BAD_GATEWAY, "upstream failed");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(resp.headers().get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn test_finalize_runs_once() {
        let ex = exchange();
        assert!(!ex.metrics_finalized());
        let _ = ex.error_response(StatusCode::BAD_GATEWAY, "upstream failed");
        assert!(ex.metrics_finalized());
        // The access log hook calling again is a no-op.
        ex.finalize_metrics(502);
    }

    #[test]
    fn test_json_error_various_status() {
        for status in &[
            StatusCode::NOT_FOUND,
            StatusCode::FORBIDDEN,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
        ] {
            assert_eq!(json_error(*status, "err").status(), *status);
        }
    }
}
