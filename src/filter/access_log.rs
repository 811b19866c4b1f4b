use crate::error::GatewayError;
use crate::filter::FilterResult;
use crate::proxy::context::{BoxBody, Exchange};

/// Sits at the front of the chain, so its response hook runs last and
/// sees the final status. Emits the access line and closes out the
/// per-request metrics.
pub struct AccessLogFilter;

impl AccessLogFilter {
    pub fn new() -> Self {
        Self
    }

    pub fn on_request(&self, _ex: &mut Exchange) -> Result<FilterResult, GatewayError> {
        Ok(FilterResult::Continue)
    }

    pub fn on_response(&self, ex: &Exchange, resp: &hyper::Response<BoxBody>) {
        let status = resp.status().as_u16();

        if let Some(len) = resp
            .headers()
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<f64>().ok())
        {
            metrics::histogram!(
                "portico_http_response_size_bytes",
                "route" => ex.route_id.clone(),
            )
            .record(len);
        }

        ex.finalize_metrics(status);

        tracing::info!(
            client_ip = %ex.client_ip,
            method = %ex.method,
            host = %ex.host,
            path = %ex.path,
            status = status,
            route = %ex.route_id,
            service = %ex.service,
            request_id = %ex.request_id,
            client_id = ex.client_id.as_deref().unwrap_or("-"),
            latency_ms = ex.start.elapsed().as_millis() as u64,
            cache = ex.served_from_cache,
            "access"
        );
    }
}

impl Default for AccessLogFilter {
    fn default() -> Self {
        Self::new()
    }
}
