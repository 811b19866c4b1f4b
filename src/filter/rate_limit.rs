use crate::error::GatewayError;
use crate::filter::FilterResult;
use crate::limit::{KeyRequest, RateLimitIndex, RateLimiter};
use crate::proxy::context::{BoxBody, Exchange};
use arc_swap::ArcSwap;
use http::{HeaderValue, StatusCode};
use std::sync::Arc;

/// Token-bucket enforcement against the shared counter store. The rule
/// index is an atomic snapshot; this filter never mutates it.
pub struct RateLimitFilter {
    limiter: Arc<RateLimiter>,
    index: Arc<ArcSwap<RateLimitIndex>>,
}

impl RateLimitFilter {
    pub fn new(limiter: Arc<RateLimiter>, index: Arc<ArcSwap<RateLimitIndex>>) -> Self {
        Self { limiter, index }
    }

    pub async fn on_request(
        &self,
        ex: &mut Exchange,
        headers: &http::HeaderMap,
    ) -> Result<FilterResult, GatewayError> {
        let route = match ex.route.clone() {
            Some(r) => r,
            None => return Ok(FilterResult::Continue),
        };

        let rule = self.index.load().lookup(&ex.route_id, &ex.service);
        let key_request = KeyRequest {
            headers,
            client_ip: ex.client_ip,
            path: &ex.path,
            route_id: &ex.route_id,
        };

        let decision = self.limiter.is_allowed(&rule, &route, &key_request).await;

        if decision.denied_empty_key {
            let status = StatusCode::from_u16(decision.empty_key_status)
                .unwrap_or(StatusCode::FORBIDDEN);
            metrics::counter!(
                "portico_rate_limit_rejected_total",
                "route" => ex.route_id.clone(),
                "reason" => "empty_key",
            )
            .increment(1);
            ex.rate_limit = Some(decision);
            return Ok(FilterResult::Reject(
                ex.error_response(status, "missing rate limit key"),
            ));
        }

        if !decision.allowed {
            tracing::debug!(
                "filter: rate_limit: rejected, route={}, tokens_left={}",
                ex.route_id,
                decision.tokens_left
            );
            metrics::counter!(
                "portico_rate_limit_rejected_total",
                "route" => ex.route_id.clone(),
                "reason" => "exhausted",
            )
            .increment(1);
            let mut resp = ex.error_response(StatusCode::TOO_MANY_REQUESTS, "too many requests");
            attach_rate_limit_headers(&decision, &mut resp);
            ex.rate_limit = Some(decision);
            return Ok(FilterResult::Reject(resp));
        }

        metrics::counter!(
            "portico_rate_limit_allowed_total",
            "route" => ex.route_id.clone(),
        )
        .increment(1);
        ex.rate_limit = Some(decision);
        Ok(FilterResult::Continue)
    }

    pub fn on_response(&self, ex: &Exchange, resp: &mut hyper::Response<BoxBody>) {
        if let Some(ref decision) = ex.rate_limit {
            attach_rate_limit_headers(decision, resp);
        }
    }
}

fn attach_rate_limit_headers(
    decision: &crate::limit::RateLimitDecision,
    resp: &mut hyper::Response<BoxBody>,
) {
    if !decision.include_headers {
        return;
    }
    let headers = resp.headers_mut();
    if decision.tokens_left >= 0 {
        if let Ok(v) = HeaderValue::from_str(&decision.tokens_left.to_string()) {
            headers.insert("x-ratelimit-remaining", v);
        }
    }
    if let Ok(v) = HeaderValue::from_str(&decision.replenish_rate.to_string()) {
        headers.insert("x-ratelimit-replenish-rate", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.burst_capacity.to_string()) {
        headers.insert("x-ratelimit-burst-capacity", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.requested_tokens.to_string()) {
        headers.insert("x-ratelimit-requested-tokens", v);
    }
}
