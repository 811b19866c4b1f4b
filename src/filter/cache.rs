use crate::config::CacheConfig;
use crate::error::GatewayError;
use crate::filter::FilterResult;
use crate::proxy::context::{full_body, BoxBody, Exchange};
use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, HeaderValue, StatusCode};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct CacheEntry {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    expires_at: Instant,
}

/// Keyed response store for GET traffic. Entries expire by TTL; when the
/// map grows past `max_entries` a sweep drops expired entries first and
/// falls back to evicting arbitrary entries to get back under the cap.
pub struct ResponseCache {
    entries: DashMap<String, Arc<CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
    max_body_bytes: usize,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::from_secs(config.ttl_secs),
            max_entries: config.max_entries,
            max_body_bytes: config.max_body_bytes,
        }
    }

    pub fn get(&self, key: &str) -> Option<hyper::Response<BoxBody>> {
        let entry = self.entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }

        let mut resp = hyper::Response::new(full_body(entry.body.clone()));
        *resp.status_mut() = entry.status;
        *resp.headers_mut() = entry.headers.clone();
        resp.headers_mut()
            .insert("x-cache", HeaderValue::from_static("HIT"));
        metrics::counter!("portico_cache_hits_total").increment(1);
        Some(resp)
    }

    pub fn insert(&self, key: String, status: StatusCode, headers: HeaderMap, body: Bytes) {
        if body.len() > self.max_body_bytes {
            tracing::debug!(
                "cache: body too large to store, key={}, size={}",
                key,
                body.len()
            );
            return;
        }

        if self.entries.len() >= self.max_entries {
            self.evict();
        }

        self.entries.insert(
            key,
            Arc::new(CacheEntry {
                status,
                headers,
                body,
                expires_at: Instant::now() + self.ttl,
            }),
        );
        metrics::gauge!("portico_cache_entries").set(self.entries.len() as f64);
    }

    fn evict(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);

        // Still full after the expiry sweep: shed whatever the shard
        // iterator yields first.
        while self.entries.len() >= self.max_entries {
            let victim = match self.entries.iter().next() {
                Some(e) => e.key().clone(),
                None => break,
            };
            self.entries.remove(&victim);
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

enum KeySegment {
    Literal(String),
    RouteId,
    RequestPath,
    RequestMethod,
    Header(String),
}

/// Cache lookup on the request path. A hit short-circuits the chain; a
/// miss records the rendered key on the exchange so the handler can
/// store the upstream response after it arrives.
pub struct CacheFilter {
    segments: Vec<KeySegment>,
    cache: Arc<ResponseCache>,
}

impl CacheFilter {
    pub fn new(template: &str, cache: Arc<ResponseCache>) -> Self {
        Self {
            segments: parse_template(template),
            cache,
        }
    }

    pub fn on_request(
        &self,
        ex: &mut Exchange,
        headers: &http::HeaderMap,
    ) -> Result<FilterResult, GatewayError> {
        if ex.method != "GET" {
            return Ok(FilterResult::Continue);
        }

        // Callers asking for a fresh response bypass both lookup and store.
        if no_cache_requested(headers) {
            return Ok(FilterResult::Continue);
        }

        let key = self.render_key(ex, headers);
        if let Some(resp) = self.cache.get(&key) {
            tracing::debug!("filter: cache: hit, key={}, route={}", key, ex.route_id);
            ex.served_from_cache = true;
            ex.finalize_metrics(resp.status().as_u16());
            return Ok(FilterResult::Reject(resp));
        }

        metrics::counter!("portico_cache_misses_total").increment(1);
        ex.cache_key = Some(key);
        Ok(FilterResult::Continue)
    }

    fn render_key(&self, ex: &Exchange, headers: &http::HeaderMap) -> String {
        let mut key = String::new();
        for segment in &self.segments {
            match segment {
                KeySegment::Literal(s) => key.push_str(s),
                KeySegment::RouteId => key.push_str(&ex.route_id),
                KeySegment::RequestPath => key.push_str(&ex.path),
                KeySegment::RequestMethod => key.push_str(&ex.method),
                KeySegment::Header(name) => {
                    if let Some(v) = headers.get(name.as_str()).and_then(|v| v.to_str().ok()) {
                        key.push_str(v);
                    }
                }
            }
        }
        key
    }
}

fn no_cache_requested(headers: &http::HeaderMap) -> bool {
    headers
        .get(http::header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("no-cache"))
        .unwrap_or(false)
}

fn parse_template(template: &str) -> Vec<KeySegment> {
    let mut segments = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        if open > 0 {
            segments.push(KeySegment::Literal(rest[..open].to_string()));
        }
        rest = &rest[open..];
        match rest.find('}') {
            Some(close) => {
                let name = &rest[1..close];
                let segment = match name {
                    "routeId" => KeySegment::RouteId,
                    "requestPath" => KeySegment::RequestPath,
                    "requestMethod" => KeySegment::RequestMethod,
                    _ => match name.strip_prefix("header:") {
                        Some(h) => KeySegment::Header(h.to_ascii_lowercase()),
                        // Unknown placeholder stays literal so the key is
                        // at least stable.
                        None => KeySegment::Literal(rest[..close + 1].to_string()),
                    },
                };
                segments.push(segment);
                rest = &rest[close + 1..];
            }
            None => {
                segments.push(KeySegment::Literal(rest.to_string()));
                rest = "";
            }
        }
    }
    if !rest.is_empty() {
        segments.push(KeySegment::Literal(rest.to_string()));
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn exchange(method: &str) -> Exchange {
        let mut ex = Exchange::new(
            "api.test".to_string(),
            "/v1/orders".to_string(),
            method.to_string(),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            "req-1".to_string(),
        );
        ex.route_id = "orders-v1".to_string();
        ex
    }

    fn cache() -> Arc<ResponseCache> {
        Arc::new(ResponseCache::new(&CacheConfig {
            enabled: true,
            ..Default::default()
        }))
    }

    #[test]
    fn test_default_template_key() {
        let f = CacheFilter::new("{routeId}:{requestMethod}:{requestPath}", cache());
        let ex = exchange("GET");
        let headers = http::HeaderMap::new();
        assert_eq!(f.render_key(&ex, &headers), "orders-v1:GET:/v1/orders");
    }

    #[test]
    fn test_header_placeholder() {
        let f = CacheFilter::new("{routeId}:{header:X-Tenant}", cache());
        let ex = exchange("GET");
        let mut headers = http::HeaderMap::new();
        headers.insert("x-tenant", "acme".parse().unwrap());
        assert_eq!(f.render_key(&ex, &headers), "orders-v1:acme");
    }

    #[test]
    fn test_miss_sets_cache_key() {
        let f = CacheFilter::new("{routeId}:{requestPath}", cache());
        let mut ex = exchange("GET");
        let headers = http::HeaderMap::new();
        assert!(matches!(
            f.on_request(&mut ex, &headers).unwrap(),
            FilterResult::Continue
        ));
        assert_eq!(ex.cache_key.as_deref(), Some("orders-v1:/v1/orders"));
    }

    #[test]
    fn test_hit_short_circuits() {
        let c = cache();
        c.insert(
            "orders-v1:/v1/orders".to_string(),
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(b"{\"ok\":true}"),
        );

        let f = CacheFilter::new("{routeId}:{requestPath}", c);
        let mut ex = exchange("GET");
        let headers = http::HeaderMap::new();
        match f.on_request(&mut ex, &headers).unwrap() {
            FilterResult::Reject(resp) => {
                assert_eq!(resp.status(), StatusCode::OK);
                assert_eq!(resp.headers().get("x-cache").unwrap(), "HIT");
            }
            FilterResult::Continue => panic!("expected cache hit"),
        }
        assert!(ex.served_from_cache);
    }

    #[test]
    fn test_no_cache_request_bypasses_hit_and_store() {
        let c = cache();
        c.insert(
            "orders-v1:/v1/orders".to_string(),
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(b"stale"),
        );

        let f = CacheFilter::new("{routeId}:{requestPath}", c);
        let mut ex = exchange("GET");
        let mut headers = http::HeaderMap::new();
        headers.insert("cache-control", "no-cache".parse().unwrap());
        assert!(matches!(
            f.on_request(&mut ex, &headers).unwrap(),
            FilterResult::Continue
        ));
        assert!(!ex.served_from_cache);
        // The fresh response is not stored either.
        assert!(ex.cache_key.is_none());
    }

    #[test]
    fn test_non_get_bypasses() {
        let f = CacheFilter::new("{routeId}:{requestPath}", cache());
        let mut ex = exchange("POST");
        let headers = http::HeaderMap::new();
        assert!(matches!(
            f.on_request(&mut ex, &headers).unwrap(),
            FilterResult::Continue
        ));
        assert!(ex.cache_key.is_none());
    }

    #[test]
    fn test_oversized_body_not_stored() {
        let c = Arc::new(ResponseCache::new(&CacheConfig {
            enabled: true,
            max_body_bytes: 8,
            ..Default::default()
        }));
        c.insert(
            "k".to_string(),
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(b"way more than eight bytes"),
        );
        assert_eq!(c.entry_count(), 0);
    }

    #[test]
    fn test_expired_entry_not_served() {
        let c = Arc::new(ResponseCache::new(&CacheConfig {
            enabled: true,
            ttl_secs: 0,
            ..Default::default()
        }));
        c.insert(
            "k".to_string(),
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(b"x"),
        );
        assert!(c.get("k").is_none());
    }

    #[test]
    fn test_eviction_keeps_cap() {
        let c = Arc::new(ResponseCache::new(&CacheConfig {
            enabled: true,
            max_entries: 4,
            ..Default::default()
        }));
        for i in 0..10 {
            c.insert(
                format!("k{}", i),
                StatusCode::OK,
                HeaderMap::new(),
                Bytes::from_static(b"x"),
            );
        }
        assert!(c.entry_count() <= 4);
    }
}
