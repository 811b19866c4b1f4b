use crate::access::{AccessControlCache, AccessDecision};
use crate::config::AccessControlConfig;
use crate::error::GatewayError;
use crate::filter::headers::build_glob_set;
use crate::filter::FilterResult;
use crate::proxy::context::Exchange;
use globset::GlobSet;
use http::StatusCode;
use std::sync::Arc;

/// Client allow-list enforcement. The policy cache behind this filter is
/// swapped wholesale on refresh; the filter itself is immutable.
pub struct AccessControlFilter {
    cache: Arc<AccessControlCache>,
    client_id_header: String,
    skip: GlobSet,
}

impl AccessControlFilter {
    pub fn from_config(
        config: &AccessControlConfig,
        cache: Arc<AccessControlCache>,
    ) -> Result<Self, GatewayError> {
        Ok(Self {
            cache,
            client_id_header: config.client_id_header.to_ascii_lowercase(),
            skip: build_glob_set(&config.skip_paths)?,
        })
    }

    pub fn on_request(
        &self,
        ex: &mut Exchange,
        headers: &http::HeaderMap,
    ) -> Result<FilterResult, GatewayError> {
        let exempt = ex.route.as_ref().map(|r| r.api_docs).unwrap_or(false)
            || self.skip.is_match(ex.path.as_str());
        if exempt {
            return Ok(FilterResult::Continue);
        }

        let client_id = headers
            .get(self.client_id_header.as_str())
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty());

        let client_id = match client_id {
            Some(id) => {
                ex.client_id = Some(id.to_string());
                id
            }
            None => {
                metrics::counter!("portico_access_denied_total", "reason" => "missing_client_id")
                    .increment(1);
                return Ok(FilterResult::Reject(
                    ex.error_response(StatusCode::UNAUTHORIZED, "missing client id"),
                ));
            }
        };

        match self.cache.check(client_id, &ex.service, &ex.route_id) {
            AccessDecision::Allowed => Ok(FilterResult::Continue),
            AccessDecision::Denied(reason) => {
                tracing::debug!(
                    "filter: access_control: denied, client={}, route={}, reason={}",
                    client_id,
                    ex.route_id,
                    reason
                );
                metrics::counter!("portico_access_denied_total", "reason" => reason)
                    .increment(1);
                Ok(FilterResult::Reject(
                    ex.error_response(StatusCode::FORBIDDEN, reason),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::model::{AccessPolicy, PolicySource, RouteDefinition, RoutePredicates};
    use crate::routing::RouteTable;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};

    fn exchange(api_docs: bool) -> Exchange {
        let def = RouteDefinition {
            id: "orders-v1".to_string(),
            service: "orders".to_string(),
            uri: "http://backend".to_string(),
            predicates: RoutePredicates {
                path: "/*".to_string(),
                methods: vec![],
                headers: vec![],
            },
            filters: vec![],
            metadata: HashMap::new(),
            active: true,
            api_docs,
        };
        let table = RouteTable::build(&[def]);
        let mut ex = Exchange::new(
            "api.test".to_string(),
            "/v1/orders".to_string(),
            "GET".to_string(),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            "req-1".to_string(),
        );
        ex.route = Some(table.all_routes()[0].clone());
        ex.route_id = "orders-v1".to_string();
        ex.service = "orders".to_string();
        ex
    }

    fn cache_with(rules: &[&str]) -> Arc<AccessControlCache> {
        let cache = Arc::new(AccessControlCache::new());
        cache.rebuild(vec![AccessPolicy {
            client_id: "partner-a".to_string(),
            tenant: "t".to_string(),
            active: true,
            rules: rules.iter().map(|r| r.to_string()).collect(),
            last_updated: 0,
            source: PolicySource::Database,
        }]);
        cache
    }

    fn filter(cache: Arc<AccessControlCache>) -> AccessControlFilter {
        AccessControlFilter::from_config(&AccessControlConfig::default(), cache).unwrap()
    }

    #[test]
    fn test_allowed_client_passes() {
        let f = filter(cache_with(&["orders:*"]));
        let mut ex = exchange(false);
        let mut headers = http::HeaderMap::new();
        headers.insert("x-client-id", "partner-a".parse().unwrap());

        assert!(matches!(
            f.on_request(&mut ex, &headers).unwrap(),
            FilterResult::Continue
        ));
        assert_eq!(ex.client_id.as_deref(), Some("partner-a"));
    }

    #[test]
    fn test_missing_client_id_unauthorized() {
        let f = filter(cache_with(&["orders:*"]));
        let mut ex = exchange(false);
        let headers = http::HeaderMap::new();

        match f.on_request(&mut ex, &headers).unwrap() {
            FilterResult::Reject(resp) => assert_eq!(resp.status(), StatusCode::UNAUTHORIZED),
            FilterResult::Continue => panic!("expected reject"),
        }
    }

    #[test]
    fn test_unknown_client_forbidden() {
        let f = filter(cache_with(&["orders:*"]));
        let mut ex = exchange(false);
        let mut headers = http::HeaderMap::new();
        headers.insert("x-client-id", "stranger".parse().unwrap());

        match f.on_request(&mut ex, &headers).unwrap() {
            FilterResult::Reject(resp) => assert_eq!(resp.status(), StatusCode::FORBIDDEN),
            FilterResult::Continue => panic!("expected reject"),
        }
    }

    #[test]
    fn test_rule_mismatch_forbidden() {
        let f = filter(cache_with(&["billing:*"]));
        let mut ex = exchange(false);
        let mut headers = http::HeaderMap::new();
        headers.insert("x-client-id", "partner-a".parse().unwrap());

        assert!(matches!(
            f.on_request(&mut ex, &headers).unwrap(),
            FilterResult::Reject(_)
        ));
    }

    #[test]
    fn test_api_docs_route_exempt() {
        let f = filter(cache_with(&[]));
        let mut ex = exchange(true);
        let headers = http::HeaderMap::new();
        assert!(matches!(
            f.on_request(&mut ex, &headers).unwrap(),
            FilterResult::Continue
        ));
    }

    #[test]
    fn test_skip_path_exempt() {
        let cache = cache_with(&[]);
        let config = AccessControlConfig {
            skip_paths: vec!["/v1/orders*".to_string()],
            ..Default::default()
        };
        let f = AccessControlFilter::from_config(&config, cache).unwrap();
        let mut ex = exchange(false);
        let headers = http::HeaderMap::new();
        assert!(matches!(
            f.on_request(&mut ex, &headers).unwrap(),
            FilterResult::Continue
        ));
    }
}
