use crate::config::types::deserialize_null_default;
use crate::config::RateLimitSettings;
use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Route metadata keys with this prefix are passed verbatim to the rule's
/// key resolver as arguments.
pub const RATE_LIMIT_ARG_PREFIX: &str = "rate-limit.";

/// Route metadata keys with this prefix declare per-route mandatory headers:
/// `required-header.<name> = <regex>` (empty value means presence-only).
pub const REQUIRED_HEADER_PREFIX: &str = "required-header.";

/// A route as stored in the registry. Compiled into the gateway's
/// `RouteTable` snapshot on refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDefinition {
    pub id: String,

    /// Logical backend name; also the service axis for rate-limit and
    /// access-control lookups.
    pub service: String,

    /// Backend base URL, e.g. `http://orders.internal:8080`.
    pub uri: String,

    #[serde(default)]
    pub predicates: RoutePredicates,

    /// Ordered per-route filter specs, merged with the global chain.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub filters: Vec<FilterSpec>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub metadata: HashMap<String, String>,

    /// Health-derived. Inactive routes are excluded from the route table.
    #[serde(default = "default_active")]
    pub active: bool,

    /// Documentation-only routes are exempt from access-control and header
    /// validation.
    #[serde(default)]
    pub api_docs: bool,
}

fn default_active() -> bool {
    true
}

/// Match conditions for a route. Path supports exact match and trailing
/// `/*` prefix wildcard; empty methods means all methods; header predicates
/// use AND semantics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutePredicates {
    #[serde(default)]
    pub path: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub methods: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub headers: Vec<HeaderPredicate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderPredicate {
    pub name: String,

    /// Regex the header value must match. Empty means presence-only.
    #[serde(default)]
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSpec {
    pub name: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub args: HashMap<String, String>,
}

/// A rate-limit rule from the registry. Keyed by exactly one of `route_id`
/// XOR `service`; `namespace` (defaulting to that key) selects the shared
/// bucket, so distinct routes can draw from one quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    #[serde(default)]
    pub route_id: Option<String>,

    #[serde(default)]
    pub service: Option<String>,

    #[serde(default)]
    pub namespace: Option<String>,

    pub replenish_rate: u64,

    pub burst_capacity: u64,

    #[serde(default = "default_requested_tokens")]
    pub requested_tokens: u64,

    #[serde(default = "default_rule_resolver")]
    pub key_resolver: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub args: HashMap<String, String>,

    #[serde(default = "default_rule_true")]
    pub include_headers: bool,

    #[serde(default)]
    pub deny_empty_key: bool,

    #[serde(default = "default_empty_key_status")]
    pub empty_key_status: u16,
}

fn default_requested_tokens() -> u64 {
    1
}

fn default_rule_resolver() -> String {
    "clientIp".to_string()
}

fn default_rule_true() -> bool {
    true
}

fn default_empty_key_status() -> u16 {
    403
}

impl RateLimitRule {
    /// The rule's lookup key: the route id or the service name.
    pub fn key(&self) -> &str {
        self.route_id
            .as_deref()
            .or(self.service.as_deref())
            .unwrap_or("")
    }

    /// Bucket-sharing namespace. Defaults to the rule's own key, so a rule
    /// without an explicit namespace gets an isolated bucket.
    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or_else(|| self.key())
    }

    /// Boundary validation for a single rule, including the configured
    /// maxima. Invalid rules never reach the gateway's runtime cache.
    pub fn validate(&self, settings: &RateLimitSettings) -> Result<(), GatewayError> {
        match (&self.route_id, &self.service) {
            (Some(_), Some(_)) => {
                return Err(GatewayError::Validation(
                    "rate-limit rule must set exactly one of routeId or service, both present"
                        .to_string(),
                ))
            }
            (None, None) => {
                return Err(GatewayError::Validation(
                    "rate-limit rule must set exactly one of routeId or service, both absent"
                        .to_string(),
                ))
            }
            _ => {}
        }
        if self.replenish_rate == 0 {
            return Err(GatewayError::Validation(format!(
                "rule '{}': replenishRate must be >= 1",
                self.key()
            )));
        }
        if self.burst_capacity < self.replenish_rate {
            return Err(GatewayError::Validation(format!(
                "rule '{}': burstCapacity ({}) must be >= replenishRate ({})",
                self.key(),
                self.burst_capacity,
                self.replenish_rate
            )));
        }
        if self.requested_tokens == 0 || self.requested_tokens > self.burst_capacity {
            return Err(GatewayError::Validation(format!(
                "rule '{}': requestedTokens must be in 1..=burstCapacity",
                self.key()
            )));
        }
        if self.replenish_rate > settings.max_replenish_rate {
            return Err(GatewayError::Validation(format!(
                "rule '{}': replenishRate {} exceeds maximum {}",
                self.key(),
                self.replenish_rate,
                settings.max_replenish_rate
            )));
        }
        if self.burst_capacity > settings.max_burst_capacity {
            return Err(GatewayError::Validation(format!(
                "rule '{}': burstCapacity {} exceeds maximum {}",
                self.key(),
                self.burst_capacity,
                settings.max_burst_capacity
            )));
        }
        Ok(())
    }
}

/// Validate a batch of rate-limit rules wholesale: every rule must pass and
/// no two rules may share a routeId or service. A duplicate rejects the
/// whole batch, naming the offending key — no partial apply.
pub fn validate_rate_limit_batch(
    rules: &[RateLimitRule],
    settings: &RateLimitSettings,
) -> Result<(), GatewayError> {
    let mut seen_routes: HashSet<&str> = HashSet::new();
    let mut seen_services: HashSet<&str> = HashSet::new();

    for rule in rules {
        rule.validate(settings)?;
        if let Some(ref route_id) = rule.route_id {
            if !seen_routes.insert(route_id) {
                return Err(GatewayError::Validation(format!(
                    "duplicate routeId '{}' in batch",
                    route_id
                )));
            }
        }
        if let Some(ref service) = rule.service {
            if !seen_services.insert(service) {
                return Err(GatewayError::Validation(format!(
                    "duplicate service '{}' in batch",
                    service
                )));
            }
        }
    }
    Ok(())
}

/// Validate a batch of route definitions: non-empty id/service/uri, known
/// filter names, and no duplicate ids within the batch.
pub fn validate_route_batch(routes: &[RouteDefinition]) -> Result<(), GatewayError> {
    let mut seen: HashSet<&str> = HashSet::new();
    for route in routes {
        if route.id.is_empty() {
            return Err(GatewayError::Validation("route with empty id".to_string()));
        }
        if route.service.is_empty() || route.uri.is_empty() {
            return Err(GatewayError::Validation(format!(
                "route '{}': service and uri must not be empty",
                route.id
            )));
        }
        for spec in &route.filters {
            if !crate::filter::KNOWN_FILTER_NAMES.contains(&spec.name.as_str()) {
                return Err(GatewayError::Validation(format!(
                    "route '{}': unknown filter '{}'",
                    route.id, spec.name
                )));
            }
        }
        if !seen.insert(&route.id) {
            return Err(GatewayError::Validation(format!(
                "duplicate route id '{}' in batch",
                route.id
            )));
        }
    }
    Ok(())
}

/// Where an access policy came from. YAML overrides supersede database
/// entries of the same client id wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicySource {
    #[serde(rename = "DATABASE")]
    Database,
    #[serde(rename = "YAML_OVERRIDE")]
    YamlOverride,
}

impl Default for PolicySource {
    fn default() -> Self {
        PolicySource::Database
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub client_id: String,

    #[serde(default)]
    pub tenant: String,

    #[serde(default = "default_active")]
    pub active: bool,

    /// Ordered allow-list of `service:route` patterns, first-match wins.
    /// `*` matches any single segment.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub rules: Vec<String>,

    /// Unix millis of the last mutation.
    #[serde(default)]
    pub last_updated: u64,

    #[serde(default)]
    pub source: PolicySource,
}

/// Typed change event carried over the pub/sub channel. Receivers treat it
/// as a refresh trigger, never as a delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_id: String,

    /// Unix millis at publish time.
    pub timestamp: u64,

    pub kind: EventKind,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub routes: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub services: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub clients: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "ROUTE_CHANGE")]
    RouteChange,
    #[serde(rename = "RATE_LIMIT_CONFIG_CHANGE")]
    RateLimitChange,
    #[serde(rename = "SERVICE_HEALTH_CHANGE")]
    HealthChange,
    #[serde(rename = "CLIENT_ACCESS_CONTROL_UPDATED")]
    AccessControlChange,
}

impl ChangeEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: unix_millis(),
            kind,
            routes: Vec::new(),
            services: Vec::new(),
            clients: Vec::new(),
        }
    }

    pub fn route_change(routes: Vec<String>) -> Self {
        let mut event = Self::new(EventKind::RouteChange);
        event.routes = routes;
        event
    }

    pub fn rate_limit_change(routes: Vec<String>, services: Vec<String>) -> Self {
        let mut event = Self::new(EventKind::RateLimitChange);
        event.routes = routes;
        event.services = services;
        event
    }

    pub fn health_change(services: Vec<String>) -> Self {
        let mut event = Self::new(EventKind::HealthChange);
        event.services = services;
        event
    }

    pub fn access_control_change(clients: Vec<String>) -> Self {
        let mut event = Self::new(EventKind::AccessControlChange);
        event.clients = clients;
        event
    }

    /// Fold another event of the same kind into this one (debounce
    /// coalescing). Affected ids are unioned, order preserved.
    pub fn absorb(&mut self, other: &ChangeEvent) {
        debug_assert_eq!(self.kind, other.kind);
        union_into(&mut self.routes, &other.routes);
        union_into(&mut self.services, &other.services);
        union_into(&mut self.clients, &other.clients);
        self.timestamp = self.timestamp.max(other.timestamp);
    }
}

fn union_into(target: &mut Vec<String>, additions: &[String]) {
    for item in additions {
        if !target.iter().any(|existing| existing == item) {
            target.push(item.clone());
        }
    }
}

pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(route_id: Option<&str>, service: Option<&str>, rate: u64, burst: u64) -> RateLimitRule {
        RateLimitRule {
            route_id: route_id.map(String::from),
            service: service.map(String::from),
            namespace: None,
            replenish_rate: rate,
            burst_capacity: burst,
            requested_tokens: 1,
            key_resolver: "clientIp".to_string(),
            args: HashMap::new(),
            include_headers: true,
            deny_empty_key: false,
            empty_key_status: 403,
        }
    }

    fn settings() -> RateLimitSettings {
        RateLimitSettings::default()
    }

    #[test]
    fn test_route_definition_deserializes_with_defaults() {
        let json = r#"{
            "id": "orders-v1",
            "service": "orders",
            "uri": "http://orders.internal:8080",
            "predicates": {"path": "/v1/orders/*", "methods": ["GET", "POST"]}
        }"#;
        let route: RouteDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(route.id, "orders-v1");
        assert_eq!(route.predicates.path, "/v1/orders/*");
        assert_eq!(route.predicates.methods, vec!["GET", "POST"]);
        assert!(route.predicates.headers.is_empty());
        assert!(route.filters.is_empty());
        assert!(route.active);
        assert!(!route.api_docs);
    }

    #[test]
    fn test_route_null_lists_default_to_empty() {
        let json = r#"{
            "id": "r1", "service": "s", "uri": "http://b",
            "filters": null, "metadata": null,
            "predicates": {"path": "/", "methods": null, "headers": null}
        }"#;
        let route: RouteDefinition = serde_json::from_str(json).unwrap();
        assert!(route.filters.is_empty());
        assert!(route.metadata.is_empty());
        assert!(route.predicates.methods.is_empty());
    }

    #[test]
    fn test_rule_xor_both_present_rejected() {
        let r = rule(Some("r1"), Some("orders"), 10, 10);
        let err = r.validate(&settings()).unwrap_err();
        assert!(err.to_string().contains("both present"));
    }

    #[test]
    fn test_rule_xor_both_absent_rejected() {
        let r = rule(None, None, 10, 10);
        let err = r.validate(&settings()).unwrap_err();
        assert!(err.to_string().contains("both absent"));
    }

    #[test]
    fn test_rule_burst_below_rate_rejected() {
        let r = rule(Some("r1"), None, 100, 50);
        assert!(r.validate(&settings()).is_err());
    }

    #[test]
    fn test_rule_requested_above_burst_rejected() {
        let mut r = rule(Some("r1"), None, 10, 10);
        r.requested_tokens = 11;
        assert!(r.validate(&settings()).is_err());
    }

    #[test]
    fn test_rule_exceeding_maxima_rejected() {
        let s = settings();
        let r = rule(Some("r1"), None, s.max_replenish_rate + 1, s.max_burst_capacity);
        let err = r.validate(&s).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_rule_valid_passes() {
        let r = rule(Some("r1"), None, 50, 50);
        assert!(r.validate(&settings()).is_ok());
    }

    #[test]
    fn test_batch_duplicate_route_id_rejected_wholesale() {
        let batch = vec![
            rule(Some("r1"), None, 10, 10),
            rule(Some("r2"), None, 10, 10),
            rule(Some("r1"), None, 20, 20),
        ];
        let err = validate_rate_limit_batch(&batch, &settings()).unwrap_err();
        assert!(err.to_string().contains("duplicate routeId 'r1'"));
    }

    #[test]
    fn test_batch_duplicate_service_rejected() {
        let batch = vec![
            rule(None, Some("orders"), 10, 10),
            rule(None, Some("orders"), 20, 20),
        ];
        let err = validate_rate_limit_batch(&batch, &settings()).unwrap_err();
        assert!(err.to_string().contains("duplicate service 'orders'"));
    }

    #[test]
    fn test_batch_mixed_keys_ok() {
        let batch = vec![
            rule(Some("r1"), None, 10, 10),
            rule(None, Some("orders"), 10, 10),
        ];
        assert!(validate_rate_limit_batch(&batch, &settings()).is_ok());
    }

    #[test]
    fn test_route_batch_duplicate_id_rejected() {
        let mk = |id: &str| RouteDefinition {
            id: id.to_string(),
            service: "s".to_string(),
            uri: "http://b".to_string(),
            predicates: RoutePredicates::default(),
            filters: Vec::new(),
            metadata: HashMap::new(),
            active: true,
            api_docs: false,
        };
        let err = validate_route_batch(&[mk("a"), mk("b"), mk("a")]).unwrap_err();
        assert!(err.to_string().contains("duplicate route id 'a'"));
    }

    #[test]
    fn test_route_batch_unknown_filter_rejected() {
        let mut route = RouteDefinition {
            id: "r1".to_string(),
            service: "s".to_string(),
            uri: "http://b".to_string(),
            predicates: RoutePredicates::default(),
            filters: Vec::new(),
            metadata: HashMap::new(),
            active: true,
            api_docs: false,
        };
        route.filters.push(FilterSpec {
            name: "jwt".to_string(),
            args: HashMap::new(),
        });
        let err = validate_route_batch(&[route]).unwrap_err();
        assert!(err.to_string().contains("unknown filter 'jwt'"));
    }

    #[test]
    fn test_namespace_defaults_to_key() {
        let r = rule(Some("r1"), None, 10, 10);
        assert_eq!(r.namespace(), "r1");

        let mut shared = rule(Some("r2"), None, 10, 10);
        shared.namespace = Some("checkout".to_string());
        assert_eq!(shared.namespace(), "checkout");
    }

    #[test]
    fn test_event_kind_wire_names() {
        let event = ChangeEvent::route_change(vec!["r1".to_string()]);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""kind":"ROUTE_CHANGE""#));

        let event = ChangeEvent::access_control_change(vec!["c1".to_string()]);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""kind":"CLIENT_ACCESS_CONTROL_UPDATED""#));
    }

    #[test]
    fn test_event_absorb_unions_ids() {
        let mut first = ChangeEvent::route_change(vec!["r1".to_string(), "r2".to_string()]);
        let second = ChangeEvent::route_change(vec!["r2".to_string(), "r3".to_string()]);
        first.absorb(&second);
        assert_eq!(first.routes, vec!["r1", "r2", "r3"]);
    }

    #[test]
    fn test_event_ids_unique_per_publish() {
        let a = ChangeEvent::new(EventKind::HealthChange);
        let b = ChangeEvent::new(EventKind::HealthChange);
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn test_policy_source_wire_names() {
        let policy = AccessPolicy {
            client_id: "c1".to_string(),
            tenant: "t".to_string(),
            active: true,
            rules: vec!["orders:*".to_string()],
            last_updated: 0,
            source: PolicySource::YamlOverride,
        };
        let json = serde_json::to_string(&policy).unwrap();
        assert!(json.contains(r#""source":"YAML_OVERRIDE""#));
        let back: AccessPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back.source, PolicySource::YamlOverride);
    }
}
