use serde::{Deserialize, Deserializer, Serialize};

/// Deserialize a `T` that implements `Default` — treats JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
pub fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub events: EventConfig,

    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    #[serde(default)]
    pub headers: HeaderFilterConfig,

    #[serde(default)]
    pub access_control: AccessControlConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,
}

/// Central registry service — the authoritative source for routes,
/// rate-limit rules, and access policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_url")]
    pub base_url: String,

    #[serde(default = "default_registry_timeout")]
    pub timeout_secs: u64,

    /// How often to re-fetch authoritative state even without events (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: default_registry_url(),
            timeout_secs: default_registry_timeout(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

fn default_registry_url() -> String {
    "http://127.0.0.1:8500".to_string()
}

fn default_registry_timeout() -> u64 {
    5
}

fn default_poll_interval() -> u64 {
    30
}

/// Shared Redis — token bucket counter store and change-event pub/sub.
/// When `url` is empty the gateway runs standalone with an in-memory
/// counter store and no event channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub url: String,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_key_prefix() -> String {
    "portico:ratelimit".to_string()
}

/// Change-event channel: debounce and publish-retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    #[serde(default = "default_event_channel")]
    pub channel: String,

    /// Rapid successive changes of the same kind collapse into one publish
    /// per window.
    #[serde(default = "default_debounce_window")]
    pub debounce_window_secs: u64,

    #[serde(default = "default_publish_attempts")]
    pub publish_max_attempts: u32,

    #[serde(default = "default_publish_base_delay")]
    pub publish_base_delay_ms: u64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel: default_event_channel(),
            debounce_window_secs: default_debounce_window(),
            publish_max_attempts: default_publish_attempts(),
            publish_base_delay_ms: default_publish_base_delay(),
        }
    }
}

fn default_event_channel() -> String {
    "portico:events".to_string()
}

fn default_debounce_window() -> u64 {
    5
}

fn default_publish_attempts() -> u32 {
    3
}

fn default_publish_base_delay() -> u64 {
    200
}

/// Process-wide rate limiting: the default bucket applied when neither a
/// route-specific nor a service-level rule matches, plus validation maxima
/// enforced at the registry boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_replenish_rate")]
    pub default_replenish_rate: u64,

    #[serde(default = "default_burst_capacity")]
    pub default_burst_capacity: u64,

    #[serde(default = "default_requested_tokens")]
    pub default_requested_tokens: u64,

    #[serde(default = "default_key_resolver")]
    pub default_key_resolver: String,

    #[serde(default = "default_true")]
    pub include_headers: bool,

    #[serde(default)]
    pub deny_empty_key: bool,

    #[serde(default = "default_empty_key_status")]
    pub empty_key_status: u16,

    #[serde(default = "default_max_replenish_rate")]
    pub max_replenish_rate: u64,

    #[serde(default = "default_max_burst_capacity")]
    pub max_burst_capacity: u64,

    /// A counter-store round trip slower than this degrades to fail-open.
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// Static rules applied after registry-sourced rules on every index
    /// rebuild; on the same routeId or service the static rule wins.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub overrides: Vec<crate::registry::model::RateLimitRule>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            default_replenish_rate: default_replenish_rate(),
            default_burst_capacity: default_burst_capacity(),
            default_requested_tokens: default_requested_tokens(),
            default_key_resolver: default_key_resolver(),
            include_headers: true,
            deny_empty_key: false,
            empty_key_status: default_empty_key_status(),
            max_replenish_rate: default_max_replenish_rate(),
            max_burst_capacity: default_max_burst_capacity(),
            store_timeout_ms: default_store_timeout(),
            overrides: Vec::new(),
        }
    }
}

fn default_replenish_rate() -> u64 {
    100
}

fn default_burst_capacity() -> u64 {
    200
}

fn default_requested_tokens() -> u64 {
    1
}

fn default_key_resolver() -> String {
    "clientIp".to_string()
}

fn default_empty_key_status() -> u16 {
    403
}

fn default_max_replenish_rate() -> u64 {
    10_000
}

fn default_max_burst_capacity() -> u64 {
    50_000
}

fn default_store_timeout() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

/// Global mandatory-header validation. Per-route rules come from route
/// metadata (`required-header.*` keys) and are merged on top of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderFilterConfig {
    /// Headers every request must carry; `pattern` is an optional regex the
    /// value must match.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub required: Vec<RequiredHeader>,

    /// Allow-list of forwardable request headers. Empty means forward all.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub allowed: Vec<String>,

    /// Path globs exempt from header validation (e.g. `/public/*`).
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub skip_paths: Vec<String>,

    /// Synthesized when absent.
    #[serde(default = "default_request_id_header")]
    pub request_id_header: String,
}

impl Default for HeaderFilterConfig {
    fn default() -> Self {
        Self {
            required: Vec::new(),
            allowed: Vec::new(),
            skip_paths: Vec::new(),
            request_id_header: default_request_id_header(),
        }
    }
}

fn default_request_id_header() -> String {
    "x-request-id".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequiredHeader {
    pub name: String,

    #[serde(default)]
    pub pattern: Option<String>,
}

/// Client access-control: which header identifies the caller, where the
/// YAML override file lives, and which paths skip the check entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessControlConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_client_id_header")]
    pub client_id_header: String,

    /// Static YAML override file. Entries here supersede registry entries
    /// of the same client id wholesale.
    #[serde(default)]
    pub overrides_file: Option<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub skip_paths: Vec<String>,

    #[serde(default = "default_access_refresh")]
    pub refresh_interval_secs: u64,
}

impl Default for AccessControlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            client_id_header: default_client_id_header(),
            overrides_file: None,
            skip_paths: Vec::new(),
            refresh_interval_secs: default_access_refresh(),
        }
    }
}

fn default_client_id_header() -> String {
    "x-client-id".to_string()
}

fn default_access_refresh() -> u64 {
    60
}

/// Response cache for idempotent requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Placeholders: `{routeId}`, `{requestPath}`, `{requestMethod}`,
    /// `{header:Name}` (header names matched case-insensitively).
    #[serde(default = "default_cache_template")]
    pub key_template: String,

    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,

    /// Bodies larger than this bypass the cache store.
    #[serde(default = "default_cache_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            key_template: default_cache_template(),
            ttl_secs: default_cache_ttl(),
            max_entries: default_cache_entries(),
            max_body_bytes: default_cache_body_bytes(),
        }
    }
}

fn default_cache_template() -> String {
    "{routeId}:{requestMethod}:{requestPath}".to_string()
}

fn default_cache_ttl() -> u64 {
    30
}

fn default_cache_entries() -> usize {
    10_000
}

fn default_cache_body_bytes() -> usize {
    1_048_576
}

/// Active backend health probing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_health_threshold")]
    pub healthy_threshold: u32,

    #[serde(default = "default_health_threshold")]
    pub unhealthy_threshold: u32,

    /// Prevents probe storms when many routes point at many backends.
    #[serde(default = "default_health_concurrency")]
    pub concurrency: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
            healthy_threshold: default_health_threshold(),
            unhealthy_threshold: default_health_threshold(),
            concurrency: default_health_concurrency(),
        }
    }
}

fn default_health_interval() -> u64 {
    10
}

fn default_health_timeout() -> u64 {
    3
}

fn default_health_threshold() -> u32 {
    3
}

fn default_health_concurrency() -> usize {
    32
}

/// Backend proxying timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: f64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: f64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_connect_timeout() -> f64 {
    3.0
}

fn default_request_timeout() -> f64 {
    30.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_config_defaults() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.registry.base_url, "http://127.0.0.1:8500");
        assert_eq!(cfg.registry.poll_interval_secs, 30);
        assert!(cfg.redis.url.is_empty());
        assert_eq!(cfg.redis.key_prefix, "portico:ratelimit");
        assert_eq!(cfg.events.channel, "portico:events");
        assert_eq!(cfg.events.debounce_window_secs, 5);
        assert_eq!(cfg.events.publish_max_attempts, 3);
        assert_eq!(cfg.rate_limit.default_replenish_rate, 100);
        assert_eq!(cfg.rate_limit.default_burst_capacity, 200);
        assert_eq!(cfg.rate_limit.default_key_resolver, "clientIp");
        assert!(cfg.rate_limit.include_headers);
        assert!(!cfg.rate_limit.deny_empty_key);
        assert_eq!(cfg.rate_limit.empty_key_status, 403);
        assert_eq!(cfg.headers.request_id_header, "x-request-id");
        assert!(!cfg.access_control.enabled);
        assert_eq!(cfg.access_control.client_id_header, "x-client-id");
        assert!(!cfg.cache.enabled);
        assert_eq!(cfg.cache.ttl_secs, 30);
        assert!(cfg.health.enabled);
        assert_eq!(cfg.health.unhealthy_threshold, 3);
        assert_eq!(cfg.proxy.request_timeout_secs, 30.0);
    }

    #[test]
    fn test_rate_limit_settings_from_toml() {
        let toml = r#"
            default_replenish_rate = 50
            default_burst_capacity = 50
            default_key_resolver = "header"
            deny_empty_key = true
            empty_key_status = 401
        "#;
        let rl: RateLimitSettings = toml::from_str(toml).unwrap();
        assert_eq!(rl.default_replenish_rate, 50);
        assert_eq!(rl.default_burst_capacity, 50);
        assert_eq!(rl.default_key_resolver, "header");
        assert!(rl.deny_empty_key);
        assert_eq!(rl.empty_key_status, 401);
        assert_eq!(rl.default_requested_tokens, 1);
        assert!(rl.overrides.is_empty());
    }

    #[test]
    fn test_rate_limit_static_overrides_from_toml() {
        let toml = r#"
            [[overrides]]
            route_id = "checkout-v1"
            replenish_rate = 5
            burst_capacity = 10
            namespace = "checkout"
        "#;
        let rl: RateLimitSettings = toml::from_str(toml).unwrap();
        assert_eq!(rl.overrides.len(), 1);
        assert_eq!(rl.overrides[0].route_id.as_deref(), Some("checkout-v1"));
        assert_eq!(rl.overrides[0].replenish_rate, 5);
        assert_eq!(rl.overrides[0].namespace.as_deref(), Some("checkout"));
    }

    #[test]
    fn test_header_filter_config_default_matches_serde_default() {
        // A config file with no [headers] section and a missing config
        // file must agree on the request id header.
        let from_empty: HeaderFilterConfig = toml::from_str("").unwrap();
        let from_default = HeaderFilterConfig::default();
        assert_eq!(from_default.request_id_header, "x-request-id");
        assert_eq!(from_empty.request_id_header, from_default.request_id_header);
        assert!(from_default.required.is_empty());
        assert!(from_default.allowed.is_empty());
        assert!(from_default.skip_paths.is_empty());
    }

    #[test]
    fn test_header_filter_null_lists_default_to_empty() {
        let json = r#"{"required": null, "allowed": null, "skip_paths": null}"#;
        let hf: HeaderFilterConfig = serde_json::from_str(json).unwrap();
        assert!(hf.required.is_empty());
        assert!(hf.allowed.is_empty());
        assert!(hf.skip_paths.is_empty());
    }

    #[test]
    fn test_required_header_with_pattern() {
        let json = r#"{"name": "x-tenant", "pattern": "^[a-z]+$"}"#;
        let rh: RequiredHeader = serde_json::from_str(json).unwrap();
        assert_eq!(rh.name, "x-tenant");
        assert_eq!(rh.pattern.as_deref(), Some("^[a-z]+$"));
    }

    #[test]
    fn test_cache_config_custom() {
        let json = r#"{
            "enabled": true,
            "key_template": "{routeId}:{header:X-Tenant}:{requestPath}",
            "ttl_secs": 120,
            "max_entries": 500
        }"#;
        let cc: CacheConfig = serde_json::from_str(json).unwrap();
        assert!(cc.enabled);
        assert_eq!(cc.key_template, "{routeId}:{header:X-Tenant}:{requestPath}");
        assert_eq!(cc.ttl_secs, 120);
        assert_eq!(cc.max_entries, 500);
        assert_eq!(cc.max_body_bytes, 1_048_576);
    }

    #[test]
    fn test_access_control_config() {
        let json = r#"{
            "enabled": true,
            "client_id_header": "x-api-client",
            "overrides_file": "/etc/portico/clients.yaml",
            "skip_paths": ["/docs/*"]
        }"#;
        let ac: AccessControlConfig = serde_json::from_str(json).unwrap();
        assert!(ac.enabled);
        assert_eq!(ac.client_id_header, "x-api-client");
        assert_eq!(ac.overrides_file.as_deref(), Some("/etc/portico/clients.yaml"));
        assert_eq!(ac.skip_paths, vec!["/docs/*"]);
        assert_eq!(ac.refresh_interval_secs, 60);
    }

    #[test]
    fn test_event_config_roundtrip() {
        let ec = EventConfig {
            channel: "ch".to_string(),
            debounce_window_secs: 2,
            publish_max_attempts: 5,
            publish_base_delay_ms: 50,
        };
        let serialized = serde_json::to_string(&ec).unwrap();
        let back: EventConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(back.channel, "ch");
        assert_eq!(back.debounce_window_secs, 2);
        assert_eq!(back.publish_max_attempts, 5);
        assert_eq!(back.publish_base_delay_ms, 50);
    }
}
