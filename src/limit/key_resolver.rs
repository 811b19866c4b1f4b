use std::collections::HashMap;
use std::net::IpAddr;

/// Inputs a resolver may draw the bucket key from.
pub struct KeyRequest<'a> {
    pub headers: &'a http::HeaderMap,
    pub client_ip: IpAddr,
    pub path: &'a str,
    pub route_id: &'a str,
}

/// A resolver maps a request to the string the bucket is keyed by. `None`
/// means the resolver could not produce a key; the filter decides whether
/// that passes or rejects based on the rule's empty-key policy.
pub type ResolverFn = fn(&KeyRequest<'_>, &HashMap<String, String>) -> Option<String>;

/// The built-in combinator: resolves each strategy named in the `parts`
/// argument and joins the results with `:`. Any part yielding nothing
/// makes the whole key empty.
pub const COMPOSITE_RESOLVER: &str = "composite";

/// Named resolver strategies, registered once at process start. Unknown
/// names are rejected when rule batches are validated; if one slips
/// through anyway, resolution degrades to the default strategy rather
/// than failing the request.
pub struct KeyResolverRegistry {
    resolvers: HashMap<String, ResolverFn>,
    default_name: String,
}

impl KeyResolverRegistry {
    pub fn new(default_name: &str) -> Self {
        let mut registry = Self {
            resolvers: HashMap::new(),
            default_name: default_name.to_string(),
        };
        registry.register("clientIp", resolve_client_ip);
        registry.register("header", resolve_header);
        registry.register("principal", resolve_principal);
        registry.register("path", resolve_path);
        registry.register("route", resolve_route);
        registry
    }

    pub fn register(&mut self, name: &str, resolver: ResolverFn) {
        self.resolvers.insert(name.to_string(), resolver);
    }

    /// Whether a rule may reference this resolver name.
    pub fn contains(&self, name: &str) -> bool {
        name == COMPOSITE_RESOLVER || self.resolvers.contains_key(name)
    }

    pub fn resolve(
        &self,
        name: &str,
        req: &KeyRequest<'_>,
        args: &HashMap<String, String>,
    ) -> Option<String> {
        if name == COMPOSITE_RESOLVER {
            return self.resolve_composite(req, args);
        }
        let resolver = match self.resolvers.get(name) {
            Some(r) => r,
            None => {
                tracing::warn!(
                    "limit: unknown key resolver, name={}, falling back to {}",
                    name,
                    self.default_name
                );
                self.resolvers.get(&self.default_name)?
            }
        };
        resolver(req, args)
    }

    fn resolve_composite(
        &self,
        req: &KeyRequest<'_>,
        args: &HashMap<String, String>,
    ) -> Option<String> {
        let parts = args.get("parts")?;
        let mut key = String::new();
        let mut resolved_any = false;
        for part in parts.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let resolver = match self.resolvers.get(part) {
                Some(r) => r,
                None => {
                    tracing::warn!("limit: unknown composite part, name={}", part);
                    return None;
                }
            };
            let value = resolver(req, args).filter(|v| !v.is_empty())?;
            if resolved_any {
                key.push(':');
            }
            key.push_str(&value);
            resolved_any = true;
        }
        if resolved_any {
            Some(key)
        } else {
            None
        }
    }
}

/// First hop of X-Forwarded-For when present, otherwise the peer address.
fn resolve_client_ip(req: &KeyRequest<'_>, _args: &HashMap<String, String>) -> Option<String> {
    if let Some(value) = req.headers.get("x-forwarded-for") {
        if let Ok(s) = value.to_str() {
            let first = s.split(',').next().unwrap_or(s).trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    Some(req.client_ip.to_string())
}

/// Keyed by a request header named in the rule args (`header-name`).
fn resolve_header(req: &KeyRequest<'_>, args: &HashMap<String, String>) -> Option<String> {
    let name = args.get("header-name")?;
    req.headers
        .get(name.as_str())
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// Authenticated principal from the x-user-id header.
fn resolve_principal(req: &KeyRequest<'_>, _args: &HashMap<String, String>) -> Option<String> {
    req.headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
}

fn resolve_path(req: &KeyRequest<'_>, _args: &HashMap<String, String>) -> Option<String> {
    Some(req.path.to_string())
}

/// All traffic on the route shares one bucket.
fn resolve_route(req: &KeyRequest<'_>, _args: &HashMap<String, String>) -> Option<String> {
    Some(req.route_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(headers: &'a http::HeaderMap) -> KeyRequest<'a> {
        KeyRequest {
            headers,
            client_ip: "10.0.0.1".parse().unwrap(),
            path: "/v1/orders",
            route_id: "orders-v1",
        }
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let registry = KeyResolverRegistry::new("clientIp");
        let mut headers = http::HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.2".parse().unwrap());
        let key = registry.resolve("clientIp", &request(&headers), &HashMap::new());
        assert_eq!(key.as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn test_client_ip_falls_back_to_peer() {
        let registry = KeyResolverRegistry::new("clientIp");
        let headers = http::HeaderMap::new();
        let key = registry.resolve("clientIp", &request(&headers), &HashMap::new());
        assert_eq!(key.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_header_resolver_uses_configured_name() {
        let registry = KeyResolverRegistry::new("clientIp");
        let mut headers = http::HeaderMap::new();
        headers.insert("x-api-key", "abc123".parse().unwrap());
        let mut args = HashMap::new();
        args.insert("header-name".to_string(), "x-api-key".to_string());
        let key = registry.resolve("header", &request(&headers), &args);
        assert_eq!(key.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_header_resolver_missing_header_is_empty() {
        let registry = KeyResolverRegistry::new("clientIp");
        let headers = http::HeaderMap::new();
        let mut args = HashMap::new();
        args.insert("header-name".to_string(), "x-api-key".to_string());
        assert!(registry.resolve("header", &request(&headers), &args).is_none());
    }

    #[test]
    fn test_principal_resolver() {
        let registry = KeyResolverRegistry::new("clientIp");
        let mut headers = http::HeaderMap::new();
        headers.insert("x-user-id", "user-42".parse().unwrap());
        let key = registry.resolve("principal", &request(&headers), &HashMap::new());
        assert_eq!(key.as_deref(), Some("user-42"));
    }

    #[test]
    fn test_route_and_path_resolvers() {
        let registry = KeyResolverRegistry::new("clientIp");
        let headers = http::HeaderMap::new();
        assert_eq!(
            registry
                .resolve("route", &request(&headers), &HashMap::new())
                .as_deref(),
            Some("orders-v1")
        );
        assert_eq!(
            registry
                .resolve("path", &request(&headers), &HashMap::new())
                .as_deref(),
            Some("/v1/orders")
        );
    }

    #[test]
    fn test_unknown_resolver_falls_back_to_default() {
        let registry = KeyResolverRegistry::new("clientIp");
        let headers = http::HeaderMap::new();
        let key = registry.resolve("nonsense", &request(&headers), &HashMap::new());
        assert_eq!(key.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_composite_joins_parts() {
        let registry = KeyResolverRegistry::new("clientIp");
        let mut headers = http::HeaderMap::new();
        headers.insert("x-user-id", "user-42".parse().unwrap());
        let mut args = HashMap::new();
        args.insert("parts".to_string(), "clientIp, principal".to_string());
        let key = registry.resolve("composite", &request(&headers), &args);
        assert_eq!(key.as_deref(), Some("10.0.0.1:user-42"));
    }

    #[test]
    fn test_composite_empty_part_empties_key() {
        let registry = KeyResolverRegistry::new("clientIp");
        let headers = http::HeaderMap::new();
        let mut args = HashMap::new();
        // principal has no x-user-id to draw from.
        args.insert("parts".to_string(), "clientIp,principal".to_string());
        assert!(registry.resolve("composite", &request(&headers), &args).is_none());
    }

    #[test]
    fn test_composite_unknown_part_empties_key() {
        let registry = KeyResolverRegistry::new("clientIp");
        let headers = http::HeaderMap::new();
        let mut args = HashMap::new();
        args.insert("parts".to_string(), "clientIp,nonsense".to_string());
        assert!(registry.resolve("composite", &request(&headers), &args).is_none());
    }

    #[test]
    fn test_contains_covers_builtins_and_composite() {
        let registry = KeyResolverRegistry::new("clientIp");
        assert!(registry.contains("clientIp"));
        assert!(registry.contains("header"));
        assert!(registry.contains("composite"));
        assert!(!registry.contains("nonsense"));
    }

    #[test]
    fn test_custom_registration_overrides() {
        let mut registry = KeyResolverRegistry::new("clientIp");
        registry.register("tenant", |req, _| {
            req.headers
                .get("x-tenant")
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        });
        let mut headers = http::HeaderMap::new();
        headers.insert("x-tenant", "acme".parse().unwrap());
        let key = registry.resolve("tenant", &request(&headers), &HashMap::new());
        assert_eq!(key.as_deref(), Some("acme"));
    }
}
