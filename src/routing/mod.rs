use crate::registry::model::{
    RouteDefinition, RATE_LIMIT_ARG_PREFIX, REQUIRED_HEADER_PREFIX,
};
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Path predicate compiled from a route definition. `/v1/orders/*` becomes
/// a prefix pattern with stem `/v1/orders`; anything else is an exact match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    Exact(String),
    Prefix(String),
}

impl PathPattern {
    pub fn compile(path: &str) -> Self {
        match path.strip_suffix("/*") {
            Some(stem) => PathPattern::Prefix(stem.to_string()),
            None => PathPattern::Exact(path.to_string()),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(p) => p == path,
            PathPattern::Prefix(stem) => {
                if stem.is_empty() {
                    return true;
                }
                path == stem || (path.starts_with(stem) && path[stem.len()..].starts_with('/'))
            }
        }
    }

    /// Specificity rank for tie-breaking: exact always wins, then longer
    /// prefix stems.
    fn specificity(&self) -> (u8, usize) {
        match self {
            PathPattern::Exact(p) => (1, p.len()),
            PathPattern::Prefix(stem) => (0, stem.len()),
        }
    }
}

/// Header predicate compiled at table-build time. An empty pattern means
/// presence-only.
#[derive(Debug, Clone)]
pub struct CompiledHeaderPredicate {
    pub name: String,
    pub pattern: Option<Regex>,
}

impl CompiledHeaderPredicate {
    pub fn matches(&self, value: Option<&str>) -> bool {
        match (value, &self.pattern) {
            (Some(v), Some(re)) => re.is_match(v),
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// A route-level filter spec compiled to what the chain consumes: turn a
/// named filter on or off for this route, optionally at an explicit
/// position. `enabled` defaults to true — listing a filter is enabling it.
#[derive(Debug, Clone)]
pub struct FilterOverride {
    pub name: String,
    pub enabled: bool,
    pub order: Option<i32>,
}

/// An immutable, fully-compiled route. Built once per refresh and shared
/// behind `Arc` across in-flight requests.
#[derive(Debug, Clone)]
pub struct CompiledRoute {
    pub id: String,
    pub service: String,
    pub uri: String,
    pub path: PathPattern,
    /// Uppercased; empty means all methods.
    pub methods: Vec<String>,
    pub header_predicates: Vec<CompiledHeaderPredicate>,
    pub metadata: HashMap<String, String>,
    /// Metadata `rate-limit.*` entries with the prefix stripped, handed to
    /// the key resolver as arguments.
    pub rate_limit_args: HashMap<String, String>,
    /// Metadata `required-header.*` entries: header name to optional value
    /// regex, enforced by the header filter.
    pub required_headers: Vec<CompiledHeaderPredicate>,
    /// Per-route filter specs overlaid on the global chain.
    pub filter_overrides: Vec<FilterOverride>,
    pub api_docs: bool,
}

impl CompiledRoute {
    fn compile(def: &RouteDefinition) -> Option<Self> {
        let mut header_predicates = Vec::with_capacity(def.predicates.headers.len());
        for hp in &def.predicates.headers {
            let pattern = if hp.pattern.is_empty() {
                None
            } else {
                match Regex::new(&hp.pattern) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        tracing::warn!(
                            "routing: skipping route with bad header predicate, route={}, header={}, err={}",
                            def.id,
                            hp.name,
                            e
                        );
                        return None;
                    }
                }
            };
            header_predicates.push(CompiledHeaderPredicate {
                name: hp.name.to_ascii_lowercase(),
                pattern,
            });
        }

        let mut rate_limit_args = HashMap::new();
        let mut required_headers = Vec::new();
        for (key, value) in &def.metadata {
            if let Some(arg) = key.strip_prefix(RATE_LIMIT_ARG_PREFIX) {
                rate_limit_args.insert(arg.to_string(), value.clone());
            } else if let Some(name) = key.strip_prefix(REQUIRED_HEADER_PREFIX) {
                let pattern = if value.is_empty() {
                    None
                } else {
                    match Regex::new(value) {
                        Ok(re) => Some(re),
                        Err(e) => {
                            tracing::warn!(
                                "routing: ignoring bad required-header pattern, route={}, header={}, err={}",
                                def.id,
                                name,
                                e
                            );
                            None
                        }
                    }
                };
                required_headers.push(CompiledHeaderPredicate {
                    name: name.to_ascii_lowercase(),
                    pattern,
                });
            }
        }

        let mut filter_overrides = Vec::with_capacity(def.filters.len());
        for spec in &def.filters {
            let enabled = spec.args.get("enabled").map(|v| v != "false").unwrap_or(true);
            let order = match spec.args.get("order") {
                Some(v) => match v.parse::<i32>() {
                    Ok(n) => Some(n),
                    Err(_) => {
                        tracing::warn!(
                            "routing: ignoring bad filter order, route={}, filter={}, order={}",
                            def.id,
                            spec.name,
                            v
                        );
                        None
                    }
                },
                None => None,
            };
            filter_overrides.push(FilterOverride {
                name: spec.name.clone(),
                enabled,
                order,
            });
        }

        Some(Self {
            id: def.id.clone(),
            service: def.service.clone(),
            uri: def.uri.trim_end_matches('/').to_string(),
            path: PathPattern::compile(&def.predicates.path),
            methods: def
                .predicates
                .methods
                .iter()
                .map(|m| m.to_uppercase())
                .collect(),
            header_predicates,
            metadata: def.metadata.clone(),
            rate_limit_args,
            required_headers,
            filter_overrides,
            api_docs: def.api_docs,
        })
    }
}

/// Deterministic route precedence: exact path beats any prefix, a longer
/// prefix stem beats a shorter one, and on identical specificity the
/// lexicographically greatest route id wins. `Less` means `a` takes
/// precedence, so sorting with this comparator yields best-first order.
pub fn route_precedence(a: &CompiledRoute, b: &CompiledRoute) -> Ordering {
    let sa = a.path.specificity();
    let sb = b.path.specificity();
    sb.cmp(&sa).then_with(|| b.id.cmp(&a.id))
}

/// The route table — a compiled, precedence-ordered snapshot.
///
/// Matching scans compiled routes in precedence order; the first route
/// whose path, method filter, and header predicates all pass wins. A route
/// whose path matches but whose method or header predicates fail is simply
/// skipped, so a less specific path can still serve the request.
pub struct RouteTable {
    routes: Vec<Arc<CompiledRoute>>,
}

impl RouteTable {
    /// Compile from registry definitions. Inactive routes are excluded;
    /// routes with uncompilable header predicates are dropped with a warn.
    pub fn build(definitions: &[RouteDefinition]) -> Self {
        let mut routes: Vec<Arc<CompiledRoute>> = definitions
            .iter()
            .filter(|d| d.active)
            .filter_map(CompiledRoute::compile)
            .map(Arc::new)
            .collect();

        routes.sort_by(|a, b| route_precedence(a, b));

        tracing::info!("routing: compiled route table, count={}", routes.len());
        Self { routes }
    }

    pub fn empty() -> Self {
        Self { routes: Vec::new() }
    }

    pub fn match_route(
        &self,
        path: &str,
        method: &str,
        headers: &http::HeaderMap,
    ) -> Option<Arc<CompiledRoute>> {
        let method_upper = method.to_uppercase();

        for route in &self.routes {
            if !route.path.matches(path) {
                continue;
            }
            if !route.methods.is_empty() && !route.methods.iter().any(|m| m == &method_upper) {
                continue;
            }
            if !route.header_predicates.is_empty() {
                let all_match = route.header_predicates.iter().all(|hp| {
                    let value = headers.get(&hp.name).and_then(|v| v.to_str().ok());
                    hp.matches(value)
                });
                if !all_match {
                    continue;
                }
            }
            return Some(route.clone());
        }
        None
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn all_routes(&self) -> &[Arc<CompiledRoute>] {
        &self.routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::model::{HeaderPredicate, RoutePredicates};

    fn make_route(id: &str, path: &str) -> RouteDefinition {
        RouteDefinition {
            id: id.to_string(),
            service: "svc".to_string(),
            uri: "http://backend:8080".to_string(),
            predicates: RoutePredicates {
                path: path.to_string(),
                methods: vec![],
                headers: vec![],
            },
            filters: vec![],
            metadata: HashMap::new(),
            active: true,
            api_docs: false,
        }
    }

    fn empty_headers() -> http::HeaderMap {
        http::HeaderMap::new()
    }

    #[test]
    fn test_exact_over_prefix() {
        let table = RouteTable::build(&[
            make_route("wc", "/v1/users/*"),
            make_route("exact", "/v1/users/list"),
        ]);
        let matched = table
            .match_route("/v1/users/list", "GET", &empty_headers())
            .unwrap();
        assert_eq!(matched.id, "exact");
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = RouteTable::build(&[
            make_route("shallow", "/api/*"),
            make_route("deep", "/api/v1/*"),
        ]);
        let matched = table
            .match_route("/api/v1/users", "GET", &empty_headers())
            .unwrap();
        assert_eq!(matched.id, "deep");

        let matched = table
            .match_route("/api/v2/other", "GET", &empty_headers())
            .unwrap();
        assert_eq!(matched.id, "shallow");
    }

    #[test]
    fn test_tie_break_by_greatest_id() {
        let table = RouteTable::build(&[
            make_route("orders-v1", "/api/*"),
            make_route("orders-v2", "/api/*"),
        ]);
        let matched = table.match_route("/api/foo", "GET", &empty_headers()).unwrap();
        assert_eq!(matched.id, "orders-v2");
    }

    #[test]
    fn test_tie_break_is_order_independent() {
        let forward = RouteTable::build(&[make_route("a", "/api/*"), make_route("b", "/api/*")]);
        let reverse = RouteTable::build(&[make_route("b", "/api/*"), make_route("a", "/api/*")]);
        let m1 = forward.match_route("/api/x", "GET", &empty_headers()).unwrap();
        let m2 = reverse.match_route("/api/x", "GET", &empty_headers()).unwrap();
        assert_eq!(m1.id, m2.id);
        assert_eq!(m1.id, "b");
    }

    #[test]
    fn test_prefix_matches_stem_itself() {
        let table = RouteTable::build(&[make_route("r", "/v1/orders/*")]);
        assert!(table.match_route("/v1/orders", "GET", &empty_headers()).is_some());
        assert!(table
            .match_route("/v1/orders/42", "GET", &empty_headers())
            .is_some());
        assert!(table
            .match_route("/v1/ordersX", "GET", &empty_headers())
            .is_none());
    }

    #[test]
    fn test_catchall_prefix() {
        let table = RouteTable::build(&[make_route("catchall", "/*")]);
        assert!(table.match_route("/anything", "GET", &empty_headers()).is_some());
    }

    #[test]
    fn test_method_filtering_falls_through() {
        let mut post_only = make_route("post_only", "/api/submit");
        post_only.predicates.methods = vec!["POST".to_string()];
        let table = RouteTable::build(&[post_only, make_route("catchall", "/*")]);

        let matched = table
            .match_route("/api/submit", "POST", &empty_headers())
            .unwrap();
        assert_eq!(matched.id, "post_only");

        let matched = table
            .match_route("/api/submit", "GET", &empty_headers())
            .unwrap();
        assert_eq!(matched.id, "catchall");
    }

    #[test]
    fn test_header_predicate_and_semantics() {
        let mut gated = make_route("gated", "/api/*");
        gated.predicates.headers = vec![
            HeaderPredicate {
                name: "x-api-version".to_string(),
                pattern: "^v2$".to_string(),
            },
            HeaderPredicate {
                name: "x-canary".to_string(),
                pattern: String::new(),
            },
        ];
        let table = RouteTable::build(&[gated, make_route("fallback", "/api/*")]);

        let mut headers = http::HeaderMap::new();
        headers.insert("x-api-version", "v2".parse().unwrap());
        headers.insert("x-canary", "on".parse().unwrap());
        let matched = table.match_route("/api/foo", "GET", &headers).unwrap();
        assert_eq!(matched.id, "gated");

        // One predicate failing means the whole set fails.
        let mut headers = http::HeaderMap::new();
        headers.insert("x-api-version", "v2".parse().unwrap());
        let matched = table.match_route("/api/foo", "GET", &headers).unwrap();
        assert_eq!(matched.id, "fallback");
    }

    #[test]
    fn test_header_predicate_never_outranks_path() {
        let mut gated = make_route("gated", "/api/*");
        gated.predicates.headers = vec![HeaderPredicate {
            name: "x-beta".to_string(),
            pattern: String::new(),
        }];
        let table = RouteTable::build(&[gated, make_route("exact", "/api/foo")]);

        let mut headers = http::HeaderMap::new();
        headers.insert("x-beta", "1".parse().unwrap());
        let matched = table.match_route("/api/foo", "GET", &headers).unwrap();
        assert_eq!(matched.id, "exact");
    }

    #[test]
    fn test_inactive_route_excluded() {
        let mut inactive = make_route("inactive", "/api/submit");
        inactive.active = false;
        let table = RouteTable::build(&[inactive, make_route("catchall", "/*")]);

        let matched = table
            .match_route("/api/submit", "GET", &empty_headers())
            .unwrap();
        assert_eq!(matched.id, "catchall");
    }

    #[test]
    fn test_no_match() {
        let table = RouteTable::build(&[make_route("r", "/v1/orders/*")]);
        assert!(table.match_route("/v2/other", "GET", &empty_headers()).is_none());
    }

    #[test]
    fn test_metadata_prefixes_extracted() {
        let mut route = make_route("r", "/api/*");
        route
            .metadata
            .insert("rate-limit.header-name".to_string(), "x-user-id".to_string());
        route
            .metadata
            .insert("required-header.x-tenant".to_string(), "^corp-".to_string());
        route
            .metadata
            .insert("owner".to_string(), "payments-team".to_string());

        let table = RouteTable::build(&[route]);
        let compiled = table.match_route("/api/x", "GET", &empty_headers()).unwrap();
        assert_eq!(
            compiled.rate_limit_args.get("header-name").map(String::as_str),
            Some("x-user-id")
        );
        assert_eq!(compiled.required_headers.len(), 1);
        assert_eq!(compiled.required_headers[0].name, "x-tenant");
        assert!(compiled.required_headers[0].matches(Some("corp-acme")));
        assert!(!compiled.required_headers[0].matches(Some("indie")));
    }

    #[test]
    fn test_filter_specs_compiled_to_overrides() {
        use crate::registry::model::FilterSpec;

        let mut route = make_route("r", "/api/*");
        route.filters = vec![
            FilterSpec {
                name: "cache".to_string(),
                args: [("order".to_string(), "15".to_string())].into_iter().collect(),
            },
            FilterSpec {
                name: "rate_limit".to_string(),
                args: [("enabled".to_string(), "false".to_string())]
                    .into_iter()
                    .collect(),
            },
            FilterSpec {
                name: "headers".to_string(),
                args: [("order".to_string(), "not-a-number".to_string())]
                    .into_iter()
                    .collect(),
            },
        ];

        let table = RouteTable::build(&[route]);
        let compiled = table.match_route("/api/x", "GET", &empty_headers()).unwrap();
        assert_eq!(compiled.filter_overrides.len(), 3);
        assert_eq!(compiled.filter_overrides[0].name, "cache");
        assert!(compiled.filter_overrides[0].enabled);
        assert_eq!(compiled.filter_overrides[0].order, Some(15));
        assert!(!compiled.filter_overrides[1].enabled);
        // An unparseable order is dropped; the filter is still enabled.
        assert_eq!(compiled.filter_overrides[2].order, None);
        assert!(compiled.filter_overrides[2].enabled);
    }

    #[test]
    fn test_route_with_bad_predicate_regex_dropped() {
        let mut bad = make_route("bad", "/api/*");
        bad.predicates.headers = vec![HeaderPredicate {
            name: "x-v".to_string(),
            pattern: "([unclosed".to_string(),
        }];
        let table = RouteTable::build(&[bad]);
        assert_eq!(table.route_count(), 0);
    }
}
