use crate::error::GatewayError;
use crate::registry::model::{AccessPolicy, PolicySource};
use arc_swap::ArcSwap;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Why a request was denied. Returned to the caller verbatim so operators
/// can tell a missing client from a bad rule set.
pub const DENY_NO_CONFIG: &str = "NO_CONFIG";
pub const DENY_CLIENT_INACTIVE: &str = "CLIENT_INACTIVE";
pub const DENY_NO_RULES: &str = "NO_RULES";
pub const DENY_BY_RULE: &str = "DENIED_BY_RULE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    Denied(&'static str),
}

/// `service:route` allow-list pattern. `*` matches one whole segment, so
/// `orders:*` allows every route of the orders service and `*:*` allows
/// everything.
fn rule_matches(rule: &str, service: &str, route_id: &str) -> bool {
    let (rule_service, rule_route) = match rule.split_once(':') {
        Some(parts) => parts,
        // A bare pattern constrains the service only.
        None => (rule, "*"),
    };
    segment_matches(rule_service, service) && segment_matches(rule_route, route_id)
}

fn segment_matches(pattern: &str, value: &str) -> bool {
    pattern == "*" || pattern == value
}

/// Read-path access-control cache, rebuilt wholesale on refresh and
/// swapped atomically. Lookups never see a half-built map.
pub struct AccessControlCache {
    policies: ArcSwap<HashMap<String, Arc<AccessPolicy>>>,
}

impl Default for AccessControlCache {
    fn default() -> Self {
        Self {
            policies: ArcSwap::from_pointee(HashMap::new()),
        }
    }
}

impl AccessControlCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rebuild(&self, policies: Vec<AccessPolicy>) {
        let map: HashMap<String, Arc<AccessPolicy>> = policies
            .into_iter()
            .map(|p| (p.client_id.clone(), Arc::new(p)))
            .collect();
        tracing::info!("access: rebuilt policy cache, clients={}", map.len());
        self.policies.store(Arc::new(map));
    }

    pub fn check(&self, client_id: &str, service: &str, route_id: &str) -> AccessDecision {
        let snapshot = self.policies.load();
        let policy = match snapshot.get(client_id) {
            Some(p) => p,
            None => return AccessDecision::Denied(DENY_NO_CONFIG),
        };
        if !policy.active {
            return AccessDecision::Denied(DENY_CLIENT_INACTIVE);
        }
        if policy.rules.is_empty() {
            return AccessDecision::Denied(DENY_NO_RULES);
        }
        for rule in &policy.rules {
            if rule_matches(rule, service, route_id) {
                return AccessDecision::Allowed;
            }
        }
        AccessDecision::Denied(DENY_BY_RULE)
    }

    pub fn client_count(&self) -> usize {
        self.policies.load().len()
    }
}

/// Merge database policies with YAML overrides. An override replaces the
/// database policy of the same client wholesale, never field by field;
/// override-only clients are appended. Database entries without an
/// override pass through untouched.
pub fn merge_policies(
    db_policies: Vec<AccessPolicy>,
    yaml_overrides: Vec<AccessPolicy>,
) -> Vec<AccessPolicy> {
    let mut overrides: HashMap<String, AccessPolicy> = yaml_overrides
        .into_iter()
        .map(|mut p| {
            p.source = PolicySource::YamlOverride;
            (p.client_id.clone(), p)
        })
        .collect();

    let mut merged: Vec<AccessPolicy> = Vec::with_capacity(db_policies.len() + overrides.len());
    for db_policy in db_policies {
        match overrides.remove(&db_policy.client_id) {
            Some(override_policy) => {
                tracing::debug!(
                    "access: yaml override replaces db policy, client={}",
                    db_policy.client_id
                );
                metrics::counter!("portico_access_override_hits_total").increment(1);
                merged.push(override_policy);
            }
            None => merged.push(db_policy),
        }
    }
    // Clients that only exist in the override file.
    merged.extend(overrides.into_values());
    merged
}

#[derive(Debug, Deserialize)]
struct OverridesFile {
    #[serde(default)]
    clients: Vec<AccessPolicy>,
}

/// Load the YAML override file. A missing file is an empty override set,
/// not an error; an unparseable file is an error, because silently
/// ignoring it could widen access.
pub fn load_yaml_overrides(path: &Path) -> Result<Vec<AccessPolicy>, GatewayError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| GatewayError::Config(format!("read {}: {}", path.display(), e)))?;
    let file: OverridesFile = serde_yaml::from_str(&content)
        .map_err(|e| GatewayError::Config(format!("parse {}: {}", path.display(), e)))?;
    Ok(file.clients)
}
