use crate::config::RateLimitSettings;
use crate::registry::model::RateLimitRule;
use std::collections::HashMap;
use std::sync::Arc;

/// Rule lookup index, rebuilt wholesale on every refresh. Lookup order is
/// route rule, then service rule, then the configured default. Static
/// overrides from gateway settings land after the registry batch, so on
/// the same key the static rule wins. Duplicate keys within one batch
/// should have been rejected at the registry boundary; if one slips
/// through, the later rule wins and a warn is logged.
pub struct RateLimitIndex {
    route_rules: HashMap<String, Arc<RateLimitRule>>,
    service_rules: HashMap<String, Arc<RateLimitRule>>,
    default_rule: Arc<RateLimitRule>,
}

impl RateLimitIndex {
    pub fn build(rules: &[RateLimitRule], settings: &RateLimitSettings) -> Self {
        let mut route_rules = HashMap::new();
        let mut service_rules = HashMap::new();

        for rule in rules {
            let rule = Arc::new(rule.clone());
            if let Some(ref route_id) = rule.route_id {
                if route_rules.insert(route_id.clone(), rule.clone()).is_some() {
                    tracing::warn!("limit: duplicate route rule overwritten, route={}", route_id);
                }
            } else if let Some(ref service) = rule.service {
                if service_rules.insert(service.clone(), rule.clone()).is_some() {
                    tracing::warn!("limit: duplicate service rule overwritten, service={}", service);
                }
            }
        }

        for rule in &settings.overrides {
            let rule = Arc::new(rule.clone());
            if let Some(ref route_id) = rule.route_id {
                if route_rules.insert(route_id.clone(), rule.clone()).is_some() {
                    tracing::debug!("limit: static override replaces route rule, route={}", route_id);
                }
            } else if let Some(ref service) = rule.service {
                if service_rules.insert(service.clone(), rule.clone()).is_some() {
                    tracing::debug!("limit: static override replaces service rule, service={}", service);
                }
            }
        }

        tracing::info!(
            "limit: rebuilt rule index, route_rules={}, service_rules={}",
            route_rules.len(),
            service_rules.len()
        );

        Self {
            route_rules,
            service_rules,
            default_rule: Arc::new(default_rule(settings)),
        }
    }

    /// The pre-first-refresh index: no registry rules yet, static
    /// overrides and the default already in force.
    pub fn empty(settings: &RateLimitSettings) -> Self {
        Self::build(&[], settings)
    }

    pub fn lookup(&self, route_id: &str, service: &str) -> Arc<RateLimitRule> {
        if let Some(rule) = self.route_rules.get(route_id) {
            return rule.clone();
        }
        if let Some(rule) = self.service_rules.get(service) {
            return rule.clone();
        }
        self.default_rule.clone()
    }

    pub fn rule_count(&self) -> usize {
        self.route_rules.len() + self.service_rules.len()
    }
}

/// The catch-all rule from gateway settings. Its namespace is resolved per
/// route at check time so unrelated routes do not share the default bucket.
fn default_rule(settings: &RateLimitSettings) -> RateLimitRule {
    RateLimitRule {
        route_id: None,
        service: None,
        namespace: None,
        replenish_rate: settings.default_replenish_rate,
        burst_capacity: settings.default_burst_capacity,
        requested_tokens: settings.default_requested_tokens,
        key_resolver: settings.default_key_resolver.clone(),
        args: HashMap::new(),
        include_headers: settings.include_headers,
        deny_empty_key: settings.deny_empty_key,
        empty_key_status: settings.empty_key_status,
    }
}
