pub mod key_resolver;
pub mod resolver;
pub mod store;

pub use key_resolver::{KeyRequest, KeyResolverRegistry};
pub use resolver::RateLimitIndex;
pub use store::{BucketParams, CounterOutcome, CounterStore, MemoryCounterStore, RedisCounterStore};

use crate::config::RateLimitSettings;
use crate::registry::model::RateLimitRule;
use crate::routing::CompiledRoute;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// What the rate-limit filter acts on. `tokens_left` is -1 whenever no
/// consume happened (fail-open, or an allowed empty key).
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub tokens_left: i64,
    pub replenish_rate: u64,
    pub burst_capacity: u64,
    pub requested_tokens: u64,
    pub include_headers: bool,
    /// Set when the key resolver produced nothing and the rule denies
    /// empty keys; the filter responds with `empty_key_status`.
    pub denied_empty_key: bool,
    pub empty_key_status: u16,
}

impl RateLimitDecision {
    fn pass_through(rule: &RateLimitRule) -> Self {
        Self {
            allowed: true,
            tokens_left: -1,
            replenish_rate: rule.replenish_rate,
            burst_capacity: rule.burst_capacity,
            requested_tokens: rule.requested_tokens,
            include_headers: rule.include_headers,
            denied_empty_key: false,
            empty_key_status: rule.empty_key_status,
        }
    }
}

/// Gateway-side rate limiting: resolve the bucket key, then run one atomic
/// check against the shared counter store. The store is authoritative and
/// shared by every gateway instance; this type never caches counters.
///
/// Infrastructure failure is deliberately fail-open. A broken store must
/// degrade to unlimited traffic, not an outage.
pub struct RateLimiter {
    store: Arc<CounterStore>,
    resolvers: KeyResolverRegistry,
    key_prefix: String,
    store_timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<CounterStore>, key_prefix: &str, settings: &RateLimitSettings) -> Self {
        Self {
            store,
            resolvers: KeyResolverRegistry::new(&settings.default_key_resolver),
            key_prefix: key_prefix.to_string(),
            store_timeout: Duration::from_millis(settings.store_timeout_ms),
        }
    }

    pub fn resolvers(&self) -> &KeyResolverRegistry {
        &self.resolvers
    }

    pub fn resolvers_mut(&mut self) -> &mut KeyResolverRegistry {
        &mut self.resolvers
    }

    pub async fn is_allowed(
        &self,
        rule: &RateLimitRule,
        route: &CompiledRoute,
        req: &KeyRequest<'_>,
    ) -> RateLimitDecision {
        let args = merged_args(rule, route);
        let resolved = self.resolvers.resolve(&rule.key_resolver, req, &args);

        let resolved_key = match resolved {
            Some(key) if !key.is_empty() => key,
            _ => {
                if rule.deny_empty_key {
                    return RateLimitDecision {
                        allowed: false,
                        tokens_left: -1,
                        replenish_rate: rule.replenish_rate,
                        burst_capacity: rule.burst_capacity,
                        requested_tokens: rule.requested_tokens,
                        include_headers: rule.include_headers,
                        denied_empty_key: true,
                        empty_key_status: rule.empty_key_status,
                    };
                }
                tracing::debug!("limit: empty key, passing through, route={}", route.id);
                return RateLimitDecision::pass_through(rule);
            }
        };

        // Namespaced bucket key: rules sharing a namespace share quota.
        let namespace = match rule.namespace() {
            "" => route.id.as_str(),
            ns => ns,
        };
        let bucket_key = format!("{}:{}:{}", self.key_prefix, namespace, resolved_key);

        let params = BucketParams {
            replenish_rate: rule.replenish_rate,
            burst_capacity: rule.burst_capacity,
            requested_tokens: rule.requested_tokens,
        };

        let checked =
            tokio::time::timeout(self.store_timeout, self.store.check_and_consume(&bucket_key, params))
                .await;

        match checked {
            Ok(Ok(outcome)) => RateLimitDecision {
                allowed: outcome.allowed,
                tokens_left: outcome.tokens_left,
                replenish_rate: rule.replenish_rate,
                burst_capacity: rule.burst_capacity,
                requested_tokens: rule.requested_tokens,
                include_headers: rule.include_headers,
                denied_empty_key: false,
                empty_key_status: rule.empty_key_status,
            },
            Ok(Err(e)) => {
                tracing::warn!(
                    "limit: counter store error, failing open, route={}, err={}",
                    route.id,
                    e
                );
                metrics::counter!("portico_rate_limit_store_errors_total", "reason" => "store")
                    .increment(1);
                RateLimitDecision::pass_through(rule)
            }
            Err(_) => {
                tracing::warn!(
                    "limit: counter store timeout, failing open, route={}, timeout_ms={}",
                    route.id,
                    self.store_timeout.as_millis()
                );
                metrics::counter!("portico_rate_limit_store_errors_total", "reason" => "timeout")
                    .increment(1);
                RateLimitDecision::pass_through(rule)
            }
        }
    }
}

/// Route metadata args overlaid with rule args; the rule wins on conflict.
fn merged_args(rule: &RateLimitRule, route: &CompiledRoute) -> HashMap<String, String> {
    if rule.args.is_empty() {
        return route.rate_limit_args.clone();
    }
    let mut args = route.rate_limit_args.clone();
    for (k, v) in &rule.args {
        args.insert(k.clone(), v.clone());
    }
    args
}
