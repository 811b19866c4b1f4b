pub mod types;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides for infrastructure settings. When the file does not
    /// exist, built-in defaults are used — allowing the gateway to start with
    /// zero configuration for local development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            GatewayConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides for connection/infra settings.
    /// Business config (routes, rate limits, access policies) is managed by
    /// the registry — not environment variables.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PORTICO_REGISTRY_URL") {
            self.registry.base_url = v;
        }
        if let Ok(v) = std::env::var("PORTICO_REGISTRY_POLL_INTERVAL") {
            if let Ok(n) = v.parse::<u64>() {
                self.registry.poll_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("PORTICO_REDIS_URL") {
            self.redis.url = v;
        }
        if let Ok(v) = std::env::var("PORTICO_REDIS_KEY_PREFIX") {
            self.redis.key_prefix = v;
        }
        if let Ok(v) = std::env::var("PORTICO_EVENT_CHANNEL") {
            self.events.channel = v;
        }
        if let Ok(v) = std::env::var("PORTICO_ACCESS_OVERRIDES_FILE") {
            self.access_control.overrides_file = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.registry.base_url.is_empty() {
            anyhow::bail!("registry.base_url must not be empty");
        }
        if self.rate_limit.default_replenish_rate == 0 {
            anyhow::bail!("rate_limit.default_replenish_rate must be >= 1");
        }
        if self.rate_limit.default_burst_capacity < self.rate_limit.default_replenish_rate {
            anyhow::bail!(
                "rate_limit.default_burst_capacity ({}) must be >= default_replenish_rate ({})",
                self.rate_limit.default_burst_capacity,
                self.rate_limit.default_replenish_rate
            );
        }
        if self.rate_limit.default_requested_tokens == 0
            || self.rate_limit.default_requested_tokens > self.rate_limit.default_burst_capacity
        {
            anyhow::bail!(
                "rate_limit.default_requested_tokens must be in 1..=default_burst_capacity"
            );
        }
        for rule in &self.rate_limit.overrides {
            rule.validate(&self.rate_limit)
                .map_err(|e| anyhow::anyhow!("rate_limit.overrides: {}", e))?;
        }
        if self.cache.enabled && self.cache.key_template.is_empty() {
            anyhow::bail!("cache.key_template must not be empty when caching is enabled");
        }
        for required in &self.headers.required {
            if let Some(ref pattern) = required.pattern {
                regex::Regex::new(pattern).map_err(|e| {
                    anyhow::anyhow!("headers.required '{}': bad pattern: {}", required.name, e)
                })?;
            }
        }
        Ok(())
    }
}
