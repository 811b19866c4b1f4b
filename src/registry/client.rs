use crate::config::RegistryConfig;
use crate::error::GatewayError;
use crate::registry::model::{AccessPolicy, RateLimitRule, RouteDefinition};

/// Registry HTTP client. The registry owns all business configuration;
/// the gateway only ever reads the full authoritative state and rebuilds
/// its snapshots from it.
#[derive(Clone)]
pub struct RegistryClient {
    base_url: String,
    client: reqwest::Client,
}

impl RegistryClient {
    pub fn new(config: &RegistryConfig) -> Self {
        let base_url = if config.base_url.starts_with("http://")
            || config.base_url.starts_with("https://")
        {
            config.base_url.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", config.base_url.trim_end_matches('/'))
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .connect_timeout(std::time::Duration::from_secs(2))
            .build()
            .expect("failed to build registry HTTP client");

        Self { base_url, client }
    }

    /// Fetch all route definitions, including inactive ones. Filtering on
    /// `active` happens when the route table is compiled.
    pub async fn fetch_routes(&self) -> Result<Vec<RouteDefinition>, GatewayError> {
        self.get_json("/v1/routes").await
    }

    pub async fn fetch_rate_limits(&self) -> Result<Vec<RateLimitRule>, GatewayError> {
        self.get_json("/v1/rate-limits").await
    }

    pub async fn fetch_access_policies(&self) -> Result<Vec<AccessPolicy>, GatewayError> {
        self.get_json("/v1/access-policies").await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, GatewayError> {
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(GatewayError::Http)?;

        if !resp.status().is_success() {
            return Err(GatewayError::Registry(format!(
                "GET {} failed: status={}",
                path,
                resp.status()
            )));
        }

        resp.json().await.map_err(GatewayError::Http)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalization() {
        let mut config = RegistryConfig::default();
        config.base_url = "registry.internal:8500/".to_string();
        let client = RegistryClient::new(&config);
        assert_eq!(client.base_url, "http://registry.internal:8500");

        config.base_url = "https://registry.internal:8500".to_string();
        let client = RegistryClient::new(&config);
        assert_eq!(client.base_url, "https://registry.internal:8500");
    }
}
