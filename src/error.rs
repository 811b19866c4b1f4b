use std::fmt;

#[derive(Debug)]
pub enum GatewayError {
    NoRouteMatch,
    RateLimited,
    AccessDenied(String),
    HeaderRejected(String),
    Validation(String),
    Registry(String),
    Store(String),
    UpstreamTimeout,
    UpstreamConnect(String),
    Http(reqwest::Error),
    Config(String),
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::NoRouteMatch => write!(f, "no route matched"),
            GatewayError::RateLimited => write!(f, "rate limited"),
            GatewayError::AccessDenied(reason) => write!(f, "access denied: {}", reason),
            GatewayError::HeaderRejected(msg) => write!(f, "header rejected: {}", msg),
            GatewayError::Validation(msg) => write!(f, "validation error: {}", msg),
            GatewayError::Registry(msg) => write!(f, "registry error: {}", msg),
            GatewayError::Store(msg) => write!(f, "counter store error: {}", msg),
            GatewayError::UpstreamTimeout => write!(f, "upstream timeout"),
            GatewayError::UpstreamConnect(msg) => write!(f, "upstream connect error: {}", msg),
            GatewayError::Http(e) => write!(f, "http error: {}", e),
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::Http(e)
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(e: redis::RedisError) -> Self {
        GatewayError::Store(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_no_route_match() {
        assert_eq!(GatewayError::NoRouteMatch.to_string(), "no route matched");
    }

    #[test]
    fn display_rate_limited() {
        assert_eq!(GatewayError::RateLimited.to_string(), "rate limited");
    }

    #[test]
    fn display_access_denied() {
        assert_eq!(
            GatewayError::AccessDenied("DENIED_BY_RULE".to_string()).to_string(),
            "access denied: DENIED_BY_RULE"
        );
    }

    #[test]
    fn display_validation() {
        assert_eq!(
            GatewayError::Validation("duplicate routeId r1".to_string()).to_string(),
            "validation error: duplicate routeId r1"
        );
    }

    #[test]
    fn display_store() {
        assert_eq!(
            GatewayError::Store("timeout".to_string()).to_string(),
            "counter store error: timeout"
        );
    }

    #[test]
    fn display_registry() {
        assert_eq!(
            GatewayError::Registry("503".to_string()).to_string(),
            "registry error: 503"
        );
    }

    #[test]
    fn display_config() {
        assert_eq!(
            GatewayError::Config("bad toml".to_string()).to_string(),
            "config error: bad toml"
        );
    }
}
