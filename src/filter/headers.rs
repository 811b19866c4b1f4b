use crate::config::HeaderFilterConfig;
use crate::error::GatewayError;
use crate::filter::FilterResult;
use crate::proxy::context::Exchange;
use globset::{Glob, GlobSet, GlobSetBuilder};
use http::{HeaderName, HeaderValue, StatusCode};
use regex::Regex;
use std::collections::HashSet;

/// Headers always forwarded regardless of the allow-list. Anything else
/// must be named in `headers.allowed` when the list is non-empty.
const ESSENTIAL_HEADERS: &[&str] = &[
    "host",
    "content-type",
    "content-length",
    "accept",
    "accept-encoding",
    "authorization",
    "user-agent",
    "x-forwarded-for",
    "x-forwarded-proto",
    "x-forwarded-host",
    "x-real-ip",
];

struct RequiredHeaderCheck {
    name: String,
    pattern: Option<Regex>,
}

/// Mandatory-header validation and request-header hygiene. Global rules
/// come from config; per-route rules ride in on the compiled route's
/// `required-header.*` metadata. Documentation routes and skip-listed
/// paths are exempt.
pub struct HeaderFilter {
    required: Vec<RequiredHeaderCheck>,
    allowed: Option<HashSet<String>>,
    skip: GlobSet,
    request_id_header: HeaderName,
}

impl HeaderFilter {
    pub fn from_config(config: &HeaderFilterConfig) -> Result<Self, GatewayError> {
        let mut required = Vec::with_capacity(config.required.len());
        for rh in &config.required {
            let pattern = match &rh.pattern {
                Some(p) => Some(Regex::new(p).map_err(|e| {
                    GatewayError::Config(format!("headers.required '{}': {}", rh.name, e))
                })?),
                None => None,
            };
            required.push(RequiredHeaderCheck {
                name: rh.name.to_ascii_lowercase(),
                pattern,
            });
        }

        let allowed = if config.allowed.is_empty() {
            None
        } else {
            Some(
                config
                    .allowed
                    .iter()
                    .map(|h| h.to_ascii_lowercase())
                    .collect(),
            )
        };

        let skip = build_glob_set(&config.skip_paths)?;

        let request_id_header = config
            .request_id_header
            .parse::<HeaderName>()
            .map_err(|e| GatewayError::Config(format!("headers.request_id_header: {}", e)))?;

        Ok(Self {
            required,
            allowed,
            skip,
            request_id_header,
        })
    }

    pub fn on_request(
        &self,
        ex: &mut Exchange,
        headers: &mut http::HeaderMap,
    ) -> Result<FilterResult, GatewayError> {
        // The id was synthesized before the chain ran; make sure upstream
        // sees it too.
        if !headers.contains_key(&self.request_id_header) {
            if let Ok(v) = HeaderValue::from_str(&ex.request_id) {
                headers.insert(self.request_id_header.clone(), v);
            }
        }

        let exempt = ex
            .route
            .as_ref()
            .map(|r| r.api_docs)
            .unwrap_or(false)
            || self.skip.is_match(ex.path.as_str());
        if exempt {
            return Ok(FilterResult::Continue);
        }

        for check in &self.required {
            if let Some(resp) = validate_required(ex, headers, &check.name, check.pattern.as_ref())
            {
                return Ok(FilterResult::Reject(resp));
            }
        }

        if let Some(route) = ex.route.clone() {
            for check in &route.required_headers {
                if let Some(resp) =
                    validate_required(ex, headers, &check.name, check.pattern.as_ref())
                {
                    return Ok(FilterResult::Reject(resp));
                }
            }
        }

        if let Some(ref allowed) = self.allowed {
            let request_id = self.request_id_header.as_str();
            let unlisted: Vec<HeaderName> = headers
                .keys()
                .filter(|name| {
                    let name = name.as_str();
                    name != request_id
                        && !ESSENTIAL_HEADERS.contains(&name)
                        && !allowed.contains(name)
                })
                .cloned()
                .collect();
            for name in unlisted {
                headers.remove(&name);
            }
        }

        escape_header_values(headers, self.request_id_header.as_str());

        Ok(FilterResult::Continue)
    }
}

/// Neutralize markup in custom header values before they reach the
/// backend. Essential headers are left alone; escaping an ETag or an
/// Authorization value would corrupt it.
fn escape_header_values(headers: &mut http::HeaderMap, request_id_header: &str) {
    let mut replacements: Vec<(HeaderName, HeaderValue)> = Vec::new();
    for (name, value) in headers.iter() {
        let name_str = name.as_str();
        if name_str == request_id_header || ESSENTIAL_HEADERS.contains(&name_str) {
            continue;
        }
        let v = match value.to_str() {
            Ok(v) => v,
            Err(_) => continue,
        };
        if !v.chars().any(|c| matches!(c, '<' | '>' | '&' | '"' | '\'')) {
            continue;
        }
        if let Ok(escaped) = HeaderValue::from_str(&html_escape(v)) {
            replacements.push((name.clone(), escaped));
        }
    }
    for (name, value) in replacements {
        headers.insert(name, value);
    }
}

fn html_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn validate_required(
    ex: &Exchange,
    headers: &http::HeaderMap,
    name: &str,
    pattern: Option<&Regex>,
) -> Option<hyper::Response<crate::proxy::context::BoxBody>> {
    let value = headers.get(name).and_then(|v| v.to_str().ok());
    match (value, pattern) {
        (None, _) => {
            tracing::debug!("filter: headers: missing required header, name={}, route={}", name, ex.route_id);
            metrics::counter!("portico_header_rejected_total", "reason" => "missing")
                .increment(1);
            Some(ex.error_response(
                StatusCode::BAD_REQUEST,
                &format!("missing required header: {}", name),
            ))
        }
        (Some(v), Some(re)) if !re.is_match(v) => {
            tracing::debug!("filter: headers: header value rejected, name={}, route={}", name, ex.route_id);
            metrics::counter!("portico_header_rejected_total", "reason" => "pattern")
                .increment(1);
            Some(ex.error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid value for header: {}", name),
            ))
        }
        _ => None,
    }
}

pub(crate) fn build_glob_set(patterns: &[String]) -> Result<GlobSet, GatewayError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| GatewayError::Config(format!("bad skip glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| GatewayError::Config(format!("glob set: {}", e)))
}
