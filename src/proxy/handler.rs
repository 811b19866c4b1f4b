use crate::proxy::context::{empty_body, full_body, BoxBody, BoxError, Exchange};
use crate::server::state::GatewayState;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::{HeaderName, HeaderValue, CONNECTION, HOST, TRANSFER_ENCODING};
use http::StatusCode;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::{Request, Response};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;

/// Entry point for every proxied request. Phases: route match, filter
/// chain, upstream forward, response filters. Each phase can finish the
/// exchange early with a synthesized response.
pub async fn handle_request(
    state: Arc<GatewayState>,
    req: Request<Incoming>,
    peer_addr: SocketAddr,
) -> Response<BoxBody> {
    metrics::gauge!("portico_http_requests_in_flight").increment(1.0);
    let resp = proxy(&state, req, peer_addr).await;
    metrics::gauge!("portico_http_requests_in_flight").decrement(1.0);
    resp
}

/// Generic over the request body so tests can drive the full pipeline
/// with an in-memory body.
pub(crate) async fn proxy<B>(
    state: &GatewayState,
    req: Request<B>,
    peer_addr: SocketAddr,
) -> Response<BoxBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let (parts, body) = req.into_parts();
    let headers = parts.headers;

    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let path = parts.uri.path().to_string();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    let method = parts.method.clone();

    let client_ip = resolve_client_ip(&headers, peer_addr);
    let request_id = headers
        .get(state.request_id_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut ex = Exchange::new(
        host,
        path,
        method.as_str().to_string(),
        client_ip,
        request_id,
    );

    // Rejections and upstream failures exit through here too, so the
    // access line and metrics cover every outcome, not just proxied ones.
    let mut resp = forward(state, &mut ex, method, &path_and_query, headers, body, peer_addr).await;
    state.chain.on_response(&ex, &mut resp);
    resp
}

async fn forward<B>(
    state: &GatewayState,
    ex: &mut Exchange,
    method: http::Method,
    path_and_query: &str,
    mut headers: http::HeaderMap,
    body: B,
    peer_addr: SocketAddr,
) -> Response<BoxBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let table = state.routes.load();
    let route = match table.match_route(&ex.path, method.as_str(), &headers) {
        Some(r) => r,
        None => {
            tracing::debug!("proxy: no route, method={}, path={}", method, ex.path);
            ex.route_id = "_no_route".to_string();
            return ex.error_response(StatusCode::NOT_FOUND, "no route matched");
        }
    };
    ex.route_id = route.id.clone();
    ex.service = route.service.clone();
    ex.route = Some(route.clone());
    drop(table);

    let host = ex.host.clone();
    inject_forwarded_headers(&mut headers, peer_addr, &host);

    if let Some(resp) = state.chain.on_request(ex, &mut headers).await {
        return resp;
    }

    ex.upstream_uri = format!("{}{}", route.uri, path_and_query);
    ex.upstream_start = Some(Instant::now());

    remove_hop_headers(&mut headers);
    headers.remove(HOST);

    let upstream_req = state
        .upstream
        .request(method.clone(), &ex.upstream_uri)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()));

    let timeout = Duration::from_secs_f64(state.config.proxy.request_timeout_secs);
    let upstream_resp = match tokio::time::timeout(timeout, upstream_req.send()).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            let (status, msg) = if e.is_timeout() {
                (StatusCode::GATEWAY_TIMEOUT, "upstream timeout")
            } else if e.is_connect() {
                (StatusCode::BAD_GATEWAY, "upstream unavailable")
            } else {
                (StatusCode::BAD_GATEWAY, "upstream error")
            };
            tracing::warn!(
                "proxy: upstream failed, route={}, uri={}, err={}",
                ex.route_id,
                ex.upstream_uri,
                e
            );
            metrics::counter!(
                "portico_upstream_errors_total",
                "route" => ex.route_id.clone(),
                "service" => ex.service.clone(),
            )
            .increment(1);
            return ex.error_response(status, msg);
        }
        Err(_) => {
            tracing::warn!(
                "proxy: upstream deadline exceeded, route={}, uri={}",
                ex.route_id,
                ex.upstream_uri
            );
            metrics::counter!(
                "portico_upstream_errors_total",
                "route" => ex.route_id.clone(),
                "service" => ex.service.clone(),
            )
            .increment(1);
            return ex.error_response(StatusCode::GATEWAY_TIMEOUT, "upstream timeout");
        }
    };

    let mut resp = build_downstream_response(state, ex, upstream_resp).await;
    remove_hop_headers(resp.headers_mut());
    resp
}

/// Turn the upstream response into the downstream one. When the cache
/// filter asked for a store (a 200 GET under the size cap) the body is
/// collected and kept; everything else streams straight through.
async fn build_downstream_response(
    state: &GatewayState,
    ex: &mut Exchange,
    upstream: reqwest::Response,
) -> Response<BoxBody> {
    let status = upstream.status();
    let headers = upstream.headers().clone();

    let store = ex.cache_key.is_some() && status == StatusCode::OK && ex.method == "GET";
    let body = if store {
        match upstream.bytes().await {
            Ok(bytes) => {
                store_cached(state, ex, status, &headers, &bytes).await;
                full_body(bytes)
            }
            Err(e) => {
                tracing::warn!("proxy: upstream body read failed, route={}, err={}", ex.route_id, e);
                // Metrics are finalized by the access log filter once this
                // response passes back through the chain.
                return crate::proxy::context::json_error(
                    StatusCode::BAD_GATEWAY,
                    "upstream body error",
                );
            }
        }
    } else {
        let stream = upstream
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(|e| Box::new(e) as BoxError);
        StreamBody::new(stream).boxed_unsync()
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    builder.body(body).unwrap_or_else(|_| {
        let mut resp = Response::new(empty_body());
        *resp.status_mut() = status;
        resp
    })
}

/// Cached bodies are stored decoded so a hit can be served to any
/// client. Gzip is decoded; any other content-encoding skips the store.
async fn store_cached(
    state: &GatewayState,
    ex: &mut Exchange,
    status: StatusCode,
    headers: &http::HeaderMap,
    body: &Bytes,
) {
    let key = match ex.cache_key.take() {
        Some(k) => k,
        None => return,
    };
    if body.len() > state.config.cache.max_body_bytes {
        return;
    }

    let encoding = headers
        .get(http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let (stored_body, strip_encoding) = match encoding {
        "" | "identity" => (body.clone(), false),
        "gzip" => {
            let mut decoder =
                async_compression::tokio::bufread::GzipDecoder::new(body.as_ref());
            let mut decoded = Vec::new();
            match decoder.read_to_end(&mut decoded).await {
                Ok(_) => (Bytes::from(decoded), true),
                Err(e) => {
                    tracing::debug!("cache: gzip decode failed, key={}, err={}", key, e);
                    return;
                }
            }
        }
        other => {
            tracing::debug!("cache: unsupported encoding, key={}, encoding={}", key, other);
            return;
        }
    };

    if stored_body.len() > state.config.cache.max_body_bytes {
        return;
    }

    let mut cached_headers = headers.clone();
    remove_hop_headers(&mut cached_headers);
    if strip_encoding {
        cached_headers.remove(http::header::CONTENT_ENCODING);
        cached_headers.remove(http::header::CONTENT_LENGTH);
    }

    state
        .response_cache
        .insert(key, status, cached_headers, stored_body);
}

/// First hop of X-Forwarded-For when parseable, otherwise the TCP peer.
pub fn resolve_client_ip(headers: &http::HeaderMap, peer_addr: SocketAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
        .unwrap_or_else(|| peer_addr.ip())
}

fn remove_hop_headers(headers: &mut http::HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

/// Inject standard `X-Forwarded-*` and `X-Real-IP` headers so upstream
/// services can identify the original client and protocol.
///
/// - `X-Forwarded-For`: append the TCP peer IP to any existing value.
/// - `X-Forwarded-Proto`: trusted when present (a front LB sets it after
///   TLS termination); defaults to `http`.
/// - `X-Forwarded-Host`: the original `Host` header value.
/// - `X-Real-IP`: always the immediate peer.
fn inject_forwarded_headers(
    headers: &mut http::HeaderMap,
    peer_addr: SocketAddr,
    original_host: &str,
) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");

    let peer_ip = peer_addr.ip().to_string();

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let mut combined = String::with_capacity(existing.len() + 2 + peer_ip.len());
        combined.push_str(existing);
        combined.push_str(", ");
        combined.push_str(&peer_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XFF.clone(), v);
    }

    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    if !original_host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(original_host) {
            headers.insert(XFH.clone(), v);
        }
    }

    if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XRI.clone(), v);
    }
}
