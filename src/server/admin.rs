use crate::events::RefreshKind;
use crate::metrics::Metrics;
use crate::proxy::context::{full_body, BoxBody};
use crate::routing::PathPattern;
use crate::server::state::GatewayState;
use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use std::sync::Arc;

pub fn handle_admin(
    req: Request<Incoming>,
    state: Arc<GatewayState>,
    metrics: Metrics,
) -> Result<Response<BoxBody>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") | (&Method::GET, "/healthz") => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        (&Method::GET, "/ready") | (&Method::GET, "/readyz") => {
            let routes = state.routes.load().route_count();
            if state.ready() {
                Ok(Response::builder()
                    .status(200)
                    .body(full_body(format!(
                        r#"{{"status":"ready","routes":{}}}"#,
                        routes
                    )))
                    .unwrap())
            } else {
                Ok(Response::builder()
                    .status(503)
                    .body(full_body(r#"{"status":"not_ready","routes":0}"#))
                    .unwrap())
            }
        }

        (&Method::GET, "/metrics") => {
            let body = metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        (&Method::GET, "/routes") => {
            let table = state.routes.load();
            let routes: Vec<serde_json::Value> = table
                .all_routes()
                .iter()
                .map(|r| {
                    let (kind, pattern) = match &r.path {
                        PathPattern::Exact(p) => ("exact", p.clone()),
                        PathPattern::Prefix(stem) => ("prefix", format!("{}/*", stem)),
                    };
                    serde_json::json!({
                        "id": r.id,
                        "service": r.service,
                        "uri": r.uri,
                        "path": pattern,
                        "path_kind": kind,
                        "methods": r.methods,
                        "api_docs": r.api_docs,
                    })
                })
                .collect();

            let body = serde_json::to_string_pretty(&routes).unwrap_or_default();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        (&Method::GET, "/services") => {
            let services: Vec<serde_json::Value> = state
                .health
                .snapshot()
                .into_iter()
                .map(|(service, healthy)| {
                    serde_json::json!({"service": service, "healthy": healthy})
                })
                .collect();

            let body = serde_json::to_string_pretty(&services).unwrap_or_default();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        (&Method::POST, "/refresh") => {
            for kind in [
                RefreshKind::Routes,
                RefreshKind::RateLimits,
                RefreshKind::AccessControl,
            ] {
                let _ = state.refresh_tx.send(kind);
            }
            tracing::info!("admin: manual refresh triggered");
            Ok(Response::builder()
                .status(202)
                .body(full_body(r#"{"status":"refresh_queued"}"#))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
