use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};

use crate::core::CoreState;

/// `GET /api/v1/models` — public, no key acquisition.
pub async fn models_list(State(state): State<Arc<CoreState>>, headers: HeaderMap, uri: Uri) -> Response {
    let path = match uri.query() {
        Some(q) => format!("/models?{q}"),
        None => "/models".to_string(),
    };
    match state
        .engine
        .forward_public(Method::GET, &path, headers, Bytes::new())
        .await
    {
        Ok(resp) => resp,
        Err(err) => err.into_response(),
    }
}

/// `POST /api/v1/chat/completions` — authenticated, runs the full retry loop.
pub async fn chat_completions(
    State(state): State<Arc<CoreState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(err) = state.auth.authenticate(&headers) {
        return err.into_response();
    }
    match state.engine.chat_completions(headers, body).await {
        Ok(resp) => resp,
        Err(err) => err.into_response(),
    }
}

/// Any other path under the API prefix: public prefixes bypass the auth gate
/// and key acquisition entirely; everything else is authenticated and
/// forwarded with key substitution (with 429 rotation). `rest` is the path
/// tail relative to the `/api/v1` mount point, matching the relative paths
/// `WreqUpstreamClient::attempt` expects.
pub async fn generic_proxy(
    State(state): State<Arc<CoreState>>,
    Path(rest): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let full_path = format!("/api/v1/{}", rest.trim_start_matches('/'));
    let upstream_path = match uri.query() {
        Some(q) => format!("/{}?{q}", rest.trim_start_matches('/')),
        None => format!("/{}", rest.trim_start_matches('/')),
    };

    if state.auth.is_public(&full_path) {
        return match state.engine.forward_public(method, &upstream_path, headers, body).await {
            Ok(resp) => resp,
            Err(err) => err.into_response(),
        };
    }

    if let Err(err) = state.auth.authenticate(&headers) {
        return err.into_response();
    }
    match state
        .engine
        .forward_authenticated(method, &upstream_path, headers, body)
        .await
    {
        Ok(resp) => resp,
        Err(err) => err.into_response(),
    }
}

/// `GET /health` — public liveness probe reporting key-pool status.
pub async fn health(State(state): State<Arc<CoreState>>) -> Response {
    let (active, cooling) = state.key_manager.snapshot_counts().await;
    let status = if active > 0 { "ok" } else { "error" };
    let code = if active > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "status": status,
        "services": {
            "keys": { "active": active, "cooling": cooling },
        },
    });
    (code, axum::Json(body)).into_response()
}

/// `GET /metrics` — Prometheus text exposition.
pub async fn metrics(State(state): State<Arc<CoreState>>) -> Response {
    state.metrics_handle.render().into_response()
}
