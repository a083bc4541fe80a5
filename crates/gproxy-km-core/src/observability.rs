use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use http::{HeaderName, HeaderValue};
use tracing::Level;
use uuid::Uuid;

use crate::core::CoreState;

#[derive(Debug, Clone)]
pub struct RequestId(pub String);

const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");
const PROCESS_TIME_HEADER: HeaderName = HeaderName::from_static("x-process-time");

/// Adopts an inbound `X-Request-ID` or mints a UUID v4, stores it as a
/// request extension for downstream handlers/middleware, and echoes it on
/// the response. Must wrap `process_time_layer` so the latter can log the ID.
pub async fn request_id_layer(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestId(id.clone()));
    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    resp
}

/// Measures wall-clock duration, sets `X-Process-Time`, strips any `Date`
/// header the inner service set, and emits one structured access log line at
/// `state.access_log_level`.
pub async fn process_time_layer(
    State(state): State<Arc<CoreState>>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let start = Instant::now();
    let mut resp = next.run(req).await;
    let elapsed = start.elapsed();

    resp.headers_mut().remove(http::header::DATE);
    resp.headers_mut().remove(http::header::SERVER);
    if let Ok(value) = HeaderValue::from_str(&elapsed.as_secs_f64().to_string()) {
        resp.headers_mut().insert(PROCESS_TIME_HEADER, value);
    }

    log_access(
        state.access_log_level,
        &request_id,
        &method,
        &path,
        resp.status().as_u16(),
        elapsed.as_millis() as u64,
    );

    resp
}

/// `tracing`'s event macros require the level as a syntactic literal, so a
/// runtime-configured level has to be dispatched by hand.
fn log_access(level: Level, req_id: &str, method: &http::Method, path: &str, status: u16, duration_ms: u64) {
    macro_rules! emit {
        ($macro:ident) => {
            tracing::$macro!(
                %req_id,
                %method,
                %path,
                status,
                duration_ms,
                "handled request"
            )
        };
    }
    match level {
        Level::TRACE => emit!(trace),
        Level::DEBUG => emit!(debug),
        Level::INFO => emit!(info),
        Level::WARN => emit!(warn),
        Level::ERROR => emit!(error),
    }
}
