use std::sync::Arc;

use axum::middleware;
use axum::routing::{any, get, post};
use axum::Router;
use gproxy_km_core::core::CoreState;
use gproxy_km_core::handler;
use gproxy_km_core::observability::{process_time_layer, request_id_layer};

/// Builds the full HTTP surface: the three `/api/v1` routes, `/health`, and
/// `/metrics`, wrapped in the observability middleware pair. `request_id_layer`
/// is applied last so it wraps outermost, ahead of `process_time_layer`, which
/// reads the request ID it stores.
pub fn proxy_router(state: Arc<CoreState>) -> Router {
    Router::new()
        .route("/api/v1/models", get(handler::models_list))
        .route("/api/v1/chat/completions", post(handler::chat_completions))
        .route("/api/v1/{*rest}", any(handler::generic_proxy))
        .route("/health", get(handler::health))
        .route("/metrics", get(handler::metrics))
        .layer(middleware::from_fn(process_time_layer))
        .layer(middleware::from_fn(request_id_layer))
        .with_state(state)
}
