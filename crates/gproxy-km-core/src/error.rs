use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::{HeaderMap, StatusCode};

/// Unified shape for every per-request error surfaced to a client: client
/// auth failures, model gating, all-keys-cooling, upstream passthrough
/// errors, and internal failures. Startup-time failures use
/// `gproxy_km_config::ConfigError` instead, since those are fatal and never
/// reach a client.
#[derive(Debug)]
pub struct ProxyError {
    pub status: StatusCode,
    pub body: Bytes,
    pub headers: HeaderMap,
}

impl ProxyError {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
            headers: HeaderMap::new(),
        }
    }

    pub fn json(status: StatusCode, error: &str, message: impl std::fmt::Display) -> Self {
        let body = serde_json::json!({ "error": error, "message": message.to_string() });
        Self::new(status, serde_json::to_vec(&body).unwrap_or_default())
    }

    pub fn client_auth() -> Self {
        Self::json(StatusCode::UNAUTHORIZED, "client_auth_error", "invalid access key")
    }

    pub fn model_not_allowed(model: &str) -> Self {
        Self::json(
            StatusCode::FORBIDDEN,
            "model_not_allowed",
            format!("model '{model}' is not in the free set"),
        )
    }

    pub fn all_keys_cooling(wait: std::time::Duration) -> Self {
        Self::json(
            StatusCode::SERVICE_UNAVAILABLE,
            "all_keys_cooling",
            format!("all keys are cooling down, retry in {:.1}s", wait.as_secs_f64()),
        )
    }

    pub fn upstream_http_error(status: StatusCode, body: Bytes, headers: HeaderMap) -> Self {
        Self {
            status,
            body,
            headers,
        }
    }

    pub fn upstream_transport_error(kind: crate::upstream_client::TransportErrorKind) -> Self {
        use crate::upstream_client::TransportErrorKind;
        let status = match kind {
            TransportErrorKind::Connect => StatusCode::SERVICE_UNAVAILABLE,
            TransportErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            TransportErrorKind::Other => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::json(status, "upstream_transport_error", "upstream request failed")
    }

    pub fn internal(message: impl std::fmt::Display) -> Self {
        Self::json(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    pub fn bad_request(message: impl std::fmt::Display) -> Self {
        Self::json(StatusCode::BAD_REQUEST, "bad_request", message)
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let mut response = Response::builder()
            .status(self.status)
            .body(axum::body::Body::from(self.body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        response.headers_mut().extend(self.headers);
        response
    }
}
