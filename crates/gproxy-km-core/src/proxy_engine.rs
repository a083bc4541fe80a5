use std::future::Future;
use std::sync::Arc;

use axum::response::IntoResponse;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use tracing::warn;

use crate::error::ProxyError;
use crate::key_manager::{AllKeysCooling, KeyId, KeyManager};
use crate::model_filter::{ModelFilterCache, remove_paid_models};
use crate::upstream_client::{UpstreamBody, UpstreamOutcome, UpstreamResponse, WreqUpstreamClient};

/// Fixed per spec.md; not user-configurable.
const MAX_ATTEMPTS: u32 = 10;

pub struct ProxyEngine {
    key_manager: Arc<KeyManager>,
    model_filter: Arc<ModelFilterCache>,
    upstream: Arc<WreqUpstreamClient>,
    free_only: bool,
    enable_token_counting: bool,
}

impl ProxyEngine {
    pub fn new(
        key_manager: Arc<KeyManager>,
        model_filter: Arc<ModelFilterCache>,
        upstream: Arc<WreqUpstreamClient>,
        free_only: bool,
        enable_token_counting: bool,
    ) -> Self {
        Self {
            key_manager,
            model_filter,
            upstream,
            free_only,
            enable_token_counting,
        }
    }

    /// `POST /api/v1/chat/completions`. Runs the retry loop, gates on the
    /// free model set when configured, and relays either a JSON body or an
    /// SSE stream depending on the request's `stream` field.
    pub async fn chat_completions(&self, headers: HeaderMap, body: Bytes) -> Result<axum::response::Response, ProxyError> {
        let parsed: serde_json::Value =
            serde_json::from_slice(&body).map_err(|e| ProxyError::bad_request(e))?;

        if self.free_only {
            let model = parsed.get("model").and_then(|v| v.as_str()).unwrap_or("");
            if !self.model_filter.is_allowed(model).await {
                return Err(ProxyError::model_not_allowed(model));
            }
        }

        let streaming = parsed.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
        if self.enable_token_counting {
            metrics::counter!("tokens_sent_total").increment(estimate_tokens_sent(&parsed));
        }

        let outbound_headers = headers.clone();
        let outbound_body = body.clone();
        let resp = self
            .run_retry_loop(|_id, key| {
                let headers = outbound_headers.clone();
                let body = outbound_body.clone();
                async move {
                    self.upstream
                        .attempt(
                            Method::POST,
                            "/chat/completions",
                            headers,
                            Some(body),
                            key,
                            streaming,
                        )
                        .await
                }
            })
            .await?;

        Ok(self.relay(resp))
    }

    /// Any other authenticated path: single key acquisition (with 429
    /// rotation), forwarded with headers sanitized and body verbatim.
    pub async fn forward_authenticated(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<axum::response::Response, ProxyError> {
        let resp = self
            .run_retry_loop(|_id, key| {
                let headers = headers.clone();
                let body = body.clone();
                let method = method.clone();
                async move {
                    self.upstream
                        .attempt(method, path, headers, Some(body).filter(|b| !b.is_empty()), key, false)
                        .await
                }
            })
            .await?;
        Ok(self.relay(resp))
    }

    /// A public-prefix path (e.g. the models listing): no key acquisition,
    /// no auth gate, forwarded as a single attempt with no upstream
    /// `Authorization` header injected.
    pub async fn forward_public(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<axum::response::Response, ProxyError> {
        match self
            .upstream
            .attempt(method, path, headers, Some(body).filter(|b| !b.is_empty()), "", false)
            .await
        {
            UpstreamOutcome::Ok(resp) => Ok(self.relay_with_model_filter(resp)),
            UpstreamOutcome::RateLimited { .. } => Err(ProxyError::json(
                StatusCode::TOO_MANY_REQUESTS,
                "upstream_rate_limited",
                "public endpoint is rate-limited upstream",
            )),
            UpstreamOutcome::HttpError { status, body, headers } => {
                Err(ProxyError::upstream_http_error(status, body, headers))
            }
            UpstreamOutcome::Transport(kind) => Err(ProxyError::upstream_transport_error(kind)),
        }
    }

    async fn run_retry_loop<F, Fut>(&self, mut attempt: F) -> Result<UpstreamResponse, ProxyError>
    where
        F: FnMut(KeyId, &str) -> Fut,
        Fut: Future<Output = UpstreamOutcome>,
    {
        for _ in 0..MAX_ATTEMPTS {
            let key_id = match self.key_manager.acquire().await {
                Ok(id) => id,
                Err(AllKeysCooling { wait }) => return Err(ProxyError::all_keys_cooling(wait)),
            };
            let key_value = self.key_manager.key_value(key_id).to_string();

            match attempt(key_id, &key_value).await {
                UpstreamOutcome::Ok(resp) => return Ok(resp),
                UpstreamOutcome::RateLimited { reset_hint } => {
                    warn!(attempt_key_id = key_id, "upstream rate-limited, rotating key");
                    self.key_manager.penalize(key_id, reset_hint).await;
                    continue;
                }
                UpstreamOutcome::HttpError { status, body, headers } => {
                    return Err(ProxyError::upstream_http_error(status, body, headers));
                }
                UpstreamOutcome::Transport(kind) => {
                    return Err(ProxyError::upstream_transport_error(kind));
                }
            }
        }

        Err(ProxyError::json(
            StatusCode::SERVICE_UNAVAILABLE,
            "retries_exhausted",
            "upstream rate-limited every attempt",
        ))
    }

    fn relay(&self, resp: UpstreamResponse) -> axum::response::Response {
        let status = resp.status;
        let headers = resp.headers;
        match resp.body {
            UpstreamBody::Bytes(bytes) => {
                if self.enable_token_counting {
                    account_non_stream_tokens(&bytes);
                }
                build_response(status, headers, bytes)
            }
            UpstreamBody::Stream(rx) => {
                let rx = relay_sse(rx, self.enable_token_counting);
                build_stream_response(status, headers, rx)
            }
        }
    }

    fn relay_with_model_filter(&self, resp: UpstreamResponse) -> axum::response::Response {
        let status = resp.status;
        let headers = resp.headers;
        match resp.body {
            UpstreamBody::Bytes(bytes) => {
                let bytes = if self.free_only {
                    Bytes::from(remove_paid_models(&bytes))
                } else {
                    bytes
                };
                build_response(status, headers, bytes)
            }
            UpstreamBody::Stream(rx) => build_stream_response(status, headers, rx),
        }
    }
}

fn account_non_stream_tokens(body: &Bytes) {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body)
        && let Some(tokens) = value
            .get("usage")
            .and_then(|u| u.get("completion_tokens"))
            .and_then(|t| t.as_u64())
    {
        metrics::counter!("tokens_received_total").increment(tokens);
    }
}

/// Relays upstream SSE chunks line-by-line, re-framing each line with a
/// trailing blank line, and (when `count_tokens`) reports
/// `usage.completion_tokens` from the last `data: {...}` event once the
/// stream ends.
fn relay_sse(
    mut upstream_rx: tokio::sync::mpsc::Receiver<Bytes>,
    count_tokens: bool,
) -> tokio::sync::mpsc::Receiver<Bytes> {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let mut buf = String::new();
        let mut last_json: Option<serde_json::Value> = None;

        while let Some(chunk) = upstream_rx.recv().await {
            buf.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buf.find('\n') {
                let line: String = buf.drain(..=pos).collect();
                if !relay_line(line.trim_end_matches(['\r', '\n']), &tx, &mut last_json).await {
                    return;
                }
            }
        }
        if !buf.is_empty() {
            let _ = relay_line(buf.trim_end_matches(['\r', '\n']), &tx, &mut last_json).await;
        }

        if !count_tokens {
            return;
        }
        if let Some(tokens) = last_json
            .as_ref()
            .and_then(|v| v.get("usage"))
            .and_then(|u| u.get("completion_tokens"))
            .and_then(|t| t.as_u64())
        {
            metrics::counter!("tokens_received_total").increment(tokens);
        }
    });
    rx
}

async fn relay_line(
    line: &str,
    tx: &tokio::sync::mpsc::Sender<Bytes>,
    last_json: &mut Option<serde_json::Value>,
) -> bool {
    if line.is_empty() {
        return true;
    }
    if let Some(data) = line.strip_prefix("data: ")
        && data.starts_with('{')
        && let Ok(value) = serde_json::from_str::<serde_json::Value>(data)
    {
        *last_json = Some(value);
    }
    let framed = Bytes::from(format!("{line}\n\n"));
    tx.send(framed).await.is_ok()
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Bytes) -> axum::response::Response {
    let mut response = axum::response::Response::builder()
        .status(status)
        .body(axum::body::Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    response.headers_mut().extend(headers);
    response
}

fn build_stream_response(
    status: StatusCode,
    headers: HeaderMap,
    rx: tokio::sync::mpsc::Receiver<Bytes>,
) -> axum::response::Response {
    use futures_util::StreamExt;
    let stream = tokio_stream::wrappers::ReceiverStream::new(rx).map(Ok::<_, std::io::Error>);
    let mut response = axum::response::Response::builder()
        .status(status)
        .body(axum::body::Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    response.headers_mut().extend(headers);
    response
}

/// Rough pre-flight estimate of tokens about to be sent, matching the
/// source's `len(content) // 4` heuristic over message contents.
fn estimate_tokens_sent(body: &serde_json::Value) -> u64 {
    let mut total = 0u64;
    if let Some(max_tokens) = body.get("max_tokens").and_then(|v| v.as_u64()) {
        total += max_tokens;
    }
    let Some(messages) = body.get("messages").and_then(|v| v.as_array()) else {
        return total;
    };
    for message in messages {
        match message.get("content") {
            Some(serde_json::Value::String(s)) => total += s.len() as u64 / 4,
            Some(serde_json::Value::Array(parts)) => {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                        total += text.len() as u64 / 4;
                    }
                }
            }
            _ => {}
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::Router;
    use axum::routing::{get, post};
    use gproxy_km_config::KeySelectionStrategy;
    use tokio::net::TcpListener;

    use super::*;
    use crate::key_manager::KeyManagerOptions;
    use crate::upstream_client::UpstreamClientConfig;

    #[test]
    fn estimate_tokens_sent_counts_string_content() {
        let body = serde_json::json!({
            "messages": [{"role": "user", "content": "a string sixteen chars"}]
        });
        assert!(estimate_tokens_sent(&body) > 0);
    }

    #[test]
    fn estimate_tokens_sent_includes_max_tokens() {
        let body = serde_json::json!({"max_tokens": 128, "messages": []});
        assert_eq!(estimate_tokens_sent(&body), 128);
    }

    fn test_key_manager() -> Arc<KeyManager> {
        Arc::new(KeyManager::new(
            vec!["sk-test-aaaa1111".to_string()],
            KeyManagerOptions {
                use_last: false,
                cooldown_default: Duration::from_secs(60),
                strategy: KeySelectionStrategy::RoundRobin,
            },
        ))
    }

    fn chat_body(model: &str) -> Bytes {
        Bytes::from(
            serde_json::to_vec(&serde_json::json!({
                "model": model,
                "messages": [{"role": "user", "content": "hi"}],
            }))
            .unwrap(),
        )
    }

    /// Serves a fixed one-model `/models` listing so `ModelFilterCache`
    /// never touches the network in these tests.
    async fn spawn_model_filter(free_model_id: &'static str) -> Arc<ModelFilterCache> {
        let app = Router::new().route(
            "/models",
            get(move || async move {
                axum::Json(serde_json::json!({"data": [{"id": free_model_id, "pricing": {}}]}))
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        Arc::new(ModelFilterCache::new(
            format!("http://{addr}/models"),
            wreq::Client::builder().build().unwrap(),
            Duration::from_secs(3600),
        ))
    }

    #[tokio::test]
    async fn free_only_rejects_non_free_model_before_key_acquisition() {
        let model_filter = spawn_model_filter("good/model:free").await;
        // Nothing listens on this port: if the engine reached the upstream
        // client at all, the result would be a transport error, not this.
        let upstream = Arc::new(
            WreqUpstreamClient::new("http://127.0.0.1:1".to_string(), UpstreamClientConfig::default())
                .unwrap(),
        );
        let engine = ProxyEngine::new(test_key_manager(), model_filter, upstream, true, false);

        let err = engine
            .chat_completions(HeaderMap::new(), chat_body("paid/model"))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn free_only_admits_free_model() {
        let model_filter = spawn_model_filter("good/model:free").await;
        let upstream_app = Router::new().route(
            "/chat/completions",
            post(|| async {
                axum::Json(serde_json::json!({"choices": [{"message": {"content": "ok"}}]}))
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, upstream_app).await.unwrap() });
        let upstream = Arc::new(
            WreqUpstreamClient::new(format!("http://{addr}"), UpstreamClientConfig::default()).unwrap(),
        );
        let engine = ProxyEngine::new(test_key_manager(), model_filter, upstream, true, false);

        let resp = engine
            .chat_completions(HeaderMap::new(), chat_body("good/model:free"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
