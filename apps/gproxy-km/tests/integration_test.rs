use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes as AxumBytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use gproxy_km_config::AppConfig;
use gproxy_km_core::core::CoreState;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;

struct MockUpstream {
    attempts: AtomicUsize,
}

/// Fails the first attempt with 429 (forcing a key rotation per S4), then
/// succeeds. Requests with `"stream": true` bypass the counter entirely and
/// relay a fixed three-event SSE body plus `[DONE]`, per S7.
async fn mock_chat_completions(
    State(state): State<Arc<MockUpstream>>,
    _headers: HeaderMap,
    body: AxumBytes,
) -> Response {
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
    let streaming = parsed.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

    if streaming {
        let sse_body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"!\"}}],\"usage\":{\"completion_tokens\":7}}\n\n",
            "data: [DONE]\n\n",
        );
        return ([("content-type", "text/event-stream")], sse_body).into_response();
    }

    if state.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            axum::Json(serde_json::json!({"error": "rate limited"})),
        )
            .into_response();
    }

    axum::Json(serde_json::json!({
        "choices": [{"message": {"content": "ok"}}],
        "usage": {"completion_tokens": 3},
    }))
    .into_response()
}

async fn spawn_mock_upstream() -> std::net::SocketAddr {
    let state = Arc::new(MockUpstream {
        attempts: AtomicUsize::new(0),
    });
    let app = Router::new()
        .route("/chat/completions", post(mock_chat_completions))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn retries_on_rate_limit_and_relays_sse() {
    let mock_addr = spawn_mock_upstream().await;

    let config_yaml = format!(
        r#"
server:
  access_key: "test-secret"
openrouter:
  keys: ["sk-test-aaaa1111", "sk-test-bbbb2222"]
  base_url: "http://{mock_addr}"
  rate_limit_cooldown: 60
"#
    );
    let config = AppConfig::parse(&config_yaml, None).unwrap();
    let metrics_handle = PrometheusBuilder::new().install_recorder().unwrap();
    let state = Arc::new(CoreState::build(&config, metrics_handle).unwrap());
    let app = gproxy_km_router::proxy_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    let base = format!("http://{addr}");

    let client = reqwest::Client::new();

    // S4: the first key is rate-limited; the engine rotates to the second
    // key and the client only ever sees the eventual 200.
    let resp = client
        .post(format!("{base}/api/v1/chat/completions"))
        .bearer_auth("test-secret")
        .json(&serde_json::json!({
            "model": "test/model",
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "ok");

    // S7: the three upstream data events plus [DONE] are relayed verbatim,
    // each re-framed with a trailing blank line.
    let resp = client
        .post(format!("{base}/api/v1/chat/completions"))
        .bearer_auth("test-secret")
        .json(&serde_json::json!({
            "model": "test/model",
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let text = resp.text().await.unwrap();
    assert_eq!(text.matches("data: ").count(), 4);
    assert!(text.contains("[DONE]"));

    // Both responses' completion_tokens (3 + 7) landed in tokens_received_total.
    let metrics_resp = client.get(format!("{base}/metrics")).send().await.unwrap();
    let metrics_text = metrics_resp.text().await.unwrap();
    assert!(metrics_text.contains("tokens_received_total 10"));

    // No access key at all ⇒ 401, never reaching the upstream.
    let resp = client
        .post(format!("{base}/api/v1/chat/completions"))
        .json(&serde_json::json!({"model": "test/model", "messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
}
