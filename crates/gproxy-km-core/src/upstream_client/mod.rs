mod reset_hint;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::StreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use wreq::{Client, Proxy};

pub use reset_hint::extract_reset_hint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Connect,
    Timeout,
    Other,
}

pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(tokio::sync::mpsc::Receiver<Bytes>),
}

pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: UpstreamBody,
}

pub enum UpstreamOutcome {
    Ok(UpstreamResponse),
    RateLimited { reset_hint: Option<SystemTime> },
    HttpError {
        status: StatusCode,
        body: Bytes,
        headers: HeaderMap,
    },
    Transport(TransportErrorKind),
}

/// Headers stripped before forwarding a client request upstream, and from
/// the upstream's response before it is relayed back to the client.
const HOP_BY_HOP_REQUEST_HEADERS: [&str; 5] =
    ["host", "content-length", "connection", "authorization", "date"];

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl UpstreamClientConfig {
    /// `request_timeout` defaults to the spec's 600s completion bound;
    /// callers needing the shorter KM-internal bound (model list refresh)
    /// build their own `wreq::Client` directly instead of through this type.
    pub fn from_request_proxy(proxy: Option<String>) -> Self {
        Self {
            proxy,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(600),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self::from_request_proxy(None)
    }
}

/// Thin wrapper over `wreq::Client` performing one upstream attempt at a
/// time and classifying its outcome. Clients are cached by normalized
/// outbound-proxy URL so the proxy URL can be swapped without rebuilding
/// every existing connection pool.
#[derive(Clone)]
pub struct WreqUpstreamClient {
    base_url: String,
    config: UpstreamClientConfig,
    proxy_resolver: Arc<dyn Fn() -> Option<String> + Send + Sync>,
    clients: Arc<Mutex<HashMap<Option<String>, Client>>>,
}

impl WreqUpstreamClient {
    pub fn new(base_url: String, config: UpstreamClientConfig) -> Result<Self, wreq::Error> {
        let proxy = normalize_proxy(config.proxy.clone());
        Self::new_with_proxy_resolver(base_url, config, move || proxy.clone())
    }

    pub fn new_with_proxy_resolver<F>(
        base_url: String,
        config: UpstreamClientConfig,
        proxy_resolver: F,
    ) -> Result<Self, wreq::Error>
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        let resolver: Arc<dyn Fn() -> Option<String> + Send + Sync> = Arc::new(proxy_resolver);
        let initial_proxy = normalize_proxy(resolver());
        let initial_client = build_client(&config, initial_proxy.as_deref())?;
        let mut clients = HashMap::new();
        clients.insert(initial_proxy, initial_client);
        Ok(Self {
            base_url,
            config,
            proxy_resolver: resolver,
            clients: Arc::new(Mutex::new(clients)),
        })
    }

    fn client_for_current_proxy(&self) -> Result<Client, wreq::Error> {
        let proxy = normalize_proxy((self.proxy_resolver)());
        let mut guard = self.clients.lock().expect("upstream client cache lock");
        if let Some(client) = guard.get(&proxy) {
            return Ok(client.clone());
        }
        let client = build_client(&self.config, proxy.as_deref())?;
        guard.insert(proxy, client.clone());
        Ok(client)
    }

    /// Performs one upstream attempt. `path` is relative to the configured
    /// base URL. `key` is injected as `Authorization: Bearer <key>`; the
    /// caller's own `Authorization` header (if any) must already be absent
    /// from `headers`.
    pub async fn attempt(
        &self,
        method: Method,
        path: &str,
        mut headers: HeaderMap,
        body: Option<Bytes>,
        key: &str,
        streaming: bool,
    ) -> UpstreamOutcome {
        for name in HOP_BY_HOP_REQUEST_HEADERS {
            headers.remove(name);
        }
        let auth_value = match HeaderValue::from_str(&format!("Bearer {key}")) {
            Ok(v) => v,
            Err(_) => return UpstreamOutcome::Transport(TransportErrorKind::Other),
        };
        headers.insert(http::header::AUTHORIZATION, auth_value);

        let client = match self.client_for_current_proxy() {
            Ok(c) => c,
            Err(_) => return UpstreamOutcome::Transport(TransportErrorKind::Other),
        };

        let url = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let mut builder = client.request(method, &url);
        for (name, value) in headers.iter() {
            if let Ok(value_str) = value.to_str() {
                builder = builder.header(name.as_str(), value_str);
            }
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let resp = match builder.send().await {
            Ok(resp) => resp,
            Err(err) => return UpstreamOutcome::Transport(classify_wreq_error(&err)),
        };

        let status = StatusCode::from_u16(resp.status().as_u16())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response_headers = sanitize_response_headers(resp.headers());

        if status.as_u16() == 429 {
            let body = match resp.bytes().await {
                Ok(b) => b,
                Err(err) => return UpstreamOutcome::Transport(classify_wreq_error(&err)),
            };
            return UpstreamOutcome::RateLimited {
                reset_hint: extract_reset_hint(&body),
            };
        }

        if status.as_u16() >= 400 {
            let body = match resp.bytes().await {
                Ok(b) => b,
                Err(err) => return UpstreamOutcome::Transport(classify_wreq_error(&err)),
            };
            return UpstreamOutcome::HttpError {
                status,
                body,
                headers: response_headers,
            };
        }

        if !streaming {
            let body = match resp.bytes().await {
                Ok(b) => b,
                Err(err) => return UpstreamOutcome::Transport(classify_wreq_error(&err)),
            };
            return UpstreamOutcome::Ok(UpstreamResponse {
                status,
                headers: response_headers,
                body: UpstreamBody::Bytes(body),
            });
        }

        let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
        let idle_timeout = self.config.stream_idle_timeout;
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            loop {
                let next = tokio::time::timeout(idle_timeout, stream.next()).await;
                let Ok(item) = next else { break };
                let Some(item) = item else { break };
                let Ok(chunk) = item else { break };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });
        response_headers.remove(http::header::CONTENT_LENGTH);
        UpstreamOutcome::Ok(UpstreamResponse {
            status,
            headers: response_headers,
            body: UpstreamBody::Stream(rx),
        })
    }
}

fn sanitize_response_headers(headers: &wreq::header::HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if name.as_str().eq_ignore_ascii_case("content-encoding")
            || name.as_str().eq_ignore_ascii_case("date")
        {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(name, value);
        }
    }
    out
}

fn normalize_proxy(value: Option<String>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

fn build_client(config: &UpstreamClientConfig, proxy: Option<&str>) -> Result<Client, wreq::Error> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .read_timeout(config.stream_idle_timeout);
    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy)?);
    }
    builder.build()
}

fn classify_wreq_error(err: &wreq::Error) -> TransportErrorKind {
    if err.is_timeout() {
        return TransportErrorKind::Timeout;
    }
    if err.is_connect() || err.is_connection_reset() {
        return TransportErrorKind::Connect;
    }
    TransportErrorKind::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_recognized() {
        assert!(HOP_BY_HOP_REQUEST_HEADERS.contains(&"authorization"));
        assert!(HOP_BY_HOP_REQUEST_HEADERS.contains(&"host"));
    }
}
