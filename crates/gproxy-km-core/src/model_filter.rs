use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

const FREE_SUFFIX: &str = ":free";
const PRICES_TO_CHECK: [&str; 6] = [
    "prompt",
    "completion",
    "request",
    "image",
    "web_search",
    "internal_reasoning",
];

struct Inner {
    models: Vec<serde_json::Value>,
    free_ids: HashSet<String>,
    last_refresh: Option<Instant>,
}

/// Bounded-staleness snapshot of the upstream model list, refreshed at most
/// once per `ttl`. The refresh HTTP call runs with the lock held: refreshes
/// are rare (every `ttl`, default one hour) and serializing them avoids a
/// thundering herd hitting the upstream models endpoint at once.
pub struct ModelFilterCache {
    models_url: String,
    client: wreq::Client,
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl ModelFilterCache {
    pub fn new(models_url: String, client: wreq::Client, ttl: Duration) -> Self {
        Self {
            models_url,
            client,
            ttl,
            inner: Mutex::new(Inner {
                models: Vec::new(),
                free_ids: HashSet::new(),
                last_refresh: None,
            }),
        }
    }

    pub async fn get_models(&self) -> Vec<serde_json::Value> {
        let mut inner = self.inner.lock().await;
        self.ensure_fresh(&mut inner).await;
        inner.models.clone()
    }

    pub async fn get_free_ids(&self) -> HashSet<String> {
        let mut inner = self.inner.lock().await;
        self.ensure_fresh(&mut inner).await;
        inner.free_ids.clone()
    }

    pub async fn is_allowed(&self, model_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        self.ensure_fresh(&mut inner).await;
        inner.free_ids.contains(model_id)
    }

    async fn ensure_fresh(&self, inner: &mut Inner) {
        let stale = match inner.last_refresh {
            None => true,
            Some(last) => Instant::now().duration_since(last) > self.ttl,
        };
        if !stale {
            return;
        }
        self.refresh(inner).await;
    }

    async fn refresh(&self, inner: &mut Inner) {
        match self.fetch_models().await {
            Ok(models) => {
                let free_ids = models
                    .iter()
                    .filter_map(|m| m.get("id").and_then(|v| v.as_str()))
                    .filter(|id| id.ends_with(FREE_SUFFIX))
                    .map(str::to_string)
                    .collect();
                inner.models = models;
                inner.free_ids = free_ids;
            }
            Err(err) => {
                // Keep the prior snapshot; a transient outage degrades into
                // "stale but served" rather than a flap. Only the timestamp
                // advances, so we don't retry the upstream on every request.
                warn!(error = %err, "model list refresh failed, serving stale snapshot");
            }
        }
        inner.last_refresh = Some(Instant::now());
    }

    async fn fetch_models(&self) -> Result<Vec<serde_json::Value>, wreq::Error> {
        let resp = self.client.get(&self.models_url).send().await?;
        let resp = resp.error_for_status()?;
        let body: serde_json::Value = resp.json().await?;
        Ok(body
            .get("data")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }
}

/// Filters a models-listing response body to free-only entries, per the
/// exact string-equality pricing check preserved from the source proxy.
/// Malformed JSON passes through unchanged; an empty filtered result also
/// passes the original body through rather than returning an empty list.
pub fn remove_paid_models(body: &[u8]) -> Vec<u8> {
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return body.to_vec();
    };
    let Some(data) = value.get("data").and_then(|v| v.as_array()).cloned() else {
        return body.to_vec();
    };

    let filtered: Vec<serde_json::Value> = data.into_iter().filter(is_free_model).collect();
    if filtered.is_empty() {
        return body.to_vec();
    }

    if let Some(obj) = value.as_object_mut() {
        obj.insert("data".to_string(), serde_json::Value::Array(filtered));
    }
    serde_json::to_vec(&value).unwrap_or_else(|_| body.to_vec())
}

fn is_free_model(model: &serde_json::Value) -> bool {
    let pricing = model.get("pricing");
    PRICES_TO_CHECK.iter().all(|field| {
        let value = pricing
            .and_then(|p| p.get(field))
            .and_then(|v| v.as_str())
            .unwrap_or("1");
        value == "0"
    })
}
