use std::sync::Arc;
use std::time::Duration;

use gproxy_km_config::{AppConfig, KeySelectionStrategy};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::auth::AuthGate;
use crate::key_manager::{KeyManager, KeyManagerOptions};
use crate::model_filter::ModelFilterCache;
use crate::proxy_engine::ProxyEngine;
use crate::upstream_client::{UpstreamClientConfig, WreqUpstreamClient};

/// How long a fetched model list is trusted before the next request refreshes it.
const MODEL_LIST_TTL: Duration = Duration::from_secs(3600);

/// Shared application state handed to every axum handler.
pub struct CoreState {
    pub auth: AuthGate,
    pub key_manager: Arc<KeyManager>,
    pub engine: Arc<ProxyEngine>,
    pub metrics_handle: PrometheusHandle,
    /// Level `process_time_layer` emits its per-request access log line at,
    /// from `server.http_log_level`.
    pub access_log_level: tracing::Level,
}

impl CoreState {
    /// Builds the whole dependency graph from a validated `AppConfig`.
    /// `AppConfig::validate` has already rejected an unknown key selection
    /// strategy, so the `expect` below can never fire in practice.
    pub fn build(config: &AppConfig, metrics_handle: PrometheusHandle) -> anyhow::Result<Self> {
        let strategy = KeySelectionStrategy::parse(&config.openrouter.key_selection_strategy)
            .expect("config validated at load time");

        let key_manager = Arc::new(KeyManager::new(
            config.openrouter.keys.clone(),
            KeyManagerOptions {
                use_last: config.openrouter.use_last(),
                cooldown_default: Duration::from_secs(config.openrouter.rate_limit_cooldown),
                strategy,
            },
        ));

        let proxy_url = config.request_proxy.resolved_url();
        let client_config = UpstreamClientConfig::from_request_proxy(proxy_url);
        let upstream = Arc::new(WreqUpstreamClient::new(
            config.openrouter.base_url.clone(),
            client_config,
        )?);

        let models_url = format!("{}/models", config.openrouter.base_url.trim_end_matches('/'));
        let model_client = wreq::Client::builder().build()?;
        let model_filter = Arc::new(ModelFilterCache::new(models_url, model_client, MODEL_LIST_TTL));

        let engine = Arc::new(ProxyEngine::new(
            key_manager.clone(),
            model_filter,
            upstream,
            config.openrouter.free_only,
            config.openrouter.enable_token_counting,
        ));

        let auth = AuthGate::new(
            config.server.access_key.clone(),
            config.openrouter.public_endpoints.clone(),
        );

        let access_log_level = config
            .server
            .http_log_level
            .parse()
            .unwrap_or(tracing::Level::INFO);

        Ok(Self {
            auth,
            key_manager,
            engine,
            metrics_handle,
            access_log_level,
        })
    }
}
