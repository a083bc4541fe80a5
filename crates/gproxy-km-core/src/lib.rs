pub mod auth;
pub mod core;
pub mod error;
pub mod handler;
pub mod key_manager;
pub mod model_filter;
pub mod observability;
pub mod proxy_engine;
pub mod upstream_client;

pub use auth::AuthGate;
pub use core::CoreState;
pub use error::ProxyError;
pub use key_manager::{KeyId, KeyManager, KeyManagerOptions, mask_key};
pub use model_filter::ModelFilterCache;
pub use proxy_engine::ProxyEngine;
pub use upstream_client::{UpstreamClientConfig, WreqUpstreamClient};
