use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found or unreadable: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Invalid(#[from] serde_yaml::Error),
    #[error("empty key pool")]
    EmptyKeyPool,
    #[error("missing access key")]
    MissingAccessKey,
    #[error("unknown key selection strategy: {0}")]
    UnknownStrategy(String),
}

/// `openrouter.key_selection_strategy`. Parsed lazily (not during YAML
/// deserialization) so an unknown value produces the dedicated
/// `UnknownStrategy` error rather than a generic parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySelectionStrategy {
    RoundRobin,
    First,
    Random,
}

impl KeySelectionStrategy {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "round-robin" => Ok(Self::RoundRobin),
            "first" => Ok(Self::First),
            "random" => Ok(Self::Random),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5555
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub access_key: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_level")]
    pub http_log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            access_key: String::new(),
            log_level: default_log_level(),
            http_log_level: default_log_level(),
        }
    }
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_public_endpoints() -> Vec<String> {
    vec!["/api/v1/models".to_string()]
}

fn default_rate_limit_cooldown() -> u64 {
    14400
}

fn default_key_selection_strategy() -> String {
    "round-robin".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_public_endpoints")]
    pub public_endpoints: Vec<String>,
    #[serde(default = "default_rate_limit_cooldown")]
    pub rate_limit_cooldown: u64,
    #[serde(default = "default_key_selection_strategy")]
    pub key_selection_strategy: String,
    #[serde(default)]
    pub key_selection_opts: Vec<String>,
    #[serde(default)]
    pub free_only: bool,
    /// Gates both `tokens_sent_total` and `tokens_received_total`. Off by
    /// default, unlike the source's `enable_token_counting` (which defaults
    /// on) — token counting is opt-in here.
    #[serde(default)]
    pub enable_token_counting: bool,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            base_url: default_base_url(),
            public_endpoints: default_public_endpoints(),
            rate_limit_cooldown: default_rate_limit_cooldown(),
            key_selection_strategy: default_key_selection_strategy(),
            key_selection_opts: Vec::new(),
            free_only: false,
            enable_token_counting: false,
        }
    }
}

impl OpenRouterConfig {
    pub fn use_last(&self) -> bool {
        self.key_selection_opts.iter().any(|opt| opt == "same")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
}

impl RequestProxyConfig {
    /// The outbound proxy URL to use, or `None` when disabled or unset.
    pub fn resolved_url(&self) -> Option<String> {
        if !self.enabled {
            return None;
        }
        self.url.clone().filter(|url| !url.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub openrouter: OpenRouterConfig,
    #[serde(default, rename = "requestProxy")]
    pub request_proxy: RequestProxyConfig,
}

/// Name of the environment variable that overrides `openrouter.keys` with a
/// comma-separated list, applied before the YAML document is parsed.
pub const OPENROUTER_KEYS_ENV: &str = "OPENROUTER_KEYS";

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw, std::env::var(OPENROUTER_KEYS_ENV).ok().as_deref())
    }

    /// Parses a YAML document, applying the `OPENROUTER_KEYS` override (if
    /// given) before the document is deserialized, then validates the result.
    pub fn parse(raw: &str, openrouter_keys_env: Option<&str>) -> Result<Self, ConfigError> {
        let mut doc: serde_yaml::Value = serde_yaml::from_str(raw)?;
        if let Some(env_keys) = openrouter_keys_env {
            let keys: Vec<serde_yaml::Value> = env_keys
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| serde_yaml::Value::String(s.to_string()))
                .collect();
            if !keys.is_empty() {
                let mapping = doc
                    .as_mapping_mut()
                    .get_or_insert_with(serde_yaml::Mapping::new);
                let openrouter_key = serde_yaml::Value::String("openrouter".to_string());
                let openrouter = mapping
                    .entry(openrouter_key)
                    .or_insert_with(|| serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                if let Some(openrouter_mapping) = openrouter.as_mapping_mut() {
                    openrouter_mapping.insert(
                        serde_yaml::Value::String("keys".to_string()),
                        serde_yaml::Value::Sequence(keys),
                    );
                }
            }
        }

        let config: AppConfig = serde_yaml::from_value(doc)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.openrouter.keys.is_empty() {
            return Err(ConfigError::EmptyKeyPool);
        }
        if self.server.access_key.trim().is_empty() {
            return Err(ConfigError::MissingAccessKey);
        }
        KeySelectionStrategy::parse(&self.openrouter.key_selection_strategy)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
server:
  access_key: "secret"
openrouter:
  keys: ["sk-a", "sk-b"]
"#;

    #[test]
    fn defaults_fill_in_missing_fields() {
        let config = AppConfig::parse(MINIMAL, None).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 5555);
        assert_eq!(config.openrouter.base_url, "https://openrouter.ai/api/v1");
        assert_eq!(config.openrouter.public_endpoints, vec!["/api/v1/models"]);
        assert_eq!(config.openrouter.rate_limit_cooldown, 14400);
        assert!(!config.openrouter.free_only);
        assert!(!config.request_proxy.enabled);
    }

    #[test]
    fn env_override_replaces_keys_before_validation() {
        let config = AppConfig::parse(MINIMAL, Some("sk-c, sk-d ,")).unwrap();
        assert_eq!(config.openrouter.keys, vec!["sk-c", "sk-d"]);
    }

    #[test]
    fn empty_key_pool_is_fatal() {
        let doc = r#"
server:
  access_key: "secret"
openrouter:
  keys: []
"#;
        let err = AppConfig::parse(doc, None).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyKeyPool));
    }

    #[test]
    fn missing_access_key_is_fatal() {
        let doc = r#"
openrouter:
  keys: ["sk-a"]
"#;
        let err = AppConfig::parse(doc, None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingAccessKey));
    }

    #[test]
    fn unknown_strategy_is_fatal() {
        let doc = r#"
server:
  access_key: "secret"
openrouter:
  keys: ["sk-a"]
  key_selection_strategy: "least-loaded"
"#;
        let err = AppConfig::parse(doc, None).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownStrategy(s) if s == "least-loaded"));
    }

    #[test]
    fn token_counting_defaults_off() {
        let config = AppConfig::parse(MINIMAL, None).unwrap();
        assert!(!config.openrouter.enable_token_counting);
    }

    #[test]
    fn use_last_reflects_same_opt() {
        let mut cfg = OpenRouterConfig::default();
        assert!(!cfg.use_last());
        cfg.key_selection_opts.push("same".to_string());
        assert!(cfg.use_last());
    }

    #[test]
    fn load_reads_yaml_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, MINIMAL.as_bytes()).unwrap();
        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.openrouter.keys, vec!["sk-a", "sk-b"]);
    }

    #[test]
    fn unrecognized_yaml_keys_are_ignored() {
        let doc = r#"
server:
  access_key: "secret"
  unknown_field: 42
openrouter:
  keys: ["sk-a"]
extra_top_level_section:
  foo: bar
"#;
        let config = AppConfig::parse(doc, None).unwrap();
        assert_eq!(config.openrouter.keys, vec!["sk-a"]);
    }
}
