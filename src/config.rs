//! Registry configuration.
//!
//! Loaded from YAML; every field has a default so an empty document is a
//! valid configuration. Secrets may be written as `${VAR}` and are resolved
//! from the environment at load time. `CAPGRAPH_*` variables override the
//! file for the settings that usually differ per deployment.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{CacheTtls, DEFAULT_PREFIX};
use crate::embeddings::hashing::DEFAULT_DIMENSIONS;
use crate::embeddings::http::HttpEmbedderConfig;
use crate::graph::http::HttpGraphConfig;
use crate::graph::pool::DEFAULT_MAX_SESSIONS;
use crate::graph::transaction::DEFAULT_MAX_RETRIES;
use crate::graph::RetryPolicy;
use crate::stream::{ConsumerConfig, DEFAULT_STREAM_KEY};
use crate::vectors::SearchWeights;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSettings {
    /// `http(s)://` selects the HTTP driver; anything else the in-process graph.
    #[serde(default = "default_graph_uri")]
    pub uri: String,
    #[serde(default = "default_graph_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_graph_database")]
    pub database: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_graph_uri() -> String { "memory://".to_string() }
fn default_graph_user() -> String { "neo4j".to_string() }
fn default_graph_database() -> String { "neo4j".to_string() }
fn default_max_sessions() -> usize { DEFAULT_MAX_SESSIONS }
fn default_max_retries() -> u32 { DEFAULT_MAX_RETRIES }
fn default_retry_delay_ms() -> u64 { 1000 }
fn default_timeout_secs() -> u64 { 30 }

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            uri: default_graph_uri(),
            user: default_graph_user(),
            password: String::new(),
            database: default_graph_database(),
            max_sessions: default_max_sessions(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl GraphSettings {
    pub fn is_remote(&self) -> bool {
        self.uri.starts_with("http://") || self.uri.starts_with("https://")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn http_config(&self) -> HttpGraphConfig {
        HttpGraphConfig {
            uri: self.uri.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            database: self.database.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    #[serde(default = "default_stream_key")]
    pub key: String,
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
    #[serde(default = "default_error_cooldown_ms")]
    pub error_cooldown_ms: u64,
}

fn default_stream_key() -> String { DEFAULT_STREAM_KEY.to_string() }
fn default_block_ms() -> u64 { 10_000 }
fn default_batch_size() -> usize { 100 }
fn default_idle_sleep_ms() -> u64 { 100 }
fn default_error_cooldown_ms() -> u64 { 30_000 }

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            key: default_stream_key(),
            block_ms: default_block_ms(),
            batch_size: default_batch_size(),
            idle_sleep_ms: default_idle_sleep_ms(),
            error_cooldown_ms: default_error_cooldown_ms(),
        }
    }
}

impl StreamSettings {
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            key: self.key.clone(),
            block: Duration::from_millis(self.block_ms),
            batch_size: self.batch_size,
            idle_sleep: Duration::from_millis(self.idle_sleep_ms),
            error_cooldown: Duration::from_millis(self.error_cooldown_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub ttl: CacheTtls,
}

fn default_cache_prefix() -> String { DEFAULT_PREFIX.to_string() }

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            prefix: default_cache_prefix(),
            ttl: CacheTtls::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSettings {
    #[serde(default)]
    pub weights: SearchWeights,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_threshold() -> f64 { 0.5 }
fn default_limit() -> usize { 10 }

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            weights: SearchWeights::default(),
            threshold: default_threshold(),
            limit: default_limit(),
        }
    }
}

/// Embedding backend. Without an endpoint the deterministic hashing
/// embedder is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Output dimensionality. Requested from, and enforced on, the HTTP
    /// embedder only when set; the hashing embedder falls back to
    /// [`DEFAULT_DIMENSIONS`].
    #[serde(default)]
    pub dimensions: Option<usize>,
}

fn default_embedding_model() -> String { "text-embedding-3-small".to_string() }

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: default_embedding_model(),
            api_key: None,
            dimensions: None,
        }
    }
}

impl EmbeddingSettings {
    /// HTTP client settings, when an endpoint is configured.
    pub fn http_config(&self) -> Option<HttpEmbedderConfig> {
        self.endpoint.as_ref().map(|endpoint| HttpEmbedderConfig {
            endpoint: endpoint.clone(),
            model: self.model.clone(),
            api_key: self.api_key.clone(),
            dimensions: self.dimensions,
        })
    }

    /// Width of the local hashing embedder.
    pub fn hashing_dimensions(&self) -> usize {
        self.dimensions.unwrap_or(DEFAULT_DIMENSIONS)
    }
}

// ---------------------------------------------------------------------------
// RegistryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub graph: GraphSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub search: SearchSettings,
    #[serde(default)]
    pub embedding: EmbeddingSettings,
}

impl RegistryConfig {
    /// Parse, resolve `${VAR}` secrets and validate.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: RegistryConfig = if yaml.trim().is_empty() {
            RegistryConfig::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.resolve_secrets();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        log::debug!("Loaded config from {}", path.as_ref().display());
        Self::from_yaml_str(&raw)
    }

    /// Apply `CAPGRAPH_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary lookup, then re-validate.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CAPGRAPH_GRAPH_URI") {
            self.graph.uri = v;
        }
        if let Some(v) = lookup("CAPGRAPH_GRAPH_USER") {
            self.graph.user = v;
        }
        if let Some(v) = lookup("CAPGRAPH_GRAPH_PASSWORD") {
            self.graph.password = v;
        }
        if let Some(v) = lookup("CAPGRAPH_GRAPH_DATABASE") {
            self.graph.database = v;
        }
        if let Some(v) = lookup("CAPGRAPH_GRAPH_MAX_SESSIONS") {
            self.graph.max_sessions = parse_override("CAPGRAPH_GRAPH_MAX_SESSIONS", &v)?;
        }
        if let Some(v) = lookup("CAPGRAPH_STREAM_KEY") {
            self.stream.key = v;
        }
        if let Some(v) = lookup("CAPGRAPH_CACHE_PREFIX") {
            self.cache.prefix = v;
        }
        if let Some(v) = lookup("CAPGRAPH_EMBEDDING_ENDPOINT") {
            self.embedding.endpoint = Some(v);
        }
        if let Some(v) = lookup("CAPGRAPH_EMBEDDING_API_KEY") {
            self.embedding.api_key = Some(v);
        }
        self.validate()
    }

    fn resolve_secrets(&mut self) {
        self.graph.password = resolve_env(&self.graph.password);
        if let Some(key) = self.embedding.api_key.as_mut() {
            *key = resolve_env(key);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.graph.uri.is_empty() {
            return Err(ConfigError::Invalid("graph.uri must not be empty".into()));
        }
        if self.graph.max_sessions == 0 {
            return Err(ConfigError::Invalid("graph.max_sessions must be at least 1".into()));
        }
        if self.graph.max_retries == 0 {
            return Err(ConfigError::Invalid("graph.max_retries must be at least 1".into()));
        }
        if self.stream.key.is_empty() {
            return Err(ConfigError::Invalid("stream.key must not be empty".into()));
        }
        if self.stream.batch_size == 0 {
            return Err(ConfigError::Invalid("stream.batch_size must be at least 1".into()));
        }
        let w = &self.search.weights;
        if w.semantic < 0.0 || w.functional < 0.0 || w.contextual < 0.0 {
            return Err(ConfigError::Invalid("search.weights must not be negative".into()));
        }
        if w.semantic + w.functional + w.contextual <= 0.0 {
            return Err(ConfigError::Invalid("search.weights must not all be zero".into()));
        }
        if !(-1.0..=1.0).contains(&self.search.threshold) {
            return Err(ConfigError::Invalid(format!(
                "search.threshold {} is outside [-1, 1]",
                self.search.threshold
            )));
        }
        if self.embedding.dimensions == Some(0) {
            return Err(ConfigError::Invalid("embedding.dimensions must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{} has an invalid value: {}", name, value)))
}

/// Resolve a `${VAR}` reference; any other value is returned as-is.
pub fn resolve_env(s: &str) -> String {
    if s.starts_with("${") && s.ends_with('}') {
        let var_name = &s[2..s.len() - 1];
        std::env::var(var_name).unwrap_or_default()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = RegistryConfig::from_yaml_str("").unwrap();
        assert_eq!(config, RegistryConfig::default());
        assert_eq!(config.graph.max_sessions, 50);
        assert_eq!(config.stream.key, "capgraph:metadata_updates");
        assert_eq!(config.cache.ttl.search, 30);
        assert!(!config.graph.is_remote());
        assert!(config.embedding.http_config().is_none());
    }

    #[test]
    fn test_partial_sections() {
        let yaml = r#"
graph:
  uri: http://graph:7474
  max_retries: 5
  retry_delay_ms: 250
stream:
  batch_size: 20
cache:
  ttl:
    tool: 600
search:
  weights:
    semantic: 0.6
"#;
        let config = RegistryConfig::from_yaml_str(yaml).unwrap();
        assert!(config.graph.is_remote());
        assert_eq!(config.graph.user, "neo4j");
        let policy = config.graph.retry_policy();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.delay_after(2), Duration::from_millis(500));
        assert_eq!(config.stream.consumer_config().batch_size, 20);
        assert_eq!(config.stream.consumer_config().block, Duration::from_secs(10));
        assert_eq!(config.cache.ttl.tool, 600);
        assert_eq!(config.cache.ttl.tool_list, 60);
        assert_eq!(config.search.weights.semantic, 0.6);
        assert_eq!(config.search.weights.functional, 0.3);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            RegistryConfig::from_yaml_str("graph:\n  max_sessions: 0\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            RegistryConfig::from_yaml_str("search:\n  threshold: 1.5\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            RegistryConfig::from_yaml_str("graph: [not, a, map]"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_secret_resolution() {
        std::env::set_var("CAPGRAPH_TEST_GRAPH_SECRET", "hunter2");
        let config = RegistryConfig::from_yaml_str(
            "graph:\n  password: ${CAPGRAPH_TEST_GRAPH_SECRET}\nembedding:\n  endpoint: http://e/v1\n  api_key: plain\n",
        )
        .unwrap();
        assert_eq!(config.graph.password, "hunter2");
        let http = config.embedding.http_config().unwrap();
        assert_eq!(http.api_key.as_deref(), Some("plain"));
        assert_eq!(http.dimensions, None);
        assert_eq!(config.embedding.hashing_dimensions(), 512);
        assert_eq!(resolve_env("${CAPGRAPH_TEST_UNSET_VARIABLE}"), "");
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("CAPGRAPH_GRAPH_URI", "https://graph.internal:7473"),
            ("CAPGRAPH_GRAPH_MAX_SESSIONS", "8"),
            ("CAPGRAPH_STREAM_KEY", "staging:updates"),
        ]
        .into_iter()
        .collect();
        let mut config = RegistryConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.graph.http_config().uri, "https://graph.internal:7473");
        assert_eq!(config.graph.max_sessions, 8);
        assert_eq!(config.stream.key, "staging:updates");

        let bad: HashMap<&str, &str> = [("CAPGRAPH_GRAPH_MAX_SESSIONS", "many")].into_iter().collect();
        assert!(config.apply_overrides(|k| bad.get(k).map(|v| v.to_string())).is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cache:\n  prefix: node-a").unwrap();
        let config = RegistryConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cache.prefix, "node-a");

        let missing = RegistryConfig::from_file("/nonexistent/capgraph.yaml");
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
