//! Versioned cache layer.
//!
//! Keys have the shape `prefix:v{version}:namespace:key`. Bumping the version
//! makes every previously written key unreachable without touching the
//! backend. Reads and writes never fail from the caller's point of view: a
//! backend error is logged and treated as a miss (or as "not stored").
//!
//! Pattern invalidation scans in bounded batches of [`SCAN_BATCH`] keys and
//! deletes each batch in one round trip, so its cost grows with the number of
//! matching keys, never with the size of the keyspace.

pub mod memory;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryCacheBackend;

/// Current key-format version.
pub const CACHE_VERSION: u32 = 1;

pub const DEFAULT_PREFIX: &str = "capgraph";

/// Upper bound on keys fetched (and deleted) per invalidation round trip.
pub const SCAN_BATCH: usize = 10_000;

/// Namespaces used by the registry.
pub mod namespace {
    pub const TOOL: &str = "tool";
    pub const TOOL_LIST: &str = "tool_list";
    pub const PROMPT: &str = "prompt";
    pub const PROMPT_LIST: &str = "prompt_list";
    pub const RESOURCE: &str = "resource";
    pub const RESOURCE_LIST: &str = "resource_list";
    pub const SEARCH: &str = "search";
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(String),

    #[error("Cache value could not be encoded: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key-value store with TTLs and glob scans.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// `true` when a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Up to `limit` live keys matching a glob pattern (`*`, `?`).
    async fn scan(&self, pattern: &str, limit: usize) -> Result<Vec<String>, CacheError>;

    /// Delete keys in one round trip; returns how many existed.
    async fn delete_many(&self, keys: &[String]) -> Result<usize, CacheError>;
}

/// Default TTL per namespace, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTtls {
    #[serde(default = "default_tool_ttl")]
    pub tool: u64,
    #[serde(default = "default_tool_list_ttl")]
    pub tool_list: u64,
    #[serde(default = "default_prompt_ttl")]
    pub prompt: u64,
    #[serde(default = "default_resource_ttl")]
    pub resource: u64,
    #[serde(default = "default_search_ttl")]
    pub search: u64,
}

fn default_tool_ttl() -> u64 {
    300
}

fn default_tool_list_ttl() -> u64 {
    60
}

fn default_prompt_ttl() -> u64 {
    300
}

fn default_resource_ttl() -> u64 {
    300
}

fn default_search_ttl() -> u64 {
    30
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            tool: default_tool_ttl(),
            tool_list: default_tool_list_ttl(),
            prompt: default_prompt_ttl(),
            resource: default_resource_ttl(),
            search: default_search_ttl(),
        }
    }
}

impl CacheTtls {
    /// TTL for a namespace; list namespaces other than tools share the tool-list TTL.
    pub fn for_namespace(&self, ns: &str) -> Duration {
        let secs = match ns {
            namespace::TOOL => self.tool,
            namespace::PROMPT => self.prompt,
            namespace::RESOURCE => self.resource,
            namespace::SEARCH => self.search,
            _ => self.tool_list,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Clone)]
pub struct VersionedCache {
    backend: Arc<dyn CacheBackend>,
    prefix: String,
    version: u32,
    ttls: CacheTtls,
}

impl VersionedCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            prefix: DEFAULT_PREFIX.to_string(),
            version: CACHE_VERSION,
            ttls: CacheTtls::default(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Use a different key-format version (mainly for migrations and tests).
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_ttls(mut self, ttls: CacheTtls) -> Self {
        self.ttls = ttls;
        self
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Full backend key.
    pub fn key(&self, ns: &str, key: &str) -> String {
        format!("{}:v{}:{}:{}", self.prefix, self.version, ns, key)
    }

    /// Cached value, or `None` on miss, decode failure or backend error.
    pub async fn get<T: DeserializeOwned>(&self, ns: &str, key: &str) -> Option<T> {
        let full = self.key(ns, key);
        match self.backend.get(&full).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    log::warn!("Discarding undecodable cache entry {}: {}", full, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                log::warn!("Cache get failed for {}: {}", full, e);
                None
            }
        }
    }

    /// Store a value; `ttl` defaults to the namespace TTL. `false` on failure.
    pub async fn set<T: Serialize>(&self, ns: &str, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        let full = self.key(ns, key);
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("Cache value for {} could not be encoded: {}", full, e);
                return false;
            }
        };
        let ttl = ttl.unwrap_or_else(|| self.ttls.for_namespace(ns));
        match self.backend.set(&full, raw, Some(ttl)).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Cache set failed for {}: {}", full, e);
                false
            }
        }
    }

    pub async fn delete(&self, ns: &str, key: &str) -> bool {
        let full = self.key(ns, key);
        match self.backend.delete(&full).await {
            Ok(deleted) => deleted,
            Err(e) => {
                log::warn!("Cache delete failed for {}: {}", full, e);
                false
            }
        }
    }

    /// Delete every key matching `pattern` (relative to the versioned prefix,
    /// e.g. `tool_list:*`). Returns the number of keys deleted.
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        let full = format!("{}:v{}:{}", self.prefix, self.version, pattern);
        let mut total = 0;
        loop {
            let keys = match self.backend.scan(&full, SCAN_BATCH).await {
                Ok(keys) => keys,
                Err(e) => {
                    log::warn!("Cache scan failed for {}: {}", full, e);
                    break;
                }
            };
            let batch = keys.len();
            if batch > 0 {
                match self.backend.delete_many(&keys).await {
                    Ok(n) => total += n,
                    Err(e) => {
                        log::warn!("Cache delete failed for {}: {}", full, e);
                        break;
                    }
                }
            }
            if batch < SCAN_BATCH {
                break;
            }
        }
        log::debug!("Invalidated {} cache key(s) matching {}", total, full);
        total
    }

    /// Drop a tool, every tool listing and every cached search.
    pub async fn invalidate_tool(&self, name: &str) -> usize {
        let mut total = usize::from(self.delete(namespace::TOOL, name).await);
        total += self.invalidate_pattern(&format!("{}:*", namespace::TOOL_LIST)).await;
        total += self.invalidate_pattern(&format!("{}:*", namespace::SEARCH)).await;
        total
    }

    pub async fn invalidate_prompt(&self, name: &str) -> usize {
        let mut total = usize::from(self.delete(namespace::PROMPT, name).await);
        total += self.invalidate_pattern(&format!("{}:*", namespace::PROMPT_LIST)).await;
        total
    }

    pub async fn invalidate_resource(&self, uri: &str) -> usize {
        let mut total = usize::from(self.delete(namespace::RESOURCE, uri).await);
        total += self.invalidate_pattern(&format!("{}:*", namespace::RESOURCE_LIST)).await;
        total
    }
}

/// Return the cached value for `(ns, key)`, or run `op`, cache its `Ok`
/// result and return it. Errors from `op` are returned and not cached.
pub async fn cached<T, E, F, Fut>(
    cache: &VersionedCache,
    ns: &str,
    key: &str,
    ttl: Option<Duration>,
    op: F,
) -> Result<T, E>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    if let Some(hit) = cache.get::<T>(ns, key).await {
        log::debug!("Cache hit {}:{}", ns, key);
        return Ok(hit);
    }
    let value = op().await?;
    cache.set(ns, key, &value, ttl).await;
    Ok(value)
}
