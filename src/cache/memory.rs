//! In-process cache backend.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;

use super::{CacheBackend, CacheError};

struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

#[derive(Default)]
struct Inner {
    entries: DashMap<String, Slot>,
    scan_calls: AtomicUsize,
    delete_many_calls: AtomicUsize,
    failing: AtomicBool,
}

/// `DashMap`-backed store with lazy TTL expiry. Counts scan and bulk-delete
/// round trips so callers can observe batching.
#[derive(Clone, Default)]
pub struct MemoryCacheBackend {
    inner: Arc<Inner>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail until switched off again.
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    pub fn scan_calls(&self) -> usize {
        self.inner.scan_calls.load(Ordering::SeqCst)
    }

    pub fn delete_many_calls(&self) -> usize {
        self.inner.delete_many_calls.load(Ordering::SeqCst)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner.entries.iter().filter(|e| e.value().is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Backend("connection refused".into()));
        }
        Ok(())
    }
}

/// Translate a glob (`*`, `?`) into an anchored regex.
fn glob_to_regex(pattern: &str) -> Result<Regex, CacheError> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| CacheError::Backend(format!("bad pattern {}: {}", pattern, e)))
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check()?;
        let now = Instant::now();
        let expired = match self.inner.entries.get(key) {
            Some(slot) if slot.is_live(now) => return Ok(Some(slot.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.inner.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.check()?;
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.inner.entries.insert(key.to_string(), Slot { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .inner
            .entries
            .remove(key)
            .map(|(_, slot)| slot.is_live(now))
            .unwrap_or(false))
    }

    async fn scan(&self, pattern: &str, limit: usize) -> Result<Vec<String>, CacheError> {
        self.check()?;
        self.inner.scan_calls.fetch_add(1, Ordering::SeqCst);
        let re = glob_to_regex(pattern)?;
        let now = Instant::now();
        Ok(self
            .inner
            .entries
            .iter()
            .filter(|e| e.value().is_live(now) && re.is_match(e.key()))
            .take(limit)
            .map(|e| e.key().clone())
            .collect())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize, CacheError> {
        self.check()?;
        self.inner.delete_many_calls.fetch_add(1, Ordering::SeqCst);
        let now = Instant::now();
        Ok(keys
            .iter()
            .filter_map(|k| self.inner.entries.remove(k))
            .filter(|(_, slot)| slot.is_live(now))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_translation() {
        let re = glob_to_regex("capgraph:v1:tool_list:*").unwrap();
        assert!(re.is_match("capgraph:v1:tool_list:all"));
        assert!(!re.is_match("capgraph:v1:tool:all"));
        assert!(!re.is_match("capgraph:v11:tool_list:all"));

        let single = glob_to_regex("a?c").unwrap();
        assert!(single.is_match("abc"));
        assert!(!single.is_match("abbc"));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let backend = MemoryCacheBackend::new();
        backend.set("k", "v".into(), Some(Duration::from_millis(20))).await.unwrap();
        backend.set("forever", "v".into(), None).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert_eq!(backend.scan("*", 10).await.unwrap(), vec!["forever".to_string()]);
    }

    #[tokio::test]
    async fn test_scan_respects_limit() {
        let backend = MemoryCacheBackend::new();
        for i in 0..5 {
            backend.set(&format!("k{}", i), "v".into(), None).await.unwrap();
        }
        assert_eq!(backend.scan("k*", 3).await.unwrap().len(), 3);
        assert_eq!(backend.scan_calls(), 1);
    }

    #[tokio::test]
    async fn test_failing_backend() {
        let backend = MemoryCacheBackend::new();
        backend.set_failing(true);
        tokio_test::assert_err!(backend.get("k").await);
        tokio_test::assert_err!(backend.scan("*", 1).await);
    }
}
