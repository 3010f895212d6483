//! Connection pool over a [`GraphDriver`].
//!
//! The pool opens the driver once, verifies connectivity, and hands out
//! scoped sessions. Concurrency is bounded by a semaphore sized to
//! `max_sessions`; the active-session counter is guarded by a mutex and is
//! decremented by [`PooledSession`]'s `Drop`, so every exit path releases it.
//! A session dropped without [`PooledSession::release`] (a cancelled unit of
//! work) is closed in the background, which rolls back any open transaction.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};

use super::{queries, AccessMode, GraphDriver, GraphError, GraphSession, Record, Statement};

/// Default bound on concurrently open sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 50;

/// Snapshot of the pool's health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolHealth {
    pub healthy: bool,
    pub active_sessions: usize,
    pub max_sessions: usize,
}

pub struct ConnectionPool {
    driver: Arc<dyn GraphDriver>,
    opened: OnceCell<()>,
    permits: Arc<Semaphore>,
    active: Arc<Mutex<usize>>,
    healthy: AtomicBool,
    max_sessions: usize,
}

impl ConnectionPool {
    pub fn new(driver: Arc<dyn GraphDriver>, max_sessions: usize) -> Self {
        let max_sessions = max_sessions.max(1);
        Self {
            driver,
            opened: OnceCell::new(),
            permits: Arc::new(Semaphore::new(max_sessions)),
            active: Arc::new(Mutex::new(0)),
            healthy: AtomicBool::new(false),
            max_sessions,
        }
    }

    /// Open the driver (once) and verify connectivity.
    ///
    /// Calling this again after a successful open only re-runs verification.
    /// A failed verification is returned as [`GraphError::Connectivity`].
    pub async fn initialize(&self) -> Result<(), GraphError> {
        self.opened
            .get_or_try_init(|| async {
                log::info!("Opening graph driver");
                self.driver.connect().await
            })
            .await?;

        if self.verify_connectivity().await {
            Ok(())
        } else {
            Err(GraphError::Connectivity(
                "connectivity verification failed".to_string(),
            ))
        }
    }

    /// Run a trivial round-trip query on a throwaway session and record the
    /// outcome in the health flag. Never fails; callers read the flag.
    pub async fn verify_connectivity(&self) -> bool {
        let outcome: Result<_, GraphError> = async {
            let mut session = self.session(AccessMode::Read).await?;
            let result = session.run(&Statement::new(queries::PING)).await;
            session.release().await;
            result
        }
        .await;

        let healthy = match outcome {
            Ok(_) => true,
            Err(e) => {
                log::warn!("Graph connectivity check failed: {}", e);
                false
            }
        };
        self.healthy.store(healthy, Ordering::SeqCst);
        healthy
    }

    /// Acquire a session, waiting while `max_sessions` are already in use.
    pub async fn session(&self, mode: AccessMode) -> Result<PooledSession, GraphError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GraphError::PoolClosed)?;

        let inner = self.driver.session(mode).await?;

        *self.active.lock() += 1;
        Ok(PooledSession {
            inner,
            mode,
            released: false,
            active: Arc::clone(&self.active),
            _permit: permit,
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn active_sessions(&self) -> usize {
        *self.active.lock()
    }

    pub fn health(&self) -> PoolHealth {
        PoolHealth {
            healthy: self.is_healthy(),
            active_sessions: self.active_sessions(),
            max_sessions: self.max_sessions,
        }
    }

    /// Stop handing out sessions and close the driver.
    pub async fn close(&self) -> Result<(), GraphError> {
        self.permits.close();
        self.healthy.store(false, Ordering::SeqCst);
        if self.opened.initialized() {
            self.driver.close().await?;
        }
        Ok(())
    }
}

/// A session checked out of the pool.
pub struct PooledSession {
    inner: Box<dyn GraphSession>,
    mode: AccessMode,
    released: bool,
    active: Arc<Mutex<usize>>,
    _permit: OwnedSemaphorePermit,
}

impl PooledSession {
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Close the underlying session. Close errors are logged, not returned:
    /// the unit of work has already succeeded or failed by this point.
    pub async fn release(mut self) {
        if let Err(e) = self.inner.close().await {
            log::debug!("Error closing graph session: {}", e);
        }
        self.released = true;
    }
}

impl Deref for PooledSession {
    type Target = dyn GraphSession;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut()
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        {
            let mut active = self.active.lock();
            *active = active.saturating_sub(1);
        }
        if self.released {
            return;
        }
        let mut inner = std::mem::replace(&mut self.inner, Box::new(Detached));
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = inner.close().await {
                        log::debug!("Error closing abandoned graph session: {}", e);
                    }
                });
            }
            Err(_) => log::warn!("Graph session dropped outside a runtime; not closed"),
        }
    }
}

/// Stands in for a session whose close was handed off by `Drop`.
struct Detached;

#[async_trait]
impl GraphSession for Detached {
    async fn begin(&mut self) -> Result<(), GraphError> {
        Err(detached())
    }

    async fn run(&mut self, _statement: &Statement) -> Result<Vec<Record>, GraphError> {
        Err(detached())
    }

    async fn commit(&mut self) -> Result<(), GraphError> {
        Err(detached())
    }

    async fn rollback(&mut self) -> Result<(), GraphError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), GraphError> {
        Ok(())
    }
}

fn detached() -> GraphError {
    GraphError::Session("session already closed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::memory::MemoryGraph;

    #[tokio::test]
    async fn test_initialize_is_idempotent_and_healthy() {
        let graph = MemoryGraph::new();
        let pool = ConnectionPool::new(Arc::new(graph.clone()), 4);
        pool.initialize().await.unwrap();
        pool.initialize().await.unwrap();
        assert_eq!(graph.connect_count(), 1);
        assert!(pool.health().healthy);
        assert_eq!(pool.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_initialize_fails_when_unreachable() {
        let graph = MemoryGraph::new();
        graph.set_reachable(false);
        let pool = ConnectionPool::new(Arc::new(graph), 4);
        let err = pool.initialize().await.unwrap_err();
        assert!(matches!(err, GraphError::Connectivity(_)));
        assert!(!pool.is_healthy());
    }

    #[tokio::test]
    async fn test_verify_connectivity_flips_flag_without_error() {
        let graph = MemoryGraph::new();
        let pool = ConnectionPool::new(Arc::new(graph.clone()), 2);
        pool.initialize().await.unwrap();

        graph.set_reachable(false);
        assert!(!pool.verify_connectivity().await);
        assert!(!pool.health().healthy);

        graph.set_reachable(true);
        assert!(pool.verify_connectivity().await);
    }

    #[tokio::test]
    async fn test_session_counter_released_on_every_path() {
        let graph = MemoryGraph::new();
        let pool = ConnectionPool::new(Arc::new(graph), 2);
        pool.initialize().await.unwrap();

        let a = pool.session(AccessMode::Read).await.unwrap();
        let mut b = pool.session(AccessMode::Write).await.unwrap();
        assert_eq!(pool.active_sessions(), 2);

        // error path: the statement fails, the guard still releases
        assert!(b.run(&Statement::new("NOT A QUERY")).await.is_err());
        drop(b);
        assert_eq!(pool.active_sessions(), 1);

        a.release().await;
        assert_eq!(pool.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_max_sessions_bounds_concurrency() {
        let graph = MemoryGraph::new();
        let pool = Arc::new(ConnectionPool::new(Arc::new(graph), 1));
        pool.initialize().await.unwrap();

        let held = pool.session(AccessMode::Read).await.unwrap();
        let waiting = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            pool.session(AccessMode::Read),
        )
        .await;
        assert!(waiting.is_err(), "second session should wait for a permit");

        drop(held);
        let again = pool.session(AccessMode::Read).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_sessions() {
        let pool = ConnectionPool::new(Arc::new(MemoryGraph::new()), 2);
        pool.initialize().await.unwrap();
        pool.close().await.unwrap();
        assert!(matches!(
            pool.session(AccessMode::Read).await,
            Err(GraphError::PoolClosed)
        ));
    }
}
