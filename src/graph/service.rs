//! The graph service handle.
//!
//! [`GraphService`] bundles the pool, the transaction manager and the
//! fallback rewriter behind one object. It is constructed once, wrapped in an
//! `Arc` and handed to every component that talks to the graph.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::pool::{ConnectionPool, PoolHealth};
use super::rewriter::{classify_access, QueryRewriter};
use super::transaction::{RetryPolicy, TransactionManager};
use super::{queries, AccessMode, GraphDriver, GraphError, Params, Record, Statement};

/// Pool health plus the extension flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceHealth {
    pub pool: PoolHealth,
    pub extension_available: bool,
}

pub struct GraphService {
    pool: Arc<ConnectionPool>,
    transactions: TransactionManager,
    rewriter: QueryRewriter,
    extension_available: AtomicBool,
}

impl GraphService {
    pub fn new(driver: Arc<dyn GraphDriver>, max_sessions: usize, policy: RetryPolicy) -> Self {
        let pool = Arc::new(ConnectionPool::new(driver, max_sessions));
        Self {
            transactions: TransactionManager::new(Arc::clone(&pool), policy),
            pool,
            rewriter: QueryRewriter::with_builtin_fallbacks(),
            extension_available: AtomicBool::new(false),
        }
    }

    /// Replace the rewriter, e.g. to register extra known-query fallbacks.
    pub fn with_rewriter(mut self, rewriter: QueryRewriter) -> Self {
        self.rewriter = rewriter;
        self
    }

    /// Open the pool (fatal on connectivity failure), then probe for the
    /// similarity extension (never fatal).
    pub async fn initialize(&self) -> Result<(), GraphError> {
        self.pool.initialize().await?;
        let available = self.detect_extension().await;
        if available {
            log::info!("Graph similarity extension detected");
        } else {
            log::warn!("Graph similarity extension not available; similarity queries will be rewritten");
        }
        Ok(())
    }

    /// Single-attempt probe; the result is stored and returned.
    pub async fn detect_extension(&self) -> bool {
        let outcome: Result<_, GraphError> = async {
            let mut session = self.pool.session(AccessMode::Read).await?;
            let result = session.run(&Statement::new(queries::EXTENSION_PROBE)).await;
            session.release().await;
            result
        }
        .await;

        let available = match outcome {
            Ok(_) => true,
            Err(e) => {
                log::debug!("Extension probe failed: {}", e);
                false
            }
        };
        self.extension_available.store(available, Ordering::SeqCst);
        available
    }

    pub fn extension_available(&self) -> bool {
        self.extension_available.load(Ordering::SeqCst)
    }

    /// The text that will actually be submitted for `query`.
    pub fn prepare<'q>(&'q self, query: &'q str) -> Cow<'q, str> {
        if self.extension_available() {
            return Cow::Borrowed(query);
        }
        self.rewriter.rewrite(query).into_text(query)
    }

    fn prepare_statement(&self, statement: &Statement) -> Statement {
        match self.prepare(&statement.text) {
            Cow::Borrowed(text) if text == statement.text => statement.clone(),
            text => Statement::with_params(text.into_owned(), statement.params.clone()),
        }
    }

    /// Run one query. A write keyword in the text overrides `read_only`.
    pub async fn query(&self, text: &str, params: Params, read_only: bool) -> Result<Vec<Record>, GraphError> {
        let mut results = self
            .run(&[Statement::with_params(text, params)], read_only)
            .await?;
        Ok(results.pop().unwrap_or_default())
    }

    /// Run statements as one read unit of work, escalated to a write unit if
    /// any statement mutates.
    pub async fn read(&self, statements: &[Statement]) -> Result<Vec<Vec<Record>>, GraphError> {
        self.run(statements, true).await
    }

    /// Run statements as one write unit of work.
    pub async fn write(&self, statements: &[Statement]) -> Result<Vec<Vec<Record>>, GraphError> {
        self.run(statements, false).await
    }

    async fn run(&self, statements: &[Statement], read_only: bool) -> Result<Vec<Vec<Record>>, GraphError> {
        let mode = if statements
            .iter()
            .any(|s| classify_access(&s.text, read_only) == AccessMode::Write)
        {
            AccessMode::Write
        } else {
            AccessMode::Read
        };
        let prepared: Vec<Statement> = statements.iter().map(|s| self.prepare_statement(s)).collect();
        self.transactions.execute(mode, &prepared).await
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn health(&self) -> ServiceHealth {
        ServiceHealth {
            pool: self.pool.health(),
            extension_available: self.extension_available(),
        }
    }

    pub async fn close(&self) -> Result<(), GraphError> {
        self.pool.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::memory::MemoryGraph;
    use std::time::Duration;

    fn service(graph: &MemoryGraph) -> GraphService {
        GraphService::new(
            Arc::new(graph.clone()),
            4,
            RetryPolicy {
                max_retries: 1,
                retry_delay: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn test_initialize_detects_extension() {
        let graph = MemoryGraph::new();
        let svc = service(&graph);
        svc.initialize().await.unwrap();
        assert!(svc.extension_available());
        assert_eq!(svc.prepare(queries::SEARCH_BY_CAPABILITY), queries::SEARCH_BY_CAPABILITY);
        assert!(svc.health().pool.healthy);
    }

    #[tokio::test]
    async fn test_missing_extension_is_not_fatal() {
        let graph = MemoryGraph::new().with_extension(false);
        let svc = service(&graph);
        svc.initialize().await.unwrap();
        assert!(!svc.extension_available());
        assert_eq!(
            svc.prepare(queries::SEARCH_BY_CAPABILITY),
            queries::SEARCH_BY_CAPABILITY_FALLBACK
        );
        assert_eq!(svc.prepare(queries::PING), queries::PING);
    }

    #[tokio::test]
    async fn test_unreachable_store_is_fatal() {
        let graph = MemoryGraph::new();
        graph.set_reachable(false);
        let svc = service(&graph);
        assert!(matches!(svc.initialize().await, Err(GraphError::Connectivity(_))));
    }

    #[tokio::test]
    async fn test_write_keyword_escalates_read_hint() {
        let graph = MemoryGraph::new();
        let svc = service(&graph);
        svc.initialize().await.unwrap();

        let meta = crate::types::CapabilityMetadata::database("db:crm", "crm", "", Default::default());
        let upsert = crate::sync::statements_for(&meta).unwrap().remove(0);
        svc.query(&upsert.text, upsert.params.clone(), true).await.unwrap();
        assert!(graph.has_catalog_node("db:crm"));
        assert_eq!(graph.write_count(), 1);

        let rows = svc.query(queries::PING, Params::new(), true).await.unwrap();
        assert_eq!(rows[0]["ok"], 1);
        assert_eq!(graph.write_count(), 1);
    }
}
