//! Graph store access.
//!
//! Layers, leaves first:
//!
//! - [`GraphDriver`] / [`GraphSession`]: the consumed graph query protocol.
//!   Implemented by [`http::HttpGraphDriver`] (Neo4j HTTP transactional
//!   endpoint) and [`memory::MemoryGraph`] (in-process).
//! - [`pool::ConnectionPool`]: bounded, health-checked session acquisition.
//! - [`transaction::TransactionManager`]: begin/commit/close with linear
//!   backoff retries.
//! - [`rewriter::QueryRewriter`]: similarity-extension fallback rewriting and
//!   read/write classification.
//! - [`service::GraphService`]: the handle every other component is given.

pub mod http;
pub mod memory;
pub mod pool;
pub mod queries;
pub mod rewriter;
pub mod service;
pub mod transaction;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use memory::MemoryGraph;
pub use pool::{ConnectionPool, PoolHealth, PooledSession};
pub use rewriter::{classify_access, QueryRewriter, Rewrite};
pub use service::{GraphService, ServiceHealth};
pub use transaction::{RetryPolicy, TransactionManager};

/// Query parameters. Values must be primitives, strings or flat lists.
pub type Params = HashMap<String, Value>;

/// One result row, keyed by column name.
pub type Record = serde_json::Map<String, Value>;

/// Declared access mode of a session or transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    Write,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
        }
    }
}

/// A parameterized query.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub text: String,
    pub params: Params,
}

impl Statement {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Params::new(),
        }
    }

    pub fn with_params(text: impl Into<String>, params: Params) -> Self {
        Self {
            text: text.into(),
            params,
        }
    }

    /// Bind a single parameter.
    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

/// Errors from the graph layer.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The store could not be reached or failed verification.
    #[error("Graph connectivity error: {0}")]
    Connectivity(String),

    /// Opening, using or closing a session failed.
    #[error("Graph session error: {0}")]
    Session(String),

    /// The store rejected or failed a query.
    #[error("Graph query error: {0}")]
    Query(String),

    /// A value could not be bound or decoded.
    #[error("Graph serialization error: {0}")]
    Serialization(String),

    /// The pool has been closed.
    #[error("Connection pool is closed")]
    PoolClosed,
}

/// Driver for a remote (or in-process) graph store.
#[async_trait]
pub trait GraphDriver: Send + Sync {
    /// Open the underlying driver (authenticate, resolve routing, ...).
    async fn connect(&self) -> Result<(), GraphError>;

    /// Open a session in the given access mode.
    async fn session(&self, mode: AccessMode) -> Result<Box<dyn GraphSession>, GraphError>;

    /// Release driver resources.
    async fn close(&self) -> Result<(), GraphError>;
}

/// A session on the graph store. Statements run outside an explicit
/// transaction are auto-committed.
#[async_trait]
pub trait GraphSession: Send {
    async fn begin(&mut self) -> Result<(), GraphError>;

    async fn run(&mut self, statement: &Statement) -> Result<Vec<Record>, GraphError>;

    async fn commit(&mut self) -> Result<(), GraphError>;

    async fn rollback(&mut self) -> Result<(), GraphError>;

    async fn close(&mut self) -> Result<(), GraphError>;
}

// ---------------------------------------------------------------------------
// Record helpers
// ---------------------------------------------------------------------------

/// Read a string column; `null` and missing columns yield `None`.
pub fn record_str(record: &Record, column: &str) -> Option<String> {
    record.get(column).and_then(Value::as_str).map(str::to_string)
}

/// Read a numeric column as `f64`.
pub fn record_f64(record: &Record, column: &str) -> Option<f64> {
    record.get(column).and_then(Value::as_f64)
}

/// Read a numeric column as `u64`.
pub fn record_u64(record: &Record, column: &str) -> Option<u64> {
    record.get(column).and_then(Value::as_u64)
}

/// Read a list-of-strings column.
pub fn record_strings(record: &Record, column: &str) -> Vec<String> {
    record
        .get(column)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Encode a vector as a flat list parameter.
pub fn vector_param(v: &[f32]) -> Value {
    Value::Array(v.iter().map(|x| Value::from(f64::from(*x))).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_builder_binds_params() {
        let s = Statement::new("RETURN $x AS x").param("x", 3).param("y", "z");
        assert_eq!(s.params["x"], Value::from(3));
        assert_eq!(s.params["y"], Value::from("z"));
    }

    #[test]
    fn test_record_helpers() {
        let mut r = Record::new();
        r.insert("name".into(), Value::from("kb"));
        r.insert("score".into(), Value::from(0.5));
        r.insert("count".into(), Value::from(3));
        r.insert("tags".into(), serde_json::json!(["a", 1, "b"]));
        r.insert("missing".into(), Value::Null);

        assert_eq!(record_str(&r, "name").as_deref(), Some("kb"));
        assert_eq!(record_str(&r, "missing"), None);
        assert_eq!(record_f64(&r, "score"), Some(0.5));
        assert_eq!(record_u64(&r, "count"), Some(3));
        assert_eq!(record_strings(&r, "tags"), vec!["a", "b"]);
    }
}
