//! In-process graph backend.
//!
//! [`MemoryGraph`] implements [`GraphDriver`] by executing the statement
//! catalogue in [`queries`](super::queries) against plain maps. It is not a
//! Cypher interpreter: any text outside the catalogue is rejected with
//! [`GraphError::Query`], the same way a real store rejects a bad query.
//!
//! A transaction reads from a snapshot taken at `begin` and records its
//! writes. Commit replays the recorded writes against the live state under
//! the lock, so concurrent transactions never overwrite each other and a
//! failed unit of work leaves nothing behind. Committed write transactions
//! are counted, which is how tests assert "zero writes".
//!
//! The handle is cheap to clone; clones share state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::rewriter::{classify_access, SIMILARITY_FUNCTION};
use super::{queries, AccessMode, GraphDriver, GraphError, GraphSession, Params, Record, Statement};
use crate::embeddings::cosine_similarity;

/// Vector categories every index node is created with.
const CATEGORIES: [&str; 3] = ["semantic", "functional", "contextual"];

/// The nine vector-source properties stored on an index node.
const SOURCE_FIELDS: [&str; 9] = [
    "core_concept",
    "domain",
    "service_type",
    "operation",
    "input_spec",
    "output_spec",
    "usage_context",
    "prerequisites",
    "constraints",
];

#[derive(Debug, Clone, Default)]
struct CatalogNode {
    props: Record,
    collections: BTreeMap<String, Record>,
    tables: BTreeMap<String, Record>,
}

#[derive(Debug, Clone)]
struct StoredVector {
    embedding: Vec<f32>,
    norm: f64,
}

#[derive(Debug, Clone, Default)]
struct IndexNode {
    props: Record,
    vectors: BTreeMap<String, StoredVector>,
}

#[derive(Debug, Clone, Default)]
struct GraphState {
    catalog: BTreeMap<String, CatalogNode>,
    index: BTreeMap<String, IndexNode>,
}

struct Inner {
    state: Mutex<GraphState>,
    reachable: AtomicBool,
    extension: AtomicBool,
    connects: AtomicUsize,
    pending_failures: AtomicUsize,
    writes: AtomicUsize,
}

#[derive(Clone)]
pub struct MemoryGraph {
    inner: Arc<Inner>,
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGraph {
    /// An empty, reachable graph with the similarity extension installed.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(GraphState::default()),
                reachable: AtomicBool::new(true),
                extension: AtomicBool::new(true),
                connects: AtomicUsize::new(0),
                pending_failures: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
            }),
        }
    }

    pub fn with_extension(self, installed: bool) -> Self {
        self.set_extension(installed);
        self
    }

    pub fn set_extension(&self, installed: bool) {
        self.inner.extension.store(installed, Ordering::SeqCst);
    }

    /// Simulate the store going away (or coming back).
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// How many times the driver was opened.
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Make the next `n` transaction `begin` calls fail with a session error.
    pub fn fail_next_transactions(&self, n: usize) {
        self.inner.pending_failures.store(n, Ordering::SeqCst);
    }

    pub fn pending_failures(&self) -> usize {
        self.inner.pending_failures.load(Ordering::SeqCst)
    }

    /// Number of committed units of work that changed state.
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    // -- inspection --------------------------------------------------------

    pub fn has_catalog_node(&self, capability_id: &str) -> bool {
        self.inner.state.lock().catalog.contains_key(capability_id)
    }

    /// Properties of a catalog node.
    pub fn catalog_node(&self, capability_id: &str) -> Option<Record> {
        self.inner
            .state
            .lock()
            .catalog
            .get(capability_id)
            .map(|n| n.props.clone())
    }

    pub fn collection_names(&self, capability_id: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .catalog
            .get(capability_id)
            .map(|n| n.collections.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn table_names(&self, capability_id: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .catalog
            .get(capability_id)
            .map(|n| n.tables.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_index_node(&self, capability_id: &str) -> bool {
        self.inner.state.lock().index.contains_key(capability_id)
    }

    /// Properties of an index node (vectors excluded).
    pub fn index_node(&self, capability_id: &str) -> Option<Record> {
        self.inner
            .state
            .lock()
            .index
            .get(capability_id)
            .map(|n| n.props.clone())
    }

    pub fn vector_count(&self, capability_id: &str) -> usize {
        self.inner
            .state
            .lock()
            .index
            .get(capability_id)
            .map(|n| n.vectors.len())
            .unwrap_or(0)
    }

    /// Total number of vector nodes in the graph.
    pub fn total_vectors(&self) -> usize {
        self.inner.state.lock().index.values().map(|n| n.vectors.len()).sum()
    }

    /// Overwrite an index node property behind the registry's back.
    pub fn tamper_index_property(&self, capability_id: &str, key: &str, value: Value) {
        if let Some(node) = self.inner.state.lock().index.get_mut(capability_id) {
            node.props.insert(key.to_string(), value);
        }
    }

    /// Drop one vector node behind the registry's back.
    pub fn drop_vector(&self, capability_id: &str, category: &str) {
        if let Some(node) = self.inner.state.lock().index.get_mut(capability_id) {
            node.vectors.remove(category);
        }
    }

    fn ensure_reachable(&self) -> Result<(), GraphError> {
        if self.inner.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GraphError::Connectivity("graph store unreachable".to_string()))
        }
    }
}

#[async_trait]
impl GraphDriver for MemoryGraph {
    async fn connect(&self) -> Result<(), GraphError> {
        self.ensure_reachable()?;
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn session(&self, mode: AccessMode) -> Result<Box<dyn GraphSession>, GraphError> {
        self.ensure_reachable()?;
        Ok(Box::new(MemorySession {
            graph: self.clone(),
            mode,
            tx: None,
        }))
    }

    async fn close(&self) -> Result<(), GraphError> {
        Ok(())
    }
}

struct Pending {
    /// Snapshot plus this transaction's own writes; serves reads.
    state: GraphState,
    writes: Vec<Statement>,
}

struct MemorySession {
    graph: MemoryGraph,
    mode: AccessMode,
    tx: Option<Pending>,
}

impl MemorySession {
    fn execute(&self, state: &mut GraphState, statement: &Statement) -> Result<(Vec<Record>, bool), GraphError> {
        let writes = classify_access(&statement.text, true) == AccessMode::Write;
        if writes && self.mode == AccessMode::Read {
            return Err(GraphError::Query(
                "Writing in read access mode not allowed".to_string(),
            ));
        }
        let extension = self.graph.inner.extension.load(Ordering::SeqCst);
        let rows = execute(state, statement, extension)?;
        Ok((rows, writes))
    }
}

#[async_trait]
impl GraphSession for MemorySession {
    async fn begin(&mut self) -> Result<(), GraphError> {
        self.graph.ensure_reachable()?;
        let injected = self
            .graph
            .inner
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(GraphError::Session("transient failure".to_string()));
        }
        if self.tx.is_some() {
            return Err(GraphError::Session("transaction already open".to_string()));
        }
        let state = self.graph.inner.state.lock().clone();
        self.tx = Some(Pending {
            state,
            writes: Vec::new(),
        });
        Ok(())
    }

    async fn run(&mut self, statement: &Statement) -> Result<Vec<Record>, GraphError> {
        self.graph.ensure_reachable()?;
        match self.tx.take() {
            Some(mut pending) => {
                let outcome = self.execute(&mut pending.state, statement);
                if let Ok((_, true)) = &outcome {
                    pending.writes.push(statement.clone());
                }
                self.tx = Some(pending);
                outcome.map(|(rows, _)| rows)
            }
            None => {
                // auto-commit
                let mut live = self.graph.inner.state.lock();
                let mut next = live.clone();
                let (rows, wrote) = self.execute(&mut next, statement)?;
                if wrote {
                    *live = next;
                    self.graph.inner.writes.fetch_add(1, Ordering::SeqCst);
                }
                Ok(rows)
            }
        }
    }

    async fn commit(&mut self) -> Result<(), GraphError> {
        self.graph.ensure_reachable()?;
        let pending = self
            .tx
            .take()
            .ok_or_else(|| GraphError::Session("no open transaction".to_string()))?;
        if pending.writes.is_empty() {
            return Ok(());
        }
        let mut live = self.graph.inner.state.lock();
        let mut next = live.clone();
        for statement in &pending.writes {
            self.execute(&mut next, statement)?;
        }
        *live = next;
        self.graph.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), GraphError> {
        self.tx = None;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), GraphError> {
        self.tx = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Statement execution
// ---------------------------------------------------------------------------

fn execute(state: &mut GraphState, statement: &Statement, extension: bool) -> Result<Vec<Record>, GraphError> {
    let p = &statement.params;
    match statement.text.as_str() {
        queries::PING => Ok(vec![row(json!({"ok": 1}))]),
        queries::EXTENSION_PROBE => {
            if extension {
                Ok(vec![row(json!({"version": "2.6.0"}))])
            } else {
                Err(unknown_function("gds.version"))
            }
        }
        queries::UPSERT_KNOWLEDGE_BASE => upsert_catalog(state, p, "KnowledgeBase"),
        queries::UPSERT_API_TOOL => upsert_catalog(state, p, "Tool"),
        queries::UPSERT_DATABASE => upsert_catalog(state, p, "Database"),
        queries::UPSERT_COLLECTION => {
            let id = str_param(p, "capability_id")?;
            let name = str_param(p, "collection_name")?;
            let Some(node) = state.catalog.get_mut(&id) else {
                return Ok(Vec::new());
            };
            let child = row(json!({
                "name": name,
                "description": str_param(p, "collection_description")?,
                "semantics": str_param(p, "semantics")?,
                "document_count": param(p, "document_count")?,
            }));
            node.collections.insert(name.clone(), child);
            Ok(vec![row(json!({"name": name}))])
        }
        queries::PRUNE_COLLECTIONS => {
            let id = str_param(p, "capability_id")?;
            let keep = strings_param(p, "collection_names")?;
            if let Some(node) = state.catalog.get_mut(&id) {
                node.collections.retain(|name, _| keep.contains(name));
            }
            Ok(Vec::new())
        }
        queries::UPSERT_TABLE => {
            let id = str_param(p, "capability_id")?;
            let name = str_param(p, "table_name")?;
            let Some(node) = state.catalog.get_mut(&id) else {
                return Ok(Vec::new());
            };
            let child = row(json!({
                "name": name,
                "description": str_param(p, "table_description")?,
                "columns": str_param(p, "columns")?,
            }));
            node.tables.insert(name.clone(), child);
            Ok(vec![row(json!({"name": name}))])
        }
        queries::PRUNE_TABLES => {
            let id = str_param(p, "capability_id")?;
            let keep = strings_param(p, "table_names")?;
            if let Some(node) = state.catalog.get_mut(&id) {
                node.tables.retain(|name, _| keep.contains(name));
            }
            Ok(Vec::new())
        }
        queries::REMOVE_CAPABILITY => {
            let id = str_param(p, "capability_id")?;
            Ok(state
                .catalog
                .remove(&id)
                .map(|_| vec![row(json!({"capability_id": id}))])
                .unwrap_or_default())
        }
        queries::GET_CONTENT_HASH => {
            let id = str_param(p, "capability_id")?;
            Ok(state
                .index
                .get(&id)
                .map(|n| {
                    vec![row(json!({
                        "content_hash": n.props.get("content_hash").cloned().unwrap_or(Value::Null)
                    }))]
                })
                .unwrap_or_default())
        }
        queries::LIST_INDEXED_IDS => Ok(state
            .index
            .keys()
            .map(|id| row(json!({"capability_id": id})))
            .collect()),
        queries::DELETE_INDEXED => {
            let id = str_param(p, "capability_id")?;
            Ok(state
                .index
                .remove(&id)
                .map(|_| vec![row(json!({"capability_id": id}))])
                .unwrap_or_default())
        }
        queries::CREATE_INDEXED => create_index_node(state, p),
        queries::SEARCH_BY_CAPABILITY => {
            if !extension {
                return Err(unknown_function(SIMILARITY_FUNCTION));
            }
            weighted_search(state, p, |stored, query, _| cosine_similarity(&stored.embedding, query))
        }
        queries::SEARCH_BY_CAPABILITY_FALLBACK => weighted_search(state, p, |stored, query, query_norm| {
            if stored.norm == 0.0 || query_norm == 0.0 {
                return 0.0;
            }
            let dot: f64 = stored
                .embedding
                .iter()
                .zip(query)
                .map(|(a, b)| f64::from(*a) * f64::from(*b))
                .sum();
            dot / (stored.norm * query_norm)
        }),
        queries::SEARCH_BY_TEXT => text_search(state, p),
        queries::INTEGRITY_SCAN => Ok(state
            .index
            .iter()
            .map(|(id, node)| {
                let mut r = Record::new();
                r.insert("capability_id".into(), Value::from(id.as_str()));
                for key in ["name", "description", "content_hash"].iter().chain(SOURCE_FIELDS.iter()) {
                    r.insert((*key).to_string(), node.props.get(*key).cloned().unwrap_or(Value::Null));
                }
                r.insert(
                    "categories".into(),
                    Value::from(node.vectors.keys().cloned().collect::<Vec<_>>()),
                );
                r
            })
            .collect()),
        other if !extension && other.contains(SIMILARITY_FUNCTION) => {
            Err(unknown_function(SIMILARITY_FUNCTION))
        }
        other => Err(GraphError::Query(format!("Invalid input: {}", truncate(other)))),
    }
}

fn upsert_catalog(state: &mut GraphState, p: &Params, label: &str) -> Result<Vec<Record>, GraphError> {
    let id = str_param(p, "capability_id")?;
    let node = state.catalog.entry(id.clone()).or_default();
    for (k, v) in p {
        node.props.insert(k.clone(), v.clone());
    }
    node.props.insert("label".into(), Value::from(label));
    Ok(vec![row(json!({"capability_id": id}))])
}

fn create_index_node(state: &mut GraphState, p: &Params) -> Result<Vec<Record>, GraphError> {
    let id = str_param(p, "capability_id")?;
    if state.index.contains_key(&id) {
        return Err(GraphError::Query(format!(
            "Node already exists with label `CapabilityIndex` and property `capability_id` = '{}'",
            id
        )));
    }
    let mut node = IndexNode::default();
    for key in ["capability_id", "capability_type", "name", "description", "content_hash", "updated_at"]
        .iter()
        .chain(SOURCE_FIELDS.iter())
    {
        node.props.insert((*key).to_string(), param(p, key)?);
    }
    for category in CATEGORIES {
        let embedding = vector_param(p, &format!("{}_vector", category))?;
        let norm = f64_param(p, &format!("{}_norm", category))?;
        node.vectors
            .insert(category.to_string(), StoredVector { embedding, norm });
    }
    state.index.insert(id.clone(), node);
    Ok(vec![row(json!({"capability_id": id}))])
}

fn weighted_search<F>(state: &GraphState, p: &Params, similarity: F) -> Result<Vec<Record>, GraphError>
where
    F: Fn(&StoredVector, &[f32], f64) -> f64,
{
    let mut targets = Vec::with_capacity(CATEGORIES.len());
    for category in CATEGORIES {
        let query = vector_param(p, &format!("{}_query", category))?;
        let norm = match p.get(&format!("{}_query_norm", category)) {
            Some(v) => v.as_f64().unwrap_or(0.0),
            None => crate::embeddings::l2_norm(&query),
        };
        let weight = f64_param(p, &format!("{}_weight", category))?;
        targets.push((category, query, norm, weight));
    }
    let threshold = f64_param(p, "threshold")?;
    let limit = usize_param(p, "limit")?;

    let mut hits: Vec<(f64, String, Record)> = Vec::new();
    for (id, node) in &state.index {
        let mut scores = Vec::with_capacity(CATEGORIES.len());
        for (category, query, norm, _) in &targets {
            match node.vectors.get(*category) {
                Some(stored) => scores.push(similarity(stored, query, *norm)),
                None => break,
            }
        }
        if scores.len() != CATEGORIES.len() {
            continue;
        }
        let score: f64 = scores.iter().zip(&targets).map(|(s, q)| s * q.3).sum();
        if score < threshold {
            continue;
        }
        let mut r = Record::new();
        r.insert("capability_id".into(), Value::from(id.as_str()));
        for key in ["name", "description", "capability_type"] {
            r.insert(key.into(), node.props.get(key).cloned().unwrap_or(Value::Null));
        }
        r.insert("score".into(), Value::from(score));
        r.insert("semantic_score".into(), Value::from(scores[0]));
        r.insert("functional_score".into(), Value::from(scores[1]));
        r.insert("contextual_score".into(), Value::from(scores[2]));
        hits.push((score, id.clone(), r));
    }
    hits.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    Ok(hits.into_iter().take(limit).map(|(_, _, r)| r).collect())
}

fn text_search(state: &GraphState, p: &Params) -> Result<Vec<Record>, GraphError> {
    let needle = str_param(p, "query")?.to_lowercase();
    let limit = usize_param(p, "limit")?;
    let mut hits: Vec<(String, String, Record)> = state
        .index
        .iter()
        .filter_map(|(id, node)| {
            let name = node.props.get("name").and_then(Value::as_str).unwrap_or_default();
            let description = node
                .props
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !name.to_lowercase().contains(&needle) && !description.to_lowercase().contains(&needle) {
                return None;
            }
            let mut r = Record::new();
            r.insert("capability_id".into(), Value::from(id.as_str()));
            for key in ["name", "description", "capability_type"] {
                r.insert(key.into(), node.props.get(key).cloned().unwrap_or(Value::Null));
            }
            Some((name.to_string(), id.clone(), r))
        })
        .collect();
    hits.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    Ok(hits.into_iter().take(limit).map(|(_, _, r)| r).collect())
}

// ---------------------------------------------------------------------------
// Parameter helpers
// ---------------------------------------------------------------------------

fn row(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}

fn unknown_function(name: &str) -> GraphError {
    GraphError::Query(format!("Unknown function '{}'", name))
}

fn truncate(text: &str) -> String {
    text.chars().take(60).collect()
}

fn param(p: &Params, key: &str) -> Result<Value, GraphError> {
    p.get(key)
        .cloned()
        .ok_or_else(|| GraphError::Query(format!("Expected parameter(s): {}", key)))
}

fn str_param(p: &Params, key: &str) -> Result<String, GraphError> {
    match param(p, key)? {
        Value::String(s) => Ok(s),
        other => Err(GraphError::Serialization(format!(
            "parameter {} must be a string, got {}",
            key, other
        ))),
    }
}

fn f64_param(p: &Params, key: &str) -> Result<f64, GraphError> {
    param(p, key)?
        .as_f64()
        .ok_or_else(|| GraphError::Serialization(format!("parameter {} must be a number", key)))
}

fn usize_param(p: &Params, key: &str) -> Result<usize, GraphError> {
    param(p, key)?
        .as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| GraphError::Serialization(format!("parameter {} must be a non-negative integer", key)))
}

fn strings_param(p: &Params, key: &str) -> Result<Vec<String>, GraphError> {
    match param(p, key)? {
        Value::Array(items) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                other => Err(GraphError::Serialization(format!(
                    "parameter {} must be a list of strings, got {}",
                    key, other
                ))),
            })
            .collect(),
        other => Err(GraphError::Serialization(format!(
            "parameter {} must be a list, got {}",
            key, other
        ))),
    }
}

fn vector_param(p: &Params, key: &str) -> Result<Vec<f32>, GraphError> {
    match param(p, key)? {
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|x| x as f32)
                    .ok_or_else(|| GraphError::Serialization(format!("parameter {} must be a list of numbers", key)))
            })
            .collect(),
        other => Err(GraphError::Serialization(format!(
            "parameter {} must be a list, got {}",
            key, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(graph: &MemoryGraph, mode: AccessMode, statement: Statement) -> Result<Vec<Record>, GraphError> {
        let mut session = graph.session(mode).await?;
        session.run(&statement).await
    }

    #[tokio::test]
    async fn test_unknown_statement_is_rejected() {
        let graph = MemoryGraph::new();
        let err = run(&graph, AccessMode::Read, Statement::new("MATCH (n) RETURN n"))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Query(_)));
    }

    #[tokio::test]
    async fn test_extension_probe_follows_flag() {
        let graph = MemoryGraph::new();
        assert!(run(&graph, AccessMode::Read, Statement::new(queries::EXTENSION_PROBE))
            .await
            .is_ok());
        graph.set_extension(false);
        let err = run(&graph, AccessMode::Read, Statement::new(queries::EXTENSION_PROBE))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unknown function"));
    }

    #[tokio::test]
    async fn test_read_session_rejects_writes() {
        let graph = MemoryGraph::new();
        let stmt = Statement::new(queries::DELETE_INDEXED).param("capability_id", "x");
        let err = run(&graph, AccessMode::Read, stmt).await.unwrap_err();
        assert!(err.to_string().contains("read access mode"));
        assert_eq!(graph.write_count(), 0);
    }

    #[tokio::test]
    async fn test_rolled_back_transaction_leaves_no_trace() {
        let graph = MemoryGraph::new();
        let mut session = graph.session(AccessMode::Write).await.unwrap();
        session.begin().await.unwrap();
        let meta = crate::types::CapabilityMetadata::database("db:a", "a", "", Default::default());
        for stmt in crate::sync::statements_for(&meta).unwrap() {
            session.run(&stmt).await.unwrap();
        }
        assert!(!graph.has_catalog_node("db:a"));
        session.rollback().await.unwrap();
        assert!(!graph.has_catalog_node("db:a"));
        assert_eq!(graph.write_count(), 0);

        session.begin().await.unwrap();
        for stmt in crate::sync::statements_for(&meta).unwrap() {
            session.run(&stmt).await.unwrap();
        }
        session.commit().await.unwrap();
        assert!(graph.has_catalog_node("db:a"));
        assert_eq!(graph.write_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_commits_keep_every_write() {
        let graph = MemoryGraph::new();
        let mut tasks = Vec::new();
        for i in 0..200 {
            let graph = graph.clone();
            tasks.push(tokio::spawn(async move {
                let meta = crate::types::CapabilityMetadata::database(
                    format!("db:{}", i),
                    format!("db{}", i),
                    "",
                    Default::default(),
                );
                let mut session = graph.session(AccessMode::Write).await.unwrap();
                session.begin().await.unwrap();
                for stmt in crate::sync::statements_for(&meta).unwrap() {
                    session.run(&stmt).await.unwrap();
                    tokio::task::yield_now().await;
                }
                session.commit().await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(graph.write_count(), 200);
        for i in 0..200 {
            assert!(graph.has_catalog_node(&format!("db:{}", i)), "db:{} lost", i);
        }
    }

    #[tokio::test]
    async fn test_commit_replays_onto_changes_made_since_begin() {
        let graph = MemoryGraph::new();
        let a = crate::types::CapabilityMetadata::database("db:a", "a", "", Default::default());
        let b = crate::types::CapabilityMetadata::database("db:b", "b", "", Default::default());

        let mut first = graph.session(AccessMode::Write).await.unwrap();
        first.begin().await.unwrap();
        for stmt in crate::sync::statements_for(&a).unwrap() {
            first.run(&stmt).await.unwrap();
        }

        let mut second = graph.session(AccessMode::Write).await.unwrap();
        for stmt in crate::sync::statements_for(&b).unwrap() {
            second.run(&stmt).await.unwrap();
        }

        first.commit().await.unwrap();
        assert!(graph.has_catalog_node("db:a"));
        assert!(graph.has_catalog_node("db:b"));
    }

    #[tokio::test]
    async fn test_read_only_commit_is_not_counted() {
        let graph = MemoryGraph::new();
        let mut session = graph.session(AccessMode::Read).await.unwrap();
        session.begin().await.unwrap();
        session.run(&Statement::new(queries::LIST_INDEXED_IDS)).await.unwrap();
        session.commit().await.unwrap();
        assert_eq!(graph.write_count(), 0);
    }
}
