//! Typed graph sync.
//!
//! Turns a [`CapabilityMetadata`] into a parameterized MERGE upsert keyed on
//! `capability_id`, plus the nested per-collection or per-table writes, and
//! runs the whole set as one write transaction. No retry here beyond what the
//! transaction manager does; failures propagate.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::graph::{queries, GraphError, GraphService, Statement};
use crate::types::{
    CapabilityDetails, CapabilityMetadata, DatabaseDetails, KnowledgeDetails, ToolDetails,
};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Failed to encode capability payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Capability {id} is a {actual}, not a {expected}")]
    WrongType {
        id: String,
        expected: &'static str,
        actual: &'static str,
    },
}

pub struct GraphSync {
    graph: Arc<GraphService>,
}

impl GraphSync {
    pub fn new(graph: Arc<GraphService>) -> Self {
        Self { graph }
    }

    /// Upsert any capability, dispatching on its type.
    pub async fn sync(&self, metadata: &CapabilityMetadata) -> Result<(), SyncError> {
        let statements = statements_for(metadata)?;
        self.graph.write(&statements).await?;
        log::debug!(
            "Synced {} {} ({} statement(s))",
            metadata.capability_type(),
            metadata.capability_id,
            statements.len()
        );
        Ok(())
    }

    pub async fn sync_knowledge_base(&self, metadata: &CapabilityMetadata) -> Result<(), SyncError> {
        self.sync_expecting(metadata, "knowledge_base").await
    }

    pub async fn sync_api_tool(&self, metadata: &CapabilityMetadata) -> Result<(), SyncError> {
        self.sync_expecting(metadata, "api_tool").await
    }

    pub async fn sync_database(&self, metadata: &CapabilityMetadata) -> Result<(), SyncError> {
        self.sync_expecting(metadata, "database").await
    }

    async fn sync_expecting(&self, metadata: &CapabilityMetadata, expected: &'static str) -> Result<(), SyncError> {
        let actual = metadata.capability_type().as_str();
        if actual != expected {
            return Err(SyncError::WrongType {
                id: metadata.capability_id.clone(),
                expected,
                actual,
            });
        }
        self.sync(metadata).await
    }

    /// Detach-delete a catalog node and its nested nodes. Returns whether it existed.
    pub async fn remove(&self, capability_id: &str) -> Result<bool, SyncError> {
        let stmt = Statement::new(queries::REMOVE_CAPABILITY).param("capability_id", capability_id);
        let results = self.graph.write(&[stmt]).await?;
        Ok(results.first().map(|rows| !rows.is_empty()).unwrap_or(false))
    }
}

/// The unit of work that syncs `metadata`. The first statement is always the
/// capability upsert.
pub fn statements_for(metadata: &CapabilityMetadata) -> Result<Vec<Statement>, SyncError> {
    match &metadata.details {
        CapabilityDetails::KnowledgeBase(kb) => knowledge_base_statements(metadata, kb),
        CapabilityDetails::ApiTool(tool) => api_tool_statements(metadata, tool),
        CapabilityDetails::Database(db) => database_statements(metadata, db),
    }
}

fn base_statement(query: &str, metadata: &CapabilityMetadata) -> Statement {
    Statement::new(query)
        .param("capability_id", metadata.capability_id.as_str())
        .param("capability_type", metadata.capability_type().as_str())
        .param("name", metadata.name.as_str())
        .param("description", metadata.description.as_str())
        .param("status", metadata.status.as_str())
        .param("last_updated", metadata.last_updated.to_rfc3339())
        .param("graph_source", metadata.graph_source.as_str())
        .param("node_name", metadata.node_name.as_str())
}

fn knowledge_base_statements(
    metadata: &CapabilityMetadata,
    kb: &KnowledgeDetails,
) -> Result<Vec<Statement>, SyncError> {
    let names: Vec<Value> = kb.collections.iter().map(|c| Value::from(c.name.as_str())).collect();
    let mut statements = vec![
        base_statement(queries::UPSERT_KNOWLEDGE_BASE, metadata).param("collection_names", names.clone()),
    ];
    for collection in &kb.collections {
        statements.push(
            Statement::new(queries::UPSERT_COLLECTION)
                .param("capability_id", metadata.capability_id.as_str())
                .param("collection_name", collection.name.as_str())
                .param("collection_description", collection.description.as_str())
                .param("semantics", serde_json::to_string(&collection.semantics)?)
                .param("document_count", collection.document_count),
        );
    }
    statements.push(
        Statement::new(queries::PRUNE_COLLECTIONS)
            .param("capability_id", metadata.capability_id.as_str())
            .param("collection_names", names),
    );
    Ok(statements)
}

fn api_tool_statements(metadata: &CapabilityMetadata, tool: &ToolDetails) -> Result<Vec<Statement>, SyncError> {
    let upsert = base_statement(queries::UPSERT_API_TOOL, metadata)
        .param("endpoint", tool.endpoint.as_str())
        .param("method", tool.method.as_str())
        .param("input_schema", serde_json::to_string(&tool.input_schema)?)
        .param("output_schema", serde_json::to_string(&tool.output_schema)?)
        .param("rate_limit", serde_json::to_string(&tool.rate_limit)?);
    Ok(vec![upsert])
}

fn database_statements(metadata: &CapabilityMetadata, db: &DatabaseDetails) -> Result<Vec<Statement>, SyncError> {
    let names: Vec<Value> = db.tables.iter().map(|t| Value::from(t.name.as_str())).collect();
    let mut statements = vec![base_statement(queries::UPSERT_DATABASE, metadata)
        .param("schema", serde_json::to_string(&db.schema)?)
        .param("table_names", names.clone())];
    for table in &db.tables {
        statements.push(
            Statement::new(queries::UPSERT_TABLE)
                .param("capability_id", metadata.capability_id.as_str())
                .param("table_name", table.name.as_str())
                .param("table_description", table.description.as_str())
                .param("columns", serde_json::to_string(&table.columns)?),
        );
    }
    statements.push(
        Statement::new(queries::PRUNE_TABLES)
            .param("capability_id", metadata.capability_id.as_str())
            .param("table_names", names),
    );
    Ok(statements)
}
