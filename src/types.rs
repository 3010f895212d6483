//! Capability metadata, the canonical record every provider publishes.
//!
//! A [`CapabilityMetadata`] describes one discoverable unit of functionality:
//! a knowledge base, an API tool or a database. The type-specific payload is
//! carried by [`CapabilityDetails`], which is serialized inline next to the
//! common fields with a `type` discriminator:
//!
//! ```json
//! {
//!   "capability_id": "tool:weather_lookup",
//!   "type": "api_tool",
//!   "name": "weather_lookup",
//!   "description": "Current weather lookup.",
//!   "status": "active",
//!   "last_updated": "2026-10-19T08:00:00Z",
//!   "graph_source": "tools",
//!   "node_name": "weather_lookup",
//!   "endpoint": "https://api.example.com/weather",
//!   "method": "GET",
//!   "input_schema": {"city": "string"},
//!   "output_schema": {"temperature": "number"}
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of capability. Determines which typed sync path applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityType {
    KnowledgeBase,
    ApiTool,
    Database,
}

impl CapabilityType {
    pub const ALL: [CapabilityType; 3] = [Self::KnowledgeBase, Self::ApiTool, Self::Database];

    /// Wire name, as stored in stream entries and graph properties.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KnowledgeBase => "knowledge_base",
            Self::ApiTool => "api_tool",
            Self::Database => "database",
        }
    }

    /// Whether capabilities of this kind carry a multi-vector representation.
    pub fn is_vector_indexed(&self) -> bool {
        matches!(self, Self::KnowledgeBase | Self::ApiTool)
    }
}

impl fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown capability type name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown capability type: {0}")]
pub struct UnknownCapabilityType(pub String);

impl FromStr for CapabilityType {
    type Err = UnknownCapabilityType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownCapabilityType(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Type-specific payloads
// ---------------------------------------------------------------------------

/// A collection exposed by a knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Per-collection semantics (topics, language, freshness, ...).
    #[serde(default)]
    pub semantics: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_count: Option<u64>,
}

impl CollectionDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            semantics: HashMap::new(),
            document_count: None,
        }
    }
}

/// Rate limits advertised by an API tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<u32>,
}

/// A column of a database table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
}

/// A table exposed by a database capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub columns: Vec<ColumnDescriptor>,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            columns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDetails {
    #[serde(default)]
    pub collections: Vec<CollectionDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolDetails {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(default)]
    pub output_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseDetails {
    /// Free-form schema document (engine, version, relations, ...).
    #[serde(default)]
    pub schema: Value,
    #[serde(default)]
    pub tables: Vec<TableDescriptor>,
}

/// Type-specific payload, tagged by the capability `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CapabilityDetails {
    KnowledgeBase(KnowledgeDetails),
    ApiTool(ToolDetails),
    Database(DatabaseDetails),
}

impl CapabilityDetails {
    pub fn capability_type(&self) -> CapabilityType {
        match self {
            Self::KnowledgeBase(_) => CapabilityType::KnowledgeBase,
            Self::ApiTool(_) => CapabilityType::ApiTool,
            Self::Database(_) => CapabilityType::Database,
        }
    }
}

// ---------------------------------------------------------------------------
// CapabilityMetadata
// ---------------------------------------------------------------------------

/// The canonical record for any capability.
///
/// `capability_id` is unique across all types. `last_updated` is the
/// conflict-resolution clock used by stream replay: an update whose
/// timestamp is not strictly newer than the last applied one is dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityMetadata {
    pub capability_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_status")]
    pub status: String,
    pub last_updated: DateTime<Utc>,
    /// Routing hint: which graph (or sub-graph) the node lives in.
    #[serde(default)]
    pub graph_source: String,
    /// Routing hint: node name inside `graph_source`.
    #[serde(default)]
    pub node_name: String,
    #[serde(flatten)]
    pub details: CapabilityDetails,
}

fn default_status() -> String {
    "active".to_string()
}

impl CapabilityMetadata {
    fn with_details(
        capability_id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        details: CapabilityDetails,
    ) -> Self {
        let name = name.into();
        Self {
            capability_id: capability_id.into(),
            node_name: name.clone(),
            name,
            description: description.into(),
            status: default_status(),
            last_updated: Utc::now(),
            graph_source: String::new(),
            details,
        }
    }

    /// Create knowledge-base metadata stamped with the current time.
    pub fn knowledge_base(
        capability_id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        details: KnowledgeDetails,
    ) -> Self {
        Self::with_details(
            capability_id,
            name,
            description,
            CapabilityDetails::KnowledgeBase(details),
        )
    }

    /// Create API-tool metadata stamped with the current time.
    pub fn api_tool(
        capability_id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        details: ToolDetails,
    ) -> Self {
        Self::with_details(capability_id, name, description, CapabilityDetails::ApiTool(details))
    }

    /// Create database metadata stamped with the current time.
    pub fn database(
        capability_id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        details: DatabaseDetails,
    ) -> Self {
        Self::with_details(capability_id, name, description, CapabilityDetails::Database(details))
    }

    pub fn capability_type(&self) -> CapabilityType {
        self.details.capability_type()
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_last_updated(mut self, last_updated: DateTime<Utc>) -> Self {
        self.last_updated = last_updated;
        self
    }

    pub fn with_routing(mut self, graph_source: impl Into<String>, node_name: impl Into<String>) -> Self {
        self.graph_source = graph_source.into();
        self.node_name = node_name.into();
        self
    }

    /// Names of the elements this capability exposes: collections for
    /// knowledge bases, tables for databases, the tool itself for tools.
    pub fn element_names(&self) -> Vec<String> {
        match &self.details {
            CapabilityDetails::KnowledgeBase(kb) => {
                kb.collections.iter().map(|c| c.name.clone()).collect()
            }
            CapabilityDetails::ApiTool(_) => vec![self.name.clone()],
            CapabilityDetails::Database(db) => db.tables.iter().map(|t| t.name.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_type_round_trips_through_str() {
        for t in CapabilityType::ALL {
            assert_eq!(t.as_str().parse::<CapabilityType>().unwrap(), t);
        }
        assert!("widget".parse::<CapabilityType>().is_err());
    }

    #[test]
    fn test_metadata_serializes_type_inline() {
        let meta = CapabilityMetadata::api_tool(
            "tool:weather_lookup",
            "weather_lookup",
            "Current weather lookup.",
            ToolDetails {
                endpoint: "https://api.example.com/weather".into(),
                method: "GET".into(),
                input_schema: serde_json::json!({"city": "string"}),
                output_schema: serde_json::json!({"temperature": "number"}),
                rate_limit: Some(RateLimit {
                    requests_per_minute: Some(60),
                    burst: None,
                }),
            },
        )
        .with_last_updated(Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap());

        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["type"], "api_tool");
        assert_eq!(json["endpoint"], "https://api.example.com/weather");
        assert_eq!(json["rate_limit"]["requests_per_minute"], 60);

        let back: CapabilityMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);
        assert_eq!(back.capability_type(), CapabilityType::ApiTool);
    }

    #[test]
    fn test_knowledge_base_defaults() {
        let json = serde_json::json!({
            "capability_id": "kb:docs",
            "type": "knowledge_base",
            "name": "docs",
            "last_updated": "2026-10-19T08:00:00Z",
            "collections": [{"name": "guides"}]
        });
        let meta: CapabilityMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(meta.status, "active");
        assert_eq!(meta.element_names(), vec!["guides".to_string()]);
        match meta.details {
            CapabilityDetails::KnowledgeBase(kb) => assert!(kb.collections[0].semantics.is_empty()),
            other => panic!("unexpected details: {:?}", other),
        }
    }
}
