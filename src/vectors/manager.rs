//! Multi-vector registration, deletion, reconciliation and search.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::extractor::{AnnotationExtractor, MetadataExtractor, QueryRepresentation};
use super::fields::{content_hash, CapabilityFields, VectorCategory, VectorSet};
use super::VectorError;
use crate::embeddings::{l2_norm, mean_vector, Embedder};
use crate::graph::{queries, record_f64, record_str, record_strings, vector_param, GraphService, Statement};
use crate::types::CapabilityMetadata;

/// Result of [`MultiVectorManager::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterOutcome {
    /// Stored hash matched; nothing was written.
    Unchanged,
    Created,
    Updated,
}

/// Per-category weights of the combined score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchWeights {
    #[serde(default = "default_semantic_weight")]
    pub semantic: f64,
    #[serde(default = "default_functional_weight")]
    pub functional: f64,
    #[serde(default = "default_contextual_weight")]
    pub contextual: f64,
}

fn default_semantic_weight() -> f64 {
    0.4
}

fn default_functional_weight() -> f64 {
    0.3
}

fn default_contextual_weight() -> f64 {
    0.3
}

impl Default for SearchWeights {
    fn default() -> Self {
        Self {
            semantic: default_semantic_weight(),
            functional: default_functional_weight(),
            contextual: default_contextual_weight(),
        }
    }
}

impl SearchWeights {
    pub fn get(&self, category: VectorCategory) -> f64 {
        match category {
            VectorCategory::Semantic => self.semantic,
            VectorCategory::Functional => self.functional,
            VectorCategory::Contextual => self.contextual,
        }
    }
}

/// One ranked similarity hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub capability_id: String,
    pub name: String,
    pub description: String,
    pub capability_type: String,
    pub score: f64,
    pub semantic_score: f64,
    pub functional_score: f64,
    pub contextual_score: f64,
}

/// One lexical hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMatch {
    pub capability_id: String,
    pub name: String,
    pub description: String,
    pub capability_type: String,
}

/// What [`MultiVectorManager::sync`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub deleted: Vec<String>,
}

/// Inconsistency found by [`MultiVectorManager::verify_integrity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum IntegrityIssue {
    /// The stored hash does not match the stored source fields.
    HashMismatch {
        capability_id: String,
        stored: String,
        computed: String,
    },
    /// The node does not have all three vector nodes.
    MissingVectors {
        capability_id: String,
        present: Vec<String>,
    },
}

pub struct MultiVectorManager {
    graph: Arc<GraphService>,
    embedder: Arc<dyn Embedder>,
    extractor: Arc<dyn MetadataExtractor>,
}

impl MultiVectorManager {
    pub fn new(graph: Arc<GraphService>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            graph,
            embedder,
            extractor: Arc::new(AnnotationExtractor),
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn MetadataExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Index a capability. Skips all writes when the content hash is
    /// unchanged, unless `force` is set.
    pub async fn register(&self, metadata: &CapabilityMetadata, force: bool) -> Result<RegisterOutcome, VectorError> {
        let id = metadata.capability_id.as_str();
        let fields = self.extractor.extract(metadata).await?;
        let hash = content_hash(&metadata.name, &metadata.description, &fields);

        let stored = self.stored_hash(id).await?;
        if !force && stored.as_deref() == Some(hash.as_str()) {
            log::debug!("Capability {} unchanged (hash {})", id, &hash[..12]);
            return Ok(RegisterOutcome::Unchanged);
        }

        let vectors = self.embed_fields(&fields, &metadata.name).await?;
        let delete = Statement::new(queries::DELETE_INDEXED).param("capability_id", id);
        let mut create = Statement::new(queries::CREATE_INDEXED)
            .param("capability_id", id)
            .param("capability_type", metadata.capability_type().as_str())
            .param("name", metadata.name.as_str())
            .param("description", metadata.description.as_str())
            .param("content_hash", hash.as_str())
            .param("updated_at", Utc::now().to_rfc3339());
        for (key, value) in fields.properties() {
            create = create.param(key, value);
        }
        for category in VectorCategory::ALL {
            let v = vectors.get(category);
            create = create
                .param(&format!("{}_vector", category.as_str()), vector_param(v))
                .param(&format!("{}_norm", category.as_str()), l2_norm(v));
        }
        self.graph.write(&[delete, create]).await?;

        let outcome = if stored.is_some() {
            RegisterOutcome::Updated
        } else {
            RegisterOutcome::Created
        };
        log::info!("Indexed capability {} ({:?})", id, outcome);
        Ok(outcome)
    }

    async fn stored_hash(&self, capability_id: &str) -> Result<Option<String>, VectorError> {
        let stmt = Statement::new(queries::GET_CONTENT_HASH).param("capability_id", capability_id);
        let results = self.graph.read(&[stmt]).await?;
        Ok(results
            .first()
            .and_then(|rows| rows.first())
            .and_then(|row| record_str(row, "content_hash")))
    }

    /// Embed the non-empty sources of each category and average them. A
    /// category without any source text embeds `fallback` instead.
    async fn embed_fields(&self, fields: &CapabilityFields, fallback: &str) -> Result<VectorSet, VectorError> {
        let mut out = Vec::with_capacity(VectorCategory::ALL.len());
        for category in VectorCategory::ALL {
            let sources: Vec<String> = fields
                .sources(category)
                .iter()
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.to_string())
                .collect();
            out.push(self.embed_mean(&sources, fallback).await?);
        }
        let contextual = out.pop().unwrap_or_default();
        let functional = out.pop().unwrap_or_default();
        let semantic = out.pop().unwrap_or_default();
        Ok(VectorSet {
            semantic,
            functional,
            contextual,
        })
    }

    async fn embed_mean(&self, sources: &[String], fallback: &str) -> Result<Vec<f32>, VectorError> {
        let embeddings = self.embedder.embed_batch(sources).await?;
        match mean_vector(&embeddings)? {
            Some(mean) => Ok(mean),
            None => Ok(self.embedder.embed(fallback).await?),
        }
    }

    /// Cascading delete. `false` when nothing was indexed under the id.
    pub async fn delete(&self, capability_id: &str) -> Result<bool, VectorError> {
        let stmt = Statement::new(queries::DELETE_INDEXED).param("capability_id", capability_id);
        let results = self.graph.write(&[stmt]).await?;
        let existed = results.first().map(|rows| !rows.is_empty()).unwrap_or(false);
        if existed {
            log::info!("Removed capability {} from the vector index", capability_id);
        }
        Ok(existed)
    }

    /// Register every supplied capability, then delete indexed ids that are
    /// not in the supplied set.
    pub async fn sync(&self, capabilities: &[CapabilityMetadata]) -> Result<SyncReport, VectorError> {
        let mut report = SyncReport::default();
        for metadata in capabilities {
            let id = metadata.capability_id.clone();
            match self.register(metadata, false).await? {
                RegisterOutcome::Created => report.created.push(id),
                RegisterOutcome::Updated => report.updated.push(id),
                RegisterOutcome::Unchanged => report.unchanged.push(id),
            }
        }

        let keep: HashSet<&str> = capabilities.iter().map(|c| c.capability_id.as_str()).collect();
        for id in self.indexed_ids().await? {
            if !keep.contains(id.as_str()) && self.delete(&id).await? {
                report.deleted.push(id);
            }
        }
        Ok(report)
    }

    /// Every indexed capability id, ascending.
    pub async fn indexed_ids(&self) -> Result<Vec<String>, VectorError> {
        let results = self.graph.read(&[Statement::new(queries::LIST_INDEXED_IDS)]).await?;
        Ok(results
            .into_iter()
            .flatten()
            .filter_map(|row| record_str(&row, "capability_id"))
            .collect())
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    /// Weighted three-vector similarity search. Hits scoring below
    /// `threshold` are dropped; ties rank by `capability_id` ascending.
    pub async fn search_by_capability(
        &self,
        query: &str,
        weights: Option<SearchWeights>,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SearchHit>, VectorError> {
        let weights = weights.unwrap_or_default();
        let representation = self.extractor.extract_query(query).await?;
        let vectors = self.embed_query(&representation, query).await?;

        let mut stmt = Statement::new(queries::SEARCH_BY_CAPABILITY)
            .param("threshold", threshold)
            .param("limit", limit as u64);
        for category in VectorCategory::ALL {
            let v = vectors.get(category);
            stmt = stmt
                .param(&format!("{}_query", category.as_str()), vector_param(v))
                .param(&format!("{}_query_norm", category.as_str()), l2_norm(v))
                .param(&format!("{}_weight", category.as_str()), weights.get(category));
        }

        let results = self.graph.read(&[stmt]).await?;
        let hits: Vec<SearchHit> = results
            .into_iter()
            .flatten()
            .map(|row| SearchHit {
                capability_id: record_str(&row, "capability_id").unwrap_or_default(),
                name: record_str(&row, "name").unwrap_or_default(),
                description: record_str(&row, "description").unwrap_or_default(),
                capability_type: record_str(&row, "capability_type").unwrap_or_default(),
                score: record_f64(&row, "score").unwrap_or(0.0),
                semantic_score: record_f64(&row, "semantic_score").unwrap_or(0.0),
                functional_score: record_f64(&row, "functional_score").unwrap_or(0.0),
                contextual_score: record_f64(&row, "contextual_score").unwrap_or(0.0),
            })
            .collect();
        log::debug!("Capability search returned {} hit(s)", hits.len());
        Ok(hits)
    }

    /// Each query field is embedded on its own, then grouped by category.
    async fn embed_query(&self, representation: &QueryRepresentation, raw: &str) -> Result<VectorSet, VectorError> {
        let mut grouped: [Vec<String>; 3] = Default::default();
        for (index, text) in representation.fields().iter().enumerate() {
            if text.trim().is_empty() {
                continue;
            }
            let slot = match QueryRepresentation::category_of(index) {
                VectorCategory::Semantic => 0,
                VectorCategory::Functional => 1,
                VectorCategory::Contextual => 2,
            };
            grouped[slot].push(text.to_string());
        }
        let [semantic, functional, contextual] = grouped;
        let (semantic, functional, contextual) = futures::try_join!(
            self.embed_mean(&semantic, raw),
            self.embed_mean(&functional, raw),
            self.embed_mean(&contextual, raw),
        )?;
        Ok(VectorSet {
            semantic,
            functional,
            contextual,
        })
    }

    /// Case-insensitive substring match on name and description.
    pub async fn search_by_text(&self, query: &str, limit: usize) -> Result<Vec<TextMatch>, VectorError> {
        let stmt = Statement::new(queries::SEARCH_BY_TEXT)
            .param("query", query)
            .param("limit", limit as u64);
        let results = self.graph.read(&[stmt]).await?;
        Ok(results
            .into_iter()
            .flatten()
            .map(|row| TextMatch {
                capability_id: record_str(&row, "capability_id").unwrap_or_default(),
                name: record_str(&row, "name").unwrap_or_default(),
                description: record_str(&row, "description").unwrap_or_default(),
                capability_type: record_str(&row, "capability_type").unwrap_or_default(),
            })
            .collect())
    }

    // -----------------------------------------------------------------------
    // Integrity
    // -----------------------------------------------------------------------

    /// Report index nodes whose stored hash disagrees with their stored
    /// fields, or that lack a vector node. Nothing is repaired.
    pub async fn verify_integrity(&self) -> Result<Vec<IntegrityIssue>, VectorError> {
        let results = self.graph.read(&[Statement::new(queries::INTEGRITY_SCAN)]).await?;
        let mut issues = Vec::new();
        for row in results.into_iter().flatten() {
            let capability_id = record_str(&row, "capability_id").unwrap_or_default();
            let fields = CapabilityFields::from_record(&row);
            let computed = content_hash(
                &record_str(&row, "name").unwrap_or_default(),
                &record_str(&row, "description").unwrap_or_default(),
                &fields,
            );
            let stored = record_str(&row, "content_hash").unwrap_or_default();
            if stored != computed {
                issues.push(IntegrityIssue::HashMismatch {
                    capability_id: capability_id.clone(),
                    stored,
                    computed,
                });
            }

            let present = record_strings(&row, "categories");
            let complete = VectorCategory::ALL
                .iter()
                .all(|c| present.iter().any(|p| p == c.as_str()));
            if !complete {
                issues.push(IntegrityIssue::MissingVectors {
                    capability_id,
                    present,
                });
            }
        }
        if !issues.is_empty() {
            log::warn!("Vector index integrity check found {} issue(s)", issues.len());
        }
        Ok(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingEmbedder;
    use crate::graph::{MemoryGraph, RetryPolicy};
    use crate::types::{CollectionDescriptor, KnowledgeDetails, ToolDetails};
    use std::time::Duration;

    async fn setup(graph: &MemoryGraph) -> MultiVectorManager {
        let svc = GraphService::new(
            Arc::new(graph.clone()),
            8,
            RetryPolicy {
                max_retries: 1,
                retry_delay: Duration::from_millis(1),
            },
        );
        svc.initialize().await.unwrap();
        MultiVectorManager::new(Arc::new(svc), Arc::new(HashingEmbedder::default()))
    }

    fn weather() -> CapabilityMetadata {
        CapabilityMetadata::api_tool(
            "tool:weather_lookup",
            "weather_lookup",
            "Current weather lookup.\n@semantic concept: weather",
            ToolDetails::default(),
        )
    }

    fn tool(id: &str, name: &str, description: &str) -> CapabilityMetadata {
        CapabilityMetadata::api_tool(id, name, description, ToolDetails::default())
    }

    #[tokio::test]
    async fn test_weather_lookup_scenario() {
        let graph = MemoryGraph::new();
        let manager = setup(&graph).await;

        assert_eq!(manager.register(&weather(), false).await.unwrap(), RegisterOutcome::Created);
        assert_eq!(graph.vector_count("tool:weather_lookup"), 3);
        let writes = graph.write_count();

        let hits = manager
            .search_by_capability("current weather", None, 0.0, 5)
            .await
            .unwrap();
        assert_eq!(hits[0].capability_id, "tool:weather_lookup");
        assert!(hits[0].score >= 0.6, "score {}", hits[0].score);

        // identical re-registration writes nothing
        assert_eq!(manager.register(&weather(), false).await.unwrap(), RegisterOutcome::Unchanged);
        assert_eq!(graph.write_count(), writes);
    }

    #[tokio::test]
    async fn test_force_and_changed_content_rewrite_all_vectors() {
        let graph = MemoryGraph::new();
        let manager = setup(&graph).await;
        manager.register(&weather(), false).await.unwrap();
        let before = graph.index_node("tool:weather_lookup").unwrap();

        assert_eq!(manager.register(&weather(), true).await.unwrap(), RegisterOutcome::Updated);

        let mut changed = weather();
        changed.description = "Current weather and forecast lookup.".into();
        assert_eq!(manager.register(&changed, false).await.unwrap(), RegisterOutcome::Updated);

        let after = graph.index_node("tool:weather_lookup").unwrap();
        assert_ne!(before["content_hash"], after["content_hash"]);
        assert_eq!(after["domain"], "Current weather and forecast lookup.");
        assert_eq!(graph.vector_count("tool:weather_lookup"), 3);
        assert_eq!(graph.total_vectors(), 3);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let graph = MemoryGraph::new();
        let manager = setup(&graph).await;
        manager.register(&weather(), false).await.unwrap();
        let radar = tool("tool:radar", "radar", "Weather radar images");
        manager.register(&radar, false).await.unwrap();

        assert!(manager.delete("tool:weather_lookup").await.unwrap());
        assert!(!graph.has_index_node("tool:weather_lookup"));
        assert_eq!(graph.vector_count("tool:weather_lookup"), 0);
        let hits = manager
            .search_by_capability("weather forecast", None, -1.0, 10)
            .await
            .unwrap();
        assert!(hits.iter().any(|h| h.capability_id == "tool:radar"));
        assert!(hits.iter().all(|h| h.capability_id != "tool:weather_lookup"));
        assert!(!manager.delete("tool:weather_lookup").await.unwrap());
    }

    #[tokio::test]
    async fn test_sync_reconciles_with_supplied_set() {
        let graph = MemoryGraph::new();
        let manager = setup(&graph).await;
        manager.register(&weather(), false).await.unwrap();
        manager
            .register(&tool("tool:stale", "stale", "Old tool"), false)
            .await
            .unwrap();

        let docs = CapabilityMetadata::knowledge_base(
            "kb:docs",
            "docs",
            "Product documentation",
            KnowledgeDetails {
                collections: vec![CollectionDescriptor::new("guides", "How-to guides")],
            },
        );
        let report = manager.sync(&[weather(), docs]).await.unwrap();
        assert_eq!(report.unchanged, vec!["tool:weather_lookup"]);
        assert_eq!(report.created, vec!["kb:docs"]);
        assert_eq!(report.deleted, vec!["tool:stale"]);
        assert_eq!(
            manager.indexed_ids().await.unwrap(),
            vec!["kb:docs", "tool:weather_lookup"]
        );
    }

    #[tokio::test]
    async fn test_fallback_scores_match_native() {
        let native_graph = MemoryGraph::new();
        let fallback_graph = MemoryGraph::new().with_extension(false);
        let native = setup(&native_graph).await;
        let fallback = setup(&fallback_graph).await;

        let caps = [
            weather(),
            tool("tool:geocode", "geocode", "Resolve a city name to coordinates.\n@input: city name"),
            tool("tool:fx", "fx_rates", "Currency exchange rates.\n@contextual limits: daily refresh"),
        ];
        for cap in &caps {
            native.register(cap, false).await.unwrap();
            fallback.register(cap, false).await.unwrap();
        }

        let a = native.search_by_capability("weather for a city", None, 0.0, 10).await.unwrap();
        let b = fallback.search_by_capability("weather for a city", None, 0.0, 10).await.unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.capability_id, y.capability_id);
            assert!((x.score - y.score).abs() < 1e-6);
            assert!((x.semantic_score - y.semantic_score).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn test_ties_break_by_capability_id() {
        let graph = MemoryGraph::new();
        let manager = setup(&graph).await;
        for id in ["tool:b", "tool:a", "tool:c"] {
            manager.register(&tool(id, "clone", "Identical tool"), false).await.unwrap();
        }
        let hits = manager.search_by_capability("identical", None, 0.0, 10).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.capability_id.as_str()).collect();
        assert_eq!(ids, vec!["tool:a", "tool:b", "tool:c"]);
    }

    #[tokio::test]
    async fn test_threshold_limit_and_weights() {
        let graph = MemoryGraph::new();
        let manager = setup(&graph).await;
        manager.register(&weather(), false).await.unwrap();
        manager
            .register(&tool("tool:fx", "fx_rates", "Currency exchange rates."), false)
            .await
            .unwrap();

        let hits = manager.search_by_capability("current weather", None, 0.6, 10).await.unwrap();
        assert_eq!(hits.len(), 1);

        let limited = manager.search_by_capability("current weather", None, 0.0, 1).await.unwrap();
        assert_eq!(limited.len(), 1);

        let semantic_only = SearchWeights {
            semantic: 1.0,
            functional: 0.0,
            contextual: 0.0,
        };
        let hits = manager
            .search_by_capability("current weather", Some(semantic_only), 0.0, 1)
            .await
            .unwrap();
        assert!((hits[0].score - hits[0].semantic_score).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_search_by_text() {
        let graph = MemoryGraph::new();
        let manager = setup(&graph).await;
        manager.register(&weather(), false).await.unwrap();
        manager
            .register(&tool("tool:fx", "fx_rates", "Currency exchange rates."), false)
            .await
            .unwrap();

        let hits = manager.search_by_text("WEATHER", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "weather_lookup");
        assert!(manager.search_by_text("nothing", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_verify_integrity_reports_without_repairing() {
        let graph = MemoryGraph::new();
        let manager = setup(&graph).await;
        manager.register(&weather(), false).await.unwrap();
        assert!(manager.verify_integrity().await.unwrap().is_empty());

        graph.tamper_index_property("tool:weather_lookup", "domain", "hijacked".into());
        graph.drop_vector("tool:weather_lookup", "contextual");

        let issues = manager.verify_integrity().await.unwrap();
        assert_eq!(issues.len(), 2);
        assert!(matches!(issues[0], IntegrityIssue::HashMismatch { .. }));
        match &issues[1] {
            IntegrityIssue::MissingVectors { present, .. } => {
                assert_eq!(present, &vec!["functional".to_string(), "semantic".to_string()])
            }
            other => panic!("unexpected issue {:?}", other),
        }
        assert_eq!(graph.vector_count("tool:weather_lookup"), 2);
    }
}
