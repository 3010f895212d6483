//! Capability registry.
//!
//! Front door for providers. Registering a provider stores it locally,
//! publishes its snapshot on the change stream for the other registry
//! instances, writes it to the graph directly and indexes it for similarity
//! search. The steps run in that order and each is attempted even when an
//! earlier one failed.
//!
//! Publishing and the direct graph write are not atomic together: a crash
//! between them leaves either this instance or the stream behind until the
//! next registration of the same capability.

pub mod provider;
pub mod state;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::{cached, namespace, VersionedCache};
use crate::config::{RegistryConfig, SearchSettings};
use crate::graph::GraphService;
use crate::stream::{
    ConsumerConfig, MetadataPublisher, MetadataStream, StreamConsumer, StreamError,
};
use crate::sync::{GraphSync, SyncError};
use crate::types::{CapabilityMetadata, CapabilityType};
use crate::vectors::{MultiVectorManager, SearchHit, VectorError};

pub use provider::{MetadataProvider, ProviderError, StaticProvider};
pub use state::RegistryState;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error("No vector index attached to this registry")]
    NoVectorIndex,
}

// ---------------------------------------------------------------------------
// ConsumerHandle
// ---------------------------------------------------------------------------

/// A running stream consumer.
pub struct ConsumerHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the consumer to stop and wait for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            log::error!("Consumer {} ended abnormally: {}", self.name, e);
        }
    }
}

// ---------------------------------------------------------------------------
// CapabilityRegistry
// ---------------------------------------------------------------------------

pub struct CapabilityRegistry {
    graph: Arc<GraphService>,
    sync: Arc<GraphSync>,
    stream: Arc<dyn MetadataStream>,
    publisher: MetadataPublisher,
    state: Arc<RegistryState>,
    consumer_config: ConsumerConfig,
    search: SearchSettings,
    vectors: Option<Arc<MultiVectorManager>>,
    cache: Option<VersionedCache>,
}

impl CapabilityRegistry {
    pub fn new(graph: Arc<GraphService>, stream: Arc<dyn MetadataStream>, config: &RegistryConfig) -> Self {
        let publisher = MetadataPublisher::new(Arc::clone(&stream), config.stream.key.clone());
        Self {
            sync: Arc::new(GraphSync::new(Arc::clone(&graph))),
            graph,
            stream,
            publisher,
            state: Arc::new(RegistryState::new()),
            consumer_config: config.stream.consumer_config(),
            search: config.search.clone(),
            vectors: None,
            cache: None,
        }
    }

    /// Index tools and knowledge bases for similarity search.
    pub fn with_vector_index(mut self, vectors: Arc<MultiVectorManager>) -> Self {
        self.vectors = Some(vectors);
        self
    }

    pub fn with_cache(mut self, cache: VersionedCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn graph(&self) -> &Arc<GraphService> {
        &self.graph
    }

    pub fn state(&self) -> &Arc<RegistryState> {
        &self.state
    }

    /// Register a provider. Every step is attempted; the first error from
    /// the graph sync or the vector index is returned. A failed publish is
    /// only logged.
    pub async fn register_provider(&self, provider: Arc<dyn MetadataProvider>) -> Result<CapabilityMetadata, RegistryError> {
        let metadata = provider.get_metadata().await?;
        let id = metadata.capability_id.clone();
        self.state.insert_provider(&metadata, provider);

        if let Err(e) = self.publisher.publish(&metadata).await {
            log::error!("Failed to publish update for {}: {}", id, e);
        }

        let mut first_error: Option<RegistryError> = None;
        match self.sync.sync(&metadata).await {
            Ok(()) => self.state.record_applied(&id, metadata.last_updated),
            Err(e) => {
                log::error!("Graph sync failed for {}: {}", id, e);
                first_error = Some(e.into());
            }
        }

        if let Some(vectors) = &self.vectors {
            if metadata.capability_type().is_vector_indexed() {
                if let Err(e) = vectors.register(&metadata, false).await {
                    log::error!("Vector indexing failed for {}: {}", id, e);
                    first_error.get_or_insert(e.into());
                }
            }
        }

        self.invalidate(&metadata).await;

        match first_error {
            Some(e) => Err(e),
            None => {
                log::info!("Registered {} {}", metadata.capability_type(), id);
                Ok(metadata)
            }
        }
    }

    /// Locally registered capability.
    pub fn get_capability(&self, capability_id: &str) -> Option<CapabilityMetadata> {
        self.state.capability(capability_id)
    }

    /// Locally registered capabilities, by id.
    pub fn list_capabilities(&self) -> Vec<CapabilityMetadata> {
        self.state.capabilities()
    }

    /// Remove a capability from the graph, the vector index and the local
    /// map. `true` when it was known anywhere.
    pub async fn remove_capability(&self, capability_id: &str) -> Result<bool, RegistryError> {
        let local = self.state.remove(capability_id);
        let in_graph = self.sync.remove(capability_id).await?;
        let indexed = match &self.vectors {
            Some(vectors) => vectors.delete(capability_id).await?,
            None => false,
        };

        if let Some(cache) = &self.cache {
            cache.delete(namespace::TOOL, capability_id).await;
            cache.delete(namespace::RESOURCE, capability_id).await;
            cache.invalidate_pattern(&format!("{}:*", namespace::TOOL_LIST)).await;
            cache.invalidate_pattern(&format!("{}:*", namespace::RESOURCE_LIST)).await;
            cache.invalidate_pattern(&format!("{}:*", namespace::SEARCH)).await;
        }
        Ok(local.is_some() || in_graph || indexed)
    }

    /// Similarity search with the configured weights, threshold and limit,
    /// served from the `search` cache namespace when possible.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>, RegistryError> {
        let vectors = self.vectors.as_ref().ok_or(RegistryError::NoVectorIndex)?;
        let settings = &self.search;
        let run = || vectors.search_by_capability(query, Some(settings.weights), settings.threshold, settings.limit);

        let hits = match &self.cache {
            Some(cache) => cached(cache, namespace::SEARCH, query, None, run).await?,
            None => run().await?,
        };
        Ok(hits)
    }

    /// Spawn a consumer that applies updates published by other instances.
    pub fn start_consumer(&self) -> ConsumerHandle {
        let mut consumer = StreamConsumer::new(
            self.consumer_config.clone(),
            Arc::clone(&self.stream),
            Arc::clone(&self.sync),
            Arc::clone(&self.state),
        );
        if let Some(vectors) = &self.vectors {
            consumer = consumer.with_vectors(Arc::clone(vectors));
        }
        let name = consumer.name().to_string();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { consumer.run(rx).await });
        ConsumerHandle {
            name,
            shutdown: tx,
            task,
        }
    }

    async fn invalidate(&self, metadata: &CapabilityMetadata) {
        let Some(cache) = &self.cache else {
            return;
        };
        match metadata.capability_type() {
            CapabilityType::ApiTool => {
                cache.invalidate_tool(&metadata.capability_id).await;
            }
            CapabilityType::KnowledgeBase | CapabilityType::Database => {
                cache.invalidate_resource(&metadata.capability_id).await;
                cache.invalidate_pattern(&format!("{}:*", namespace::SEARCH)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheBackend;
    use crate::embeddings::HashingEmbedder;
    use crate::graph::MemoryGraph;
    use crate::stream::{Fields, MemoryStream, StreamId};
    use crate::types::{CollectionDescriptor, KnowledgeDetails, ToolDetails};
    use async_trait::async_trait;
    use std::time::Duration;

    fn config() -> RegistryConfig {
        let mut config = RegistryConfig::default();
        config.graph.max_retries = 1;
        config.graph.retry_delay_ms = 1;
        config.stream.key = "updates".into();
        config.stream.block_ms = 50;
        config.stream.idle_sleep_ms = 5;
        config.stream.error_cooldown_ms = 20;
        config
    }

    async fn service(graph: &MemoryGraph, config: &RegistryConfig) -> Arc<GraphService> {
        let svc = GraphService::new(
            Arc::new(graph.clone()),
            config.graph.max_sessions,
            config.graph.retry_policy(),
        );
        svc.initialize().await.unwrap();
        Arc::new(svc)
    }

    async fn registry(graph: &MemoryGraph, stream: &MemoryStream) -> CapabilityRegistry {
        let config = config();
        let svc = service(graph, &config).await;
        let vectors = Arc::new(MultiVectorManager::new(
            Arc::clone(&svc),
            Arc::new(HashingEmbedder::default()),
        ));
        CapabilityRegistry::new(svc, Arc::new(stream.clone()), &config).with_vector_index(vectors)
    }

    fn weather() -> CapabilityMetadata {
        CapabilityMetadata::api_tool(
            "tool:weather_lookup",
            "weather_lookup",
            "Current weather lookup.\n@semantic concept: weather",
            ToolDetails::default(),
        )
    }

    fn handbook() -> CapabilityMetadata {
        CapabilityMetadata::knowledge_base(
            "kb:handbook",
            "handbook",
            "Employee handbook",
            KnowledgeDetails {
                collections: vec![CollectionDescriptor::new("policies", "HR policies")],
            },
        )
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    struct BrokenStream;

    #[async_trait]
    impl MetadataStream for BrokenStream {
        async fn append(&self, _key: &str, _fields: Fields) -> Result<StreamId, StreamError> {
            Err(StreamError::Backend("connection reset".into()))
        }

        async fn last_id(&self, _key: &str) -> Result<StreamId, StreamError> {
            Err(StreamError::Backend("connection reset".into()))
        }

        async fn read(
            &self,
            _key: &str,
            _after: StreamId,
            _block: Duration,
            _count: usize,
        ) -> Result<Vec<(StreamId, Fields)>, StreamError> {
            Err(StreamError::Backend("connection reset".into()))
        }
    }

    #[tokio::test]
    async fn test_register_provider_publishes_syncs_and_indexes() {
        let graph = MemoryGraph::new();
        let stream = MemoryStream::new();
        let registry = registry(&graph, &stream).await;

        registry
            .register_provider(Arc::new(StaticProvider::new(weather())))
            .await
            .unwrap();
        registry
            .register_provider(Arc::new(StaticProvider::new(handbook())))
            .await
            .unwrap();

        assert_eq!(stream.len("updates"), 2);
        assert!(graph.has_catalog_node("tool:weather_lookup"));
        assert_eq!(graph.collection_names("kb:handbook"), vec!["policies"]);
        assert_eq!(graph.vector_count("tool:weather_lookup"), 3);
        assert_eq!(graph.vector_count("kb:handbook"), 3);

        let ids: Vec<String> = registry
            .list_capabilities()
            .into_iter()
            .map(|m| m.capability_id)
            .collect();
        assert_eq!(ids, vec!["kb:handbook", "tool:weather_lookup"]);
        assert_eq!(registry.get_capability("kb:handbook").unwrap().name, "handbook");
        assert!(registry.get_capability("kb:missing").is_none());
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_block_sync() {
        let graph = MemoryGraph::new();
        let config = config();
        let svc = service(&graph, &config).await;
        let registry = CapabilityRegistry::new(svc, Arc::new(BrokenStream), &config);

        registry
            .register_provider(Arc::new(StaticProvider::new(weather())))
            .await
            .unwrap();
        assert!(graph.has_catalog_node("tool:weather_lookup"));
    }

    #[tokio::test]
    async fn test_sync_failure_is_returned_after_indexing() {
        let graph = MemoryGraph::new();
        let stream = MemoryStream::new();
        let registry = registry(&graph, &stream).await;
        graph.fail_next_transactions(1);

        let result = registry
            .register_provider(Arc::new(StaticProvider::new(weather())))
            .await;
        assert!(matches!(result, Err(RegistryError::Sync(_))));
        assert_eq!(stream.len("updates"), 1);
        assert!(!graph.has_catalog_node("tool:weather_lookup"));
        assert!(graph.has_index_node("tool:weather_lookup"));
        assert!(registry.state().last_applied("tool:weather_lookup").is_none());
    }

    #[tokio::test]
    async fn test_other_instance_converges_through_stream() {
        let stream = MemoryStream::new();
        let graph_a = MemoryGraph::new();
        let graph_b = MemoryGraph::new();
        let a = registry(&graph_a, &stream).await;
        let b = registry(&graph_b, &stream).await;

        let consumer = b.start_consumer();
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.register_provider(Arc::new(StaticProvider::new(weather())))
            .await
            .unwrap();

        let g = graph_b.clone();
        wait_for(move || g.vector_count("tool:weather_lookup") == 3).await;
        assert!(graph_b.has_catalog_node("tool:weather_lookup"));
        assert!(b.get_capability("tool:weather_lookup").is_none());

        consumer.shutdown().await;
    }

    #[tokio::test]
    async fn test_own_updates_are_stale_on_replay() {
        let graph = MemoryGraph::new();
        let stream = MemoryStream::new();
        let registry = registry(&graph, &stream).await;
        registry
            .register_provider(Arc::new(StaticProvider::new(weather())))
            .await
            .unwrap();
        let writes = graph.write_count();

        let consumer = StreamConsumer::new(
            config().stream.consumer_config(),
            Arc::new(stream.clone()),
            Arc::clone(&registry.sync),
            Arc::clone(&registry.state),
        );
        let mut cursor = StreamId::ZERO;
        assert_eq!(consumer.poll_once(&mut cursor).await.unwrap(), 0);
        assert_eq!(graph.write_count(), writes);
    }

    #[tokio::test]
    async fn test_search_is_cached_and_invalidated() {
        let graph = MemoryGraph::new();
        let stream = MemoryStream::new();
        let backend = MemoryCacheBackend::new();
        let cache = VersionedCache::new(Arc::new(backend.clone()));
        let registry = registry(&graph, &stream).await.with_cache(cache.clone());

        registry
            .register_provider(Arc::new(StaticProvider::new(weather())))
            .await
            .unwrap();
        let hits = registry.search("current weather").await.unwrap();
        assert_eq!(hits[0].capability_id, "tool:weather_lookup");
        assert!(hits[0].score >= 0.6);
        let stored: Vec<SearchHit> = cache.get(namespace::SEARCH, "current weather").await.unwrap();
        assert_eq!(stored.len(), hits.len());
        assert!((stored[0].score - hits[0].score).abs() < 1e-9);
        let again = registry.search("current weather").await.unwrap();
        assert_eq!(again[0].capability_id, "tool:weather_lookup");

        registry
            .register_provider(Arc::new(StaticProvider::new(handbook())))
            .await
            .unwrap();
        let stored: Option<Vec<SearchHit>> = cache.get(namespace::SEARCH, "current weather").await;
        assert!(stored.is_none());
    }

    #[tokio::test]
    async fn test_search_requires_vector_index() {
        let graph = MemoryGraph::new();
        let config = config();
        let svc = service(&graph, &config).await;
        let registry = CapabilityRegistry::new(svc, Arc::new(MemoryStream::new()), &config);
        assert!(matches!(
            registry.search("anything").await,
            Err(RegistryError::NoVectorIndex)
        ));
    }

    #[tokio::test]
    async fn test_remove_capability() {
        let graph = MemoryGraph::new();
        let stream = MemoryStream::new();
        let registry = registry(&graph, &stream).await;
        registry
            .register_provider(Arc::new(StaticProvider::new(weather())))
            .await
            .unwrap();

        assert!(registry.remove_capability("tool:weather_lookup").await.unwrap());
        assert!(!graph.has_catalog_node("tool:weather_lookup"));
        assert!(!graph.has_index_node("tool:weather_lookup"));
        assert!(registry.list_capabilities().is_empty());
        assert!(!registry.remove_capability("tool:weather_lookup").await.unwrap());
    }
}
