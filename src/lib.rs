//! # capgraph
//!
//! A capability registry. Providers describe knowledge bases, API tools and
//! databases; the registry publishes their metadata on a change stream,
//! writes it to a graph store, indexes it as three embedding vectors per
//! capability and answers weighted similarity searches over them.
//!
//! Layers, leaves first:
//!
//! - [`embeddings`]: text to vector.
//! - [`graph`]: connection pool, transaction retries, query rewriting when the
//!   similarity extension is missing.
//! - [`sync`]: typed catalog upserts.
//! - [`vectors`]: multi-vector index with content-hash change detection.
//! - [`stream`]: publisher and last-write-wins consumer loop.
//! - [`registry`]: the orchestrator.
//! - [`cache`]: versioned cache with bounded invalidation.

pub mod cache;
pub mod config;
pub mod embeddings;
pub mod graph;
pub mod registry;
pub mod stream;
pub mod sync;
pub mod types;
pub mod vectors;

pub use cache::{cached, CacheBackend, VersionedCache};
pub use config::RegistryConfig;
pub use embeddings::Embedder;
pub use graph::{GraphDriver, GraphError, GraphService};
pub use registry::{CapabilityRegistry, ConsumerHandle, MetadataProvider, RegistryError};
pub use stream::{MetadataPublisher, MetadataStream, StreamConsumer};
pub use sync::GraphSync;
pub use types::{CapabilityMetadata, CapabilityType};
pub use vectors::{MultiVectorManager, SearchHit, SearchWeights};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
