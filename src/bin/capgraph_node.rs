//! capgraph registry node.
//!
//! Loads the registry configuration, connects to the graph store, starts the
//! stream consumer and runs until Ctrl-C.
//!
//! # Environment Variables
//!
//! - `CAPGRAPH_CONFIG`: path to a YAML config file (optional)
//! - `CAPGRAPH_*`: per-setting overrides, see `capgraph::config`
//! - `RUST_LOG`: tracing filter (default: "info,capgraph=debug")
//!
//! Without an `http(s)://` graph URI the node runs against an in-process
//! graph and stream, which is useful for local development.

use std::sync::Arc;

use anyhow::Context;

use capgraph::cache::{MemoryCacheBackend, VersionedCache};
use capgraph::config::RegistryConfig;
use capgraph::embeddings::{Embedder, HashingEmbedder, HttpEmbedder};
use capgraph::graph::http::HttpGraphDriver;
use capgraph::graph::{GraphDriver, GraphService, MemoryGraph};
use capgraph::registry::CapabilityRegistry;
use capgraph::stream::MemoryStream;
use capgraph::vectors::MultiVectorManager;

fn load_config() -> anyhow::Result<RegistryConfig> {
    let mut config = match std::env::var("CAPGRAPH_CONFIG") {
        Ok(path) => RegistryConfig::from_file(&path).with_context(|| format!("loading {}", path))?,
        Err(_) => RegistryConfig::default(),
    };
    config.apply_env().context("applying CAPGRAPH_* overrides")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,capgraph=debug".into()),
        )
        .init();

    let config = load_config()?;

    let driver: Arc<dyn GraphDriver> = if config.graph.is_remote() {
        tracing::info!("Using graph store at {}", config.graph.uri);
        Arc::new(HttpGraphDriver::new(config.graph.http_config())?)
    } else {
        tracing::warn!("No graph store configured, using in-process graph");
        Arc::new(MemoryGraph::new())
    };
    let graph = Arc::new(GraphService::new(
        driver,
        config.graph.max_sessions,
        config.graph.retry_policy(),
    ));
    graph.initialize().await.context("connecting to graph store")?;

    let embedder: Arc<dyn Embedder> = match config.embedding.http_config() {
        Some(http) => Arc::new(HttpEmbedder::new(http)),
        None => Arc::new(HashingEmbedder::new(config.embedding.hashing_dimensions())),
    };
    let vectors = Arc::new(MultiVectorManager::new(Arc::clone(&graph), embedder));
    let cache = VersionedCache::new(Arc::new(MemoryCacheBackend::new()))
        .with_prefix(config.cache.prefix.clone())
        .with_ttls(config.cache.ttl);

    let registry = CapabilityRegistry::new(Arc::clone(&graph), Arc::new(MemoryStream::new()), &config)
        .with_vector_index(vectors)
        .with_cache(cache);

    let consumer = registry.start_consumer();
    let health = graph.health();
    tracing::info!(
        "capgraph node {} up: consumer {}, {} session(s) max, similarity extension {}",
        capgraph::VERSION,
        consumer.name(),
        health.pool.max_sessions,
        if health.extension_available { "available" } else { "unavailable" }
    );

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("Shutting down");

    consumer.shutdown().await;
    graph.close().await?;
    Ok(())
}
