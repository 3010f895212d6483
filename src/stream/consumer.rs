//! Stream consumer loop.
//!
//! Tails the change stream from its current end and applies every entry to
//! the local graph, in arrival order. Replay is idempotent: an entry is only
//! applied when its `last_updated` is strictly newer than the last one
//! applied for that capability (last-write-wins).
//!
//! Errors never end the loop. They are logged and followed by a cooldown;
//! only the shutdown signal stops it.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use super::{MetadataStream, StreamEntry, StreamError, StreamId, DEFAULT_STREAM_KEY};
use crate::registry::provider::ProviderError;
use crate::registry::state::RegistryState;
use crate::sync::{GraphSync, SyncError};
use crate::vectors::{MultiVectorManager, VectorError};

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Vector(#[from] VectorError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub key: String,
    pub block: Duration,
    pub batch_size: usize,
    pub idle_sleep: Duration,
    pub error_cooldown: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            key: DEFAULT_STREAM_KEY.to_string(),
            block: Duration::from_secs(10),
            batch_size: 100,
            idle_sleep: Duration::from_millis(100),
            error_cooldown: Duration::from_secs(30),
        }
    }
}

/// Result of applying one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Not strictly newer than what was already applied; dropped.
    Stale,
}

pub struct StreamConsumer {
    name: String,
    config: ConsumerConfig,
    stream: Arc<dyn MetadataStream>,
    sync: Arc<GraphSync>,
    state: Arc<RegistryState>,
    vectors: Option<Arc<MultiVectorManager>>,
}

impl StreamConsumer {
    pub fn new(
        config: ConsumerConfig,
        stream: Arc<dyn MetadataStream>,
        sync: Arc<GraphSync>,
        state: Arc<RegistryState>,
    ) -> Self {
        Self {
            name: format!("consumer-{}", Uuid::new_v4()),
            config,
            stream,
            sync,
            state,
            vectors: None,
        }
    }

    /// Also re-index tools and knowledge bases on apply.
    pub fn with_vectors(mut self, vectors: Arc<MultiVectorManager>) -> Self {
        self.vectors = Some(vectors);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run until `shutdown` becomes `true` (or its sender is dropped).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        log::info!("{} starting on stream {}", self.name, self.config.key);

        let mut cursor = loop {
            match self.stream.last_id(&self.config.key).await {
                Ok(id) => break id,
                Err(e) => {
                    log::error!("{} could not resolve stream tail: {}", self.name, e);
                    if self.pause(self.config.error_cooldown, &mut shutdown).await {
                        log::info!("{} stopped", self.name);
                        return;
                    }
                }
            }
        };
        log::debug!("{} reading after {}", self.name, cursor);

        loop {
            if *shutdown.borrow() {
                break;
            }
            let step = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                step = self.poll_once(&mut cursor) => step,
            };
            let delay = match step {
                Ok(_) => self.config.idle_sleep,
                Err(e) => {
                    log::error!("{} failed to process stream batch: {}", self.name, e);
                    self.config.error_cooldown
                }
            };
            if self.pause(delay, &mut shutdown).await {
                break;
            }
        }
        log::info!("{} stopped", self.name);
    }

    /// Sleep for `delay`; `true` when shutdown was requested meanwhile.
    async fn pause(&self, delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        if *shutdown.borrow() {
            return true;
        }
        let closed = tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            changed = shutdown.changed() => changed.is_err(),
        };
        closed || *shutdown.borrow()
    }

    /// One blocking read and the in-order application of its entries.
    /// Advances `cursor` past every entry handled; on an apply error the
    /// cursor stays before the failing entry so it is retried.
    pub async fn poll_once(&self, cursor: &mut StreamId) -> Result<usize, ConsumerError> {
        let batch = self
            .stream
            .read(&self.config.key, *cursor, self.config.block, self.config.batch_size)
            .await?;

        let mut applied = 0;
        for (id, fields) in batch {
            match StreamEntry::from_fields(&fields) {
                Ok(entry) => {
                    if self.apply(&entry).await? == ApplyOutcome::Applied {
                        applied += 1;
                    }
                }
                Err(e) => log::warn!("{} skipping undecodable entry {}: {}", self.name, id, e),
            }
            *cursor = id;
        }
        Ok(applied)
    }

    /// Apply one entry if it is strictly newer than the last applied update
    /// for its capability.
    pub async fn apply(&self, entry: &StreamEntry) -> Result<ApplyOutcome, ConsumerError> {
        let metadata = &entry.metadata;
        let id = metadata.capability_id.as_str();
        if !self.state.is_newer(id, metadata.last_updated) {
            log::debug!(
                "{} dropping stale update for {} ({})",
                self.name,
                id,
                metadata.last_updated.to_rfc3339()
            );
            return Ok(ApplyOutcome::Stale);
        }

        self.sync.sync(metadata).await?;
        if let Some(provider) = self.state.provider(id) {
            provider.update_metadata(metadata).await?;
            self.state.update_capability(metadata);
        }
        if let Some(vectors) = &self.vectors {
            if metadata.capability_type().is_vector_indexed() {
                vectors.register(metadata, false).await?;
            }
        }
        self.state.record_applied(id, metadata.last_updated);
        log::debug!("{} applied update for {}", self.name, id);
        Ok(ApplyOutcome::Applied)
    }
}
