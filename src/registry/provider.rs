//! Metadata providers.
//!
//! A provider owns one capability and is the source of truth for its
//! metadata. The registry pulls a snapshot on registration and pushes newer
//! snapshots back when they arrive through the change stream.

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use crate::types::CapabilityMetadata;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Provider rejected update: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Current metadata snapshot.
    async fn get_metadata(&self) -> Result<CapabilityMetadata, ProviderError>;

    /// Accept a newer snapshot that arrived from elsewhere.
    async fn update_metadata(&self, metadata: &CapabilityMetadata) -> Result<(), ProviderError>;

    /// Operational status, e.g. `"active"`.
    async fn get_status(&self) -> Result<String, ProviderError>;

    /// Names of the elements the capability exposes.
    async fn get_elements(&self) -> Result<Vec<String>, ProviderError>;
}

/// A provider that serves a fixed snapshot, replaced on update.
pub struct StaticProvider {
    metadata: RwLock<CapabilityMetadata>,
    updates: RwLock<usize>,
}

impl StaticProvider {
    pub fn new(metadata: CapabilityMetadata) -> Self {
        Self {
            metadata: RwLock::new(metadata),
            updates: RwLock::new(0),
        }
    }

    /// How many times `update_metadata` was called.
    pub fn update_count(&self) -> usize {
        *self.updates.read()
    }

    pub fn snapshot(&self) -> CapabilityMetadata {
        self.metadata.read().clone()
    }
}

#[async_trait]
impl MetadataProvider for StaticProvider {
    async fn get_metadata(&self) -> Result<CapabilityMetadata, ProviderError> {
        Ok(self.snapshot())
    }

    async fn update_metadata(&self, metadata: &CapabilityMetadata) -> Result<(), ProviderError> {
        let mut current = self.metadata.write();
        if current.capability_id != metadata.capability_id {
            return Err(ProviderError::Rejected(format!(
                "snapshot for {} sent to provider of {}",
                metadata.capability_id, current.capability_id
            )));
        }
        *current = metadata.clone();
        *self.updates.write() += 1;
        Ok(())
    }

    async fn get_status(&self) -> Result<String, ProviderError> {
        Ok(self.metadata.read().status.clone())
    }

    async fn get_elements(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self.metadata.read().element_names())
    }
}
