//! Process-local registry state shared by the registry and its consumer.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::provider::MetadataProvider;
use crate::types::CapabilityMetadata;

/// Providers by capability id, and the newest applied `last_updated` per id.
#[derive(Default)]
pub struct RegistryState {
    providers: RwLock<HashMap<String, Arc<dyn MetadataProvider>>>,
    capabilities: RwLock<HashMap<String, CapabilityMetadata>>,
    last_applied: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl RegistryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_provider(&self, metadata: &CapabilityMetadata, provider: Arc<dyn MetadataProvider>) {
        let id = metadata.capability_id.clone();
        self.providers.write().insert(id.clone(), provider);
        self.capabilities.write().insert(id, metadata.clone());
    }

    pub fn provider(&self, capability_id: &str) -> Option<Arc<dyn MetadataProvider>> {
        self.providers.read().get(capability_id).cloned()
    }

    pub fn remove(&self, capability_id: &str) -> Option<Arc<dyn MetadataProvider>> {
        self.capabilities.write().remove(capability_id);
        self.last_applied.write().remove(capability_id);
        self.providers.write().remove(capability_id)
    }

    /// Metadata of a locally registered capability.
    pub fn capability(&self, capability_id: &str) -> Option<CapabilityMetadata> {
        self.capabilities.read().get(capability_id).cloned()
    }

    /// Refresh the cached snapshot of a locally registered capability.
    pub fn update_capability(&self, metadata: &CapabilityMetadata) {
        if let Some(existing) = self.capabilities.write().get_mut(&metadata.capability_id) {
            *existing = metadata.clone();
        }
    }

    /// Locally registered capabilities, by id.
    pub fn capabilities(&self) -> Vec<CapabilityMetadata> {
        let mut all: Vec<CapabilityMetadata> = self.capabilities.read().values().cloned().collect();
        all.sort_by(|a, b| a.capability_id.cmp(&b.capability_id));
        all
    }

    pub fn last_applied(&self, capability_id: &str) -> Option<DateTime<Utc>> {
        self.last_applied.read().get(capability_id).copied()
    }

    /// Whether `timestamp` is strictly newer than anything applied for the id.
    pub fn is_newer(&self, capability_id: &str, timestamp: DateTime<Utc>) -> bool {
        self.last_applied(capability_id)
            .map(|last| timestamp > last)
            .unwrap_or(true)
    }

    /// Record an applied timestamp. Never moves the clock backwards.
    pub fn record_applied(&self, capability_id: &str, timestamp: DateTime<Utc>) {
        let mut map = self.last_applied.write();
        let entry = map.entry(capability_id.to_string()).or_insert(timestamp);
        if timestamp > *entry {
            *entry = timestamp;
        }
    }
}
