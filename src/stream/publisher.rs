//! Appends metadata snapshots to the change stream.

use std::sync::Arc;

use super::{MetadataStream, StreamEntry, StreamError, StreamId};
use crate::types::CapabilityMetadata;

pub struct MetadataPublisher {
    stream: Arc<dyn MetadataStream>,
    key: String,
}

impl MetadataPublisher {
    pub fn new(stream: Arc<dyn MetadataStream>, key: impl Into<String>) -> Self {
        Self {
            stream,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Append one entry carrying the full snapshot.
    pub async fn publish(&self, metadata: &CapabilityMetadata) -> Result<StreamId, StreamError> {
        let fields = StreamEntry::from_metadata(metadata).to_fields()?;
        let id = self.stream.append(&self.key, fields).await?;
        log::debug!("Published {} as {} on {}", metadata.capability_id, id, self.key);
        Ok(id)
    }
}
