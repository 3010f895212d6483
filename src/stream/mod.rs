//! Metadata change stream.
//!
//! Every registration appends a [`StreamEntry`] to an append-only stream.
//! Other registry instances tail the stream with a
//! [`StreamConsumer`](consumer::StreamConsumer) and apply the entries to their
//! own graph, so delivery is at-least-once and replay must be idempotent.
//!
//! The stream itself is consumed through the [`MetadataStream`] trait; entries
//! are flat string maps addressed by a monotonically increasing [`StreamId`].

pub mod consumer;
pub mod memory;
pub mod publisher;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{CapabilityMetadata, CapabilityType};

pub use consumer::{ApplyOutcome, ConsumerConfig, ConsumerError, StreamConsumer};
pub use memory::MemoryStream;
pub use publisher::MetadataPublisher;

/// Default stream key.
pub const DEFAULT_STREAM_KEY: &str = "capgraph:metadata_updates";

/// Raw entry payload.
pub type Fields = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Stream backend error: {0}")]
    Backend(String),

    #[error("Stream entry is missing field '{0}'")]
    MissingField(&'static str),

    #[error("Invalid stream entry: {0}")]
    Invalid(String),

    #[error("Invalid stream id: {0}")]
    InvalidId(String),

    #[error("Failed to (de)serialize metadata snapshot: {0}")]
    Json(#[from] serde_json::Error),
}

/// `<millis>-<seq>`; ordered by time, then sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId {
    pub millis: u64,
    pub seq: u64,
}

impl StreamId {
    /// Before every entry.
    pub const ZERO: StreamId = StreamId { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StreamError::InvalidId(s.to_string());
        let (millis, seq) = s.split_once('-').unwrap_or((s, "0"));
        Ok(Self {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// One change event: a full metadata snapshot plus routing hints.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub capability_id: String,
    pub capability_type: CapabilityType,
    pub metadata: CapabilityMetadata,
    /// When the entry was generated (not the metadata's `last_updated`).
    pub timestamp: DateTime<Utc>,
    pub graph_source: String,
    pub node_name: String,
}

impl StreamEntry {
    pub fn from_metadata(metadata: &CapabilityMetadata) -> Self {
        Self {
            capability_id: metadata.capability_id.clone(),
            capability_type: metadata.capability_type(),
            metadata: metadata.clone(),
            timestamp: Utc::now(),
            graph_source: metadata.graph_source.clone(),
            node_name: metadata.node_name.clone(),
        }
    }

    pub fn to_fields(&self) -> Result<Fields, StreamError> {
        let mut fields = Fields::new();
        fields.insert("capability_id".into(), self.capability_id.clone());
        fields.insert("type".into(), self.capability_type.as_str().to_string());
        fields.insert("metadata".into(), serde_json::to_string(&self.metadata)?);
        fields.insert("timestamp".into(), self.timestamp.to_rfc3339());
        fields.insert("graph_source".into(), self.graph_source.clone());
        fields.insert("node_name".into(), self.node_name.clone());
        Ok(fields)
    }

    pub fn from_fields(fields: &Fields) -> Result<Self, StreamError> {
        let get = |key: &'static str| fields.get(key).ok_or(StreamError::MissingField(key));

        let metadata: CapabilityMetadata = serde_json::from_str(get("metadata")?)?;
        let capability_id = get("capability_id")?.clone();
        if metadata.capability_id != capability_id {
            return Err(StreamError::Invalid(format!(
                "entry id {} does not match snapshot id {}",
                capability_id, metadata.capability_id
            )));
        }
        let capability_type: CapabilityType = get("type")?
            .parse()
            .map_err(|e: crate::types::UnknownCapabilityType| StreamError::Invalid(e.to_string()))?;
        let timestamp = DateTime::parse_from_rfc3339(get("timestamp")?)
            .map_err(|e| StreamError::Invalid(format!("timestamp: {}", e)))?
            .with_timezone(&Utc);

        Ok(Self {
            capability_id,
            capability_type,
            metadata,
            timestamp,
            graph_source: fields.get("graph_source").cloned().unwrap_or_default(),
            node_name: fields.get("node_name").cloned().unwrap_or_default(),
        })
    }
}

/// An append-only, tail-able stream.
#[async_trait]
pub trait MetadataStream: Send + Sync {
    /// Append an entry and return its id.
    async fn append(&self, key: &str, fields: Fields) -> Result<StreamId, StreamError>;

    /// Id of the newest entry, or [`StreamId::ZERO`] for an empty stream.
    async fn last_id(&self, key: &str) -> Result<StreamId, StreamError>;

    /// Up to `count` entries with ids strictly after `after`, waiting up to
    /// `block` for at least one to arrive. An empty result means timeout.
    async fn read(
        &self,
        key: &str,
        after: StreamId,
        block: Duration,
        count: usize,
    ) -> Result<Vec<(StreamId, Fields)>, StreamError>;
}
