//! Multi-vector capability index.
//!
//! Every indexed capability carries three embeddings (semantic, functional,
//! contextual), each the element-wise mean of the embeddings of its source
//! fields. A content hash over the source fields short-circuits re-indexing
//! when nothing changed. Search embeds a query the same way and ranks by a
//! weighted sum of the three cosine similarities.

pub mod extractor;
pub mod fields;
pub mod manager;

use thiserror::Error;

use crate::embeddings::EmbeddingError;
use crate::graph::GraphError;

pub use extractor::{AnnotationExtractor, MetadataExtractor, QueryRepresentation};
pub use fields::{content_hash, CapabilityFields, VectorCategory, VectorSet};
pub use manager::{
    IntegrityIssue, MultiVectorManager, RegisterOutcome, SearchHit, SearchWeights, SyncReport, TextMatch,
};

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("Field extraction failed: {0}")]
    Extraction(String),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}
