//! Embedding service boundary.
//!
//! The registry treats the embedding model as a black box that turns text
//! into a fixed-length vector. Everything the rest of the crate needs from it
//! is captured by the [`Embedder`] trait; two implementations ship here:
//!
//! - [`HashingEmbedder`]: deterministic feature hashing, no network. Used for
//!   local development and tests.
//! - [`HttpEmbedder`]: an OpenAI-compatible `/embeddings` endpoint.
//!
//! The module also owns the vector arithmetic shared by the multi-vector
//! manager and the in-process graph backend: element-wise averaging and the
//! two cosine formulations (native and the manual reduce-style expansion used
//! when the graph store lacks its similarity extension).

pub mod hashing;
pub mod http;

use async_trait::async_trait;
use thiserror::Error;

pub use hashing::HashingEmbedder;
pub use http::HttpEmbedder;

/// Errors produced by embedding providers.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// The request to the embedding service failed.
    #[error("Embedding request failed: {0}")]
    Request(String),

    /// The service answered with something we could not use.
    #[error("Invalid embedding response: {0}")]
    Response(String),

    /// Vectors of different lengths were combined.
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Text → vector conversion.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed several texts. The default implementation calls [`embed`](Self::embed)
    /// sequentially; providers with a native batch endpoint override it.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Output dimensionality, when known up front.
    fn dimensions(&self) -> Option<usize> {
        None
    }
}

/// Element-wise mean of a set of vectors.
///
/// Returns `Ok(None)` for an empty input. Vectors are averaged, never
/// concatenated, so the result has the same length as every input.
pub fn mean_vector(vectors: &[Vec<f32>]) -> Result<Option<Vec<f32>>, EmbeddingError> {
    let Some(first) = vectors.first() else {
        return Ok(None);
    };
    let dim = first.len();
    let mut sum = vec![0.0f64; dim];
    for v in vectors {
        if v.len() != dim {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dim,
                actual: v.len(),
            });
        }
        for (acc, x) in sum.iter_mut().zip(v) {
            *acc += f64::from(*x);
        }
    }
    let n = vectors.len() as f64;
    Ok(Some(sum.into_iter().map(|s| (s / n) as f32).collect()))
}

/// Cosine similarity as the graph store's similarity extension computes it.
///
/// Zero-norm operands score `0.0`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| f64::from(*x) * f64::from(*y)).sum();
    let na = l2_norm(a);
    let nb = l2_norm(b);
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

/// The manual expansion substituted for the similarity extension:
/// `reduce(dot) / (sqrt(reduce(a·a)) * sqrt(reduce(b·b)))`, evaluated index by
/// index over the first operand's length, exactly as the rewritten query does.
pub fn manual_cosine(a: &[f32], b: &[f32]) -> f64 {
    let n = a.len().min(b.len());
    let mut dot = 0.0f64;
    let mut sa = 0.0f64;
    let mut sb = 0.0f64;
    for i in 0..n {
        dot += f64::from(a[i]) * f64::from(b[i]);
        sa += f64::from(a[i]) * f64::from(a[i]);
        sb += f64::from(b[i]) * f64::from(b[i]);
    }
    let denom = sa.sqrt() * sb.sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    dot / denom
}

/// Euclidean norm.
pub fn l2_norm(v: &[f32]) -> f64 {
    v.iter().map(|x| f64::from(*x) * f64::from(*x)).sum::<f64>().sqrt()
}
