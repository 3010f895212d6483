//! Deterministic feature-hashing embedder.
//!
//! Each lowercase alphanumeric token is hashed with SHA-256 into one of
//! `dimensions` buckets; the bucket counts are L2-normalized. Identical text
//! always yields an identical vector, across processes and platforms.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{Embedder, EmbeddingError};

/// Default vector length.
pub const DEFAULT_DIMENSIONS: usize = 512;

#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSIONS)
    }
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn bucket(&self, token: &str) -> usize {
        let digest = Sha256::digest(token.as_bytes());
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(raw) % self.dimensions as u64) as usize
    }

    /// Synchronous core, shared by the async trait methods.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimensions];
        for token in tokenize(text) {
            v[self.bucket(&token)] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        v
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_text(text))
    }

    fn dimensions(&self) -> Option<usize> {
        Some(self.dimensions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::cosine_similarity;

    #[test]
    fn test_embedding_is_deterministic_and_normalized() {
        let e = HashingEmbedder::default();
        let a = e.embed_text("Current weather lookup");
        let b = e.embed_text("current  WEATHER, lookup!");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_shared_tokens_raise_similarity() {
        let e = HashingEmbedder::default();
        let q = e.embed_text("current weather");
        let near = e.embed_text("weather lookup");
        let far = e.embed_text("invoice ledger export");
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let e = HashingEmbedder::new(8);
        assert_eq!(e.embed_text("  !! "), vec![0.0; 8]);
    }

    #[tokio::test]
    async fn test_batch_matches_single() {
        let e = HashingEmbedder::new(64);
        let batch = e
            .embed_batch(&["alpha".to_string(), "beta gamma".to_string()])
            .await
            .unwrap();
        assert_eq!(batch[1], e.embed("beta gamma").await.unwrap());
    }
}
