//! The embedding client contract and a deterministic in-memory fake for tests.

use async_trait::async_trait;

use crate::error::Result;

/// Capability interface for a text-embedding provider.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed a single piece of text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts; implementations may parallelize internally.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// The fixed dimensionality this provider returns.
    fn dimensions(&self) -> usize;

    /// A short name for logging.
    fn name(&self) -> &str;
}

/// A deterministic fake: hashes the input text into a fixed-dimension
/// vector so that identical text always embeds identically and distinct
/// text almost always embeds to distinct vectors, without any network call.
pub struct FakeEmbeddingClient {
    dimensions: usize,
}

impl FakeEmbeddingClient {
    #[must_use]
    pub const fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn hash_embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimensions];
        let bytes = text.as_bytes();
        if bytes.is_empty() {
            return vector;
        }
        for (i, slot) in vector.iter_mut().enumerate() {
            let mut acc: u64 = (i as u64).wrapping_add(1).wrapping_mul(2_654_435_761);
            for &b in bytes {
                acc = acc.wrapping_mul(31).wrapping_add(u64::from(b));
            }
            *slot = ((acc % 2000) as f32 / 1000.0) - 1.0;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingClient for FakeEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.hash_embed(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.hash_embed(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "fake-embedding"
    }
}
