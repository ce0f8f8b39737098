//! Embedding provider abstraction.
//!
//! The engine treats embedding as an injected capability: text in, fixed
//! length vector out. Every call made by the engine is bounded by a timeout
//! and surfaces [`StoreError::Timeout`] instead of hanging.
//!
//! [`HashingEmbedder`] is the built-in backend. It hashes word and character
//! trigram features into a fixed number of signed buckets, which is enough to
//! make lexically related fragments land near each other without shipping a
//! model.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use tracing::debug;

use super::error::{EmbeddingError, StoreError, StoreResult};

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Map `text` to a vector of the corpus dimension.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Run `provider.embed` under `timeout`.
pub async fn embed_with_timeout(
    provider: &dyn EmbeddingProvider,
    text: &str,
    timeout: Duration,
) -> StoreResult<Vec<f32>> {
    let start = Instant::now();
    match tokio::time::timeout(timeout, provider.embed(text)).await {
        Ok(result) => {
            let vector = result?;
            debug!(
                dimension = vector.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Embedded text"
            );
            Ok(vector)
        },
        Err(_) => Err(StoreError::Timeout {
            operation: "embedding",
            elapsed: start.elapsed(),
        }),
    }
}

const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;

/// Deterministic feature-hashing embedder.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn tokens(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bucket_bytes = [0u8; 8];
        bucket_bytes.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }

    /// Synchronous embedding, exposed for callers outside an async context.
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        if self.dimension == 0 {
            return vector;
        }

        for token in Self::tokens(text) {
            self.add_feature(&mut vector, &format!("w:{token}"), WORD_WEIGHT);

            let chars: Vec<char> = token.chars().collect();
            if chars.len() > 3 {
                for window in chars.windows(3) {
                    let trigram: String = window.iter().collect();
                    self.add_feature(&mut vector, &format!("t:{trigram}"), TRIGRAM_WEIGHT);
                }
            }
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if self.dimension == 0 {
            return Err(EmbeddingError::InvalidInput(
                "embedding dimension must be positive".to_string(),
            ));
        }
        Ok(self.embed_sync(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;

    mock! {
        pub Provider {}

        #[async_trait]
        impl EmbeddingProvider for Provider {
            async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl EmbeddingProvider for SlowProvider {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(vec![1.0])
        }
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[tokio::test]
    async fn test_hashing_embedder_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed("Fix the failing auth test").await.unwrap();
        let b = embedder.embed("Fix the failing auth test").await.unwrap();

        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_related_text_is_closer() {
        let embedder = HashingEmbedder::new(256);
        let query = embedder.embed_sync("database migration failed");
        let related = embedder.embed_sync("the database migration failed with a lock error");
        let unrelated = embedder.embed_sync("render the dashboard sparkline widget");

        assert!(cosine(&query, &related) > cosine(&query, &unrelated));
    }

    #[test]
    fn test_empty_text_yields_zero_vector() {
        let embedder = HashingEmbedder::new(16);
        let v = embedder.embed_sync("  !!! ");
        assert_eq!(v.len(), 16);
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_timeout_is_typed() {
        let err = embed_with_timeout(&SlowProvider, "text", Duration::from_millis(20))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StoreError::Timeout {
                operation: "embedding",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_provider_failure_propagates() {
        let mut provider = MockProvider::new();
        provider
            .expect_embed()
            .times(1)
            .returning(|_| Err(EmbeddingError::Unavailable("model offline".to_string())));

        let err = embed_with_timeout(&provider, "text", Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StoreError::Embedding(EmbeddingError::Unavailable(_))
        ));
    }
}
