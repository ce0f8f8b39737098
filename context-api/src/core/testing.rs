//! Deterministic collaborators for unit tests.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::embedding::{EmbeddingProvider, HashingEmbedder};
use super::error::EmbeddingError;

/// Returns pinned vectors for known texts and hashed vectors otherwise.
pub struct StubEmbedder {
    fallback: HashingEmbedder,
    pinned: RwLock<HashMap<String, Vec<f32>>>,
}

impl StubEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            fallback: HashingEmbedder::new(dimension),
            pinned: RwLock::new(HashMap::new()),
        }
    }

    pub fn pin(&self, text: &str, vector: Vec<f32>) {
        self.pinned.write().insert(text.to_string(), vector);
    }

    pub fn with(self, text: &str, vector: Vec<f32>) -> Self {
        self.pin(text, vector);
        self
    }
}

#[async_trait]
impl EmbeddingProvider for StubEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if let Some(vector) = self.pinned.read().get(text) {
            return Ok(vector.clone());
        }
        Ok(self.fallback.embed_sync(text))
    }
}
