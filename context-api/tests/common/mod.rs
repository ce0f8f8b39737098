#![allow(dead_code)]

use async_trait::async_trait;
use axum_test::TestServer;
use context_api::core::clock::ManualClock;
use context_api::core::config::Settings;
use context_api::core::embedding::{EmbeddingProvider, HashingEmbedder};
use context_api::core::error::EmbeddingError;
use context_api::core::service::ContextService;
use std::collections::HashMap;
use std::sync::Arc;

pub const DIM: usize = 4;

/// Fixed vectors for known texts, hashed vectors for everything else.
pub struct PinnedEmbedder {
    pinned: HashMap<String, Vec<f32>>,
    fallback: HashingEmbedder,
}

impl PinnedEmbedder {
    pub fn new(pins: &[(&str, [f32; DIM])]) -> Self {
        Self {
            pinned: pins
                .iter()
                .map(|(text, v)| (text.to_string(), v.to_vec()))
                .collect(),
            fallback: HashingEmbedder::new(DIM),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for PinnedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self
            .pinned
            .get(text)
            .cloned()
            .unwrap_or_else(|| self.fallback.embed_sync(text)))
    }
}

pub fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.corpus.embedding_dimension = DIM;
    settings.lifecycle.stale_after_secs = 3600;
    settings.lifecycle.archive_after_secs = 2 * 3600;
    settings.lifecycle.purge_after_secs = 3 * 3600;
    settings.lifecycle.sweep_every_n_writes = 0;
    settings
}

pub struct Harness {
    pub server: TestServer,
    pub service: Arc<ContextService>,
    pub clock: Arc<ManualClock>,
}

pub fn harness(settings: &Settings, embedder: PinnedEmbedder) -> Harness {
    let clock = Arc::new(ManualClock::default());
    let service = Arc::new(
        ContextService::with_provider(settings, Arc::new(embedder), clock.clone()).unwrap(),
    );
    let server = TestServer::new(context_api::create_app(service.clone())).unwrap();
    Harness {
        server,
        service,
        clock,
    }
}
