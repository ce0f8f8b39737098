pub mod context;
pub mod health;
pub mod iterations;
pub mod maintenance;
pub mod stats;

use std::sync::Arc;

use crate::core::service::ContextService;

/// Shared state of every route.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ContextService>,
}

impl AppState {
    pub fn new(service: Arc<ContextService>) -> Self {
        Self { service }
    }
}
