//! Progressive context disclosure engine.
//!
//! Stores fragments of an agent's history as embedded context items, ages
//! them through a lifecycle, and answers queries with a small, ranked,
//! deduplicated slice of the corpus instead of the full transcript.

pub mod api;
pub mod core;
pub mod middleware;
pub mod models;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::AppState;
use crate::core::config::LoggingConfig;
use crate::core::service::ContextService;
use crate::middleware::{error_handler, request_id};

/// Install the global tracing subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

pub fn create_app(service: Arc<ContextService>) -> Router {
    let state = AppState::new(service);

    let context_routes = Router::new()
        .route(
            "/v1/context",
            post(api::context::store_context).get(api::context::list_context_items),
        )
        .route("/v1/context/retrieve", post(api::context::retrieve_context))
        .route(
            "/v1/context/:id",
            get(api::context::get_context_item).delete(api::context::purge_context_item),
        )
        .route("/v1/context/:id/state", post(api::context::update_context_state))
        .route("/v1/context/:id/feedback", post(api::context::mark_useful));

    let iteration_routes = Router::new()
        .route("/v1/iterations", post(api::iterations::summarize_iteration))
        .route("/v1/iterations/history", get(api::iterations::iteration_history))
        .route("/v1/learnings", get(api::iterations::learnings));

    let admin_routes = Router::new()
        .route("/v1/stats", get(api::stats::get_stats))
        .route("/v1/maintenance/sweep", post(api::maintenance::run_maintenance))
        .route(
            "/v1/maintenance/rebuild-index",
            post(api::maintenance::rebuild_index),
        )
        .route("/health", get(api::health::health_check));

    Router::new()
        .merge(context_routes)
        .merge(iteration_routes)
        .merge(admin_routes)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(axum::middleware::from_fn(error_handler::handle_errors))
                .layer(axum::middleware::from_fn(request_id::add_request_id)),
        )
}
