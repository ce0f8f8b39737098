use axum::{Json, extract::State, response::IntoResponse};

use super::AppState;
use crate::models::{
    api::{RebuildBody, Versioned},
    error::{ApiError, ApiResult},
};

/// Run a lifecycle sweep now. The sweep holds the corpus write lock, so it
/// runs on the blocking pool.
pub async fn run_maintenance(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let service = state.service.clone();
    let report = tokio::task::spawn_blocking(move || service.run_maintenance())
        .await
        .map_err(|e| ApiError::Internal(format!("maintenance task failed: {e}")))??;

    Ok(Json(Versioned::new(report)))
}

pub async fn rebuild_index(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let service = state.service.clone();
    let entries = tokio::task::spawn_blocking(move || service.rebuild_index())
        .await
        .map_err(|e| ApiError::Internal(format!("rebuild task failed: {e}")))??;

    Ok(Json(Versioned::new(RebuildBody { entries })))
}
