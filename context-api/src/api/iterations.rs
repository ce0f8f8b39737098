use axum::{
    Json,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::IntoResponse,
};

use super::AppState;
use crate::models::{
    api::{HistoryQuery, ItemList, LearningsQuery, StoredIds, Versioned},
    context::IterationResult,
    error::ApiResult,
};

const DEFAULT_HISTORY: usize = 5;

pub async fn summarize_iteration(
    State(state): State<AppState>,
    payload: Result<Json<Versioned<IterationResult>>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let iteration = request.into_checked()?;
    let ids = state.service.summarize_iteration(&iteration).await?;

    Ok((StatusCode::CREATED, Json(Versioned::new(StoredIds { ids }))))
}

pub async fn iteration_history(
    State(state): State<AppState>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    let items = state
        .service
        .iteration_history(query.last_n.unwrap_or(DEFAULT_HISTORY));

    Ok(Json(Versioned::new(ItemList::new(items))))
}

pub async fn learnings(
    State(state): State<AppState>,
    query: Result<Query<LearningsQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    let items = state
        .service
        .learnings(&query.tag_list(), query.min_usefulness.unwrap_or(0.0));

    Ok(Json(Versioned::new(ItemList::new(items))))
}
