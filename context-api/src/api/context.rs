use axum::{
    Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;

use super::AppState;
use crate::models::{
    api::{
        ItemBody, ItemList, ListQuery, MarkUsefulBody, RetrieveContextBody, StoredId,
        UpdateStateBody, UsefulnessBody, Versioned,
    },
    context::{ContextId, NewContextItem},
    error::{ApiError, ApiResult},
};

pub async fn store_context(
    State(state): State<AppState>,
    payload: Result<Json<Versioned<NewContextItem>>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let item = request.into_checked()?;
    let id = state.service.store_context(item).await?;

    Ok((StatusCode::CREATED, Json(Versioned::new(StoredId { id }))))
}

pub async fn retrieve_context(
    State(state): State<AppState>,
    payload: Result<Json<Versioned<RetrieveContextBody>>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let body = request.into_checked()?;
    let result = state
        .service
        .retrieve_context(&body.query, &body.filters, body.budget)
        .await?;

    Ok(Json(Versioned::new(result)))
}

pub async fn get_context_item(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<impl IntoResponse> {
    let item = state.service.get_item(ContextId(id))?;
    Ok(Json(Versioned::new(ItemBody { item })))
}

pub async fn list_context_items(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    let filter = query.into_filter().map_err(ApiError::Validation)?;
    let items = state.service.list_items(&filter);

    Ok(Json(Versioned::new(ItemList::new(items))))
}

pub async fn update_context_state(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    payload: Result<Json<Versioned<UpdateStateBody>>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let body = request.into_checked()?;
    let item = state.service.update_state(ContextId(id), body.state).await?;

    Ok(Json(Versioned::new(ItemBody { item })))
}

pub async fn purge_context_item(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<impl IntoResponse> {
    let item = state.service.purge_item(ContextId(id)).await?;
    Ok(Json(Versioned::new(ItemBody { item })))
}

pub async fn mark_useful(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    payload: Result<Json<Versioned<MarkUsefulBody>>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let body = request.into_checked()?;
    let id = ContextId(id);
    let usefulness_score = state.service.mark_useful(id, body.helpful)?;
    if let Some(reason) = &body.reason {
        info!(item_id = %id, reason = %reason, "Feedback reason");
    }

    Ok(Json(Versioned::new(UsefulnessBody {
        id,
        usefulness_score,
    })))
}
