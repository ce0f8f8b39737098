use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::core::error::{EmbeddingError, StoreError};
use crate::models::context::SCHEMA_VERSION;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Corpus capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Index sync failed: {0}")]
    IndexSync(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err {
            StoreError::Validation(m) => ApiError::Validation(m),
            StoreError::NotFound(_) => ApiError::NotFound(message),
            StoreError::InvalidTransition { .. } => ApiError::InvalidTransition(message),
            StoreError::Timeout { .. } => ApiError::Timeout(message),
            StoreError::CorpusCapacityExceeded { .. } => ApiError::CapacityExceeded(message),
            StoreError::Embedding(EmbeddingError::InvalidInput(m)) => ApiError::Validation(m),
            StoreError::Embedding(_) => ApiError::Embedding(message),
            StoreError::IndexSyncFailed { .. } => ApiError::IndexSync(message),
            StoreError::Persistence(_) | StoreError::Internal(_) => ApiError::Internal(message),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::Validation(rejection.body_text())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub schema_version: u32,
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: String,
    pub code: Option<String>,
    /// Whether the same request may succeed when retried with backoff
    pub retryable: bool,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, code, retryable) = match &self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error", None, false),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found_error", None, false),
            ApiError::InvalidTransition(_) => (
                StatusCode::CONFLICT,
                "invalid_transition_error",
                Some("invalid_transition"),
                false,
            ),
            ApiError::Timeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "timeout_error",
                Some("timeout"),
                true,
            ),
            ApiError::CapacityExceeded(_) => (
                StatusCode::INSUFFICIENT_STORAGE,
                "capacity_error",
                Some("corpus_capacity_exceeded"),
                true,
            ),
            ApiError::Embedding(_) => (StatusCode::BAD_GATEWAY, "embedding_error", None, true),
            ApiError::IndexSync(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                Some("index_sync_failed"),
                false,
            ),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None, false),
        };

        let error_response = ErrorResponse {
            schema_version: SCHEMA_VERSION,
            error: ErrorDetail {
                message: self.to_string(),
                r#type: error_type.to_string(),
                code: code.map(String::from),
                retryable,
            },
        };

        (status, Json(error_response)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
