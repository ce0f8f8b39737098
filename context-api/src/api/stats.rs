use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;

use super::AppState;
use crate::models::{api::Versioned, context::CorpusStats, error::ApiResult};

#[derive(Debug, Serialize)]
pub struct SystemStats {
    #[serde(flatten)]
    pub corpus: CorpusStats,
    pub version: &'static str,
}

pub async fn get_stats(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let stats = SystemStats {
        corpus: state.service.get_stats(),
        version: env!("CARGO_PKG_VERSION"),
    };

    Ok(Json(Versioned::new(stats)))
}
