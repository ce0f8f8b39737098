use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;

use super::AppState;
use crate::core::service::HealthReport;
use crate::models::api::Versioned;

#[derive(Debug, Serialize)]
pub struct HealthBody {
    #[serde(flatten)]
    pub report: HealthReport,
    pub version: &'static str,
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.service.health();
    let status = if report.status == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(Versioned::new(HealthBody {
            report,
            version: env!("CARGO_PKG_VERSION"),
        })),
    )
}
