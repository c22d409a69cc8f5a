use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};

use crate::coordinator::DebugSnapshot;
use crate::errors::AppError;
use crate::jobs::SubscriptionManagerStats;
use crate::recovery::ErrorStatistics;
use crate::state::AppState;

/// GET /debug/info
pub async fn handle_debug_info(State(state): State<AppState>) -> Json<DebugSnapshot> {
    Json(state.coordinator.debug_snapshot())
}

/// GET /debug/subscriptions
pub async fn handle_subscription_stats(
    State(state): State<AppState>,
) -> Json<SubscriptionManagerStats> {
    Json(state.coordinator.jobs().get_stats())
}

/// POST /debug/clear
pub async fn handle_clear(State(state): State<AppState>) -> StatusCode {
    state.coordinator.clear_all();
    StatusCode::NO_CONTENT
}

/// POST /debug/jobs/:job_id/refresh
pub async fn handle_force_refresh(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    state.coordinator.jobs().force_refresh(&job_id)?;
    Ok(Json(json!({ "jobId": job_id, "refreshed": true })))
}

/// GET /debug/errors/stats
pub async fn handle_error_stats(State(state): State<AppState>) -> Json<ErrorStatistics> {
    Json(state.coordinator.recovery().get_error_statistics().await)
}

/// GET /debug/errors/report
/// Pretty-printed, intended for download and attaching to bug reports.
pub async fn handle_error_report(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let report = state
        .coordinator
        .recovery()
        .export_error_report()
        .await
        .map_err(anyhow::Error::from)?;
    Ok(([(header::CONTENT_TYPE, "application/json")], report))
}
