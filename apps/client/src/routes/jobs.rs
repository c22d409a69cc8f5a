use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::coordinator::RecommendationFailure;
use crate::errors::AppError;
use crate::requests::RequestOutcome;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecommendationsRequest {
    pub target_role: Option<String>,
    pub industry_keywords: Vec<String>,
    pub force_regenerate: bool,
}

impl IntoResponse for RecommendationFailure {
    fn into_response(self) -> Response {
        let (status, code, message) = AppError::Request(self.error).parts();
        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            },
            "recovery": self.recovery
        }));
        (status, body).into_response()
    }
}

/// POST /api/v1/jobs/:job_id/recommendations
/// Concurrent calls for the same job and parameters share one backend execution.
pub async fn handle_recommendations(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    body: Option<Json<RecommendationsRequest>>,
) -> Result<Json<RequestOutcome>, RecommendationFailure> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let outcome = state
        .coordinator
        .get_recommendations(
            &job_id,
            req.target_role,
            req.industry_keywords,
            req.force_regenerate,
        )
        .await?;
    Ok(Json(outcome))
}

/// PUT /api/v1/jobs/:job_id/watch
pub async fn handle_watch(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let id = state.coordinator.watch_job(&job_id)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "jobId": job_id, "subscriptionId": id })),
    ))
}

/// DELETE /api/v1/jobs/:job_id/watch
pub async fn handle_unwatch(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<StatusCode, AppError> {
    if state.coordinator.unwatch_job(&job_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("Job {job_id} is not watched")))
    }
}
