use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::jobs::SubscriptionError;
use crate::requests::RequestError;
use crate::sync::SyncError;

/// Error type of the debug/control HTTP surface.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub(crate) fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Request(e) => match e {
                RequestError::Timeout { .. } => {
                    (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT_EXCEEDED", e.to_string())
                }
                RequestError::Executor(_) => {
                    tracing::error!("Backend error: {e}");
                    (StatusCode::BAD_GATEWAY, "BACKEND_ERROR", e.to_string())
                }
                RequestError::Aborted(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "ABORTED", e.to_string())
                }
            },
            AppError::Subscription(e) => match e {
                SubscriptionError::RateLimited(_) => {
                    (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", e.to_string())
                }
                SubscriptionError::UnknownJob(_) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND", e.to_string())
                }
                SubscriptionError::ShutDown => {
                    (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN", e.to_string())
                }
            },
            AppError::Sync(e) => match e {
                SyncError::UnknownSession(_) | SyncError::UnknownUpdate(_) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND", e.to_string())
                }
                SyncError::InvalidChange(_) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string())
                }
                SyncError::NotConnected(_) => {
                    (StatusCode::CONFLICT, "NOT_CONNECTED", e.to_string())
                }
                _ => {
                    tracing::error!("Sync error: {e}");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "SYNC_ERROR",
                        "A session sync error occurred".to_string(),
                    )
                }
            },
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                )
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
