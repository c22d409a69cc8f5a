use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::errors::AppError;
use crate::state::AppState;
use crate::sync::{ConflictResolution, SessionState, StateChange, SyncStatus, UserPresence};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSessionRequest {
    pub session_id: String,
    /// Full state to start from; a blank state is created when absent.
    #[serde(default)]
    pub state: Option<SessionState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRequest {
    pub path: String,
    /// `null` or missing deletes the path.
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub optimistic: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub status: SyncStatus,
    pub state: SessionState,
    pub peers: Vec<UserPresence>,
    pub conflicts: Vec<ConflictResolution>,
    pub pending_changes: usize,
}

/// POST /api/v1/sessions
pub async fn handle_join(
    State(state): State<AppState>,
    Json(req): Json<JoinSessionRequest>,
) -> Result<(StatusCode, Json<SessionView>), AppError> {
    if req.session_id.trim().is_empty() {
        return Err(AppError::Validation("sessionId must not be empty".to_string()));
    }
    let initial = match req.state {
        Some(initial) if initial.session_id != req.session_id => {
            return Err(AppError::Validation(
                "state.sessionId does not match sessionId".to_string(),
            ));
        }
        Some(initial) => initial,
        None => SessionState::new(&req.session_id, &state.config.sync_user_id),
    };

    state.coordinator.sync().connect(initial).await?;
    Ok((StatusCode::CREATED, Json(session_view(&state, &req.session_id)?)))
}

/// GET /api/v1/sessions/:session_id
pub async fn handle_get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionView>, AppError> {
    Ok(Json(session_view(&state, &session_id)?))
}

/// DELETE /api/v1/sessions/:session_id
pub async fn handle_leave(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.coordinator.sync().disconnect(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/sessions/:session_id/reconnect
pub async fn handle_reconnect(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.coordinator.sync().reconnect(&session_id)?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /api/v1/sessions/:session_id/changes
pub async fn handle_change(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<ChangeRequest>,
) -> Result<Json<Value>, AppError> {
    let change = match req.value {
        Some(value) if !value.is_null() => StateChange::update(&session_id, &req.path, value),
        _ => StateChange::delete(&session_id, &req.path),
    };
    let change_id = change.id;

    let sync = state.coordinator.sync();
    let update_id = if req.optimistic {
        Some(sync.apply_optimistic_update(&session_id, change).await?)
    } else {
        sync.broadcast_state_change(&session_id, change).await?;
        None
    };

    let version = sync.state(&session_id).map(|s| s.version);
    Ok(Json(json!({
        "changeId": change_id,
        "updateId": update_id,
        "version": version,
    })))
}

/// POST /api/v1/updates/:update_id/rollback
pub async fn handle_rollback(
    State(state): State<AppState>,
    Path(update_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.coordinator.sync().rollback_update(update_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/updates/:update_id/confirm
pub async fn handle_confirm(
    State(state): State<AppState>,
    Path(update_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.coordinator.sync().confirm_update(update_id)?;
    Ok(StatusCode::NO_CONTENT)
}

fn session_view(state: &AppState, session_id: &str) -> Result<SessionView, AppError> {
    let sync = state.coordinator.sync();
    let (Some(status), Some(session)) = (sync.status(session_id), sync.state(session_id)) else {
        return Err(AppError::NotFound(format!("Session {session_id} not joined")));
    };
    Ok(SessionView {
        status,
        state: session,
        peers: sync.peers(session_id),
        conflicts: sync.conflicts(session_id),
        pending_changes: sync.pending_changes(session_id),
    })
}
