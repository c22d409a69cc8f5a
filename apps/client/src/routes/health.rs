use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health
/// Service version plus a coarse view of the coordination layer.
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let status = if state.coordinator.is_shut_down() {
        "shutting_down"
    } else {
        "ok"
    };
    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "service": env!("CARGO_PKG_NAME"),
        "devMode": state.config.dev_mode,
    }))
}
