pub mod debug;
pub mod health;
pub mod jobs;
pub mod sessions;

use axum::{
    routing::{get, post, put},
    Router,
};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Jobs
        .route(
            "/api/v1/jobs/:job_id/recommendations",
            post(jobs::handle_recommendations),
        )
        .route(
            "/api/v1/jobs/:job_id/watch",
            put(jobs::handle_watch).delete(jobs::handle_unwatch),
        )
        // Session sync
        .route("/api/v1/sessions", post(sessions::handle_join))
        .route(
            "/api/v1/sessions/:session_id",
            get(sessions::handle_get_session).delete(sessions::handle_leave),
        )
        .route(
            "/api/v1/sessions/:session_id/changes",
            post(sessions::handle_change),
        )
        .route(
            "/api/v1/sessions/:session_id/reconnect",
            post(sessions::handle_reconnect),
        )
        .route(
            "/api/v1/updates/:update_id/rollback",
            post(sessions::handle_rollback),
        )
        .route(
            "/api/v1/updates/:update_id/confirm",
            post(sessions::handle_confirm),
        )
        // Debug
        .route("/debug/info", get(debug::handle_debug_info))
        .route("/debug/subscriptions", get(debug::handle_subscription_stats))
        .route("/debug/clear", post(debug::handle_clear))
        .route(
            "/debug/jobs/:job_id/refresh",
            post(debug::handle_force_refresh),
        )
        .route("/debug/errors/stats", get(debug::handle_error_stats))
        .route("/debug/errors/report", get(debug::handle_error_report))
        .with_state(state)
}
