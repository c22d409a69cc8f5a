use std::sync::Arc;

use crate::config::Config;
use crate::coordinator::Coordinator;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    /// Request deduplication, job subscriptions, session sync and error recovery.
    pub coordinator: Arc<Coordinator>,
    pub config: Config,
}
