//! Keyed deduplication of asynchronous operations.
//!
//! Every mutating or expensive backend call is routed through `execute_once` so
//! concurrent callers for the same `RequestKey` share one execution and one cached
//! result. Retry policy stays with the caller (see `recovery`).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub mod key;
pub mod manager;
pub mod strict_mode;

pub use key::RequestKey;
pub use manager::{RequestDebugInfo, RequestManager, RequestManagerConfig};
pub use strict_mode::{StrictModeAwareRequestManager, StrictModeConfig, StrictModeDebugInfo};

/// Failure observed by every caller waiting on the same key.
/// Cloneable because one settled execution fans out to many awaiters.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    #[error("request '{key}' timed out after {timeout_ms}ms")]
    Timeout { key: String, timeout_ms: u64 },

    #[error("{0}")]
    Executor(Arc<anyhow::Error>),

    #[error("request aborted: {0}")]
    Aborted(String),
}

/// Per-call knobs for `execute_once`.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Skip the completed-result cache. An execution already in flight is still joined.
    pub force_regenerate: bool,
    /// Overrides the manager's default timeout.
    pub timeout: Option<Duration>,
    /// Free-form label carried into logs.
    pub context: Option<String>,
}

impl ExecuteOptions {
    pub fn forced() -> Self {
        Self {
            force_regenerate: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Result handed back to each caller.
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcome {
    pub data: Value,
    pub was_from_cache: bool,
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub was_strict_mode_duplicate: bool,
}

impl RequestOutcome {
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data)
    }
}
