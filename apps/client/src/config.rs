use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Process configuration loaded from environment variables.
/// Fails at startup if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub backend_url: String,
    pub sync_ws_url: Option<String>,
    pub redis_url: Option<String>,
    pub session_store_dir: Option<PathBuf>,
    /// Identity announced in session sync presence and join messages.
    pub sync_user_id: String,
    /// Enables duplicate-window detection for double-invoked effects.
    pub dev_mode: bool,
    pub request_timeout: Duration,
    pub job_poll_interval: Duration,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            backend_url: require_env("BACKEND_URL")?,
            sync_ws_url: optional_env("SYNC_WS_URL"),
            redis_url: optional_env("REDIS_URL"),
            session_store_dir: optional_env("SESSION_STORE_DIR").map(PathBuf::from),
            sync_user_id: optional_env("SYNC_USER_ID").unwrap_or_else(|| "anonymous".to_string()),
            dev_mode: parse_bool(optional_env("DEV_MODE").as_deref()),
            request_timeout: Duration::from_millis(
                parse_or("REQUEST_TIMEOUT_MS", 30_000)
                    .context("REQUEST_TIMEOUT_MS must be a number of milliseconds")?,
            ),
            job_poll_interval: Duration::from_millis(
                parse_or("JOB_POLL_INTERVAL_MS", 2_000)
                    .context("JOB_POLL_INTERVAL_MS must be a number of milliseconds")?,
            ),
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8787".to_string())
                .parse::<u16>()
                .context("PORT must be a valid port number")?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or(key: &str, default: u64) -> Result<u64> {
    match optional_env(key) {
        Some(raw) => Ok(raw.trim().parse::<u64>()?),
        None => Ok(default),
    }
}

fn parse_bool(raw: Option<&str>) -> bool {
    matches!(
        raw.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_accepts_common_truthy_values() {
        assert!(parse_bool(Some("true")));
        assert!(parse_bool(Some(" YES ")));
        assert!(parse_bool(Some("1")));
        assert!(!parse_bool(Some("0")));
        assert!(!parse_bool(Some("development")));
        assert!(!parse_bool(None));
    }
}
