use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use super::manager::{RequestDebugInfo, RequestManager};
use super::{ExecuteOptions, RequestError, RequestKey, RequestOutcome};

/// Above this many tracked keys, stale issue timestamps are pruned on the next call.
const RECENT_PRUNE_THRESHOLD: usize = 256;

#[derive(Debug, Clone)]
pub struct StrictModeConfig {
    /// Only development builds double-invoke effects; production leaves this off.
    pub enabled: bool,
    pub duplicate_window: Duration,
}

impl Default for StrictModeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            duplicate_window: Duration::from_millis(100),
        }
    }
}

/// Dedup diagnostics plus the duplicate-window counters.
#[derive(Debug, Clone, Serialize)]
pub struct StrictModeDebugInfo {
    #[serde(flatten)]
    pub requests: RequestDebugInfo,
    pub strict_mode_enabled: bool,
    pub strict_mode_duplicates: u64,
}

/// Request manager that also collapses near-simultaneous duplicate calls.
///
/// A call for a key issued within `duplicate_window` of the previous call for the
/// same key is treated as a spurious double invocation: it never starts a new
/// execution (even when `force_regenerate` is set) and its outcome is tagged
/// `was_strict_mode_duplicate`. With the window disabled this is plain
/// `RequestManager::execute_once`.
#[derive(Clone)]
pub struct StrictModeAwareRequestManager {
    inner: RequestManager,
    config: StrictModeConfig,
    recent: Arc<Mutex<HashMap<String, Instant>>>,
    duplicates: Arc<AtomicU64>,
}

impl StrictModeAwareRequestManager {
    pub fn new(inner: RequestManager, config: StrictModeConfig) -> Self {
        Self {
            inner,
            config,
            recent: Arc::new(Mutex::new(HashMap::new())),
            duplicates: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn inner(&self) -> &RequestManager {
        &self.inner
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub async fn execute_once<F, Fut>(
        &self,
        key: &RequestKey,
        executor: F,
        options: ExecuteOptions,
    ) -> Result<RequestOutcome, RequestError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let duplicate = self.config.enabled && self.mark_issued(key);

        let options = if duplicate {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "collapsing probable double invocation");
            ExecuteOptions {
                force_regenerate: false,
                ..options
            }
        } else {
            options
        };

        let mut outcome = self.inner.execute_once(key, executor, options).await?;
        outcome.was_strict_mode_duplicate = duplicate;
        Ok(outcome)
    }

    pub fn debug_info(&self) -> StrictModeDebugInfo {
        StrictModeDebugInfo {
            requests: self.inner.debug_info(),
            strict_mode_enabled: self.config.enabled,
            strict_mode_duplicates: self.duplicates.load(Ordering::Relaxed),
        }
    }

    pub fn clear_all(&self) {
        self.recent.lock().clear();
        self.inner.clear_all();
    }

    /// Records the call and reports whether it landed inside the duplicate window.
    /// Only the first call of a burst is recorded, so a steady stream of calls
    /// spaced just under the window is not collapsed indefinitely.
    fn mark_issued(&self, key: &RequestKey) -> bool {
        let window = self.config.duplicate_window;
        let now = Instant::now();
        let mut recent = self.recent.lock();

        if recent.len() > RECENT_PRUNE_THRESHOLD {
            recent.retain(|_, issued| now.duration_since(*issued) < window);
        }

        match recent.get(key.as_str()) {
            Some(issued) if now.duration_since(*issued) < window => true,
            _ => {
                recent.insert(key.as_str().to_string(), now);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use futures::future::{BoxFuture, FutureExt};
    use serde_json::json;

    use crate::requests::RequestManagerConfig;

    fn manager(enabled: bool) -> StrictModeAwareRequestManager {
        StrictModeAwareRequestManager::new(
            RequestManager::new(RequestManagerConfig::default()),
            StrictModeConfig {
                enabled,
                ..StrictModeConfig::default()
            },
        )
    }

    fn executor(
        calls: Arc<AtomicUsize>,
        delay: Duration,
    ) -> impl FnOnce() -> BoxFuture<'static, anyhow::Result<Value>> + Send + 'static {
        move || {
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(delay).await;
                Ok(json!({ "execution": n }))
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_invocation_joins_in_flight_execution() {
        let manager = manager(true);
        let calls = Arc::new(AtomicUsize::new(0));
        let key = RequestKey::raw("getRecommendations|job=7");

        let (first, second) = tokio::join!(
            manager.execute_once(
                &key,
                executor(calls.clone(), Duration::from_millis(30)),
                ExecuteOptions::forced(),
            ),
            manager.execute_once(
                &key,
                executor(calls.clone(), Duration::from_millis(30)),
                ExecuteOptions::forced(),
            ),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let first = first.unwrap();
        let second = second.unwrap();
        assert!(!first.was_strict_mode_duplicate);
        assert!(second.was_strict_mode_duplicate);
        assert_eq!(first.data, second.data);
        let info = manager.debug_info();
        assert_eq!(info.strict_mode_duplicates, 1);
        assert!(info.strict_mode_enabled);
        assert_eq!(info.requests.executions, 1);
        assert_eq!(info.requests.joined, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_duplicate_inside_window_reuses_result() {
        let manager = manager(true);
        let calls = Arc::new(AtomicUsize::new(0));
        let key = RequestKey::raw("generateCV|job=7");

        manager
            .execute_once(&key, executor(calls.clone(), Duration::ZERO), ExecuteOptions::forced())
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(40)).await;
        let again = manager
            .execute_once(&key, executor(calls.clone(), Duration::ZERO), ExecuteOptions::forced())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(again.was_strict_mode_duplicate);
        assert!(again.was_from_cache);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_call_after_window_executes_again() {
        let manager = manager(true);
        let calls = Arc::new(AtomicUsize::new(0));
        let key = RequestKey::raw("generateCV|job=8");

        manager
            .execute_once(&key, executor(calls.clone(), Duration::ZERO), ExecuteOptions::forced())
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(150)).await;
        let again = manager
            .execute_once(&key, executor(calls.clone(), Duration::ZERO), ExecuteOptions::forced())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!again.was_strict_mode_duplicate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_window_behaves_like_plain_manager() {
        let manager = manager(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let key = RequestKey::raw("generateCV|job=9");

        for _ in 0..2 {
            let outcome = manager
                .execute_once(&key, executor(calls.clone(), Duration::ZERO), ExecuteOptions::forced())
                .await
                .unwrap();
            assert!(!outcome.was_strict_mode_duplicate);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
