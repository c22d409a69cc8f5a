use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ExecuteOptions, RequestError, RequestKey, RequestOutcome};

#[derive(Debug, Clone)]
pub struct RequestManagerConfig {
    pub cache_ttl: Duration,
    pub max_cache_entries: usize,
    pub default_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for RequestManagerConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(5 * 60),
            max_cache_entries: 100,
            default_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct Settled {
    data: Value,
    request_id: Uuid,
    timestamp: DateTime<Utc>,
}

type SharedExecution = Shared<BoxFuture<'static, Result<Settled, RequestError>>>;

struct InFlight {
    request_id: Uuid,
    started_at: Instant,
    execution: SharedExecution,
}

struct CachedResult {
    settled: Settled,
    cached_at: Instant,
}

#[derive(Default)]
struct RequestState {
    in_flight: HashMap<String, InFlight>,
    completed: HashMap<String, CachedResult>,
}

#[derive(Default)]
struct Counters {
    executions: AtomicU64,
    cache_hits: AtomicU64,
    joined: AtomicU64,
    timeouts: AtomicU64,
    failures: AtomicU64,
}

struct Inner {
    config: RequestManagerConfig,
    state: Mutex<RequestState>,
    counters: Counters,
}

/// Global keyed deduplication and result cache.
///
/// At most one execution per key is in flight; every caller that arrives while it
/// runs awaits the same shared future and observes the same success or failure.
/// Executions run on their own task, so in-flight bookkeeping is cleaned up even if
/// every caller stops waiting.
#[derive(Clone)]
pub struct RequestManager {
    inner: Arc<Inner>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InFlightInfo {
    pub key: String,
    pub request_id: Uuid,
    pub age_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestDebugInfo {
    pub in_flight: Vec<InFlightInfo>,
    pub cached_entries: usize,
    pub executions: u64,
    pub cache_hits: u64,
    pub joined: u64,
    pub timeouts: u64,
    pub failures: u64,
}

impl RequestManager {
    pub fn new(config: RequestManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(RequestState::default()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &RequestManagerConfig {
        &self.inner.config
    }

    /// Runs `executor` at most once per key, sharing the in-flight execution and
    /// caching a successful result for `cache_ttl`.
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
        let key_str = key.as_str().to_string();
        let context = options.context.as_deref().unwrap_or("-");

        let execution = {
            let mut state = self.inner.state.lock();

            if !options.force_regenerate {
                if let Some(outcome) = self.inner.cached_outcome(&mut state, &key_str) {
                    self.inner.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key_str, context, "request cache hit");
                    return Ok(outcome);
                }
            }

            if let Some(in_flight) = state.in_flight.get(&key_str) {
                self.inner.counters.joined.fetch_add(1, Ordering::Relaxed);
                debug!(
                    key = %key_str,
                    context,
                    request_id = %in_flight.request_id,
                    "joining in-flight request"
                );
                in_flight.execution.clone()
            } else {
                let timeout = options.timeout.unwrap_or(self.inner.config.default_timeout);
                debug!(key = %key_str, context, timeout_ms = timeout.as_millis() as u64, "request cache miss");
                Inner::start(&self.inner, &mut state, key_str, executor, timeout)
            }
        };

        let settled = execution.await?;
        Ok(RequestOutcome {
            data: settled.data,
            was_from_cache: false,
            request_id: settled.request_id,
            timestamp: settled.timestamp,
            was_strict_mode_duplicate: false,
        })
    }

    /// Drops the cached result for `key`. Returns whether an entry existed.
    pub fn invalidate(&self, key: &RequestKey) -> bool {
        self.inner.state.lock().completed.remove(key.as_str()).is_some()
    }

    pub fn clear_cache(&self) {
        self.inner.state.lock().completed.clear();
    }

    /// Forgets every cached result and in-flight registration.
    /// Executions already running finish on their own task but are not cached.
    pub fn clear_all(&self) {
        let mut state = self.inner.state.lock();
        state.completed.clear();
        state.in_flight.clear();
        info!("request manager cleared");
    }

    /// Removes cache entries older than the TTL. Returns how many were evicted.
    pub fn sweep_expired(&self) -> usize {
        let ttl = self.inner.config.cache_ttl;
        let mut state = self.inner.state.lock();
        let before = state.completed.len();
        state
            .completed
            .retain(|_, cached| cached.cached_at.elapsed() < ttl);
        let evicted = before - state.completed.len();
        if evicted > 0 {
            debug!(evicted, "expired request cache entries removed");
        }
        evicted
    }

    /// Spawns the periodic cache sweep. The caller owns the handle and aborts it on shutdown.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let period = self.inner.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.sweep_expired();
            }
        })
    }

    pub fn debug_info(&self) -> RequestDebugInfo {
        let state = self.inner.state.lock();
        let mut in_flight: Vec<InFlightInfo> = state
            .in_flight
            .iter()
            .map(|(key, flight)| InFlightInfo {
                key: key.clone(),
                request_id: flight.request_id,
                age_ms: flight.started_at.elapsed().as_millis() as u64,
            })
            .collect();
        in_flight.sort_by(|a, b| a.key.cmp(&b.key));

        let counters = &self.inner.counters;
        RequestDebugInfo {
            in_flight,
            cached_entries: state.completed.len(),
            executions: counters.executions.load(Ordering::Relaxed),
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
            joined: counters.joined.load(Ordering::Relaxed),
            timeouts: counters.timeouts.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
        }
    }

    pub fn is_in_flight(&self, key: &RequestKey) -> bool {
        self.inner.state.lock().in_flight.contains_key(key.as_str())
    }
}

impl Inner {
    fn cached_outcome(&self, state: &mut RequestState, key: &str) -> Option<RequestOutcome> {
        let fresh = state
            .completed
            .get(key)
            .map(|cached| cached.cached_at.elapsed() < self.config.cache_ttl)?;
        if !fresh {
            state.completed.remove(key);
            return None;
        }
        state.completed.get(key).map(|cached| RequestOutcome {
            data: cached.settled.data.clone(),
            was_from_cache: true,
            request_id: cached.settled.request_id,
            timestamp: cached.settled.timestamp,
            was_strict_mode_duplicate: false,
        })
    }

    fn start<F, Fut>(
        inner: &Arc<Inner>,
        state: &mut RequestState,
        key: String,
        executor: F,
        timeout: Duration,
    ) -> SharedExecution
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let request_id = Uuid::new_v4();
        inner.counters.executions.fetch_add(1, Ordering::Relaxed);

        let task_inner = Arc::clone(inner);
        let task_key = key.clone();
        let handle: JoinHandle<Result<Settled, RequestError>> = tokio::spawn(async move {
            let guarded = AssertUnwindSafe(async move { executor().await }).catch_unwind();
            let result = match tokio::time::timeout(timeout, guarded).await {
                Ok(Ok(Ok(data))) => Ok(Settled {
                    data,
                    request_id,
                    timestamp: Utc::now(),
                }),
                Ok(Ok(Err(err))) => Err(RequestError::Executor(Arc::new(err))),
                Ok(Err(_panic)) => Err(RequestError::Executor(Arc::new(anyhow::anyhow!(
                    "executor for '{task_key}' panicked"
                )))),
                Err(_) => Err(RequestError::Timeout {
                    key: task_key.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            };
            task_inner.settle(&task_key, request_id, &result);
            result
        });

        let execution = async move {
            match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(RequestError::Aborted(join_err.to_string())),
            }
        }
        .boxed()
        .shared();

        state.in_flight.insert(
            key,
            InFlight {
                request_id,
                started_at: Instant::now(),
                execution: execution.clone(),
            },
        );
        execution
    }

    /// Runs on the execution task once the executor settles or times out.
    fn settle(&self, key: &str, request_id: Uuid, result: &Result<Settled, RequestError>) {
        let mut state = self.state.lock();
        let was_current = state
            .in_flight
            .get(key)
            .is_some_and(|flight| flight.request_id == request_id);
        if was_current {
            state.in_flight.remove(key);
        }

        match result {
            Ok(settled) => {
                info!(key, %request_id, "request completed");
                if was_current {
                    state.completed.insert(
                        key.to_string(),
                        CachedResult {
                            settled: settled.clone(),
                            cached_at: Instant::now(),
                        },
                    );
                    self.evict_overflow(&mut state);
                }
            }
            Err(RequestError::Timeout { timeout_ms, .. }) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(key, %request_id, timeout_ms, "request timed out");
            }
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(key, %request_id, error = %err, "request failed");
            }
        }
    }

    /// Oldest-first eviction once the cache exceeds its bound.
    fn evict_overflow(&self, state: &mut RequestState) {
        let max = self.config.max_cache_entries;
        if state.completed.len() <= max {
            return;
        }
        let mut by_age: Vec<(String, Instant)> = state
            .completed
            .iter()
            .map(|(k, cached)| (k.clone(), cached.cached_at))
            .collect();
        by_age.sort_by_key(|(_, at)| *at);
        let overflow = state.completed.len() - max;
        for (key, _) in by_age.into_iter().take(overflow) {
            state.completed.remove(&key);
        }
        debug!(overflow, "request cache over capacity, evicted oldest");
    }
}
