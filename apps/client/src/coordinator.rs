//! Process-wide owner of every coordination component.
//!
//! Built once at startup and shared behind an `Arc`. `shutdown` tears down every
//! listener, timer and socket synchronously; the binary calls it on Ctrl-C / SIGTERM.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backend::{BackendClient, GET_RECOMMENDATIONS};
use crate::config::Config;
use crate::jobs::{
    CallbackType, Job, JobSource, JobSubscriptionConfig, JobSubscriptionManager, MemoryStats,
    PollingJobSource, SubscribeOptions, SubscriptionError, SubscriptionId,
    SubscriptionManagerStats, Unsubscribe,
};
use crate::recovery::{
    ErrorRecoveryService, ErrorStore, InMemoryErrorStore, RecoveryConfig, RecoveryResult,
    RedisErrorStore,
};
use crate::requests::{
    ExecuteOptions, RequestError, RequestKey, RequestManager, RequestManagerConfig,
    RequestOutcome, StrictModeAwareRequestManager, StrictModeConfig, StrictModeDebugInfo,
};
use crate::sync::{
    LocalBus, PendingChangeStore, RealtimeSessionSync, SocketConnector, SyncConfig,
    SyncDebugInfo, WebSocketConnector,
};

const ERROR_STORE_KEY: &str = "cv-client:errors";
const ERROR_STORE_CAPACITY: usize = 1_000;
const RECOMMENDATIONS_FEATURE: &str = "recommendations";
const ANONYMOUS_ACTOR: &str = "anonymous";

#[derive(Debug, Clone, Serialize)]
pub struct DebugSnapshot {
    pub requests: StrictModeDebugInfo,
    pub subscriptions: SubscriptionManagerStats,
    pub memory: MemoryStats,
    pub sync: SyncDebugInfo,
    pub watched_jobs: Vec<String>,
}

/// Recommendation fetch that failed, with the recovery advice computed for it.
#[derive(Debug)]
pub struct RecommendationFailure {
    pub error: RequestError,
    pub recovery: RecoveryResult,
}

pub struct Coordinator {
    backend: BackendClient,
    requests: StrictModeAwareRequestManager,
    jobs: JobSubscriptionManager,
    sync: RealtimeSessionSync,
    recovery: ErrorRecoveryService,
    /// User the request keys are scoped to.
    actor: String,
    watches: Mutex<HashMap<String, Unsubscribe>>,
    maintenance: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Coordinator {
    pub fn new(
        backend: BackendClient,
        requests: StrictModeAwareRequestManager,
        jobs: JobSubscriptionManager,
        sync: RealtimeSessionSync,
        recovery: ErrorRecoveryService,
    ) -> Self {
        Self {
            backend,
            requests,
            jobs,
            sync,
            recovery,
            actor: ANONYMOUS_ACTOR.to_string(),
            watches: Mutex::new(HashMap::new()),
            maintenance: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn with_actor(mut self, user_id: impl Into<String>) -> Self {
        self.actor = user_id.into();
        self
    }

    /// Wires every component from process configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let backend = BackendClient::new(config.backend_url.clone(), config.request_timeout)?;

        let requests = StrictModeAwareRequestManager::new(
            RequestManager::new(RequestManagerConfig {
                default_timeout: config.request_timeout,
                ..RequestManagerConfig::default()
            }),
            StrictModeConfig {
                enabled: config.dev_mode,
                ..StrictModeConfig::default()
            },
        );

        let source: Arc<dyn JobSource> =
            Arc::new(PollingJobSource::new(backend.clone(), config.job_poll_interval));
        let jobs = JobSubscriptionManager::new(source, JobSubscriptionConfig::default());

        let connector = config
            .sync_ws_url
            .as_ref()
            .map(|url| Arc::new(WebSocketConnector::new(url.clone())) as Arc<dyn SocketConnector>);
        let store = config.session_store_dir.clone().map(PendingChangeStore::new);
        let sync = RealtimeSessionSync::new(
            SyncConfig {
                user_id: config.sync_user_id.clone(),
                ..SyncConfig::default()
            },
            LocalBus::new(),
            connector,
            store,
        );

        let error_store: Arc<dyn ErrorStore> = match &config.redis_url {
            Some(url) => {
                info!("Error store: Redis");
                Arc::new(RedisErrorStore::new(url, ERROR_STORE_KEY, ERROR_STORE_CAPACITY)?)
            }
            None => {
                info!("Error store: in-memory");
                Arc::new(InMemoryErrorStore::new(ERROR_STORE_CAPACITY))
            }
        };
        let recovery = ErrorRecoveryService::new(error_store, RecoveryConfig::default());

        Ok(Self::new(backend, requests, jobs, sync, recovery).with_actor(&config.sync_user_id))
    }

    pub fn backend(&self) -> &BackendClient {
        &self.backend
    }

    pub fn requests(&self) -> &StrictModeAwareRequestManager {
        &self.requests
    }

    pub fn jobs(&self) -> &JobSubscriptionManager {
        &self.jobs
    }

    pub fn sync(&self) -> &RealtimeSessionSync {
        &self.sync
    }

    pub fn recovery(&self) -> &ErrorRecoveryService {
        &self.recovery
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Starts the periodic cache and subscription sweeps.
    pub fn spawn_maintenance(&self) {
        let mut handles = self.maintenance.lock();
        handles.push(self.requests.inner().spawn_maintenance());
        handles.push(self.jobs.spawn_maintenance());
    }

    /// Fetches recommendations for a job through the deduplicating request layer.
    /// Failures are analyzed by the recovery service before being returned.
    pub async fn get_recommendations(
        &self,
        job_id: &str,
        target_role: Option<String>,
        industry_keywords: Vec<String>,
        force_regenerate: bool,
    ) -> Result<RequestOutcome, RecommendationFailure> {
        let key = self.recommendations_key(job_id, target_role.as_deref(), &industry_keywords);

        let backend = self.backend.clone();
        let owned_job_id = job_id.to_string();
        let options = ExecuteOptions {
            force_regenerate,
            ..ExecuteOptions::default()
        }
        .with_context(RECOMMENDATIONS_FEATURE);

        let result = self
            .requests
            .execute_once(
                &key,
                move || async move {
                    let value = backend
                        .get_recommendations(&owned_job_id, target_role.as_deref(), &industry_keywords)
                        .await?;
                    Ok::<Value, anyhow::Error>(value)
                },
                options,
            )
            .await;

        match result {
            Ok(outcome) => {
                self.recovery.record_success(RECOMMENDATIONS_FEATURE);
                Ok(outcome)
            }
            Err(error) => {
                let context = self
                    .recovery
                    .analyze_error(&error, RECOMMENDATIONS_FEATURE, Some(job_id))
                    .await;
                let recovery = self.recovery.calculate_recovery(&context);
                Err(RecommendationFailure { error, recovery })
            }
        }
    }

    /// Keywords are encoded as a JSON array so `["a,b"]` and `["a", "b"]` stay distinct.
    fn recommendations_key(
        &self,
        job_id: &str,
        target_role: Option<&str>,
        industry_keywords: &[String],
    ) -> RequestKey {
        RequestKey::builder(GET_RECOMMENDATIONS)
            .param("job", job_id)
            .param("role", Value::from(target_role))
            .param("keywords", Value::from(industry_keywords.to_vec()))
            .actor(&self.actor)
            .build()
    }

    /// Keeps a progress subscription open for `job_id`, logging each delivered update.
    pub fn watch_job(&self, job_id: &str) -> Result<SubscriptionId, SubscriptionError> {
        if let Some(existing) = self.watches.lock().get(job_id).and_then(Unsubscribe::id) {
            return Ok(existing);
        }

        let watched = job_id.to_string();
        let handle = self.jobs.try_subscribe_to_job(
            job_id,
            move |job: Option<Job>| match job {
                Some(job) => info!(
                    job_id = %watched,
                    status = %job.status,
                    progress = job.progress.unwrap_or_default(),
                    "job update"
                ),
                None => warn!(job_id = %watched, "job unavailable or subscription deactivated"),
            },
            SubscribeOptions::of_type(CallbackType::Progress),
        )?;

        let id = handle.id().ok_or(SubscriptionError::ShutDown)?;
        let mut watches = self.watches.lock();
        if let Some(previous) = watches.insert(job_id.to_string(), handle) {
            previous.unsubscribe();
        }
        Ok(id)
    }

    pub fn unwatch_job(&self, job_id: &str) -> bool {
        match self.watches.lock().remove(job_id) {
            Some(handle) => {
                handle.unsubscribe();
                true
            }
            None => false,
        }
    }

    pub fn debug_snapshot(&self) -> DebugSnapshot {
        let mut watched_jobs: Vec<String> = self.watches.lock().keys().cloned().collect();
        watched_jobs.sort();
        DebugSnapshot {
            requests: self.requests.debug_info(),
            subscriptions: self.jobs.get_stats(),
            memory: self.jobs.get_memory_stats(),
            sync: self.sync.debug_info(),
            watched_jobs,
        }
    }

    /// Drops cached results, in-flight bookkeeping and job subscriptions.
    pub fn clear_all(&self) {
        for (_, handle) in self.watches.lock().drain() {
            handle.unsubscribe();
        }
        self.requests.clear_all();
        self.jobs.clear_all();
        info!("coordinator state cleared");
    }

    /// Idempotent. Aborts maintenance tasks, then tears down subscriptions and sessions.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in self.maintenance.lock().drain(..) {
            handle.abort();
        }
        self.watches.lock().clear();
        self.jobs.shutdown();
        self.sync.shutdown();
        self.requests.clear_all();
        info!("coordinator shut down");
    }
}
