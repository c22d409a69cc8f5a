//! Job Subscription Manager: multiplexes many callbacks onto one realtime listener per job.
//!
//! # Lifecycle
//! - First subscriber for a job attaches the listener; later subscribers share it.
//! - Last unsubscribe schedules teardown after `cleanup_grace`; a resubscribe inside the
//!   grace window cancels it and reuses the listener.
//! - `sweep` (every `sweep_interval`) tears down listeners idle past `inactivity_timeout`
//!   or deactivated by repeated errors.
//!
//! # Delivery
//! Updates whose change hash matches the previous one are dropped unless the job is in
//! an active processing state. Each callback is debounced on its own: a burst inside the
//! window collapses into one call carrying the latest value.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::jobs::filters::{CallbackType, JobFilter};
use crate::jobs::model::{Job, JobStatus};
use crate::jobs::rate_limit::RateLimiter;
use crate::jobs::source::{JobEvent, JobSource, ListenerHandle};

const MISSING_DOCUMENT_HASH: &str = "<missing>";
const ESTIMATED_SUBSCRIPTION_BYTES: usize = 1024;
const ESTIMATED_CALLBACK_BYTES: usize = 256;

pub type JobCallback = Arc<dyn Fn(Option<Job>) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("Subscription rate limit exceeded for job {0}")]
    RateLimited(String),

    #[error("No subscription for job {0}")]
    UnknownJob(String),

    #[error("Subscription manager has been shut down")]
    ShutDown,
}

#[derive(Debug, Clone)]
pub struct JobSubscriptionConfig {
    pub debounce: Duration,
    pub cleanup_grace: Duration,
    pub sweep_interval: Duration,
    pub inactivity_timeout: Duration,
    /// Consecutive listener errors tolerated before the subscription is deactivated.
    pub max_retries: u32,
    pub rate_limit_burst: u32,
    pub rate_limit_refill_per_sec: f64,
}

impl Default for JobSubscriptionConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            cleanup_grace: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5 * 60),
            inactivity_timeout: Duration::from_secs(10 * 60),
            max_retries: 3,
            rate_limit_burst: 10,
            rate_limit_refill_per_sec: 2.0,
        }
    }
}

#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub callback_type: CallbackType,
    pub filter: Option<JobFilter>,
    /// Overrides the manager-wide debounce for this callback.
    pub debounce: Option<Duration>,
}

impl SubscribeOptions {
    pub fn of_type(callback_type: CallbackType) -> Self {
        Self {
            callback_type,
            ..Self::default()
        }
    }

    pub fn with_filter(mut self, filter: impl Fn(&Job) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }
}

/// Explicit handle for one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SubscriptionId(u64);

/// Idempotent unsubscribe handle returned by every subscribe call.
pub struct Unsubscribe {
    target: Option<(Weak<Inner>, String, SubscriptionId)>,
    done: AtomicBool,
}

impl Unsubscribe {
    fn noop() -> Self {
        Self {
            target: None,
            done: AtomicBool::new(true),
        }
    }

    /// True when the subscribe call was rejected (rate limit or shutdown).
    pub fn is_noop(&self) -> bool {
        self.target.is_none()
    }

    pub fn id(&self) -> Option<SubscriptionId> {
        self.target.as_ref().map(|(_, _, id)| *id)
    }

    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some((weak, job_id, id)) = &self.target {
            if let Some(inner) = weak.upgrade() {
                Inner::remove_callback(&inner, job_id, *id);
            }
        }
    }
}

struct CallbackEntry {
    callback: JobCallback,
    callback_type: CallbackType,
    filter: Option<JobFilter>,
    debounce: Duration,
    pending: Option<Option<Job>>,
    timer: Option<JoinHandle<()>>,
    deliveries: u64,
}

impl CallbackEntry {
    fn accepts(&self, job: &Job) -> bool {
        self.callback_type.accepts(job) && self.filter.as_ref().map_or(true, |f| f(job))
    }
}

struct JobSubscription {
    job_id: String,
    generation: u64,
    last_job: Option<Job>,
    last_hash: Option<String>,
    listener: Option<ListenerHandle>,
    pump: Option<JoinHandle<()>>,
    callbacks: HashMap<SubscriptionId, CallbackEntry>,
    last_update: Instant,
    consecutive_errors: u32,
    is_active: bool,
    cleanup: Option<JoinHandle<()>>,
    /// Bumped whenever a grace teardown is scheduled or cancelled; a timer only acts on its own epoch.
    cleanup_epoch: u64,
    updates_received: u64,
    updates_skipped: u64,
}

impl JobSubscription {
    fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            generation: 0,
            last_job: None,
            last_hash: None,
            listener: None,
            pump: None,
            callbacks: HashMap::new(),
            last_update: Instant::now(),
            consecutive_errors: 0,
            is_active: true,
            cleanup: None,
            cleanup_epoch: 0,
            updates_received: 0,
            updates_skipped: 0,
        }
    }

    /// Detaches the listener and cancels every timer. Callbacks stay registered.
    fn detach(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.cancel();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        for entry in self.callbacks.values_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            entry.pending = None;
        }
    }

    fn teardown(&mut self) {
        self.detach();
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.abort();
        }
        self.callbacks.clear();
    }
}

struct State {
    subscriptions: HashMap<String, JobSubscription>,
    limiter: RateLimiter,
    next_id: u64,
    next_generation: u64,
    shut_down: bool,
}

#[derive(Default)]
struct Counters {
    listeners_created: AtomicU64,
    notifications: AtomicU64,
    rate_limited: AtomicU64,
}

struct Inner {
    config: JobSubscriptionConfig,
    source: Arc<dyn JobSource>,
    state: Mutex<State>,
    counters: Counters,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSubscriptionStats {
    pub job_id: String,
    pub callbacks: usize,
    pub callback_types: Vec<CallbackType>,
    pub is_active: bool,
    pub has_listener: bool,
    pub pending_cleanup: bool,
    pub consecutive_errors: u32,
    pub last_status: Option<JobStatus>,
    pub last_update_ms_ago: u64,
    pub updates_received: u64,
    pub updates_skipped: u64,
    pub deliveries: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionManagerStats {
    pub total_subscriptions: usize,
    pub active_subscriptions: usize,
    pub total_callbacks: usize,
    pub listeners_created: u64,
    pub notifications_delivered: u64,
    pub rate_limited: u64,
    pub jobs: Vec<JobSubscriptionStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub subscriptions: usize,
    pub callbacks: usize,
    pub active_listeners: usize,
    pub pending_debounce_timers: usize,
    pub pending_cleanup_timers: usize,
    pub rate_limited_keys: usize,
    pub estimated_bytes: usize,
}

#[derive(Clone)]
pub struct JobSubscriptionManager {
    inner: Arc<Inner>,
}

impl JobSubscriptionManager {
    pub fn new(source: Arc<dyn JobSource>, config: JobSubscriptionConfig) -> Self {
        let limiter = RateLimiter::new(config.rate_limit_burst, config.rate_limit_refill_per_sec);
        Self {
            inner: Arc::new(Inner {
                config,
                source,
                state: Mutex::new(State {
                    subscriptions: HashMap::new(),
                    limiter,
                    next_id: 1,
                    next_generation: 1,
                    shut_down: false,
                }),
                counters: Counters::default(),
            }),
        }
    }

    /// Registers `callback` for updates on `job_id`.
    ///
    /// Rejected attempts (rate limit, shutdown) are logged and return a no-op handle.
    pub fn subscribe_to_job(
        &self,
        job_id: &str,
        callback: impl Fn(Option<Job>) + Send + Sync + 'static,
        options: SubscribeOptions,
    ) -> Unsubscribe {
        match self.try_subscribe_to_job(job_id, callback, options) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(job_id, "job subscription rejected: {err}");
                Unsubscribe::noop()
            }
        }
    }

    pub fn try_subscribe_to_job(
        &self,
        job_id: &str,
        callback: impl Fn(Option<Job>) + Send + Sync + 'static,
        options: SubscribeOptions,
    ) -> Result<Unsubscribe, SubscriptionError> {
        let inner = &self.inner;
        let mut guard = inner.state.lock();
        let state = &mut *guard;

        if state.shut_down {
            return Err(SubscriptionError::ShutDown);
        }
        if !state.limiter.try_acquire(job_id) {
            inner.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            return Err(SubscriptionError::RateLimited(job_id.to_string()));
        }

        let id = SubscriptionId(state.next_id);
        state.next_id += 1;

        let sub = state
            .subscriptions
            .entry(job_id.to_string())
            .or_insert_with(|| JobSubscription::new(job_id));

        if let Some(cleanup) = sub.cleanup.take() {
            cleanup.abort();
            sub.cleanup_epoch += 1;
            debug!(job_id, "pending teardown cancelled, reusing listener");
        }

        let mut entry = CallbackEntry {
            callback: Arc::new(callback),
            callback_type: options.callback_type,
            filter: options.filter,
            debounce: options.debounce.unwrap_or(inner.config.debounce),
            pending: None,
            timer: None,
            deliveries: 0,
        };

        // A shared listener will not replay the current document, so late
        // subscribers get it from the last known state.
        if sub.is_active {
            if let Some(job) = sub.last_job.as_ref().filter(|job| entry.accepts(job)) {
                Inner::schedule_delivery(inner, job_id, id, &mut entry, Some(job.clone()));
            }
        }
        sub.callbacks.insert(id, entry);

        if sub.listener.is_none() {
            let generation = state.next_generation;
            state.next_generation += 1;
            Inner::attach_listener(inner, sub, generation);
        }

        debug!(job_id, subscription = id.0, callbacks = sub.callbacks.len(), "job subscription added");

        Ok(Unsubscribe {
            target: Some((Arc::downgrade(inner), job_id.to_string(), id)),
            done: AtomicBool::new(false),
        })
    }

    pub fn subscribe_to_progress(
        &self,
        job_id: &str,
        callback: impl Fn(Option<Job>) + Send + Sync + 'static,
    ) -> Unsubscribe {
        self.subscribe_to_job(job_id, callback, SubscribeOptions::of_type(CallbackType::Progress))
    }

    pub fn subscribe_to_preview(
        &self,
        job_id: &str,
        callback: impl Fn(Option<Job>) + Send + Sync + 'static,
    ) -> Unsubscribe {
        self.subscribe_to_job(job_id, callback, SubscribeOptions::of_type(CallbackType::Preview))
    }

    pub fn subscribe_to_features(
        &self,
        job_id: &str,
        callback: impl Fn(Option<Job>) + Send + Sync + 'static,
    ) -> Unsubscribe {
        self.subscribe_to_job(job_id, callback, SubscribeOptions::of_type(CallbackType::Features))
    }

    /// Re-attaches a fresh listener for `job_id`, reactivating a subscription that was
    /// deactivated by errors.
    pub fn force_refresh(&self, job_id: &str) -> Result<(), SubscriptionError> {
        let inner = &self.inner;
        let mut guard = inner.state.lock();
        let state = &mut *guard;
        let generation = state.next_generation;

        let Some(sub) = state.subscriptions.get_mut(job_id) else {
            return Err(SubscriptionError::UnknownJob(job_id.to_string()));
        };
        state.next_generation += 1;

        sub.detach();
        sub.consecutive_errors = 0;
        sub.last_hash = None;
        sub.is_active = true;
        Inner::attach_listener(inner, sub, generation);
        info!(job_id, "job subscription force-refreshed");
        Ok(())
    }

    /// Tears down listeners idle past the inactivity window or over the error threshold.
    pub fn sweep(&self) -> usize {
        let config = &self.inner.config;
        let mut state = self.inner.state.lock();
        let now = Instant::now();
        let before = state.subscriptions.len();

        state.subscriptions.retain(|job_id, sub| {
            let idle = now.duration_since(sub.last_update) > config.inactivity_timeout;
            let failing = sub.consecutive_errors > config.max_retries;
            if idle || failing {
                info!(job_id = %job_id, idle, failing, "sweeping job subscription");
                sub.teardown();
                false
            } else {
                true
            }
        });
        state.limiter.prune();

        before - state.subscriptions.len()
    }

    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let period = self.inner.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.sweep();
            }
        })
    }

    pub fn get_stats(&self) -> SubscriptionManagerStats {
        let state = self.inner.state.lock();
        let now = Instant::now();
        let mut jobs: Vec<JobSubscriptionStats> = state
            .subscriptions
            .values()
            .map(|sub| JobSubscriptionStats {
                job_id: sub.job_id.clone(),
                callbacks: sub.callbacks.len(),
                callback_types: sub.callbacks.values().map(|e| e.callback_type).collect(),
                is_active: sub.is_active,
                has_listener: sub.listener.is_some(),
                pending_cleanup: sub.cleanup.is_some(),
                consecutive_errors: sub.consecutive_errors,
                last_status: sub.last_job.as_ref().map(|job| job.status),
                last_update_ms_ago: now.duration_since(sub.last_update).as_millis() as u64,
                updates_received: sub.updates_received,
                updates_skipped: sub.updates_skipped,
                deliveries: sub.callbacks.values().map(|e| e.deliveries).sum(),
            })
            .collect();
        jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));

        let counters = &self.inner.counters;
        SubscriptionManagerStats {
            total_subscriptions: jobs.len(),
            active_subscriptions: jobs.iter().filter(|j| j.is_active).count(),
            total_callbacks: jobs.iter().map(|j| j.callbacks).sum(),
            listeners_created: counters.listeners_created.load(Ordering::Relaxed),
            notifications_delivered: counters.notifications.load(Ordering::Relaxed),
            rate_limited: counters.rate_limited.load(Ordering::Relaxed),
            jobs,
        }
    }

    pub fn get_memory_stats(&self) -> MemoryStats {
        let state = self.inner.state.lock();
        let mut stats = MemoryStats {
            subscriptions: state.subscriptions.len(),
            callbacks: 0,
            active_listeners: 0,
            pending_debounce_timers: 0,
            pending_cleanup_timers: 0,
            rate_limited_keys: state.limiter.tracked_keys(),
            estimated_bytes: 0,
        };
        for sub in state.subscriptions.values() {
            stats.callbacks += sub.callbacks.len();
            stats.active_listeners += usize::from(sub.listener.is_some());
            stats.pending_cleanup_timers += usize::from(sub.cleanup.is_some());
            stats.pending_debounce_timers +=
                sub.callbacks.values().filter(|e| e.timer.is_some()).count();
            stats.estimated_bytes += ESTIMATED_SUBSCRIPTION_BYTES
                + sub.callbacks.len() * ESTIMATED_CALLBACK_BYTES
                + sub
                    .last_job
                    .as_ref()
                    .and_then(|job| serde_json::to_vec(job).ok())
                    .map_or(0, |bytes| bytes.len());
        }
        stats
    }

    /// Synchronously tears down every listener and timer. Later subscribes are no-ops.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shut_down = true;
        let count = state.subscriptions.len();
        for (_, mut sub) in state.subscriptions.drain() {
            sub.teardown();
        }
        info!(subscriptions = count, "job subscription manager shut down");
    }

    /// Drops every subscription without blocking future subscribes.
    pub fn clear_all(&self) {
        let mut state = self.inner.state.lock();
        for (_, mut sub) in state.subscriptions.drain() {
            sub.teardown();
        }
        info!("job subscriptions cleared");
    }
}

impl Inner {
    fn attach_listener(inner: &Arc<Inner>, sub: &mut JobSubscription, generation: u64) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = inner.source.listen(&sub.job_id, tx);

        let weak = Arc::downgrade(inner);
        let job_id = sub.job_id.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Inner::handle_event(&inner, &job_id, generation, event);
            }
        });

        sub.listener = Some(listener);
        sub.pump = Some(pump);
        sub.generation = generation;
        sub.is_active = true;
        sub.consecutive_errors = 0;
        sub.last_update = Instant::now();
        inner.counters.listeners_created.fetch_add(1, Ordering::Relaxed);
        info!(job_id = %sub.job_id, generation, "realtime listener attached");
    }

    fn handle_event(inner: &Arc<Inner>, job_id: &str, generation: u64, event: JobEvent) {
        let mut deactivated: Vec<JobCallback> = Vec::new();
        {
            let mut state = inner.state.lock();
            let Some(sub) = state.subscriptions.get_mut(job_id) else {
                return;
            };
            if sub.generation != generation || !sub.is_active {
                return;
            }

            match event {
                JobEvent::Snapshot(job) => {
                    sub.last_update = Instant::now();
                    sub.consecutive_errors = 0;
                    sub.updates_received += 1;

                    let hash = job
                        .as_ref()
                        .map(Job::change_hash)
                        .unwrap_or_else(|| MISSING_DOCUMENT_HASH.to_string());
                    let active = job.as_ref().is_some_and(|j| j.status.is_active());
                    if !active && sub.last_hash.as_deref() == Some(hash.as_str()) {
                        sub.updates_skipped += 1;
                        debug!(job_id, "job update carries no meaningful change, skipped");
                        return;
                    }
                    sub.last_hash = Some(hash);
                    sub.last_job = job.clone();

                    for (id, entry) in sub.callbacks.iter_mut() {
                        let relevant = job.as_ref().map_or(true, |j| entry.accepts(j));
                        if relevant {
                            Inner::schedule_delivery(inner, job_id, *id, entry, job.clone());
                        }
                    }
                }
                JobEvent::Error(message) => {
                    sub.consecutive_errors += 1;
                    warn!(
                        job_id,
                        consecutive_errors = sub.consecutive_errors,
                        "realtime listener error: {message}"
                    );
                    if sub.consecutive_errors > inner.config.max_retries {
                        sub.is_active = false;
                        error!(
                            job_id,
                            max_retries = inner.config.max_retries,
                            "job subscription deactivated, force_refresh required"
                        );
                        deactivated.extend(sub.callbacks.values().map(|e| Arc::clone(&e.callback)));
                        // Stops polling sources too; this pump exits at its next await.
                        sub.detach();
                    }
                }
            }
        }

        for callback in deactivated {
            invoke(job_id, &callback, None);
        }
    }

    /// Stores the latest value and (re)starts this callback's debounce timer.
    fn schedule_delivery(
        inner: &Arc<Inner>,
        job_id: &str,
        id: SubscriptionId,
        entry: &mut CallbackEntry,
        value: Option<Job>,
    ) {
        entry.pending = Some(value);
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }

        let weak = Arc::downgrade(inner);
        let job_id = job_id.to_string();
        let delay = entry.debounce;
        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                Inner::flush_delivery(&inner, &job_id, id);
            }
        }));
    }

    fn flush_delivery(inner: &Arc<Inner>, job_id: &str, id: SubscriptionId) {
        let (callback, value) = {
            let mut state = inner.state.lock();
            let Some(sub) = state.subscriptions.get_mut(job_id) else {
                return;
            };
            if !sub.is_active {
                return;
            }
            let Some(entry) = sub.callbacks.get_mut(&id) else {
                return;
            };
            entry.timer = None;
            let Some(value) = entry.pending.take() else {
                return;
            };
            entry.deliveries += 1;
            (Arc::clone(&entry.callback), value)
        };

        inner.counters.notifications.fetch_add(1, Ordering::Relaxed);
        invoke(job_id, &callback, value);
    }

    fn remove_callback(inner: &Arc<Inner>, job_id: &str, id: SubscriptionId) {
        let mut state = inner.state.lock();
        let Some(sub) = state.subscriptions.get_mut(job_id) else {
            return;
        };
        if let Some(entry) = sub.callbacks.remove(&id) {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
        debug!(job_id, subscription = id.0, remaining = sub.callbacks.len(), "job subscription removed");

        if sub.callbacks.is_empty() && sub.cleanup.is_none() {
            let weak = Arc::downgrade(inner);
            let grace = inner.config.cleanup_grace;
            sub.cleanup_epoch += 1;
            let epoch = sub.cleanup_epoch;
            let job_id = job_id.to_string();
            sub.cleanup = Some(tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if let Some(inner) = weak.upgrade() {
                    Inner::teardown_if_idle(&inner, &job_id, epoch);
                }
            }));
        }
    }

    fn teardown_if_idle(inner: &Arc<Inner>, job_id: &str, epoch: u64) {
        let mut state = inner.state.lock();
        let idle = state
            .subscriptions
            .get(job_id)
            .is_some_and(|sub| sub.callbacks.is_empty() && sub.cleanup_epoch == epoch);
        if !idle {
            return;
        }
        if let Some(mut sub) = state.subscriptions.remove(job_id) {
            // this task is the cleanup timer; drop its own handle instead of aborting it
            sub.cleanup = None;
            sub.teardown();
            info!(job_id, "realtime listener torn down after grace period");
        }
    }
}

/// Runs a subscriber callback; a panic is logged and contained.
fn invoke(job_id: &str, callback: &JobCallback, value: Option<Job>) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
        error!(job_id, "job subscription callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::source::InMemoryJobSource;

    type Received = Arc<Mutex<Vec<Option<Job>>>>;

    fn setup(config: JobSubscriptionConfig) -> (JobSubscriptionManager, InMemoryJobSource) {
        let source = InMemoryJobSource::new();
        let manager = JobSubscriptionManager::new(Arc::new(source.clone()), config);
        (manager, source)
    }

    fn recorder() -> (Received, impl Fn(Option<Job>) + Send + Sync + 'static) {
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        (received, move |job| sink.lock().push(job))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_many_callbacks_share_one_listener() {
        let (manager, source) = setup(JobSubscriptionConfig::default());
        let handles: Vec<Unsubscribe> = (0..3)
            .map(|_| manager.subscribe_to_job("job-1", |_| {}, SubscribeOptions::default()))
            .collect();
        assert_eq!(source.registrations(), 1);
        assert_eq!(manager.get_stats().total_callbacks, 3);

        for handle in &handles {
            handle.unsubscribe();
        }
        tokio::time::sleep(Duration::from_secs(10)).await;

        let _again = manager.subscribe_to_job("job-1", |_| {}, SubscribeOptions::default());
        assert_eq!(source.registrations(), 1);
        assert_eq!(source.active_listeners("job-1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_torn_down_after_grace_period() {
        let (manager, source) = setup(JobSubscriptionConfig::default());
        let handle = manager.subscribe_to_job("job-1", |_| {}, SubscribeOptions::default());
        handle.unsubscribe();
        handle.unsubscribe();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(source.active_listeners("job-1"), 0);
        assert_eq!(manager.get_stats().total_subscriptions, 0);

        let _again = manager.subscribe_to_job("job-1", |_| {}, SubscribeOptions::default());
        assert_eq!(source.registrations(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_updates_coalesces_to_latest() {
        let (manager, source) = setup(JobSubscriptionConfig::default());
        let (received, callback) = recorder();
        let _sub = manager.subscribe_to_job("job-1", callback, SubscribeOptions::default());

        for progress in [10.0, 20.0, 30.0, 40.0, 50.0] {
            source.push(Job::new("job-1", JobStatus::Processing).with_progress(progress));
        }
        settle().await;

        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].as_ref().unwrap().progress, Some(50.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_subscriber_skips_pending_state() {
        let (manager, source) = setup(JobSubscriptionConfig::default());
        let (received, callback) = recorder();
        let _sub = manager.subscribe_to_progress("job-42", callback);

        for status in [JobStatus::Pending, JobStatus::Processing, JobStatus::Analyzed] {
            source.push(Job::new("job-42", status));
            settle().await;
        }

        let statuses: Vec<JobStatus> = received
            .lock()
            .iter()
            .map(|job| job.as_ref().unwrap().status)
            .collect();
        assert_eq!(statuses, vec![JobStatus::Processing, JobStatus::Analyzed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_update_skipped_unless_job_is_active() {
        let (manager, source) = setup(JobSubscriptionConfig::default());
        let (received, callback) = recorder();
        let _sub = manager.subscribe_to_job("job-1", callback, SubscribeOptions::default());

        let analyzed = Job::new("job-1", JobStatus::Analyzed).with_progress(100.0);
        source.push(analyzed.clone());
        settle().await;
        source.push(analyzed);
        settle().await;
        assert_eq!(received.lock().len(), 1);

        let processing = Job::new("job-1", JobStatus::Processing).with_progress(10.0);
        source.push(processing.clone());
        settle().await;
        source.push(processing);
        settle().await;
        assert_eq!(received.lock().len(), 3);

        let stats = manager.get_stats();
        assert_eq!(stats.jobs[0].updates_skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_subscriber_receives_last_known_state() {
        let (manager, source) = setup(JobSubscriptionConfig::default());
        let _first = manager.subscribe_to_job("job-1", |_| {}, SubscribeOptions::default());
        source.push(Job::new("job-1", JobStatus::Analyzed));
        settle().await;

        let (received, callback) = recorder();
        let _second = manager.subscribe_to_job("job-1", callback, SubscribeOptions::default());
        settle().await;

        assert_eq!(received.lock().len(), 1);
        assert_eq!(source.registrations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_delivery_after_unsubscribe() {
        let (manager, source) = setup(JobSubscriptionConfig::default());
        let (received, callback) = recorder();
        let sub = manager.subscribe_to_job("job-1", callback, SubscribeOptions::default());

        source.push(Job::new("job-1", JobStatus::Processing));
        tokio::task::yield_now().await;
        sub.unsubscribe();
        settle().await;

        assert!(received.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_errors_deactivate_until_force_refresh() {
        let (manager, source) = setup(JobSubscriptionConfig::default());
        let (received, callback) = recorder();
        let _sub = manager.subscribe_to_job("job-1", callback, SubscribeOptions::default());

        for _ in 0..4 {
            source.fail("job-1", "listener permission denied");
        }
        settle().await;
        assert_eq!(*received.lock(), vec![None]);
        assert!(!manager.get_stats().jobs[0].is_active);

        source.push(Job::new("job-1", JobStatus::Processing));
        settle().await;
        assert_eq!(received.lock().len(), 1);

        assert!(manager.force_refresh("job-1").is_ok());
        assert_eq!(
            manager.force_refresh("job-9"),
            Err(SubscriptionError::UnknownJob("job-9".to_string()))
        );
        settle().await;
        assert_eq!(source.registrations(), 2);
        // fresh listener replays the stored document
        assert_eq!(received.lock().len(), 2);
        assert!(manager.get_stats().jobs[0].is_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_below_threshold_keep_subscription_active() {
        let (manager, source) = setup(JobSubscriptionConfig::default());
        let _sub = manager.subscribe_to_job("job-1", |_| {}, SubscribeOptions::default());

        for _ in 0..3 {
            source.fail("job-1", "transient");
        }
        settle().await;
        let stats = manager.get_stats();
        assert!(stats.jobs[0].is_active);
        assert_eq!(stats.jobs[0].consecutive_errors, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_subscribe_returns_noop() {
        let (manager, _source) = setup(JobSubscriptionConfig {
            rate_limit_burst: 2,
            rate_limit_refill_per_sec: 0.0,
            ..JobSubscriptionConfig::default()
        });

        let a = manager.subscribe_to_job("job-1", |_| {}, SubscribeOptions::default());
        let b = manager.subscribe_to_job("job-1", |_| {}, SubscribeOptions::default());
        let c = manager.subscribe_to_job("job-1", |_| {}, SubscribeOptions::default());
        assert!(matches!(
            manager.try_subscribe_to_job("job-1", |_| {}, SubscribeOptions::default()),
            Err(SubscriptionError::RateLimited(_))
        ));
        assert!(!a.is_noop());
        assert!(!b.is_noop());
        assert!(c.is_noop());
        c.unsubscribe();
        assert_eq!(manager.get_stats().rate_limited, 2);
        assert_eq!(manager.get_stats().total_callbacks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_inactive_subscriptions() {
        let (manager, source) = setup(JobSubscriptionConfig::default());
        let _sub = manager.subscribe_to_job("job-1", |_| {}, SubscribeOptions::default());

        tokio::time::advance(Duration::from_secs(11 * 60)).await;
        assert_eq!(manager.sweep(), 1);
        assert_eq!(source.active_listeners("job-1"), 0);
        assert_eq!(manager.get_memory_stats().subscriptions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivation_releases_listener_until_force_refresh() {
        let (manager, source) = setup(JobSubscriptionConfig::default());
        let _sub = manager.subscribe_to_job("job-1", |_| {}, SubscribeOptions::default());
        assert_eq!(source.active_listeners("job-1"), 1);

        for _ in 0..4 {
            source.fail("job-1", "listener permission denied");
        }
        settle().await;
        let stats = manager.get_stats();
        assert!(!stats.jobs[0].is_active);
        assert!(!stats.jobs[0].has_listener);
        assert_eq!(source.active_listeners("job-1"), 0);

        manager.force_refresh("job-1").unwrap();
        assert_eq!(source.active_listeners("job-1"), 1);
        assert!(manager.get_stats().jobs[0].has_listener);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_subscriptions_over_error_threshold() {
        let (manager, source) = setup(JobSubscriptionConfig {
            max_retries: 1,
            ..JobSubscriptionConfig::default()
        });
        let _failing = manager.subscribe_to_job("job-1", |_| {}, SubscribeOptions::default());
        let _healthy = manager.subscribe_to_job("job-2", |_| {}, SubscribeOptions::default());

        source.fail("job-1", "listener permission denied");
        source.fail("job-1", "listener permission denied");
        settle().await;

        assert_eq!(manager.sweep(), 1);
        let stats = manager.get_stats();
        assert_eq!(stats.total_subscriptions, 1);
        assert_eq!(stats.jobs[0].job_id, "job-2");
        assert_eq!(source.active_listeners("job-2"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refresh_during_grace_window_still_tears_down() {
        let (manager, source) = setup(JobSubscriptionConfig::default());
        let handle = manager.subscribe_to_job("job-1", |_| {}, SubscribeOptions::default());
        handle.unsubscribe();

        tokio::time::sleep(Duration::from_secs(5)).await;
        manager.force_refresh("job-1").unwrap();
        assert_eq!(source.active_listeners("job-1"), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(manager.get_stats().total_subscriptions, 0);
        assert_eq!(source.active_listeners("job-1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_and_leave_restarts_grace_window() {
        let (manager, source) = setup(JobSubscriptionConfig::default());
        manager
            .subscribe_to_job("job-1", |_| {}, SubscribeOptions::default())
            .unsubscribe();
        tokio::time::sleep(Duration::from_secs(20)).await;
        manager
            .subscribe_to_job("job-1", |_| {}, SubscribeOptions::default())
            .unsubscribe();

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(manager.get_stats().total_subscriptions, 1);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(manager.get_stats().total_subscriptions, 0);
        assert_eq!(source.registrations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_callback_does_not_starve_others() {
        let (manager, source) = setup(JobSubscriptionConfig::default());
        let (received, callback) = recorder();
        let _bad = manager.subscribe_to_job("job-1", |_| panic!("render failed"), SubscribeOptions::default());
        let _good = manager.subscribe_to_job("job-1", callback, SubscribeOptions::default());

        source.push(Job::new("job-1", JobStatus::Processing));
        settle().await;
        source.push(Job::new("job-1", JobStatus::Generating));
        settle().await;

        assert_eq!(received.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_filter_applies_on_top_of_type() {
        let (manager, source) = setup(JobSubscriptionConfig::default());
        let (received, callback) = recorder();
        let _sub = manager.subscribe_to_job(
            "job-1",
            callback,
            SubscribeOptions::of_type(CallbackType::Progress)
                .with_filter(|job| job.progress.unwrap_or(0.0) >= 50.0),
        );

        source.push(Job::new("job-1", JobStatus::Processing).with_progress(20.0));
        settle().await;
        source.push(Job::new("job-1", JobStatus::Processing).with_progress(60.0));
        settle().await;

        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].as_ref().unwrap().progress, Some(60.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_detaches_everything() {
        let (manager, source) = setup(JobSubscriptionConfig::default());
        let _a = manager.subscribe_to_job("job-1", |_| {}, SubscribeOptions::default());
        let _b = manager.subscribe_to_job("job-2", |_| {}, SubscribeOptions::default());
        assert_eq!(manager.get_memory_stats().active_listeners, 2);

        manager.shutdown();
        assert_eq!(source.active_listeners("job-1"), 0);
        assert_eq!(source.active_listeners("job-2"), 0);
        assert!(manager
            .subscribe_to_job("job-3", |_| {}, SubscribeOptions::default())
            .is_noop());
    }
}
