//! Realtime job document sources.
//!
//! A source pushes `JobEvent`s for one job id into the channel it is handed until the
//! returned `ListenerHandle` is dropped. The subscription manager opens at most one
//! listener per job and fans the events out to its callbacks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backend::BackendClient;
use crate::jobs::model::Job;

#[derive(Debug, Clone)]
pub enum JobEvent {
    /// Current document, or `None` when it does not exist.
    Snapshot(Option<Job>),
    Error(String),
}

/// Cancels the underlying listener when dropped.
pub struct ListenerHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn from_task(task: JoinHandle<()>) -> Self {
        Self::new(move || task.abort())
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

pub trait JobSource: Send + Sync {
    fn listen(&self, job_id: &str, events: UnboundedSender<JobEvent>) -> ListenerHandle;
}

/// Observes job documents by polling `getJobStatus` on the backend.
pub struct PollingJobSource {
    backend: BackendClient,
    interval: Duration,
}

impl PollingJobSource {
    pub fn new(backend: BackendClient, interval: Duration) -> Self {
        Self { backend, interval }
    }
}

impl JobSource for PollingJobSource {
    fn listen(&self, job_id: &str, events: UnboundedSender<JobEvent>) -> ListenerHandle {
        let backend = self.backend.clone();
        let interval = self.interval;
        let job_id = job_id.to_string();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let event = match backend.get_job_status(&job_id).await {
                    Ok(job) => JobEvent::Snapshot(job),
                    Err(err) => {
                        warn!(job_id = %job_id, "job status poll failed: {err}");
                        JobEvent::Error(err.to_string())
                    }
                };
                if events.send(event).is_err() {
                    debug!(job_id = %job_id, "job listener channel closed, stopping poll");
                    break;
                }
            }
        });

        ListenerHandle::from_task(task)
    }
}

#[derive(Default)]
struct InMemoryState {
    documents: HashMap<String, Job>,
    sinks: HashMap<String, Vec<(u64, UnboundedSender<JobEvent>)>>,
    next_sink: u64,
}

/// Push-driven source backed by an in-process document map.
///
/// Delivers the current document on attach like a realtime listener does, and
/// counts listener registrations so callers can observe listener sharing.
#[derive(Clone, Default)]
pub struct InMemoryJobSource {
    state: Arc<Mutex<InMemoryState>>,
    registrations: Arc<AtomicU64>,
}

impl InMemoryJobSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the document and notifies every listener on its id.
    pub fn push(&self, job: Job) {
        let mut state = self.state.lock();
        let job_id = job.id.clone();
        state.documents.insert(job_id.clone(), job.clone());
        Self::emit(&mut state, &job_id, JobEvent::Snapshot(Some(job)));
    }

    pub fn remove(&self, job_id: &str) {
        let mut state = self.state.lock();
        state.documents.remove(job_id);
        Self::emit(&mut state, job_id, JobEvent::Snapshot(None));
    }

    pub fn fail(&self, job_id: &str, message: impl Into<String>) {
        let mut state = self.state.lock();
        Self::emit(&mut state, job_id, JobEvent::Error(message.into()));
    }

    pub fn registrations(&self) -> u64 {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn active_listeners(&self, job_id: &str) -> usize {
        self.state.lock().sinks.get(job_id).map_or(0, Vec::len)
    }

    fn emit(state: &mut InMemoryState, job_id: &str, event: JobEvent) {
        if let Some(sinks) = state.sinks.get_mut(job_id) {
            sinks.retain(|(_, sink)| sink.send(event.clone()).is_ok());
        }
    }
}

impl JobSource for InMemoryJobSource {
    fn listen(&self, job_id: &str, events: UnboundedSender<JobEvent>) -> ListenerHandle {
        self.registrations.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        let sink_id = state.next_sink;
        state.next_sink += 1;
        if let Some(existing) = state.documents.get(job_id) {
            let _ = events.send(JobEvent::Snapshot(Some(existing.clone())));
        }
        state
            .sinks
            .entry(job_id.to_string())
            .or_default()
            .push((sink_id, events));

        let shared = Arc::clone(&self.state);
        let job_id = job_id.to_string();
        ListenerHandle::new(move || {
            let mut state = shared.lock();
            if let Some(sinks) = state.sinks.get_mut(&job_id) {
                sinks.retain(|(id, _)| *id != sink_id);
                if sinks.is_empty() {
                    state.sinks.remove(&job_id);
                }
            }
        })
    }
}
