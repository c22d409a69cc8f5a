//! Realtime session sync.
//!
//! Per session: `disconnected → syncing → (synced | conflicted | error | offline)`.
//! Local changes are applied optimistically, published to peer tabs on the
//! [`LocalBus`] and sent over the socket when one is up. Changes that cannot be sent
//! are queued (and persisted when a [`PendingChangeStore`] is configured), then
//! replayed after the next successful connection.

pub mod conflict;
pub mod model;
pub mod persist;
pub mod presence;
pub mod transport;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use conflict::{detect_conflict, merge_states, resolve_conflicts};
pub use model::{
    ChangeSource, ChangeType, ConflictResolution, FeatureState, PresenceStatus,
    ResolutionStrategy, SessionState, SocketMessage, StateChange, StepProgress, SyncEvent,
    SyncStatus, TabEnvelope, TabMessageType, UserPresence,
};
pub use persist::PendingChangeStore;
pub use presence::PresenceTracker;
pub use transport::{LocalBus, MemoryConnector, SocketConnector, SocketLink, WebSocketConnector};

const EVENT_CAPACITY: usize = 256;
const MAX_RECORDED_CONFLICTS: usize = 50;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Session {0} has no socket connection")]
    NotConnected(String),

    #[error("Invalid change at path '{0}'")]
    InvalidChange(String),

    #[error("Unknown optimistic update: {0}")]
    UnknownUpdate(Uuid),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub user_id: String,
    pub device: String,
    pub strategy: ResolutionStrategy,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Failed reconnects tolerated before the session goes `offline`.
    pub max_reconnect_attempts: u32,
    pub presence_interval: Duration,
    pub away_after: Duration,
    /// Recent local changes kept for conflict detection.
    pub change_log_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            user_id: "anonymous".to_string(),
            device: presence::device_name(),
            strategy: ResolutionStrategy::Merge,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            presence_interval: Duration::from_secs(30),
            away_after: Duration::from_secs(5 * 60),
            change_log_capacity: 200,
        }
    }
}

struct OptimisticUpdate {
    session_id: String,
    path: String,
    previous: Option<Value>,
}

struct Session {
    state: SessionState,
    status: SyncStatus,
    pending: Vec<StateChange>,
    change_log: VecDeque<StateChange>,
    seen: VecDeque<Uuid>,
    outbound: Option<mpsc::Sender<SocketMessage>>,
    reconnect_attempts: u32,
    connection: Option<JoinHandle<()>>,
    tab_listener: Option<JoinHandle<()>>,
    presence: Option<JoinHandle<()>>,
    peers: HashMap<String, UserPresence>,
    conflicts: VecDeque<ConflictResolution>,
}

impl Session {
    fn new(state: SessionState) -> Self {
        Self {
            state,
            status: SyncStatus::Disconnected,
            pending: Vec::new(),
            change_log: VecDeque::new(),
            seen: VecDeque::new(),
            outbound: None,
            reconnect_attempts: 0,
            connection: None,
            tab_listener: None,
            presence: None,
            peers: HashMap::new(),
            conflicts: VecDeque::new(),
        }
    }

    fn abort_tasks(&mut self) {
        for task in [
            self.connection.take(),
            self.tab_listener.take(),
            self.presence.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
        self.outbound = None;
    }

    fn remember(&mut self, id: Uuid, capacity: usize) {
        self.seen.push_back(id);
        while self.seen.len() > capacity {
            self.seen.pop_front();
        }
    }

    fn record_conflict(&mut self, resolution: ConflictResolution) {
        self.conflicts.push_back(resolution);
        while self.conflicts.len() > MAX_RECORDED_CONFLICTS {
            self.conflicts.pop_front();
        }
    }
}

struct State {
    sessions: HashMap<String, Session>,
    optimistic: HashMap<Uuid, OptimisticUpdate>,
    presence: PresenceTracker,
}

struct Inner {
    config: SyncConfig,
    tab_id: String,
    connector: Option<Arc<dyn SocketConnector>>,
    bus: LocalBus,
    store: Option<PendingChangeStore>,
    state: Mutex<State>,
    events: broadcast::Sender<SyncEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDebugInfo {
    pub session_id: String,
    pub status: SyncStatus,
    pub version: u64,
    pub pending_changes: usize,
    pub reconnect_attempts: u32,
    pub peers: usize,
    pub conflicts: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncDebugInfo {
    pub tab_id: String,
    pub presence: PresenceStatus,
    pub optimistic_updates: usize,
    pub sessions: Vec<SessionDebugInfo>,
}

/// One tab's view of every session it has joined.
#[derive(Clone)]
pub struct RealtimeSessionSync {
    inner: Arc<Inner>,
}

impl RealtimeSessionSync {
    /// `connector: None` keeps sessions local: tab-to-tab propagation only.
    pub fn new(
        config: SyncConfig,
        bus: LocalBus,
        connector: Option<Arc<dyn SocketConnector>>,
        store: Option<PendingChangeStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let presence = PresenceTracker::new(config.away_after);
        Self {
            inner: Arc::new(Inner {
                config,
                tab_id: Uuid::new_v4().to_string(),
                connector,
                bus,
                store,
                state: Mutex::new(State {
                    sessions: HashMap::new(),
                    optimistic: HashMap::new(),
                    presence,
                }),
                events,
            }),
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.inner.tab_id
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Joins `initial.session_id`: attaches the tab bus, starts presence and opens the
    /// socket in the background. Changes persisted by an earlier run are re-applied and
    /// queued for replay. Joining an already joined session is a no-op.
    pub async fn connect(&self, initial: SessionState) -> Result<(), SyncError> {
        let inner = &self.inner;
        let session_id = initial.session_id.clone();
        if inner.state.lock().sessions.contains_key(&session_id) {
            return Ok(());
        }

        let restored = match &inner.store {
            Some(store) => store.load(&session_id).await.unwrap_or_else(|e| {
                warn!(session_id = %session_id, "failed to load pending changes: {e}");
                Vec::new()
            }),
            None => Vec::new(),
        };

        let status = {
            let mut state = inner.state.lock();
            if state.sessions.contains_key(&session_id) {
                return Ok(());
            }

            let mut session = Session::new(initial);
            for change in restored {
                if let Err(e) = session.state.apply(&change) {
                    warn!(session_id = %session_id, "dropping unreplayable pending change: {e}");
                    continue;
                }
                session.remember(change.id, inner.config.change_log_capacity);
                session.pending.push(change);
            }

            session.tab_listener = Some(Inner::spawn_tab_listener(inner, &session_id));
            session.presence = Some(Inner::spawn_presence(inner, &session_id));
            session.status = if inner.connector.is_some() {
                session.connection = Some(Inner::spawn_connection(inner, &session_id));
                SyncStatus::Syncing
            } else {
                SyncStatus::Synced
            };
            let status = session.status;
            state.sessions.insert(session_id.clone(), session);
            status
        };

        info!(session_id = %session_id, %status, "session sync started");
        inner.emit(SyncEvent::StatusChanged { session_id, status });
        Ok(())
    }

    /// Leaves the session. Unsent changes stay persisted for the next `connect`.
    pub async fn disconnect(&self, session_id: &str) -> Result<(), SyncError> {
        let pending = {
            let mut state = self.inner.state.lock();
            let mut session = state
                .sessions
                .remove(session_id)
                .ok_or_else(|| SyncError::UnknownSession(session_id.to_string()))?;
            session.abort_tasks();
            state.optimistic.retain(|_, update| update.session_id != session_id);
            session.pending
        };

        self.inner.persist_pending(session_id, &pending).await;
        info!(session_id, pending = pending.len(), "session sync stopped");
        self.inner.emit(SyncEvent::StatusChanged {
            session_id: session_id.to_string(),
            status: SyncStatus::Disconnected,
        });
        Ok(())
    }

    /// Restarts the connection loop with a fresh attempt budget. Required once a
    /// session has gone `offline`.
    pub fn reconnect(&self, session_id: &str) -> Result<(), SyncError> {
        let inner = &self.inner;
        if inner.connector.is_none() {
            return Err(SyncError::NotConnected(session_id.to_string()));
        }
        {
            let mut state = inner.state.lock();
            let session = state
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| SyncError::UnknownSession(session_id.to_string()))?;
            if let Some(task) = session.connection.take() {
                task.abort();
            }
            session.outbound = None;
            session.reconnect_attempts = 0;
            session.status = SyncStatus::Syncing;
            session.connection = Some(Inner::spawn_connection(inner, session_id));
        }
        info!(session_id, "manual reconnect requested");
        inner.emit(SyncEvent::StatusChanged {
            session_id: session_id.to_string(),
            status: SyncStatus::Syncing,
        });
        Ok(())
    }

    /// Applies `change` locally, notifies local listeners and fans it out to peer tabs
    /// and the socket.
    pub async fn broadcast_state_change(
        &self,
        session_id: &str,
        change: StateChange,
    ) -> Result<(), SyncError> {
        self.inner.publish_local(session_id, change).await.map(|_| ())
    }

    /// Like [`broadcast_state_change`](Self::broadcast_state_change) but remembers the
    /// overwritten value so the change can be rolled back.
    pub async fn apply_optimistic_update(
        &self,
        session_id: &str,
        change: StateChange,
    ) -> Result<Uuid, SyncError> {
        let path = change.path.clone();
        let previous = self.inner.publish_local(session_id, change).await?;

        let update_id = Uuid::new_v4();
        self.inner.state.lock().optimistic.insert(
            update_id,
            OptimisticUpdate {
                session_id: session_id.to_string(),
                path,
                previous,
            },
        );
        debug!(session_id, %update_id, "optimistic update applied");
        Ok(update_id)
    }

    /// Reverts the path touched by `update_id` to its previous value. Later changes to
    /// the same path are overwritten too.
    pub async fn rollback_update(&self, update_id: Uuid) -> Result<(), SyncError> {
        let update = self
            .inner
            .state
            .lock()
            .optimistic
            .remove(&update_id)
            .ok_or(SyncError::UnknownUpdate(update_id))?;

        let revert = match update.previous {
            Some(previous) => StateChange::update(&update.session_id, &update.path, previous),
            None => StateChange::delete(&update.session_id, &update.path),
        };
        self.inner.publish_local(&update.session_id, revert).await?;
        info!(session_id = %update.session_id, %update_id, path = %update.path, "optimistic update rolled back");
        Ok(())
    }

    pub fn confirm_update(&self, update_id: Uuid) -> Result<(), SyncError> {
        self.inner
            .state
            .lock()
            .optimistic
            .remove(&update_id)
            .map(|_| ())
            .ok_or(SyncError::UnknownUpdate(update_id))
    }

    /// Feeds page/window visibility into presence.
    pub fn set_visibility(&self, visible: bool) {
        self.inner.state.lock().presence.set_visible(visible);
    }

    pub fn status(&self, session_id: &str) -> Option<SyncStatus> {
        self.inner.state.lock().sessions.get(session_id).map(|s| s.status)
    }

    pub fn state(&self, session_id: &str) -> Option<SessionState> {
        self.inner
            .state
            .lock()
            .sessions
            .get(session_id)
            .map(|s| s.state.clone())
    }

    pub fn peers(&self, session_id: &str) -> Vec<UserPresence> {
        self.inner
            .state
            .lock()
            .sessions
            .get(session_id)
            .map(|s| s.peers.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn conflicts(&self, session_id: &str) -> Vec<ConflictResolution> {
        self.inner
            .state
            .lock()
            .sessions
            .get(session_id)
            .map(|s| s.conflicts.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_changes(&self, session_id: &str) -> usize {
        self.inner
            .state
            .lock()
            .sessions
            .get(session_id)
            .map_or(0, |s| s.pending.len())
    }

    pub fn debug_info(&self) -> SyncDebugInfo {
        let state = self.inner.state.lock();
        let mut sessions: Vec<SessionDebugInfo> = state
            .sessions
            .iter()
            .map(|(id, s)| SessionDebugInfo {
                session_id: id.clone(),
                status: s.status,
                version: s.state.version,
                pending_changes: s.pending.len(),
                reconnect_attempts: s.reconnect_attempts,
                peers: s.peers.len(),
                conflicts: s.conflicts.len(),
            })
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        SyncDebugInfo {
            tab_id: self.inner.tab_id.clone(),
            presence: state.presence.status(),
            optimistic_updates: state.optimistic.len(),
            sessions,
        }
    }

    /// Synchronously stops every session task. Persisted pending changes are kept.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        let count = state.sessions.len();
        for (_, mut session) in state.sessions.drain() {
            session.abort_tasks();
        }
        state.optimistic.clear();
        info!(sessions = count, "session sync shut down");
    }
}

impl Inner {
    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    /// Best effort: a failed write is logged, the change stays queued in memory.
    async fn persist_pending(&self, session_id: &str, pending: &[StateChange]) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(session_id, pending).await {
                warn!(session_id, "failed to persist pending changes: {e}");
            }
        }
    }

    /// Returns the value previously stored at the change's path.
    async fn publish_local(
        &self,
        session_id: &str,
        mut change: StateChange,
    ) -> Result<Option<Value>, SyncError> {
        change.session_id = session_id.to_string();
        change.source = ChangeSource::Local;

        let (previous, outbound, unsent) = {
            let mut state = self.state.lock();
            let session = state
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| SyncError::UnknownSession(session_id.to_string()))?;

            let previous = session.state.read_path(&change.path);
            change.old_value = previous.clone();
            session.state.apply(&change)?;

            session.remember(change.id, self.config.change_log_capacity);
            session.change_log.push_back(change.clone());
            while session.change_log.len() > self.config.change_log_capacity {
                session.change_log.pop_front();
            }

            let outbound = session.outbound.clone();
            let unsent = if outbound.is_none() && self.connector.is_some() {
                session.pending.push(change.clone());
                Some(session.pending.clone())
            } else {
                None
            };
            (previous, outbound, unsent)
        };

        self.emit(SyncEvent::StateChanged {
            session_id: session_id.to_string(),
            change: change.clone(),
        });
        self.bus.publish(TabEnvelope {
            message_type: TabMessageType::StateChange,
            session_id: session_id.to_string(),
            changes: vec![change.clone()],
            tab_id: self.tab_id.clone(),
            timestamp: Utc::now(),
        });

        // A full socket channel is awaited, never bypassed into the pending queue.
        let unsent = match outbound {
            Some(tx) => {
                let message = SocketMessage::StateChange {
                    session_id: session_id.to_string(),
                    change: change.clone(),
                };
                if tx.send(message).await.is_ok() {
                    None
                } else {
                    self.queue_pending(session_id, change)
                }
            }
            None => unsent,
        };
        if let Some(pending) = unsent {
            debug!(session_id, pending = pending.len(), "change queued until reconnect");
            self.persist_pending(session_id, &pending).await;
        }
        Ok(previous)
    }

    /// Queues a change the socket refused. Returns the queue to persist, or `None` if
    /// the session is gone.
    fn queue_pending(&self, session_id: &str, change: StateChange) -> Option<Vec<StateChange>> {
        let mut state = self.state.lock();
        let session = state.sessions.get_mut(session_id)?;
        session.pending.push(change);
        Some(session.pending.clone())
    }

    /// Applies a change that originated in another tab or on the server.
    fn apply_remote(&self, session_id: &str, mut change: StateChange) {
        change.source = ChangeSource::Remote;
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(session) = state.sessions.get_mut(session_id) else {
                return;
            };
            if session.seen.contains(&change.id) {
                return;
            }
            session.remember(change.id, self.config.change_log_capacity);

            let conflicting = session
                .change_log
                .iter()
                .position(|local| detect_conflict(local, &change));

            if let Some(index) = conflicting {
                session.change_log.remove(index);
                let mut remote_state = session.state.clone();
                if let Err(e) = remote_state.apply(&change) {
                    warn!(session_id, "ignoring remote change: {e}");
                    return;
                }
                remote_state.last_active_at = change.timestamp;

                let (resolved, resolution) =
                    resolve_conflicts(&session.state, &remote_state, self.config.strategy);
                info!(
                    session_id,
                    path = %change.path,
                    strategy = ?resolution.resolution_strategy,
                    "conflicting change resolved"
                );
                session.state = resolved;
                if let Some(tx) = &session.outbound {
                    let _ = tx.try_send(SocketMessage::ConflictDetected {
                        session_id: session_id.to_string(),
                        resolution: resolution.clone(),
                    });
                }
                session.record_conflict(resolution.clone());
                if session.status != SyncStatus::Conflicted {
                    session.status = SyncStatus::Conflicted;
                    events.push(SyncEvent::StatusChanged {
                        session_id: session_id.to_string(),
                        status: SyncStatus::Conflicted,
                    });
                }
                events.push(SyncEvent::ConflictResolved { resolution });
            } else {
                if let Err(e) = session.state.apply(&change) {
                    warn!(session_id, "ignoring remote change: {e}");
                    return;
                }
                events.push(SyncEvent::StateChanged {
                    session_id: session_id.to_string(),
                    change,
                });
                // Local-only sessions have no socket to wait for.
                let online = session.outbound.is_some() || self.connector.is_none();
                if session.status == SyncStatus::Conflicted && online {
                    session.status = SyncStatus::Synced;
                    events.push(SyncEvent::StatusChanged {
                        session_id: session_id.to_string(),
                        status: SyncStatus::Synced,
                    });
                }
            }
        }
        for event in events {
            self.emit(event);
        }
    }

    fn handle_socket_message(&self, message: SocketMessage) {
        match message {
            SocketMessage::StateChange { session_id, change } => {
                self.apply_remote(&session_id, change);
            }
            SocketMessage::UserPresence {
                session_id,
                presence,
            } => {
                if presence.user_id == self.config.user_id && presence.device == self.config.device {
                    return;
                }
                {
                    let mut state = self.state.lock();
                    let Some(session) = state.sessions.get_mut(&session_id) else {
                        return;
                    };
                    session.peers.insert(presence.user_id.clone(), presence.clone());
                }
                self.emit(SyncEvent::PresenceChanged {
                    session_id,
                    presence,
                });
            }
            SocketMessage::ConflictDetected {
                session_id,
                resolution,
            } => {
                {
                    let mut state = self.state.lock();
                    let Some(session) = state.sessions.get_mut(&session_id) else {
                        return;
                    };
                    match serde_json::from_value::<SessionState>(resolution.resolved_value.clone()) {
                        Ok(resolved) if resolved.version > session.state.version => {
                            session.state = resolved;
                        }
                        Ok(_) => {}
                        Err(e) => warn!(session_id = %session_id, "unusable conflict resolution: {e}"),
                    }
                    session.record_conflict(resolution.clone());
                }
                self.emit(SyncEvent::ConflictResolved { resolution });
            }
            SocketMessage::JoinSession {
                session_id,
                user_id,
                ..
            } => {
                debug!(session_id = %session_id, user_id = %user_id, "peer joined session");
            }
        }
    }

    /// Records a live socket. Returns the queued changes to replay, or `None` if the
    /// session is gone.
    fn on_connected(
        &self,
        session_id: &str,
        outbound: mpsc::Sender<SocketMessage>,
    ) -> Option<Vec<StateChange>> {
        let pending = {
            let mut state = self.state.lock();
            let session = state.sessions.get_mut(session_id)?;
            session.outbound = Some(outbound);
            session.reconnect_attempts = 0;
            session.status = SyncStatus::Synced;
            std::mem::take(&mut session.pending)
        };
        info!(session_id, replay = pending.len(), "session sync socket established");
        self.emit(SyncEvent::StatusChanged {
            session_id: session_id.to_string(),
            status: SyncStatus::Synced,
        });
        Some(pending)
    }

    fn requeue(&self, session_id: &str, mut unsent: Vec<StateChange>) {
        let mut state = self.state.lock();
        if let Some(session) = state.sessions.get_mut(session_id) {
            unsent.append(&mut session.pending);
            session.pending = unsent;
        }
    }

    fn on_disconnected(&self, session_id: &str) {
        {
            let mut state = self.state.lock();
            let Some(session) = state.sessions.get_mut(session_id) else {
                return;
            };
            session.outbound = None;
            session.status = SyncStatus::Error;
        }
        warn!(session_id, "session sync socket closed");
        self.emit(SyncEvent::StatusChanged {
            session_id: session_id.to_string(),
            status: SyncStatus::Error,
        });
    }

    /// Counts a failed attempt. Returns the delay before the next one, or `None` once
    /// the budget is spent (session marked `offline`) or the session is gone.
    fn next_backoff(&self, session_id: &str) -> Option<Duration> {
        let (delay, status) = {
            let mut state = self.state.lock();
            let session = state.sessions.get_mut(session_id)?;
            session.reconnect_attempts += 1;
            let attempt = session.reconnect_attempts;

            if attempt > self.config.max_reconnect_attempts {
                session.status = SyncStatus::Offline;
                session.connection = None;
                (None, SyncStatus::Offline)
            } else {
                session.status = SyncStatus::Error;
                let factor = 2u32.saturating_pow(attempt - 1);
                let delay = self
                    .config
                    .reconnect_base_delay
                    .saturating_mul(factor)
                    .min(self.config.reconnect_max_delay);
                (Some(delay), SyncStatus::Error)
            }
        };

        match delay {
            Some(delay) => info!(session_id, delay_ms = delay.as_millis() as u64, "reconnecting after backoff"),
            None => warn!(
                session_id,
                attempts = self.config.max_reconnect_attempts,
                "reconnect attempts exhausted, session offline"
            ),
        }
        self.emit(SyncEvent::StatusChanged {
            session_id: session_id.to_string(),
            status,
        });
        delay
    }

    fn spawn_connection(inner: &Arc<Inner>, session_id: &str) -> JoinHandle<()> {
        let weak = Arc::downgrade(inner);
        let session_id = session_id.to_string();
        tokio::spawn(run_connection(weak, session_id))
    }

    fn spawn_tab_listener(inner: &Arc<Inner>, session_id: &str) -> JoinHandle<()> {
        let mut rx = inner.bus.subscribe();
        let weak = Arc::downgrade(inner);
        let tab_id = inner.tab_id.clone();
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if envelope.tab_id == tab_id || envelope.session_id != session_id {
                            continue;
                        }
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        for change in envelope.changes {
                            inner.apply_remote(&session_id, change);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(session_id = %session_id, skipped, "tab bus lagged, changes dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_presence(inner: &Arc<Inner>, session_id: &str) -> JoinHandle<()> {
        let weak = Arc::downgrade(inner);
        let period = inner.config.presence_interval;
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.announce_presence(&session_id);
            }
        })
    }

    fn announce_presence(&self, session_id: &str) {
        let state = self.state.lock();
        let Some(tx) = state.sessions.get(session_id).and_then(|s| s.outbound.as_ref()) else {
            return;
        };
        let presence = state
            .presence
            .snapshot(&self.config.user_id, &self.config.device);
        let _ = tx.try_send(SocketMessage::UserPresence {
            session_id: session_id.to_string(),
            presence,
        });
    }
}

async fn run_connection(weak: Weak<Inner>, session_id: String) {
    loop {
        let Some(connector) = weak.upgrade().and_then(|inner| inner.connector.clone()) else {
            return;
        };

        match connector.connect(&session_id).await {
            Ok(SocketLink {
                outbound,
                mut inbound,
            }) => {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let Some(pending) = inner.on_connected(&session_id, outbound.clone()) else {
                    return;
                };
                let join = SocketMessage::JoinSession {
                    session_id: session_id.clone(),
                    user_id: inner.config.user_id.clone(),
                    tab_id: inner.tab_id.clone(),
                };

                let mut flushed = outbound.send(join).await.is_ok();
                let mut replayed = 0;
                for change in &pending {
                    let message = SocketMessage::StateChange {
                        session_id: session_id.clone(),
                        change: change.clone(),
                    };
                    if outbound.send(message).await.is_err() {
                        flushed = false;
                        break;
                    }
                    replayed += 1;
                }
                if flushed {
                    if !pending.is_empty() {
                        inner.persist_pending(&session_id, &[]).await;
                        info!(session_id = %session_id, replayed, "pending changes replayed");
                    }
                } else {
                    inner.requeue(&session_id, pending[replayed..].to_vec());
                }
                drop(outbound);
                drop(inner);

                while let Some(message) = inbound.recv().await {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    inner.handle_socket_message(message);
                }

                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.on_disconnected(&session_id);
            }
            Err(e) => warn!(session_id = %session_id, "session sync connect failed: {e}"),
        }

        let Some(delay) = weak.upgrade().and_then(|inner| inner.next_backoff(&session_id)) else {
            return;
        };
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fast_config(user_id: &str) -> SyncConfig {
        SyncConfig {
            user_id: user_id.to_string(),
            device: "test-device".to_string(),
            reconnect_base_delay: Duration::from_millis(5),
            reconnect_max_delay: Duration::from_millis(20),
            ..SyncConfig::default()
        }
    }

    fn tab(
        bus: &LocalBus,
        connector: Option<&MemoryConnector>,
        store: Option<PendingChangeStore>,
    ) -> RealtimeSessionSync {
        RealtimeSessionSync::new(
            fast_config("u-1"),
            bus.clone(),
            connector.map(|c| Arc::new(c.clone()) as Arc<dyn SocketConnector>),
            store,
        )
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..300 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn count_changes(messages: &[SocketMessage]) -> usize {
        messages
            .iter()
            .filter(|m| matches!(m, SocketMessage::StateChange { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_connect_joins_session_over_socket() {
        let connector = MemoryConnector::new();
        let sync = tab(&LocalBus::new(), Some(&connector), None);

        sync.connect(SessionState::new("s-1", "u-1")).await.unwrap();
        wait_for(|| sync.status("s-1") == Some(SyncStatus::Synced)).await;
        wait_for(|| !connector.received().is_empty()).await;

        assert!(matches!(
            &connector.received()[0],
            SocketMessage::JoinSession { session_id, user_id, .. } if session_id == "s-1" && user_id == "u-1"
        ));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_socket_listeners_and_peer_tabs() {
        let connector = MemoryConnector::new();
        let bus = LocalBus::new();
        let tab_a = tab(&bus, Some(&connector), None);
        let tab_b = tab(&bus, None, None);
        let mut events = tab_a.events();

        tab_a.connect(SessionState::new("s-1", "u-1")).await.unwrap();
        tab_b.connect(SessionState::new("s-1", "u-1")).await.unwrap();
        wait_for(|| tab_a.status("s-1") == Some(SyncStatus::Synced)).await;

        tab_a
            .broadcast_state_change("s-1", StateChange::update("", "formData.name", json!("Ada")))
            .await
            .unwrap();

        assert_eq!(tab_a.state("s-1").unwrap().form_data["name"], json!("Ada"));
        wait_for(|| tab_b.state("s-1").is_some_and(|s| s.form_data.get("name") == Some(&json!("Ada")))).await;
        wait_for(|| count_changes(&connector.received()) == 1).await;

        let mut saw_change = false;
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::StateChanged { change, .. } = event {
                assert_eq!(change.path, "formData.name");
                assert_eq!(change.session_id, "s-1");
                saw_change = true;
            }
        }
        assert!(saw_change);
    }

    #[tokio::test]
    async fn test_remote_conflict_merges_to_higher_completion() {
        let connector = MemoryConnector::new();
        let sync = tab(&LocalBus::new(), Some(&connector), None);
        sync.connect(SessionState::new("s-1", "u-1")).await.unwrap();
        wait_for(|| sync.status("s-1") == Some(SyncStatus::Synced)).await;

        let t = Utc::now();
        sync.broadcast_state_change(
            "s-1",
            StateChange::update("s-1", "stepProgress.step1.completion", json!(40.0)).at(t),
        )
        .await
        .unwrap();

        connector.push(SocketMessage::StateChange {
            session_id: "s-1".to_string(),
            change: StateChange::update("s-1", "stepProgress.step1.completion", json!(70.0))
                .at(t - chrono::Duration::seconds(2)),
        });

        wait_for(|| sync.status("s-1") == Some(SyncStatus::Conflicted)).await;
        assert_eq!(sync.state("s-1").unwrap().step_progress["step1"].completion, 70.0);

        let conflicts = sync.conflicts("s-1");
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].resolution_strategy, ResolutionStrategy::Merge);
        assert!(conflicts[0]
            .divergent_paths
            .contains(&"stepProgress.step1.completion".to_string()));
        wait_for(|| {
            connector
                .received()
                .iter()
                .any(|m| matches!(m, SocketMessage::ConflictDetected { .. }))
        })
        .await;
    }

    #[tokio::test]
    async fn test_echo_of_own_change_is_ignored() {
        let connector = MemoryConnector::new();
        let sync = tab(&LocalBus::new(), Some(&connector), None);
        sync.connect(SessionState::new("s-1", "u-1")).await.unwrap();
        wait_for(|| sync.status("s-1") == Some(SyncStatus::Synced)).await;

        let change = StateChange::update("s-1", "currentStep", json!("skills"));
        sync.broadcast_state_change("s-1", change.clone()).await.unwrap();
        let version = sync.state("s-1").unwrap().version;

        connector.push(SocketMessage::StateChange {
            session_id: "s-1".to_string(),
            change,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(sync.state("s-1").unwrap().version, version);
        assert_eq!(sync.status("s-1"), Some(SyncStatus::Synced));
    }

    #[tokio::test]
    async fn test_goes_offline_after_reconnect_budget_then_manual_reconnect() {
        let connector = MemoryConnector::new();
        connector.set_available(false);
        let sync = tab(&LocalBus::new(), Some(&connector), None);

        sync.connect(SessionState::new("s-1", "u-1")).await.unwrap();
        wait_for(|| sync.status("s-1") == Some(SyncStatus::Offline)).await;
        // initial attempt plus five retries
        assert_eq!(connector.attempts(), 6);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connector.attempts(), 6);

        connector.set_available(true);
        sync.reconnect("s-1").unwrap();
        wait_for(|| sync.status("s-1") == Some(SyncStatus::Synced)).await;
        assert_eq!(sync.debug_info().sessions[0].reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_dropped_socket_reconnects_automatically() {
        let connector = MemoryConnector::new();
        let sync = tab(&LocalBus::new(), Some(&connector), None);
        sync.connect(SessionState::new("s-1", "u-1")).await.unwrap();
        wait_for(|| sync.status("s-1") == Some(SyncStatus::Synced)).await;

        connector.drop_connections();
        wait_for(|| connector.attempts() == 2).await;
        wait_for(|| sync.status("s-1") == Some(SyncStatus::Synced)).await;
    }

    #[tokio::test]
    async fn test_offline_changes_are_persisted_and_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let store = PendingChangeStore::new(dir.path());
        let connector = MemoryConnector::new();
        connector.set_available(false);

        let first = tab(&LocalBus::new(), Some(&connector), Some(store.clone()));
        first.connect(SessionState::new("s-1", "u-1")).await.unwrap();
        first
            .broadcast_state_change("s-1", StateChange::update("s-1", "formData.name", json!("Ada")))
            .await
            .unwrap();
        assert_eq!(first.pending_changes("s-1"), 1);
        assert_eq!(store.load("s-1").await.unwrap().len(), 1);
        first.shutdown();

        // a fresh process picks the queue up from disk
        connector.set_available(true);
        let second = tab(&LocalBus::new(), Some(&connector), Some(store.clone()));
        second.connect(SessionState::new("s-1", "u-1")).await.unwrap();
        assert_eq!(second.state("s-1").unwrap().form_data["name"], json!("Ada"));

        wait_for(|| count_changes(&connector.received()) == 1).await;
        wait_for(|| second.pending_changes("s-1") == 0).await;
        for _ in 0..50 {
            if store.load("s-1").await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.load("s-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_optimistic_update_rollback_restores_previous_value() {
        let sync = tab(&LocalBus::new(), None, None);
        let mut initial = SessionState::new("s-1", "u-1");
        initial.current_step = "experience".to_string();
        sync.connect(initial).await.unwrap();

        let update = sync
            .apply_optimistic_update("s-1", StateChange::update("s-1", "currentStep", json!("skills")))
            .await
            .unwrap();
        assert_eq!(sync.state("s-1").unwrap().current_step, "skills");

        sync.rollback_update(update).await.unwrap();
        assert_eq!(sync.state("s-1").unwrap().current_step, "experience");
        assert!(matches!(
            sync.rollback_update(update).await,
            Err(SyncError::UnknownUpdate(id)) if id == update
        ));

        let created = sync
            .apply_optimistic_update("s-1", StateChange::update("s-1", "formData.phone", json!("555")))
            .await
            .unwrap();
        sync.rollback_update(created).await.unwrap();
        assert!(sync.state("s-1").unwrap().form_data.get("phone").is_none());

        let confirmed = sync
            .apply_optimistic_update("s-1", StateChange::update("s-1", "currentStep", json!("review")))
            .await
            .unwrap();
        sync.confirm_update(confirmed).unwrap();
        assert!(sync.rollback_update(confirmed).await.is_err());
        assert_eq!(sync.state("s-1").unwrap().current_step, "review");
    }

    #[tokio::test]
    async fn test_peer_presence_is_tracked() {
        let connector = MemoryConnector::new();
        let sync = tab(&LocalBus::new(), Some(&connector), None);
        sync.connect(SessionState::new("s-1", "u-1")).await.unwrap();
        wait_for(|| sync.status("s-1") == Some(SyncStatus::Synced)).await;

        connector.push(SocketMessage::UserPresence {
            session_id: "s-1".to_string(),
            presence: UserPresence {
                user_id: "u-2".to_string(),
                status: PresenceStatus::Idle,
                last_seen: Utc::now(),
                device: "phone".to_string(),
            },
        });

        wait_for(|| sync.peers("s-1").len() == 1).await;
        assert_eq!(sync.peers("s-1")[0].status, PresenceStatus::Idle);
    }

    #[tokio::test]
    async fn test_unknown_session_and_invalid_change_are_rejected() {
        let sync = tab(&LocalBus::new(), None, None);
        assert!(matches!(
            sync.broadcast_state_change("nope", StateChange::update("nope", "currentStep", json!("x")))
                .await,
            Err(SyncError::UnknownSession(_))
        ));

        sync.connect(SessionState::new("s-1", "u-1")).await.unwrap();
        assert!(matches!(
            sync.broadcast_state_change("s-1", StateChange::update("s-1", "", json!("x"))).await,
            Err(SyncError::InvalidChange(_))
        ));
        assert!(matches!(sync.reconnect("s-1"), Err(SyncError::NotConnected(_))));
    }

    #[tokio::test]
    async fn test_disconnect_and_shutdown() {
        let connector = MemoryConnector::new();
        let sync = tab(&LocalBus::new(), Some(&connector), None);
        sync.connect(SessionState::new("s-1", "u-1")).await.unwrap();
        sync.connect(SessionState::new("s-2", "u-1")).await.unwrap();
        wait_for(|| connector.connected_clients() == 2).await;

        sync.disconnect("s-1").await.unwrap();
        assert_eq!(sync.status("s-1"), None);
        assert!(matches!(sync.disconnect("s-1").await, Err(SyncError::UnknownSession(_))));

        sync.shutdown();
        assert!(sync.debug_info().sessions.is_empty());
        wait_for(|| connector.connected_clients() == 0).await;
    }

    #[tokio::test]
    async fn test_burst_of_changes_reaches_socket_in_order() {
        let connector = MemoryConnector::new();
        let sync = tab(&LocalBus::new(), Some(&connector), None);
        sync.connect(SessionState::new("s-1", "u-1")).await.unwrap();
        wait_for(|| sync.status("s-1") == Some(SyncStatus::Synced)).await;

        for i in 0..200 {
            sync.broadcast_state_change("s-1", StateChange::update("", "currentStep", json!(i)))
                .await
                .unwrap();
        }

        wait_for(|| count_changes(&connector.received()) == 200).await;
        assert_eq!(sync.pending_changes("s-1"), 0);
        assert_eq!(sync.status("s-1"), Some(SyncStatus::Synced));

        let steps: Vec<Value> = connector
            .received()
            .into_iter()
            .filter_map(|m| match m {
                SocketMessage::StateChange { change, .. } => change.new_value,
                _ => None,
            })
            .collect();
        let expected: Vec<Value> = (0..200).map(|i| json!(i)).collect();
        assert_eq!(steps, expected);
    }

    #[tokio::test]
    async fn test_local_only_session_recovers_from_conflict() {
        let bus = LocalBus::new();
        let tab_a = tab(&bus, None, None);
        let tab_b = tab(&bus, None, None);
        tab_a.connect(SessionState::new("s-1", "u-1")).await.unwrap();
        tab_b.connect(SessionState::new("s-1", "u-1")).await.unwrap();

        let t = Utc::now();
        tab_a
            .broadcast_state_change(
                "s-1",
                StateChange::update("s-1", "stepProgress.step1.completion", json!(40.0)).at(t),
            )
            .await
            .unwrap();
        wait_for(|| tab_b.state("s-1").is_some_and(|s| s.step_progress.contains_key("step1"))).await;

        tab_b
            .broadcast_state_change(
                "s-1",
                StateChange::update("s-1", "stepProgress.step1.completion", json!(70.0))
                    .at(t - chrono::Duration::seconds(2)),
            )
            .await
            .unwrap();
        wait_for(|| tab_a.status("s-1") == Some(SyncStatus::Conflicted)).await;

        tab_b
            .broadcast_state_change("s-1", StateChange::update("s-1", "formData.name", json!("Ada")))
            .await
            .unwrap();
        wait_for(|| tab_a.status("s-1") == Some(SyncStatus::Synced)).await;
        assert_eq!(tab_a.state("s-1").unwrap().form_data["name"], json!("Ada"));
        assert_eq!(tab_a.state("s-1").unwrap().step_progress["step1"].completion, 70.0);
    }
}
