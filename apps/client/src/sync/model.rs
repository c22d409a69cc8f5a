use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::SyncError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepProgress {
    pub completion: f64,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeatureState {
    pub enabled: bool,
    pub status: String,
    pub progress: Option<f64>,
    pub last_processed_at: Option<DateTime<Utc>>,
}

/// Collaborative state of one CV-building session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: String,
    pub user_id: String,
    #[serde(default)]
    pub current_step: String,
    #[serde(default)]
    pub step_progress: BTreeMap<String, StepProgress>,
    #[serde(default)]
    pub feature_states: BTreeMap<String, FeatureState>,
    #[serde(default)]
    pub form_data: Map<String, Value>,
    pub last_active_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            current_step: String::new(),
            step_progress: BTreeMap::new(),
            feature_states: BTreeMap::new(),
            form_data: Map::new(),
            last_active_at: Utc::now(),
            version: 0,
        }
    }

    /// Reads the value at a dot-separated path (`stepProgress.step1.completion`).
    pub fn read_path(&self, path: &str) -> Option<Value> {
        let root = serde_json::to_value(self).ok()?;
        let mut current = &root;
        for segment in path.split('.') {
            current = current.as_object()?.get(segment)?;
        }
        Some(current.clone())
    }

    /// Applies `change` in place. The state is left untouched if the result would not
    /// form a valid session state.
    pub fn apply(&mut self, change: &StateChange) -> Result<(), SyncError> {
        let segments = split_path(&change.path)?;
        let mut root = serde_json::to_value(&*self)?;

        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| SyncError::InvalidChange(change.path.clone()))?;
        let mut cursor = &mut root;
        for segment in parents {
            let object = cursor
                .as_object_mut()
                .ok_or_else(|| SyncError::InvalidChange(change.path.clone()))?;
            cursor = object
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        let object = cursor
            .as_object_mut()
            .ok_or_else(|| SyncError::InvalidChange(change.path.clone()))?;

        match change.change_type {
            ChangeType::Delete => {
                object.remove(*last);
            }
            ChangeType::Create | ChangeType::Update => {
                object.insert(last.to_string(), change.new_value.clone().unwrap_or(Value::Null));
            }
        }

        let mut next: SessionState = serde_json::from_value(root)
            .map_err(|e| SyncError::InvalidChange(format!("{}: {e}", change.path)))?;
        if change.timestamp > next.last_active_at {
            next.last_active_at = change.timestamp;
        }
        next.version = self.version + 1;
        *self = next;
        Ok(())
    }
}

fn split_path(path: &str) -> Result<Vec<&str>, SyncError> {
    let segments: Vec<&str> = path.split('.').collect();
    if path.is_empty() || segments.iter().any(|s| s.is_empty()) {
        return Err(SyncError::InvalidChange(path.to_string()));
    }
    Ok(segments)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    Local,
    Remote,
}

/// One path-level mutation of a session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub id: Uuid,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub path: String,
    #[serde(default)]
    pub old_value: Option<Value>,
    #[serde(default)]
    pub new_value: Option<Value>,
    pub source: ChangeSource,
}

impl StateChange {
    pub fn update(session_id: impl Into<String>, path: impl Into<String>, new_value: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            timestamp: Utc::now(),
            change_type: ChangeType::Update,
            path: path.into(),
            old_value: None,
            new_value: Some(new_value),
            source: ChangeSource::Local,
        }
    }

    pub fn delete(session_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            change_type: ChangeType::Delete,
            new_value: None,
            ..Self::update(session_id, path, Value::Null)
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn from_remote(mut self) -> Self {
        self.source = ChangeSource::Remote;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    LocalWins,
    RemoteWins,
    #[default]
    Merge,
    /// No interactive chooser exists here; resolves like `Merge`.
    UserChoice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub conflict_id: Uuid,
    pub session_id: String,
    pub conflicting_changes: Vec<StateChange>,
    pub divergent_paths: Vec<String>,
    pub resolution_strategy: ResolutionStrategy,
    pub resolved_value: Value,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Disconnected,
    Syncing,
    Synced,
    Conflicted,
    Error,
    Offline,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SyncStatus::Disconnected => "disconnected",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflicted => "conflicted",
            SyncStatus::Error => "error",
            SyncStatus::Offline => "offline",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Active,
    Idle,
    Away,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    pub user_id: String,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
    pub device: String,
}

/// Messages exchanged with the session-sync socket endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SocketMessage {
    JoinSession {
        session_id: String,
        user_id: String,
        tab_id: String,
    },
    StateChange {
        session_id: String,
        change: StateChange,
    },
    UserPresence {
        session_id: String,
        presence: UserPresence,
    },
    ConflictDetected {
        session_id: String,
        resolution: ConflictResolution,
    },
}

impl SocketMessage {
    pub fn session_id(&self) -> &str {
        match self {
            SocketMessage::JoinSession { session_id, .. }
            | SocketMessage::StateChange { session_id, .. }
            | SocketMessage::UserPresence { session_id, .. }
            | SocketMessage::ConflictDetected { session_id, .. } => session_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabMessageType {
    StateChange,
}

/// Envelope carried between tabs (local peers) sharing a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabEnvelope {
    #[serde(rename = "type")]
    pub message_type: TabMessageType,
    pub session_id: String,
    pub changes: Vec<StateChange>,
    pub tab_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Notifications emitted to local listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    StatusChanged {
        session_id: String,
        status: SyncStatus,
    },
    StateChanged {
        session_id: String,
        change: StateChange,
    },
    ConflictResolved {
        resolution: ConflictResolution,
    },
    PresenceChanged {
        session_id: String,
        presence: UserPresence,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_creates_missing_intermediate_objects() {
        let mut state = SessionState::new("s-1", "u-1");
        state
            .apply(&StateChange::update("s-1", "stepProgress.step1.completion", json!(40.0)))
            .unwrap();

        assert_eq!(state.step_progress["step1"].completion, 40.0);
        assert_eq!(state.version, 1);
        assert_eq!(state.read_path("stepProgress.step1.completion"), Some(json!(40.0)));
    }

    #[test]
    fn test_apply_rejects_shape_breaking_change() {
        let mut state = SessionState::new("s-1", "u-1");
        let before = state.clone();
        let err = state
            .apply(&StateChange::update("s-1", "stepProgress.step1", json!("not an object")))
            .unwrap_err();

        assert!(matches!(err, SyncError::InvalidChange(_)));
        assert_eq!(state, before);
    }

    #[test]
    fn test_apply_rejects_empty_segments() {
        let mut state = SessionState::new("s-1", "u-1");
        assert!(state.apply(&StateChange::update("s-1", "formData..name", json!("x"))).is_err());
        assert!(state.apply(&StateChange::update("s-1", "", json!("x"))).is_err());
    }

    #[test]
    fn test_delete_removes_form_field() {
        let mut state = SessionState::new("s-1", "u-1");
        state.apply(&StateChange::update("s-1", "formData.name", json!("Ada"))).unwrap();
        state.apply(&StateChange::delete("s-1", "formData.name")).unwrap();
        assert!(state.form_data.get("name").is_none());
    }

    #[test]
    fn test_socket_message_wire_shape() {
        let msg = SocketMessage::JoinSession {
            session_id: "s-1".to_string(),
            user_id: "u-1".to_string(),
            tab_id: "tab-a".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({ "type": "join_session", "sessionId": "s-1", "userId": "u-1", "tabId": "tab-a" })
        );
    }

    #[test]
    fn test_tab_envelope_wire_shape() {
        let envelope = TabEnvelope {
            message_type: TabMessageType::StateChange,
            session_id: "s-1".to_string(),
            changes: vec![],
            tab_id: "tab-a".to_string(),
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], json!("state_change"));
        assert_eq!(value["tabId"], json!("tab-a"));
        assert!(value.get("changes").is_some());
    }
}
