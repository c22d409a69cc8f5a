//! Conflict detection and resolution between diverging session states.

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use super::model::{
    ChangeSource, ChangeType, ConflictResolution, ResolutionStrategy, SessionState, StateChange,
};

/// Two changes conflict when they write different values to the same path at
/// different times and at least one of them came from elsewhere.
pub fn detect_conflict(a: &StateChange, b: &StateChange) -> bool {
    a.path == b.path
        && a.new_value != b.new_value
        && a.timestamp != b.timestamp
        && (a.source == ChangeSource::Remote || b.source == ChangeSource::Remote)
}

/// Leaf paths at which the two states differ. `version` is bookkeeping, not content.
pub fn divergent_paths(local: &SessionState, remote: &SessionState) -> Vec<String> {
    let (Ok(local), Ok(remote)) = (serde_json::to_value(local), serde_json::to_value(remote))
    else {
        return Vec::new();
    };
    let mut paths = Vec::new();
    collect_divergent("", &local, &remote, &mut paths);
    paths.retain(|p| p != "version");
    paths
}

fn collect_divergent(prefix: &str, local: &Value, remote: &Value, out: &mut Vec<String>) {
    match (local, remote) {
        (Value::Object(l), Value::Object(r)) => {
            let mut keys: Vec<&String> = l.keys().chain(r.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                let null = Value::Null;
                collect_divergent(
                    &path,
                    l.get(key).unwrap_or(&null),
                    r.get(key).unwrap_or(&null),
                    out,
                );
            }
        }
        (l, r) if l != r => out.push(prefix.to_string()),
        _ => {}
    }
}

/// Resolves the divergence between `local` and `remote` using `strategy`.
///
/// Returns the resolved state alongside the record describing the resolution. The
/// resolved state's version is one past the higher of the two inputs.
pub fn resolve_conflicts(
    local: &SessionState,
    remote: &SessionState,
    strategy: ResolutionStrategy,
) -> (SessionState, ConflictResolution) {
    let paths = divergent_paths(local, remote);

    let mut resolved = match strategy {
        ResolutionStrategy::LocalWins => local.clone(),
        ResolutionStrategy::RemoteWins => remote.clone(),
        ResolutionStrategy::Merge | ResolutionStrategy::UserChoice => merge_states(local, remote),
    };
    resolved.version = local.version.max(remote.version) + 1;

    let conflicting_changes = paths
        .iter()
        .flat_map(|path| {
            [
                synthesized_change(local, path, ChangeSource::Local),
                synthesized_change(remote, path, ChangeSource::Remote),
            ]
        })
        .collect();

    let resolution = ConflictResolution {
        conflict_id: Uuid::new_v4(),
        session_id: local.session_id.clone(),
        conflicting_changes,
        divergent_paths: paths,
        resolution_strategy: strategy,
        resolved_value: serde_json::to_value(&resolved).unwrap_or(Value::Null),
        resolved_at: Utc::now(),
    };
    (resolved, resolution)
}

fn synthesized_change(state: &SessionState, path: &str, source: ChangeSource) -> StateChange {
    StateChange {
        id: Uuid::new_v4(),
        session_id: state.session_id.clone(),
        timestamp: state.last_active_at,
        change_type: ChangeType::Update,
        path: path.to_string(),
        old_value: None,
        new_value: state.read_path(path),
        source,
    }
}

/// Field-level reconciliation.
///
/// - step progress: the higher completion wins (local on ties)
/// - feature states: the more recently processed one wins (local on ties)
/// - `last_active_at`: the later of the two
/// - everything else comes from whichever side was active more recently
pub fn merge_states(local: &SessionState, remote: &SessionState) -> SessionState {
    let remote_is_newer = remote.last_active_at > local.last_active_at;
    let mut merged = if remote_is_newer {
        remote.clone()
    } else {
        local.clone()
    };

    merged.step_progress = local.step_progress.clone();
    for (step, theirs) in &remote.step_progress {
        let take_remote = merged
            .step_progress
            .get(step)
            .map_or(true, |ours| theirs.completion > ours.completion);
        if take_remote {
            merged.step_progress.insert(step.clone(), theirs.clone());
        }
    }

    merged.feature_states = local.feature_states.clone();
    for (feature, theirs) in &remote.feature_states {
        let take_remote = merged
            .feature_states
            .get(feature)
            .map_or(true, |ours| theirs.last_processed_at > ours.last_processed_at);
        if take_remote {
            merged.feature_states.insert(feature.clone(), theirs.clone());
        }
    }

    merged.last_active_at = local.last_active_at.max(remote.last_active_at);
    merged
}
