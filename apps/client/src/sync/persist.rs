use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use super::model::StateChange;
use super::SyncError;

/// Keeps unsent local changes on disk (one JSON file per session) so they survive a
/// restart while offline and can be replayed on the next connection.
#[derive(Debug, Clone)]
pub struct PendingChangeStore {
    dir: PathBuf,
}

impl PendingChangeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.pending.json", encode_file_stem(session_id)))
    }

    pub async fn save(&self, session_id: &str, changes: &[StateChange]) -> Result<(), SyncError> {
        if changes.is_empty() {
            return self.clear(session_id).await;
        }
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SyncError::Persistence(e.to_string()))?;

        let payload = serde_json::to_vec_pretty(changes)?;
        let path = self.path_for(session_id);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, payload)
            .await
            .map_err(|e| SyncError::Persistence(e.to_string()))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| SyncError::Persistence(e.to_string()))?;

        debug!(session_id, count = changes.len(), "pending changes persisted");
        Ok(())
    }

    /// Missing files read as no pending changes.
    pub async fn load(&self, session_id: &str) -> Result<Vec<StateChange>, SyncError> {
        match fs::read(self.path_for(session_id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(SyncError::Persistence(e.to_string())),
        }
    }

    pub async fn clear(&self, session_id: &str) -> Result<(), SyncError> {
        match fs::remove_file(self.path_for(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::Persistence(e.to_string())),
        }
    }
}

/// Percent-encodes every byte outside `[A-Za-z0-9_-]`. `%` is always encoded, so two
/// distinct session ids never share a file.
fn encode_file_stem(session_id: &str) -> String {
    let mut stem = String::with_capacity(session_id.len());
    for byte in session_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    stem
}
