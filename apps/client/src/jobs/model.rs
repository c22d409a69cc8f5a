use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle of one CV processing pipeline as reported by the job document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Analyzed,
    Generating,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    /// States in which the backend is actively working and every update matters.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Processing | JobStatus::Generating)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Analyzed => "analyzed",
            JobStatus::Generating => "generating",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of one optional enhancement (skills chart, podcast, portfolio...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureProgress {
    pub status: String,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// The job document as observed through the realtime source.
/// Only a handful of fields are interpreted; the rest is carried in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub features: BTreeMap<String, FeatureProgress>,
    #[serde(default)]
    pub preview: Option<Value>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Job {
    pub fn new(id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            id: id.into(),
            status,
            progress: None,
            features: BTreeMap::new(),
            preview: None,
            updated_at: None,
            error: None,
            extra: Map::new(),
        }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Lightweight fingerprint used to drop updates that carry nothing new.
    /// Nested feature fields are not part of it.
    pub fn change_hash(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.status,
            self.progress
                .map(|p| format!("{p:.2}"))
                .unwrap_or_else(|| "-".to_string()),
            self.features.len(),
            self.updated_at
                .map(|t| t.timestamp_millis().to_string())
                .unwrap_or_else(|| "-".to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_deserializes_camel_case_document() {
        let job: Job = serde_json::from_value(json!({
            "id": "job-1",
            "status": "generating",
            "progress": 55.0,
            "features": {
                "skills-visualization": { "status": "processing", "progress": 40.0, "currentStep": "charting" }
            },
            "updatedAt": "2026-01-05T10:00:00Z",
            "userId": "u-9"
        }))
        .unwrap();

        assert_eq!(job.status, JobStatus::Generating);
        assert_eq!(job.features["skills-visualization"].current_step.as_deref(), Some("charting"));
        assert_eq!(job.extra["userId"], json!("u-9"));
    }

    #[test]
    fn test_unrecognised_status_maps_to_unknown() {
        let job: Job = serde_json::from_value(json!({ "id": "j", "status": "archived" })).unwrap();
        assert_eq!(job.status, JobStatus::Unknown);
    }

    #[test]
    fn test_change_hash_ignores_nested_feature_fields() {
        let mut a = Job::new("j", JobStatus::Analyzed).with_progress(50.0);
        a.features.insert(
            "podcast".to_string(),
            FeatureProgress {
                status: "pending".to_string(),
                progress: Some(0.0),
                current_step: None,
                error: None,
            },
        );
        let mut b = a.clone();
        b.features.get_mut("podcast").unwrap().progress = Some(80.0);
        assert_eq!(a.change_hash(), b.change_hash());

        let c = a.clone().with_progress(60.0);
        assert_ne!(a.change_hash(), c.change_hash());
    }

    #[test]
    fn test_active_states() {
        assert!(JobStatus::Processing.is_active());
        assert!(JobStatus::Generating.is_active());
        assert!(!JobStatus::Analyzed.is_active());
        assert!(JobStatus::Failed.is_terminal());
    }
}
