use std::sync::Arc;

use serde::Serialize;

use crate::jobs::model::{Job, JobStatus};

/// Predicate deciding whether an update is relevant to one callback.
pub type JobFilter = Arc<dyn Fn(&Job) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackType {
    #[default]
    All,
    Progress,
    Preview,
    Features,
}

impl CallbackType {
    pub fn accepts(&self, job: &Job) -> bool {
        match self {
            CallbackType::All => true,
            CallbackType::Progress => is_progress_update(job),
            CallbackType::Preview => is_preview_update(job),
            CallbackType::Features => is_features_update(job),
        }
    }
}

/// Progress views only care once work has started.
pub fn is_progress_update(job: &Job) -> bool {
    job.status != JobStatus::Pending
}

pub fn is_preview_update(job: &Job) -> bool {
    job.preview.is_some() || matches!(job.status, JobStatus::Analyzed | JobStatus::Completed)
}

pub fn is_features_update(job: &Job) -> bool {
    !job.features.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_progress_filter_skips_pending() {
        assert!(!CallbackType::Progress.accepts(&Job::new("j", JobStatus::Pending)));
        assert!(CallbackType::Progress.accepts(&Job::new("j", JobStatus::Processing)));
        assert!(CallbackType::Progress.accepts(&Job::new("j", JobStatus::Failed)));
    }

    #[test]
    fn test_preview_filter() {
        let mut job = Job::new("j", JobStatus::Processing);
        assert!(!CallbackType::Preview.accepts(&job));
        job.preview = Some(json!({ "html": "<div/>" }));
        assert!(CallbackType::Preview.accepts(&job));
        assert!(CallbackType::Preview.accepts(&Job::new("j", JobStatus::Completed)));
    }

    #[test]
    fn test_all_accepts_everything() {
        assert!(CallbackType::All.accepts(&Job::new("j", JobStatus::Pending)));
    }
}
