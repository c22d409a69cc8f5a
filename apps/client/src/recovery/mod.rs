//! Error Recovery Service: classifies failures and recommends whether and when to retry.
//!
//! Retry policy stays with the caller: this service only analyses an error, keeps the
//! per-feature failure history and answers with a [`RecoveryResult`].

pub mod classify;
pub mod store;
pub mod strategy;

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

pub use classify::{classify, ErrorClass};
pub use store::{ErrorStore, InMemoryErrorStore, RedisErrorStore};
pub use strategy::{BackoffCurve, RetryStrategy};

const MIN_SUCCESS_PROBABILITY: f64 = 0.05;
const MAX_SUCCESS_PROBABILITY: f64 = 0.95;

/// Host facts captured alongside each error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    pub client: String,
    pub os: String,
    pub arch: String,
    pub cpu_count: usize,
    pub memory_rss_bytes: Option<u64>,
}

impl SystemSnapshot {
    pub fn capture() -> Self {
        Self {
            client: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpu_count: std::thread::available_parallelism().map_or(1, |n| n.get()),
            memory_rss_bytes: resident_memory_bytes(),
        }
    }
}

/// Resident set size from procfs; `None` where procfs is unavailable.
fn resident_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    pub error_id: Uuid,
    pub feature_id: String,
    pub job_id: Option<String>,
    pub message: String,
    pub class: ErrorClass,
    /// The attempt a retry would be; the first failure yields 2.
    pub attempt_number: u32,
    /// Failures recorded for the feature before this one.
    pub prior_failures: u32,
    /// Those failures, oldest first.
    #[serde(default)]
    pub previous_attempts: Vec<PreviousAttempt>,
    pub timestamp: DateTime<Utc>,
    pub system: SystemSnapshot,
}

/// Summary of an earlier failure of the same feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviousAttempt {
    pub error_id: Uuid,
    pub class: ErrorClass,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&ErrorContext> for PreviousAttempt {
    fn from(context: &ErrorContext) -> Self {
        Self {
            error_id: context.error_id,
            class: context.class,
            message: context.message.clone(),
            timestamp: context.timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    RetryWithBackoff,
    CheckConnectivity,
    IncreaseTimeout,
    ReduceRequestSize,
    WaitForQuotaReset,
    FixInput,
    SimplifyRequest,
    UseFallback,
    ContactSupport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryResult {
    pub should_retry: bool,
    pub delay_ms: u64,
    pub recovery_actions: Vec<RecoveryAction>,
    pub alternative_approach: Option<String>,
    pub estimated_success_probability: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorStatistics {
    pub total_errors: usize,
    pub by_class: BTreeMap<ErrorClass, usize>,
    pub by_feature: BTreeMap<String, usize>,
    pub most_common_class: Option<ErrorClass>,
    pub features_with_active_failures: usize,
    pub last_error_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub generated_at: DateTime<Utc>,
    pub system: SystemSnapshot,
    pub statistics: ErrorStatistics,
    pub recent_errors: Vec<ErrorContext>,
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Failures kept per feature until a success clears them.
    pub history_per_feature: usize,
    /// Records read back from the store for statistics and reports.
    pub report_limit: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            history_per_feature: 50,
            report_limit: 500,
        }
    }
}

pub struct ErrorRecoveryService {
    config: RecoveryConfig,
    store: Arc<dyn ErrorStore>,
    history: Mutex<HashMap<String, Vec<ErrorContext>>>,
}

impl ErrorRecoveryService {
    pub fn new(store: Arc<dyn ErrorStore>, config: RecoveryConfig) -> Self {
        Self {
            config,
            store,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Classifies `error`, appends it to the feature's history and persists it.
    /// Persistence failures are logged, never returned.
    pub async fn analyze_error(
        &self,
        error: impl Display,
        feature_id: &str,
        job_id: Option<&str>,
    ) -> ErrorContext {
        let message = error.to_string();
        let class = classify(&message);

        let context = {
            let mut history = self.history.lock();
            let failures = history.entry(feature_id.to_string()).or_default();
            let prior_failures = failures.len() as u32;
            let context = ErrorContext {
                error_id: Uuid::new_v4(),
                feature_id: feature_id.to_string(),
                job_id: job_id.map(str::to_string),
                message,
                class,
                attempt_number: prior_failures + 2,
                prior_failures,
                previous_attempts: failures.iter().map(PreviousAttempt::from).collect(),
                timestamp: Utc::now(),
                system: SystemSnapshot::capture(),
            };
            failures.push(context.clone());
            let overflow = failures.len().saturating_sub(self.config.history_per_feature);
            failures.drain(..overflow);
            context
        };

        warn!(
            feature_id,
            class = %context.class,
            attempt = context.attempt_number,
            "error analyzed: {}",
            context.message
        );

        if let Err(e) = self.store.persist(&context).await {
            error!(feature_id, "failed to persist error context: {e:#}");
        }
        context
    }

    pub fn calculate_recovery(&self, context: &ErrorContext) -> RecoveryResult {
        let strategy = RetryStrategy::for_class(context.class);
        let should_retry = strategy.allows(context.attempt_number);

        let mut actions = actions_for(context.class);
        let (delay_ms, probability) = if should_retry {
            (
                strategy.delay_with_jitter(context.attempt_number),
                success_probability(context),
            )
        } else {
            actions.retain(|a| *a != RecoveryAction::RetryWithBackoff);
            actions.push(RecoveryAction::UseFallback);
            if context.class != ErrorClass::Validation {
                actions.push(RecoveryAction::ContactSupport);
            }
            (0, 0.0)
        };

        RecoveryResult {
            should_retry,
            delay_ms,
            recovery_actions: actions,
            alternative_approach: alternative_for(context.class).map(str::to_string),
            estimated_success_probability: probability,
        }
    }

    /// A success ends the failure streak for `feature_id`.
    pub fn record_success(&self, feature_id: &str) {
        if self.history.lock().remove(feature_id).is_some() {
            info!(feature_id, "failure history cleared after success");
        }
    }

    pub fn feature_history(&self, feature_id: &str) -> Vec<ErrorContext> {
        self.history
            .lock()
            .get(feature_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn get_error_statistics(&self) -> ErrorStatistics {
        let records = self.load_records().await;
        self.statistics_for(&records)
    }

    /// Pretty JSON with statistics and the most recent errors.
    pub async fn export_error_report(&self) -> Result<String, serde_json::Error> {
        let records = self.load_records().await;
        let report = ErrorReport {
            generated_at: Utc::now(),
            system: SystemSnapshot::capture(),
            statistics: self.statistics_for(&records),
            recent_errors: records,
        };
        serde_json::to_string_pretty(&report)
    }

    /// Store contents, or the in-memory histories if the store cannot be read.
    async fn load_records(&self) -> Vec<ErrorContext> {
        match self.store.recent(self.config.report_limit).await {
            Ok(records) => records,
            Err(e) => {
                error!("failed to read error store, falling back to local history: {e:#}");
                let mut records: Vec<ErrorContext> =
                    self.history.lock().values().flatten().cloned().collect();
                records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                records.truncate(self.config.report_limit);
                records
            }
        }
    }

    fn statistics_for(&self, records: &[ErrorContext]) -> ErrorStatistics {
        let mut by_class: BTreeMap<ErrorClass, usize> = BTreeMap::new();
        let mut by_feature: BTreeMap<String, usize> = BTreeMap::new();
        for record in records {
            *by_class.entry(record.class).or_default() += 1;
            *by_feature.entry(record.feature_id.clone()).or_default() += 1;
        }
        let most_common_class = by_class
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(class, _)| *class);

        ErrorStatistics {
            total_errors: records.len(),
            most_common_class,
            by_class,
            by_feature,
            features_with_active_failures: self.history.lock().len(),
            last_error_at: records.iter().map(|r| r.timestamp).max(),
        }
    }
}

fn actions_for(class: ErrorClass) -> Vec<RecoveryAction> {
    use RecoveryAction::*;
    match class {
        ErrorClass::Network => vec![CheckConnectivity, RetryWithBackoff],
        ErrorClass::Timeout => vec![IncreaseTimeout, ReduceRequestSize, RetryWithBackoff],
        ErrorClass::Quota => vec![WaitForQuotaReset, RetryWithBackoff],
        ErrorClass::Validation => vec![FixInput],
        ErrorClass::Processing => vec![SimplifyRequest, RetryWithBackoff],
        ErrorClass::Unknown => vec![RetryWithBackoff],
    }
}

fn alternative_for(class: ErrorClass) -> Option<&'static str> {
    match class {
        ErrorClass::Network => Some("Queue the request and resubmit once connectivity returns"),
        ErrorClass::Timeout => Some("Process the CV in smaller sections"),
        ErrorClass::Quota => Some("Defer optional enhancements until the quota resets"),
        ErrorClass::Validation => Some("Correct the input and resubmit"),
        ErrorClass::Processing => Some("Generate the basic CV without optional enhancements"),
        ErrorClass::Unknown => None,
    }
}

/// Per-class baseline decaying with each attempt and with the feature's failure history.
fn success_probability(context: &ErrorContext) -> f64 {
    let baseline = match context.class {
        ErrorClass::Network => 0.8,
        ErrorClass::Timeout => 0.7,
        ErrorClass::Quota => 0.6,
        ErrorClass::Validation => 0.1,
        ErrorClass::Processing => 0.6,
        ErrorClass::Unknown => 0.5,
    };
    let attempt_decay = 0.85f64.powi(context.attempt_number.saturating_sub(2) as i32);
    let history_decay = 0.95f64.powi(context.prior_failures as i32);
    (baseline * attempt_decay * history_decay).clamp(MIN_SUCCESS_PROBABILITY, MAX_SUCCESS_PROBABILITY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;

    struct BrokenStore;

    #[async_trait]
    impl ErrorStore for BrokenStore {
        async fn persist(&self, _context: &ErrorContext) -> anyhow::Result<()> {
            Err(anyhow!("disk full"))
        }

        async fn recent(&self, _limit: usize) -> anyhow::Result<Vec<ErrorContext>> {
            Err(anyhow!("disk full"))
        }
    }

    fn service() -> ErrorRecoveryService {
        ErrorRecoveryService::new(Arc::new(InMemoryErrorStore::new(100)), RecoveryConfig::default())
    }

    #[tokio::test]
    async fn test_network_failures_back_off_then_stop() {
        let service = service();
        let mut delays = Vec::new();
        for _ in 0..3 {
            let context = service.analyze_error("Network request failed", "podcast", Some("job-1")).await;
            let result = service.calculate_recovery(&context);
            assert!(result.should_retry);
            delays.push(result.delay_ms);
        }

        assert!((1_000..=1_100).contains(&delays[0]), "{delays:?}");
        assert!((2_000..=2_200).contains(&delays[1]), "{delays:?}");
        assert!((4_000..=4_400).contains(&delays[2]), "{delays:?}");

        let fourth = service.analyze_error("Network request failed", "podcast", Some("job-1")).await;
        assert_eq!(fourth.attempt_number, 5);
        let result = service.calculate_recovery(&fourth);
        assert!(!result.should_retry);
        assert_eq!(result.delay_ms, 0);
        assert!(result.recovery_actions.contains(&RecoveryAction::UseFallback));
        assert!(!result.recovery_actions.contains(&RecoveryAction::RetryWithBackoff));
    }

    #[tokio::test]
    async fn test_success_probability_decays_with_history() {
        let service = service();
        let first = service.analyze_error("Failed to parse sections", "skills", None).await;
        let second = service.analyze_error("Failed to parse sections", "skills", None).await;

        let p1 = service.calculate_recovery(&first).estimated_success_probability;
        let p2 = service.calculate_recovery(&second).estimated_success_probability;
        assert!(p2 < p1);
        assert!((MIN_SUCCESS_PROBABILITY..=MAX_SUCCESS_PROBABILITY).contains(&p2));
    }

    #[tokio::test]
    async fn test_validation_errors_are_not_retried() {
        let service = service();
        let context = service.analyze_error("Invalid file type", "upload", None).await;
        let result = service.calculate_recovery(&context);

        assert!(!result.should_retry);
        assert_eq!(result.estimated_success_probability, 0.0);
        assert_eq!(
            result.recovery_actions,
            vec![RecoveryAction::FixInput, RecoveryAction::UseFallback]
        );
        assert!(result.alternative_approach.is_some());
    }

    #[tokio::test]
    async fn test_record_success_resets_attempts() {
        let service = service();
        service.analyze_error("timeout", "portfolio", None).await;
        service.analyze_error("timeout", "portfolio", None).await;
        assert_eq!(service.feature_history("portfolio").len(), 2);

        service.record_success("portfolio");
        let context = service.analyze_error("timeout", "portfolio", None).await;
        assert_eq!(context.attempt_number, 2);
        assert_eq!(context.prior_failures, 0);
        assert!(context.previous_attempts.is_empty());
    }

    #[tokio::test]
    async fn test_context_lists_previous_attempts() {
        let service = service();
        let first = service.analyze_error("network unreachable", "portfolio", Some("job-1")).await;
        let second = service.analyze_error("request timed out", "portfolio", Some("job-1")).await;
        let other = service.analyze_error("timeout", "podcast", None).await;

        assert_eq!(second.previous_attempts.len(), 1);
        let previous = &second.previous_attempts[0];
        assert_eq!(previous.error_id, first.error_id);
        assert_eq!(previous.class, first.class);
        assert_eq!(previous.timestamp, first.timestamp);
        assert_ne!(second.class, first.class);
        assert!(other.previous_attempts.is_empty());

        let json = serde_json::to_value(&second).unwrap();
        assert_eq!(json["previousAttempts"][0]["class"], serde_json::json!(first.class));
    }

    #[tokio::test]
    async fn test_persistence_failure_is_swallowed() {
        let service = ErrorRecoveryService::new(Arc::new(BrokenStore), RecoveryConfig::default());
        let context = service.analyze_error("quota exceeded", "podcast", None).await;
        assert_eq!(context.class, ErrorClass::Quota);

        // statistics fall back to the local history
        let stats = service.get_error_statistics().await;
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.by_class.get(&ErrorClass::Quota), Some(&1));
    }

    #[tokio::test]
    async fn test_statistics_and_report() {
        let service = service();
        service.analyze_error("Network down", "podcast", None).await;
        service.analyze_error("Network down", "skills", None).await;
        service.analyze_error("Invalid input", "skills", None).await;

        let stats = service.get_error_statistics().await;
        assert_eq!(stats.total_errors, 3);
        assert_eq!(stats.most_common_class, Some(ErrorClass::Network));
        assert_eq!(stats.by_feature["skills"], 2);
        assert_eq!(stats.features_with_active_failures, 2);

        let report: serde_json::Value =
            serde_json::from_str(&service.export_error_report().await.unwrap()).unwrap();
        assert_eq!(report["statistics"]["totalErrors"], 3);
        assert_eq!(report["recentErrors"].as_array().unwrap().len(), 3);
        assert_eq!(report["statistics"]["byClass"]["network"], 2);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let service = ErrorRecoveryService::new(
            Arc::new(InMemoryErrorStore::new(10)),
            RecoveryConfig {
                history_per_feature: 3,
                ..RecoveryConfig::default()
            },
        );
        for _ in 0..5 {
            service.analyze_error("boom", "f", None).await;
        }
        assert_eq!(service.feature_history("f").len(), 3);
    }
}
