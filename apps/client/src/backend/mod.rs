//! Backend client: the single point of entry for callable backend functions.
//!
//! Every CV analysis/generation call is a named function that takes and returns a
//! `{ "data": ... }` JSON envelope. This module treats the backend as an opaque
//! async function that may fail or hang; deduplication and retry live elsewhere.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::jobs::model::Job;

pub const ANALYZE_CV: &str = "analyzeCV";
pub const GENERATE_CV: &str = "generateCV";
pub const GET_RECOMMENDATIONS: &str = "getRecommendations";
pub const GET_JOB_STATUS: &str = "getJobStatus";
pub const GET_SYSTEM_HEALTH: &str = "getSystemHealth";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("call to '{function}' timed out after {timeout_ms}ms")]
    Timeout { function: String, timeout_ms: u64 },

    #[error("response envelope has no data")]
    MissingData,
}

#[derive(Debug, Serialize)]
struct CallEnvelope<'a> {
    data: &'a Value,
}

#[derive(Debug, Deserialize)]
struct BackendErrorBody {
    error: BackendErrorDetail,
}

#[derive(Debug, Deserialize)]
struct BackendErrorDetail {
    message: String,
}

/// HTTP client for the callable-function backend.
#[derive(Clone)]
pub struct BackendClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Invokes a named backend function. The call is raced against the client's
    /// fixed timeout so a hung connection surfaces as `BackendError::Timeout`.
    pub async fn call(&self, function: &str, data: Value) -> Result<Value, BackendError> {
        let url = format!("{}/{}", self.base_url, function);
        let request = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&CallEnvelope { data: &data })
            .send();

        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| BackendError::Timeout {
                function: function.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            })??;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<BackendErrorBody>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            warn!(function, status = status.as_u16(), "backend call failed: {message}");
            return Err(BackendError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = response.json().await?;
        debug!(function, "backend call succeeded");
        unwrap_envelope(body)
    }

    pub async fn analyze_cv(&self, job_id: &str) -> Result<Value, BackendError> {
        self.call(ANALYZE_CV, json!({ "jobId": job_id })).await
    }

    pub async fn generate_cv(
        &self,
        job_id: &str,
        template_id: &str,
        features: &[String],
    ) -> Result<Value, BackendError> {
        self.call(
            GENERATE_CV,
            json!({ "jobId": job_id, "templateId": template_id, "features": features }),
        )
        .await
    }

    pub async fn get_recommendations(
        &self,
        job_id: &str,
        target_role: Option<&str>,
        industry_keywords: &[String],
    ) -> Result<Value, BackendError> {
        self.call(
            GET_RECOMMENDATIONS,
            json!({
                "jobId": job_id,
                "targetRole": target_role,
                "industryKeywords": industry_keywords,
            }),
        )
        .await
    }

    /// Fetches the job document. `Ok(None)` when the backend reports no such job.
    pub async fn get_job_status(&self, job_id: &str) -> Result<Option<Job>, BackendError> {
        let data = match self.call(GET_JOB_STATUS, json!({ "jobId": job_id })).await {
            Ok(data) => data,
            Err(BackendError::Api { status: 404, .. }) => return Ok(None),
            Err(err) => return Err(err),
        };
        if data.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(data)?))
    }

    pub async fn get_system_health(&self) -> Result<Value, BackendError> {
        self.call(GET_SYSTEM_HEALTH, json!({})).await
    }
}

/// Extracts the payload from a `{ "data": ... }` envelope.
/// Some deployments answer with `{ "result": ... }`; both are accepted.
fn unwrap_envelope(body: Value) -> Result<Value, BackendError> {
    match body {
        Value::Object(mut map) => map
            .remove("data")
            .or_else(|| map.remove("result"))
            .ok_or(BackendError::MissingData),
        _ => Err(BackendError::MissingData),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwrap_envelope_with_data_key() {
        let body = json!({ "data": { "recommendations": [1, 2] } });
        assert_eq!(
            unwrap_envelope(body).unwrap(),
            json!({ "recommendations": [1, 2] })
        );
    }

    #[test]
    fn test_unwrap_envelope_with_result_key() {
        let body = json!({ "result": "ok" });
        assert_eq!(unwrap_envelope(body).unwrap(), json!("ok"));
    }

    #[test]
    fn test_unwrap_envelope_without_payload() {
        assert!(matches!(
            unwrap_envelope(json!({ "status": "ok" })),
            Err(BackendError::MissingData)
        ));
        assert!(matches!(
            unwrap_envelope(json!([1, 2, 3])),
            Err(BackendError::MissingData)
        ));
    }

    #[test]
    fn test_new_trims_trailing_slash() {
        let client = BackendClient::new("http://localhost:5001/fns/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url(), "http://localhost:5001/fns");
    }
}
