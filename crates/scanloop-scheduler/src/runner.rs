//! Batch runner — the seam to the batch-processing backend.
//!
//! The executor only sees the `BatchRunner` trait; the backend itself is a
//! black box that takes a task's targets and reports counts.

use async_trait::async_trait;
use scanloop_core::config::RunnerConfig;
use scanloop_core::error::{Result, ScanloopError};
use scanloop_core::model::{BatchOutcome, TaskTarget};

#[async_trait]
pub trait BatchRunner: Send + Sync {
    /// Execute the scan/report work for a task's targets.
    async fn execute(&self, targets: &[TaskTarget]) -> Result<BatchOutcome>;
}

/// Deterministic in-process runner for dry runs and tests: each target is
/// one batch and counts as `batch_size` successes.
pub struct LocalRunner;

#[async_trait]
impl BatchRunner for LocalRunner {
    async fn execute(&self, targets: &[TaskTarget]) -> Result<BatchOutcome> {
        let success_count: i64 = targets.iter().map(|t| t.batch_size).sum();
        Ok(BatchOutcome {
            success_count,
            fail_count: 0,
            batches: targets.len() as i64,
            sample_report_id: None,
            details: serde_json::json!({
                "mode": "local",
                "targets": targets.iter().map(|t| t.label.as_str()).collect::<Vec<_>>(),
            }),
        })
    }
}

/// Posts targets to the configured batch backend and parses its outcome.
pub struct HttpRunner {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRunner {
    pub fn new(base_url: &str, config: &RunnerConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl BatchRunner for HttpRunner {
    async fn execute(&self, targets: &[TaskTarget]) -> Result<BatchOutcome> {
        let url = format!("{}/v1/batches/execute", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "targets": targets }))
            .send()
            .await
            .map_err(|e| ScanloopError::Runner(format!("backend request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ScanloopError::Runner(format!("backend error {status}: {body}")));
        }
        resp.json::<BatchOutcome>()
            .await
            .map_err(|e| ScanloopError::Runner(format!("unreadable backend outcome: {e}")))
    }
}
