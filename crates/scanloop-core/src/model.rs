//! Domain model — automation tasks, runs, queue payloads, and webhook
//! records, plus the task/run state machines.
//!
//! All wire-facing structs serialize camelCase to match the queue payload
//! and event envelope formats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generate a new entity ID.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ─── Task ─────────────────────────────────────────────────────────────────

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Inactive,
    Scheduled,
    Queued,
    Running,
    Paused,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Inactive => "inactive",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inactive" => Some(TaskStatus::Inactive),
            "scheduled" => Some(TaskStatus::Scheduled),
            "queued" => Some(TaskStatus::Queued),
            "running" => Some(TaskStatus::Running),
            "paused" => Some(TaskStatus::Paused),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// Allowed task transitions.
    pub fn can_transition(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Inactive, Scheduled)
                | (Inactive, Queued)
                | (Scheduled, Queued)
                | (Scheduled, Paused)
                | (Scheduled, Inactive)
                | (Queued, Running)
                | (Queued, Failed)
                | (Running, Scheduled)
                | (Running, Failed)
                | (Running, Inactive)
                | (Paused, Scheduled)
                | (Paused, Inactive)
                | (Failed, Scheduled)
                | (Failed, Inactive)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recurrence policy of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Manual,
    Interval,
    Hourly,
    Daily,
    Cron,
}

impl Cadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Manual => "manual",
            Cadence::Interval => "interval",
            Cadence::Hourly => "hourly",
            Cadence::Daily => "daily",
            Cadence::Cron => "cron",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Cadence::Manual),
            "interval" => Some(Cadence::Interval),
            "hourly" => Some(Cadence::Hourly),
            "daily" => Some(Cadence::Daily),
            "cron" => Some(Cadence::Cron),
            _ => None,
        }
    }
}

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cadence-specific schedule configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_minutes: Option<i64>,
    /// "HH:MM" wall-clock time for daily cadence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// IANA timezone name, overrides the task timezone for daily cadence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

/// One scan/report target of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTarget {
    #[serde(rename = "type")]
    pub kind: String,
    pub label: String,
    pub batch_size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// A recurring automation job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationTask {
    pub id: String,
    pub name: String,
    pub project_id: Option<String>,
    pub status: TaskStatus,
    pub cadence: Cadence,
    pub timezone: String,
    pub schedule: ScheduleConfig,
    pub targets: Vec<TaskTarget>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Non-null only while status == scheduled.
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub retry_limit: u32,
    /// Consecutive failed attempts, reset on success.
    pub retry_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
    pub last_result: Option<serde_json::Value>,
}

impl AutomationTask {
    /// The task-level direct webhook target, if configured.
    pub fn direct_webhook(&self) -> Option<DirectWebhook> {
        self.webhook_url.as_ref().map(|url| DirectWebhook {
            url: url.clone(),
            secret: self.webhook_secret.clone(),
        })
    }
}

// ─── Run ──────────────────────────────────────────────────────────────────

/// Run lifecycle status: queued → running → {completed, failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn can_transition(self, to: RunStatus) -> bool {
        use RunStatus::*;
        matches!((self, to), (Queued, Running) | (Running, Completed) | (Running, Failed) | (Queued, Failed))
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution attempt of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRun {
    pub id: String,
    pub task_id: String,
    pub status: RunStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub batches_processed: i64,
    pub success_count: i64,
    pub fail_count: i64,
    pub webhook_status: Option<String>,
    pub response_code: Option<i64>,
    pub error: Option<String>,
    pub sample_report_id: Option<String>,
    pub metadata: serde_json::Value,
}

impl TaskRun {
    /// A fresh queued run for the given task.
    pub fn queued(task_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            task_id: task_id.to_string(),
            status: RunStatus::Queued,
            queued_at: now,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            batches_processed: 0,
            success_count: 0,
            fail_count: 0,
            webhook_status: None,
            response_code: None,
            error: None,
            sample_report_id: None,
            metadata: serde_json::Value::Null,
        }
    }
}

// ─── Queue ────────────────────────────────────────────────────────────────

/// A per-task direct webhook target, carried through the queue payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectWebhook {
    pub url: String,
    pub secret: Option<String>,
}

/// Queue entry payload — a transient pointer to a pending run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuePayload {
    pub run_id: String,
    pub task_id: String,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub project_id: Option<String>,
    pub direct_webhook: Option<DirectWebhook>,
}

// ─── Webhooks ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "paused" => Some(SubscriptionStatus::Paused),
            _ => None,
        }
    }
}

/// A standing registration for signed event notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSubscription {
    pub id: String,
    /// None = global (matches every project).
    pub project_id: Option<String>,
    pub name: String,
    pub url: String,
    pub secret: String,
    pub events: Vec<String>,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_delivery_at: Option<DateTime<Utc>>,
}

impl WebhookSubscription {
    pub fn matches(&self, project_id: Option<&str>, event: &str) -> bool {
        if self.status != SubscriptionStatus::Active {
            return false;
        }
        let scope_ok = match (&self.project_id, project_id) {
            (None, _) => true,
            (Some(own), Some(task)) => own == task,
            (Some(_), None) => false,
        };
        scope_ok && self.events.iter().any(|e| e == event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "delivered" => Some(DeliveryStatus::Delivered),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

/// Append-only audit record of one webhook send attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDelivery {
    pub id: String,
    /// None for direct-webhook and ad-hoc test deliveries.
    pub subscription_id: Option<String>,
    pub event: String,
    pub status: DeliveryStatus,
    pub response_code: Option<i64>,
    pub error: Option<String>,
    pub payload: String,
    pub delivered_at: DateTime<Utc>,
    pub duration_ms: i64,
}

// ─── Batch runner ─────────────────────────────────────────────────────────

/// Outcome of one batch-executor invocation over a task's targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub success_count: i64,
    pub fail_count: i64,
    pub batches: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_report_id: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}
