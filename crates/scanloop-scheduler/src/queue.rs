//! Queue protocol over the store's sorted KV namespace.
//!
//! Keys are `automation:queue:<timestamp>:<run_id>` with the enqueue
//! timestamp zero-padded to 20 decimal digits, so lexicographic order is
//! chronological order for any epoch value. Entries expire after 24 hours if
//! never claimed.
//!
//! Claim keeps the list → read → delete shape, but the delete reports its
//! affected-row count: a claimer that loses the delete race simply moves on
//! to the next entry instead of double-processing the run.

use chrono::{DateTime, Duration, Utc};
use scanloop_core::error::{Result, ScanloopError};
use scanloop_core::model::{AutomationTask, QueuePayload, TaskRun, TaskStatus};
use scanloop_store::{StoreDb, TaskPatch};

use crate::cadence;

pub const QUEUE_PREFIX: &str = "automation:queue:";

const QUEUE_TTL_HOURS: i64 = 24;

/// Why a task was enqueued — recorded as the task's `last_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueReason {
    Scheduled,
    Manual,
}

impl EnqueueReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnqueueReason::Scheduled => "scheduled",
            EnqueueReason::Manual => "manual",
        }
    }
}

/// Build a time-ordered queue key for a run.
pub fn build_queue_key(run_id: &str, enqueued_at_ms: i64) -> String {
    format!("{QUEUE_PREFIX}{enqueued_at_ms:020}:{run_id}")
}

/// Turn a task into a queued run: one new Run row, one new queue entry, and
/// the task moved to `queued`.
///
/// For `Scheduled` enqueues the `scheduled → queued` transition is the guard
/// against concurrent dispatchers; `Ok(None)` means another dispatcher won
/// and nothing was written. Manual triggers update the task directly.
pub fn enqueue_task(
    store: &StoreDb,
    task_id: &str,
    reason: EnqueueReason,
    now: DateTime<Utc>,
) -> Result<Option<(AutomationTask, TaskRun)>> {
    let mut task = store
        .get_task(task_id)?
        .ok_or_else(|| ScanloopError::TaskNotFound(task_id.to_string()))?;

    let schedule = cadence::effective_schedule(&task);
    let next = cadence::next_run_at(task.cadence, &schedule, now);

    match reason {
        EnqueueReason::Scheduled => {
            if !store.mark_queued_if_scheduled(&task.id, reason.as_str(), next, now)? {
                return Ok(None);
            }
        }
        EnqueueReason::Manual => {
            if !task.status.can_transition(TaskStatus::Queued) {
                return Err(ScanloopError::InvalidTransition(format!(
                    "task {} is {} and cannot be queued",
                    task.id, task.status
                )));
            }
            let patch = TaskPatch {
                status: Some(TaskStatus::Queued),
                last_status: Some(reason.as_str().to_string()),
                next_run_at: Some(next),
                ..Default::default()
            };
            store.update_task(&task.id, &patch, now)?;
        }
    }
    task.status = TaskStatus::Queued;
    task.last_status = Some(reason.as_str().to_string());
    task.next_run_at = next;

    let run = TaskRun::queued(&task.id, now);
    store.create_run(&run)?;

    let payload = QueuePayload {
        run_id: run.id.clone(),
        task_id: task.id.clone(),
        enqueued_at: now,
        attempts: task.retry_attempts,
        project_id: task.project_id.clone(),
        direct_webhook: task.direct_webhook(),
    };
    let now_ms = now.timestamp_millis();
    store.kv_put(
        &build_queue_key(&run.id, now_ms),
        &serde_json::to_string(&payload)?,
        now_ms,
        now_ms + Duration::hours(QUEUE_TTL_HOURS).num_milliseconds(),
    )?;

    tracing::debug!("queued run {} for task '{}' ({})", run.id, task.name, reason.as_str());
    Ok(Some((task, run)))
}

/// Claim the oldest ready queue entry, or None when the queue is empty.
/// Unreadable values are dropped defensively and the claim continues.
pub fn claim_next(store: &StoreDb, now: DateTime<Utc>) -> Result<Option<QueuePayload>> {
    let now_ms = now.timestamp_millis();
    store.kv_sweep_expired(now_ms)?;

    loop {
        let Some((key, value)) = store.kv_first_ready(QUEUE_PREFIX, now_ms)? else {
            return Ok(None);
        };
        let payload: QueuePayload = match serde_json::from_str(&value) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("dropping unreadable queue entry {key}: {e}");
                store.kv_delete(&key)?;
                continue;
            }
        };
        if store.kv_delete(&key)? {
            return Ok(Some(payload));
        }
        // Another claimer consumed this key first; take the next one.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use scanloop_core::model::{Cadence, RunStatus, ScheduleConfig};
    use scanloop_store::NewTask;

    fn store_with_task(status: TaskStatus) -> (StoreDb, AutomationTask) {
        let db = StoreDb::open_in_memory().unwrap();
        let now = Utc::now();
        let task = db
            .create_task(
                NewTask {
                    name: "scan".into(),
                    project_id: Some("p1".into()),
                    cadence: Cadence::Interval,
                    timezone: "UTC".into(),
                    schedule: ScheduleConfig { interval_minutes: Some(30), ..Default::default() },
                    targets: vec![],
                    webhook_url: None,
                    webhook_secret: None,
                    retry_limit: 0,
                    metadata: serde_json::Value::Null,
                    status,
                    next_run_at: Some(now),
                },
                now,
            )
            .unwrap();
        (db, task)
    }

    #[test]
    fn test_key_ordering_is_chronological() {
        let t1 = 1_700_000_000_000i64;
        let t2 = 1_700_000_000_001i64;
        assert!(build_queue_key("r", t1) < build_queue_key("r", t2));

        // Holds across digit-width boundaries thanks to zero-padding
        let small = 999i64;
        let large = 1_000i64;
        assert!(build_queue_key("r", small) < build_queue_key("r", large));
    }

    #[test]
    fn test_enqueue_writes_run_entry_and_task() {
        let (db, task) = store_with_task(TaskStatus::Scheduled);
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();

        let (task, run) = enqueue_task(&db, &task.id, EnqueueReason::Scheduled, now)
            .unwrap()
            .unwrap();

        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(db.list_runs_for_task(&task.id, 10).unwrap().len(), 1);
        assert_eq!(db.kv_count(QUEUE_PREFIX).unwrap(), 1);

        let stored = db.get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
        assert_eq!(stored.last_status.as_deref(), Some("scheduled"));
    }

    #[test]
    fn test_enqueue_unknown_task() {
        let db = StoreDb::open_in_memory().unwrap();
        let err = enqueue_task(&db, "missing", EnqueueReason::Manual, Utc::now()).unwrap_err();
        assert!(matches!(err, ScanloopError::TaskNotFound(_)));
    }

    #[test]
    fn test_scheduled_enqueue_is_guarded() {
        let (db, task) = store_with_task(TaskStatus::Scheduled);
        let now = Utc::now();

        assert!(enqueue_task(&db, &task.id, EnqueueReason::Scheduled, now).unwrap().is_some());
        // A second dispatcher observing the same due task loses the guard
        assert!(enqueue_task(&db, &task.id, EnqueueReason::Scheduled, now).unwrap().is_none());
        assert_eq!(db.kv_count(QUEUE_PREFIX).unwrap(), 1);
        assert_eq!(db.list_runs_for_task(&task.id, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_manual_trigger_from_running_is_rejected() {
        let (db, task) = store_with_task(TaskStatus::Running);
        let err = enqueue_task(&db, &task.id, EnqueueReason::Manual, Utc::now()).unwrap_err();
        assert!(matches!(err, ScanloopError::InvalidTransition(_)));
    }

    #[test]
    fn test_claim_serves_oldest_first() {
        let (db, task) = store_with_task(TaskStatus::Inactive);
        let t1 = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let t2 = t1 + Duration::seconds(1);

        let (_, first) = enqueue_task(&db, &task.id, EnqueueReason::Manual, t1).unwrap().unwrap();
        // Re-arm the task so a second manual trigger is legal
        db.update_task(
            &task.id,
            &TaskPatch { status: Some(TaskStatus::Inactive), ..Default::default() },
            t2,
        )
        .unwrap();
        let (_, second) = enqueue_task(&db, &task.id, EnqueueReason::Manual, t2).unwrap().unwrap();

        let claimed = claim_next(&db, t2).unwrap().unwrap();
        assert_eq!(claimed.run_id, first.id);
        let claimed = claim_next(&db, t2).unwrap().unwrap();
        assert_eq!(claimed.run_id, second.id);
        assert!(claim_next(&db, t2).unwrap().is_none());
    }

    #[test]
    fn test_claim_empty_queue() {
        let db = StoreDb::open_in_memory().unwrap();
        assert!(claim_next(&db, Utc::now()).unwrap().is_none());
    }

    #[test]
    fn test_claim_drops_unreadable_entries() {
        let (db, task) = store_with_task(TaskStatus::Inactive);
        let now = Utc::now();
        let now_ms = now.timestamp_millis();

        db.kv_put(&build_queue_key("corrupt", now_ms - 1), "not json", now_ms - 1, i64::MAX)
            .unwrap();
        let (_, run) = enqueue_task(&db, &task.id, EnqueueReason::Manual, now).unwrap().unwrap();

        // The corrupt entry sorts first, is dropped, and the real one is served
        let claimed = claim_next(&db, now).unwrap().unwrap();
        assert_eq!(claimed.run_id, run.id);
        assert_eq!(db.kv_count(QUEUE_PREFIX).unwrap(), 0);
    }

    #[test]
    fn test_expired_entries_are_never_claimed() {
        let (db, task) = store_with_task(TaskStatus::Inactive);
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        enqueue_task(&db, &task.id, EnqueueReason::Manual, now).unwrap();

        let after_ttl = now + Duration::hours(QUEUE_TTL_HOURS) + Duration::minutes(1);
        assert!(claim_next(&db, after_ttl).unwrap().is_none());
        assert_eq!(db.kv_count(QUEUE_PREFIX).unwrap(), 0);
    }

    #[test]
    fn test_payload_carries_direct_webhook() {
        let db = StoreDb::open_in_memory().unwrap();
        let now = Utc::now();
        let task = db
            .create_task(
                NewTask {
                    name: "hooked".into(),
                    project_id: None,
                    cadence: Cadence::Manual,
                    timezone: "UTC".into(),
                    schedule: ScheduleConfig::default(),
                    targets: vec![],
                    webhook_url: Some("https://example.com/hook".into()),
                    webhook_secret: Some("whsec".into()),
                    retry_limit: 0,
                    metadata: serde_json::Value::Null,
                    status: TaskStatus::Inactive,
                    next_run_at: None,
                },
                now,
            )
            .unwrap();

        enqueue_task(&db, &task.id, EnqueueReason::Manual, now).unwrap();
        let payload = claim_next(&db, now).unwrap().unwrap();
        let hook = payload.direct_webhook.unwrap();
        assert_eq!(hook.url, "https://example.com/hook");
        assert_eq!(hook.secret.as_deref(), Some("whsec"));
        // Manual cadence never reschedules
        assert!(db.get_task(&task.id).unwrap().unwrap().next_run_at.is_none());
    }
}
