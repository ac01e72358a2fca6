//! Task and run CRUD over the system of record.
//!
//! Updates are partial: a patch only touches the columns it names, every
//! other field is left unchanged. `updated_at` is bumped on every task patch.

use chrono::{DateTime, Utc};
use rusqlite::{Row, params, params_from_iter, types::ToSql};
use scanloop_core::error::{Result, ScanloopError};
use scanloop_core::model::{
    AutomationTask, Cadence, RunStatus, ScheduleConfig, TaskRun, TaskStatus, TaskTarget, new_id,
};

use crate::db::{StoreDb, opt_ts_from_string, opt_ts_to_string, ts_from_string, ts_to_string};

/// Fields for a new task definition. Status and `next_run_at` are decided by
/// the caller (the engine computes them from the cadence in the same call).
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub project_id: Option<String>,
    pub cadence: Cadence,
    pub timezone: String,
    pub schedule: ScheduleConfig,
    pub targets: Vec<TaskTarget>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub retry_limit: u32,
    pub metadata: serde_json::Value,
    pub status: TaskStatus,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Partial task update. `None` = leave unchanged; the double-`Option` fields
/// distinguish "set to NULL" (`Some(None)`) from "leave alone" (`None`).
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub name: Option<String>,
    pub status: Option<TaskStatus>,
    pub cadence: Option<Cadence>,
    pub timezone: Option<String>,
    pub schedule: Option<ScheduleConfig>,
    pub targets: Option<Vec<TaskTarget>>,
    pub last_run_at: Option<Option<DateTime<Utc>>>,
    pub next_run_at: Option<Option<DateTime<Utc>>>,
    pub last_status: Option<String>,
    pub webhook_url: Option<Option<String>>,
    pub webhook_secret: Option<Option<String>>,
    pub retry_limit: Option<u32>,
    pub retry_attempts: Option<u32>,
    pub metadata: Option<serde_json::Value>,
    pub last_result: Option<serde_json::Value>,
}

/// Partial run update. Run fields are only ever set, never cleared.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub batches_processed: Option<i64>,
    pub success_count: Option<i64>,
    pub fail_count: Option<i64>,
    pub webhook_status: Option<String>,
    pub response_code: Option<i64>,
    pub error: Option<String>,
    pub sample_report_id: Option<String>,
}

const TASK_COLS: &str = "id, name, project_id, status, cadence, timezone, schedule, targets, \
     last_run_at, next_run_at, last_status, webhook_url, webhook_secret, \
     retry_limit, retry_attempts, created_at, updated_at, metadata, last_result";

const RUN_COLS: &str = "id, task_id, status, queued_at, started_at, completed_at, duration_ms, \
     batches_processed, success_count, fail_count, webhook_status, response_code, \
     error, sample_report_id, metadata";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<AutomationTask> {
    let schedule_str: String = row.get(6)?;
    let targets_str: String = row.get(7)?;
    let metadata_str: String = row.get(17)?;
    let last_result_str: Option<String> = row.get(18)?;

    Ok(AutomationTask {
        id: row.get(0)?,
        name: row.get(1)?,
        project_id: row.get(2)?,
        status: TaskStatus::parse(&row.get::<_, String>(3)?).unwrap_or(TaskStatus::Inactive),
        cadence: Cadence::parse(&row.get::<_, String>(4)?).unwrap_or(Cadence::Manual),
        timezone: row.get(5)?,
        schedule: serde_json::from_str(&schedule_str).unwrap_or_default(),
        targets: serde_json::from_str(&targets_str).unwrap_or_default(),
        last_run_at: opt_ts_from_string(row.get(8)?),
        next_run_at: opt_ts_from_string(row.get(9)?),
        last_status: row.get(10)?,
        webhook_url: row.get(11)?,
        webhook_secret: row.get(12)?,
        retry_limit: row.get(13)?,
        retry_attempts: row.get(14)?,
        created_at: ts_from_string(&row.get::<_, String>(15)?).unwrap_or_else(Utc::now),
        updated_at: ts_from_string(&row.get::<_, String>(16)?).unwrap_or_else(Utc::now),
        metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::Value::Null),
        last_result: last_result_str.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRun> {
    let metadata_str: String = row.get(14)?;
    Ok(TaskRun {
        id: row.get(0)?,
        task_id: row.get(1)?,
        status: RunStatus::parse(&row.get::<_, String>(2)?).unwrap_or(RunStatus::Queued),
        queued_at: ts_from_string(&row.get::<_, String>(3)?).unwrap_or_else(Utc::now),
        started_at: opt_ts_from_string(row.get(4)?),
        completed_at: opt_ts_from_string(row.get(5)?),
        duration_ms: row.get(6)?,
        batches_processed: row.get(7)?,
        success_count: row.get(8)?,
        fail_count: row.get(9)?,
        webhook_status: row.get(10)?,
        response_code: row.get(11)?,
        error: row.get(12)?,
        sample_report_id: row.get(13)?,
        metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::Value::Null),
    })
}

impl StoreDb {
    // ─── Tasks ────────────────────────────────────────────────────────────

    /// Insert a new task row and return the stored task.
    pub fn create_task(&self, new: NewTask, now: DateTime<Utc>) -> Result<AutomationTask> {
        let task = AutomationTask {
            id: new_id(),
            name: new.name,
            project_id: new.project_id,
            status: new.status,
            cadence: new.cadence,
            timezone: new.timezone,
            schedule: new.schedule,
            targets: new.targets,
            last_run_at: None,
            next_run_at: new.next_run_at,
            last_status: None,
            webhook_url: new.webhook_url,
            webhook_secret: new.webhook_secret,
            retry_limit: new.retry_limit,
            retry_attempts: 0,
            created_at: now,
            updated_at: now,
            metadata: new.metadata,
            last_result: None,
        };

        self.conn()?
            .execute(
                &format!("INSERT INTO tasks ({TASK_COLS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"),
                params![
                    task.id,
                    task.name,
                    task.project_id,
                    task.status.as_str(),
                    task.cadence.as_str(),
                    task.timezone,
                    serde_json::to_string(&task.schedule)?,
                    serde_json::to_string(&task.targets)?,
                    opt_ts_to_string(task.last_run_at),
                    opt_ts_to_string(task.next_run_at),
                    task.last_status,
                    task.webhook_url,
                    task.webhook_secret,
                    task.retry_limit,
                    task.retry_attempts,
                    ts_to_string(task.created_at),
                    ts_to_string(task.updated_at),
                    serde_json::to_string(&task.metadata)?,
                    task.last_result.as_ref().map(serde_json::to_string).transpose()?,
                ],
            )
            .map_err(|e| ScanloopError::Store(format!("Insert task: {e}")))?;
        Ok(task)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<AutomationTask>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {TASK_COLS} FROM tasks WHERE id = ?1"))
            .map_err(|e| ScanloopError::Store(format!("Get task: {e}")))?;
        let mut rows = stmt
            .query_map([id], task_from_row)
            .map_err(|e| ScanloopError::Store(format!("Get task: {e}")))?;
        Ok(rows.next().transpose().map_err(|e| ScanloopError::Store(e.to_string()))?)
    }

    pub fn list_recent_tasks(&self, limit: usize) -> Result<Vec<AutomationTask>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLS} FROM tasks ORDER BY created_at DESC LIMIT ?1"
            ))
            .map_err(|e| ScanloopError::Store(format!("List tasks: {e}")))?;
        let rows = stmt
            .query_map([limit as i64], task_from_row)
            .map_err(|e| ScanloopError::Store(format!("List tasks: {e}")))?;
        Ok(rows.filter_map(|t| t.ok()).collect())
    }

    /// Tasks due at `now`: scheduled with `next_run_at <= now`, earliest
    /// first.
    pub fn list_due_tasks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<AutomationTask>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLS} FROM tasks \
                 WHERE status = 'scheduled' AND next_run_at IS NOT NULL AND next_run_at <= ?1 \
                 ORDER BY next_run_at ASC LIMIT ?2"
            ))
            .map_err(|e| ScanloopError::Store(format!("List due: {e}")))?;
        let rows = stmt
            .query_map(params![ts_to_string(now), limit as i64], task_from_row)
            .map_err(|e| ScanloopError::Store(format!("List due: {e}")))?;
        Ok(rows.filter_map(|t| t.ok()).collect())
    }

    /// Apply a partial update. Absent patch fields leave columns untouched.
    pub fn update_task(&self, id: &str, patch: &TaskPatch, now: DateTime<Utc>) -> Result<()> {
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(name) = &patch.name {
            sets.push("name = ?");
            values.push(Box::new(name.clone()));
        }
        if let Some(status) = patch.status {
            sets.push("status = ?");
            values.push(Box::new(status.as_str()));
        }
        if let Some(cadence) = patch.cadence {
            sets.push("cadence = ?");
            values.push(Box::new(cadence.as_str()));
        }
        if let Some(tz) = &patch.timezone {
            sets.push("timezone = ?");
            values.push(Box::new(tz.clone()));
        }
        if let Some(schedule) = &patch.schedule {
            sets.push("schedule = ?");
            values.push(Box::new(serde_json::to_string(schedule)?));
        }
        if let Some(targets) = &patch.targets {
            sets.push("targets = ?");
            values.push(Box::new(serde_json::to_string(targets)?));
        }
        if let Some(last_run_at) = patch.last_run_at {
            sets.push("last_run_at = ?");
            values.push(Box::new(opt_ts_to_string(last_run_at)));
        }
        if let Some(next_run_at) = patch.next_run_at {
            sets.push("next_run_at = ?");
            values.push(Box::new(opt_ts_to_string(next_run_at)));
        }
        if let Some(last_status) = &patch.last_status {
            sets.push("last_status = ?");
            values.push(Box::new(last_status.clone()));
        }
        if let Some(url) = &patch.webhook_url {
            sets.push("webhook_url = ?");
            values.push(Box::new(url.clone()));
        }
        if let Some(secret) = &patch.webhook_secret {
            sets.push("webhook_secret = ?");
            values.push(Box::new(secret.clone()));
        }
        if let Some(retry_limit) = patch.retry_limit {
            sets.push("retry_limit = ?");
            values.push(Box::new(retry_limit));
        }
        if let Some(retry_attempts) = patch.retry_attempts {
            sets.push("retry_attempts = ?");
            values.push(Box::new(retry_attempts));
        }
        if let Some(metadata) = &patch.metadata {
            sets.push("metadata = ?");
            values.push(Box::new(serde_json::to_string(metadata)?));
        }
        if let Some(last_result) = &patch.last_result {
            sets.push("last_result = ?");
            values.push(Box::new(serde_json::to_string(last_result)?));
        }

        sets.push("updated_at = ?");
        values.push(Box::new(ts_to_string(now)));
        values.push(Box::new(id.to_string()));

        let placeholders: Vec<String> = sets
            .iter()
            .enumerate()
            .map(|(i, frag)| frag.replace('?', &format!("?{}", i + 1)))
            .collect();
        let sql = format!(
            "UPDATE tasks SET {} WHERE id = ?{}",
            placeholders.join(", "),
            values.len()
        );

        self.conn()?
            .execute(&sql, params_from_iter(values.iter().map(|v| v.as_ref())))
            .map_err(|e| ScanloopError::Store(format!("Update task: {e}")))?;
        Ok(())
    }

    /// Dispatch guard: flip `scheduled → queued` only if the task is still
    /// scheduled. Returns whether this caller won the transition.
    pub fn mark_queued_if_scheduled(
        &self,
        id: &str,
        last_status: &str,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = self
            .conn()?
            .execute(
                "UPDATE tasks SET status = 'queued', last_status = ?1, next_run_at = ?2, updated_at = ?3 \
                 WHERE id = ?4 AND status = 'scheduled'",
                params![last_status, opt_ts_to_string(next_run_at), ts_to_string(now), id],
            )
            .map_err(|e| ScanloopError::Store(format!("Queue guard: {e}")))?;
        Ok(affected == 1)
    }

    // ─── Runs ─────────────────────────────────────────────────────────────

    pub fn create_run(&self, run: &TaskRun) -> Result<()> {
        self.conn()?
            .execute(
                &format!("INSERT INTO task_runs ({RUN_COLS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"),
                params![
                    run.id,
                    run.task_id,
                    run.status.as_str(),
                    ts_to_string(run.queued_at),
                    opt_ts_to_string(run.started_at),
                    opt_ts_to_string(run.completed_at),
                    run.duration_ms,
                    run.batches_processed,
                    run.success_count,
                    run.fail_count,
                    run.webhook_status,
                    run.response_code,
                    run.error,
                    run.sample_report_id,
                    serde_json::to_string(&run.metadata)?,
                ],
            )
            .map_err(|e| ScanloopError::Store(format!("Insert run: {e}")))?;
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> Result<Option<TaskRun>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {RUN_COLS} FROM task_runs WHERE id = ?1"))
            .map_err(|e| ScanloopError::Store(format!("Get run: {e}")))?;
        let mut rows = stmt
            .query_map([id], run_from_row)
            .map_err(|e| ScanloopError::Store(format!("Get run: {e}")))?;
        Ok(rows.next().transpose().map_err(|e| ScanloopError::Store(e.to_string()))?)
    }

    pub fn list_runs_for_task(&self, task_id: &str, limit: usize) -> Result<Vec<TaskRun>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLS} FROM task_runs WHERE task_id = ?1 \
                 ORDER BY queued_at DESC LIMIT ?2"
            ))
            .map_err(|e| ScanloopError::Store(format!("List runs: {e}")))?;
        let rows = stmt
            .query_map(params![task_id, limit as i64], run_from_row)
            .map_err(|e| ScanloopError::Store(format!("List runs: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Runs stuck in `running` since before the cutoff (orphaned by a
    /// crashed executor).
    pub fn list_stale_running_runs(&self, cutoff: DateTime<Utc>) -> Result<Vec<TaskRun>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLS} FROM task_runs \
                 WHERE status = 'running' AND started_at IS NOT NULL AND started_at <= ?1 \
                 ORDER BY started_at ASC"
            ))
            .map_err(|e| ScanloopError::Store(format!("List stale runs: {e}")))?;
        let rows = stmt
            .query_map([ts_to_string(cutoff)], run_from_row)
            .map_err(|e| ScanloopError::Store(format!("List stale runs: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn update_run(&self, id: &str, patch: &RunPatch) -> Result<()> {
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(status) = patch.status {
            sets.push("status = ?");
            values.push(Box::new(status.as_str()));
        }
        if let Some(started_at) = patch.started_at {
            sets.push("started_at = ?");
            values.push(Box::new(ts_to_string(started_at)));
        }
        if let Some(completed_at) = patch.completed_at {
            sets.push("completed_at = ?");
            values.push(Box::new(ts_to_string(completed_at)));
        }
        if let Some(duration_ms) = patch.duration_ms {
            sets.push("duration_ms = ?");
            values.push(Box::new(duration_ms));
        }
        if let Some(batches) = patch.batches_processed {
            sets.push("batches_processed = ?");
            values.push(Box::new(batches));
        }
        if let Some(success) = patch.success_count {
            sets.push("success_count = ?");
            values.push(Box::new(success));
        }
        if let Some(fail) = patch.fail_count {
            sets.push("fail_count = ?");
            values.push(Box::new(fail));
        }
        if let Some(webhook_status) = &patch.webhook_status {
            sets.push("webhook_status = ?");
            values.push(Box::new(webhook_status.clone()));
        }
        if let Some(code) = patch.response_code {
            sets.push("response_code = ?");
            values.push(Box::new(code));
        }
        if let Some(error) = &patch.error {
            sets.push("error = ?");
            values.push(Box::new(error.clone()));
        }
        if let Some(sample) = &patch.sample_report_id {
            sets.push("sample_report_id = ?");
            values.push(Box::new(sample.clone()));
        }

        if sets.is_empty() {
            return Ok(());
        }
        values.push(Box::new(id.to_string()));

        let placeholders: Vec<String> = sets
            .iter()
            .enumerate()
            .map(|(i, frag)| frag.replace('?', &format!("?{}", i + 1)))
            .collect();
        let sql = format!(
            "UPDATE task_runs SET {} WHERE id = ?{}",
            placeholders.join(", "),
            values.len()
        );

        self.conn()?
            .execute(&sql, params_from_iter(values.iter().map(|v| v.as_ref())))
            .map_err(|e| ScanloopError::Store(format!("Update run: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use scanloop_core::model::TaskStatus;

    fn sample_new_task(name: &str, status: TaskStatus, next: Option<DateTime<Utc>>) -> NewTask {
        NewTask {
            name: name.into(),
            project_id: None,
            cadence: Cadence::Interval,
            timezone: "UTC".into(),
            schedule: ScheduleConfig { interval_minutes: Some(30), ..Default::default() },
            targets: vec![],
            webhook_url: None,
            webhook_secret: None,
            retry_limit: 0,
            metadata: serde_json::Value::Null,
            status,
            next_run_at: next,
        }
    }

    #[test]
    fn test_create_and_get_task() {
        let db = StoreDb::open_in_memory().unwrap();
        let now = Utc::now();
        let task = db
            .create_task(sample_new_task("nightly", TaskStatus::Scheduled, Some(now)), now)
            .unwrap();

        let loaded = db.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.name, "nightly");
        assert_eq!(loaded.status, TaskStatus::Scheduled);
        assert_eq!(loaded.schedule.interval_minutes, Some(30));
        assert!(db.get_task("missing").unwrap().is_none());
    }

    #[test]
    fn test_partial_update_leaves_other_fields() {
        let db = StoreDb::open_in_memory().unwrap();
        let now = Utc::now();
        let task = db
            .create_task(sample_new_task("t", TaskStatus::Scheduled, Some(now)), now)
            .unwrap();

        let patch = TaskPatch { status: Some(TaskStatus::Paused), ..Default::default() };
        db.update_task(&task.id, &patch, now).unwrap();

        let loaded = db.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Paused);
        // Untouched fields survive
        assert_eq!(loaded.name, "t");
        assert_eq!(loaded.cadence, Cadence::Interval);
        assert!(loaded.next_run_at.is_some());

        // Explicit null clears a nullable column
        let patch = TaskPatch { next_run_at: Some(None), ..Default::default() };
        db.update_task(&task.id, &patch, now).unwrap();
        assert!(db.get_task(&task.id).unwrap().unwrap().next_run_at.is_none());
    }

    #[test]
    fn test_list_due_orders_earliest_first() {
        let db = StoreDb::open_in_memory().unwrap();
        let now = Utc::now();
        let later = db
            .create_task(
                sample_new_task("later", TaskStatus::Scheduled, Some(now - Duration::minutes(1))),
                now,
            )
            .unwrap();
        let earlier = db
            .create_task(
                sample_new_task("earlier", TaskStatus::Scheduled, Some(now - Duration::minutes(10))),
                now,
            )
            .unwrap();
        // Not due: in the future, or not scheduled
        db.create_task(
            sample_new_task("future", TaskStatus::Scheduled, Some(now + Duration::minutes(10))),
            now,
        )
        .unwrap();
        db.create_task(sample_new_task("paused", TaskStatus::Paused, Some(now - Duration::minutes(5))), now)
            .unwrap();

        let due = db.list_due_tasks(now, 10).unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, earlier.id);
        assert_eq!(due[1].id, later.id);
    }

    #[test]
    fn test_queue_guard_is_single_winner() {
        let db = StoreDb::open_in_memory().unwrap();
        let now = Utc::now();
        let task = db
            .create_task(sample_new_task("guarded", TaskStatus::Scheduled, Some(now)), now)
            .unwrap();

        assert!(db.mark_queued_if_scheduled(&task.id, "scheduled", None, now).unwrap());
        // Second attempt loses: status is no longer `scheduled`
        assert!(!db.mark_queued_if_scheduled(&task.id, "scheduled", None, now).unwrap());
        assert_eq!(db.get_task(&task.id).unwrap().unwrap().status, TaskStatus::Queued);
    }

    #[test]
    fn test_run_round_trip_and_patch() {
        let db = StoreDb::open_in_memory().unwrap();
        let now = Utc::now();
        let run = TaskRun::queued("task-1", now);
        db.create_run(&run).unwrap();

        db.update_run(
            &run.id,
            &RunPatch {
                status: Some(RunStatus::Completed),
                success_count: Some(60),
                batches_processed: Some(2),
                response_code: Some(200),
                ..Default::default()
            },
        )
        .unwrap();

        let loaded = db.get_run(&run.id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.success_count, 60);
        assert_eq!(loaded.batches_processed, 2);
        assert_eq!(loaded.fail_count, 0);
        assert_eq!(db.list_runs_for_task("task-1", 10).unwrap().len(), 1);
    }
}
