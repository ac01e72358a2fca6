//! The automation engine: task lifecycle entry points, the dispatcher loop,
//! and the executor loop.
//!
//! Everything is dependency-injected — store, batch runner, notifier, and
//! scheduler config are supplied at construction, so invocations are
//! stateless and tests are hermetic.
//!
//! Error policy: `dispatch_due` and the task entry points may return errors
//! to the caller; `process_queue` and `requeue_stale_runs` never do — each
//! bad run degrades to a recorded terminal state and the loop moves on.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use scanloop_core::config::SchedulerConfig;
use scanloop_core::error::{Result, ScanloopError};
use scanloop_core::model::{
    AutomationTask, BatchOutcome, Cadence, QueuePayload, RunStatus, ScheduleConfig, TaskRun,
    TaskStatus, TaskTarget,
};
use scanloop_store::{NewTask, RunPatch, StoreDb, TaskPatch};

use crate::cadence;
use crate::queue::{self, EnqueueReason};
use crate::runner::BatchRunner;
use crate::webhook::{EVENT_RUN_COMPLETED, EVENT_RUN_FAILED, WebhookNotifier};

/// Longest retry backoff, in minutes.
const MAX_BACKOFF_MINUTES: i64 = 60;

/// Caller-facing fields for creating a task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub project_id: Option<String>,
    pub cadence: Cadence,
    pub timezone: Option<String>,
    pub schedule: ScheduleConfig,
    pub targets: Vec<TaskTarget>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub retry_limit: u32,
    pub metadata: Option<serde_json::Value>,
    /// Schedule immediately (ignored for manual cadence).
    pub activate: bool,
}

/// Caller-facing partial task update.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub name: Option<String>,
    /// Operator status transition, checked against the transition table.
    pub status: Option<TaskStatus>,
    pub cadence: Option<Cadence>,
    pub timezone: Option<String>,
    pub schedule: Option<ScheduleConfig>,
    pub targets: Option<Vec<TaskTarget>>,
    pub webhook_url: Option<Option<String>>,
    pub webhook_secret: Option<Option<String>>,
    pub retry_limit: Option<u32>,
    pub metadata: Option<serde_json::Value>,
}

pub struct AutomationEngine {
    store: Arc<StoreDb>,
    runner: Arc<dyn BatchRunner>,
    notifier: WebhookNotifier,
    scheduler: SchedulerConfig,
}

impl AutomationEngine {
    pub fn new(
        store: Arc<StoreDb>,
        runner: Arc<dyn BatchRunner>,
        notifier: WebhookNotifier,
        scheduler: SchedulerConfig,
    ) -> Self {
        Self { store, runner, notifier, scheduler }
    }

    pub fn store(&self) -> &StoreDb {
        &self.store
    }

    pub fn notifier(&self) -> &WebhookNotifier {
        &self.notifier
    }

    pub fn scheduler_config(&self) -> &SchedulerConfig {
        &self.scheduler
    }

    // ─── Task lifecycle ───────────────────────────────────────────────────

    /// Create a task. Activation schedules it and computes `next_run_at` in
    /// the same call; manual-cadence tasks are never auto-scheduled.
    pub fn create_task(&self, spec: TaskSpec, now: DateTime<Utc>) -> Result<AutomationTask> {
        let timezone = spec.timezone.unwrap_or_else(|| "UTC".to_string());
        let mut schedule = spec.schedule;
        if schedule.timezone.is_none() {
            schedule.timezone = Some(timezone.clone());
        }

        let activate = spec.activate && spec.cadence != Cadence::Manual;
        let status = if activate { TaskStatus::Scheduled } else { TaskStatus::Inactive };
        let next_run_at = if activate {
            cadence::next_run_at(spec.cadence, &schedule, now)
        } else {
            None
        };

        let task = self.store.create_task(
            NewTask {
                name: spec.name,
                project_id: spec.project_id,
                cadence: spec.cadence,
                timezone,
                schedule,
                targets: spec.targets,
                webhook_url: spec.webhook_url,
                webhook_secret: spec.webhook_secret,
                retry_limit: spec.retry_limit,
                metadata: spec.metadata.unwrap_or(serde_json::Value::Null),
                status,
                next_run_at,
            },
            now,
        )?;
        tracing::info!("task '{}' created ({}, {})", task.name, task.cadence, task.status);
        Ok(task)
    }

    /// Partial task update. Operator status changes are validated against
    /// the transition table; schedule-affecting changes recompute
    /// `next_run_at` while the task is scheduled.
    pub fn patch_task(
        &self,
        id: &str,
        update: TaskUpdate,
        now: DateTime<Utc>,
    ) -> Result<AutomationTask> {
        let task = self
            .store
            .get_task(id)?
            .ok_or_else(|| ScanloopError::TaskNotFound(id.to_string()))?;

        let cadence_after = update.cadence.unwrap_or(task.cadence);
        let mut schedule_after = update.schedule.clone().unwrap_or_else(|| task.schedule.clone());
        if schedule_after.timezone.is_none() {
            let tz = update.timezone.clone().unwrap_or_else(|| task.timezone.clone());
            if !tz.is_empty() {
                schedule_after.timezone = Some(tz);
            }
        }

        let mut patch = TaskPatch {
            name: update.name,
            cadence: update.cadence,
            timezone: update.timezone,
            schedule: update.schedule,
            targets: update.targets,
            webhook_url: update.webhook_url,
            webhook_secret: update.webhook_secret,
            retry_limit: update.retry_limit,
            metadata: update.metadata,
            ..Default::default()
        };

        if let Some(target) = update.status {
            if target != task.status && !task.status.can_transition(target) {
                return Err(ScanloopError::InvalidTransition(format!(
                    "task {} cannot move {} -> {}",
                    task.id, task.status, target
                )));
            }
            patch.status = Some(target);
            if target == TaskStatus::Scheduled {
                if cadence_after == Cadence::Manual {
                    return Err(ScanloopError::InvalidTransition(format!(
                        "manual task {} cannot be scheduled",
                        task.id
                    )));
                }
                patch.next_run_at =
                    Some(cadence::next_run_at(cadence_after, &schedule_after, now));
            } else {
                patch.next_run_at = Some(None);
            }
        } else if task.status == TaskStatus::Scheduled
            && (patch.cadence.is_some() || patch.schedule.is_some() || patch.timezone.is_some())
        {
            patch.next_run_at = Some(cadence::next_run_at(cadence_after, &schedule_after, now));
        }

        self.store.update_task(id, &patch, now)?;
        self.store
            .get_task(id)?
            .ok_or_else(|| ScanloopError::TaskNotFound(id.to_string()))
    }

    /// Manual enqueue. Errors with `TaskNotFound` for unknown ids and
    /// `InvalidTransition` when the task cannot currently be queued.
    pub fn trigger_task(&self, id: &str, now: DateTime<Utc>) -> Result<(AutomationTask, TaskRun)> {
        queue::enqueue_task(&self.store, id, EnqueueReason::Manual, now)?
            .ok_or_else(|| ScanloopError::Queue(format!("task {id} was not enqueued")))
    }

    // ─── Dispatcher ───────────────────────────────────────────────────────

    /// Turn due tasks into queued runs, earliest-due first. Returns how many
    /// tasks were enqueued.
    pub fn dispatch_due(&self, now: DateTime<Utc>, limit: usize) -> Result<usize> {
        let due = self.store.list_due_tasks(now, limit)?;
        let mut dispatched = 0;
        for task in due {
            match queue::enqueue_task(&self.store, &task.id, EnqueueReason::Scheduled, now)? {
                Some(_) => dispatched += 1,
                // Lost the guard race to a concurrent dispatcher
                None => tracing::debug!("task {} already claimed by another dispatcher", task.id),
            }
        }
        Ok(dispatched)
    }

    // ─── Executor ─────────────────────────────────────────────────────────

    /// Claim and execute up to `limit` queued runs. Never throws; each
    /// failure is recorded on its run/task and the loop continues.
    pub async fn process_queue(&self, limit: usize) -> usize {
        let mut processed = 0;
        for _ in 0..limit {
            let payload = match queue::claim_next(&self.store, Utc::now()) {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("queue claim failed: {e}");
                    break;
                }
            };
            processed += 1;

            if let Err(e) = self.execute_claim(&payload).await {
                tracing::error!("run {} failed outside the runner: {e}", payload.run_id);
                let now = Utc::now();
                let _ = self.store.update_run(
                    &payload.run_id,
                    &RunPatch {
                        status: Some(RunStatus::Failed),
                        completed_at: Some(now),
                        error: Some(e.to_string()),
                        ..Default::default()
                    },
                );
                let _ = self.store.update_task(
                    &payload.task_id,
                    &TaskPatch {
                        status: Some(TaskStatus::Failed),
                        last_status: Some("failed".into()),
                        next_run_at: Some(None),
                        ..Default::default()
                    },
                    now,
                );
            }
        }
        processed
    }

    async fn execute_claim(&self, payload: &QueuePayload) -> Result<()> {
        let Some(run) = self.store.get_run(&payload.run_id)? else {
            tracing::warn!(
                "claimed run {} no longer exists (task {})",
                payload.run_id,
                payload.task_id
            );
            return Ok(());
        };
        let Some(task) = self.store.get_task(&payload.task_id)? else {
            // Dangling claim: fail the run, never retry
            self.store.update_run(
                &run.id,
                &RunPatch {
                    status: Some(RunStatus::Failed),
                    completed_at: Some(Utc::now()),
                    error: Some(format!("task {} missing for queued run", payload.task_id)),
                    ..Default::default()
                },
            )?;
            return Ok(());
        };

        let started = Utc::now();
        self.store.update_run(
            &run.id,
            &RunPatch {
                status: Some(RunStatus::Running),
                started_at: Some(started),
                ..Default::default()
            },
        )?;
        self.store.update_task(
            &task.id,
            &TaskPatch {
                status: Some(TaskStatus::Running),
                last_status: Some("running".into()),
                ..Default::default()
            },
            started,
        )?;

        match self.runner.execute(&task.targets).await {
            Ok(outcome) => self.finish_success(task, run, outcome, started).await,
            Err(e) => self.finish_failure(task, run, payload.attempts, e.to_string(), started).await,
        }
    }

    async fn finish_success(
        &self,
        task: AutomationTask,
        run: TaskRun,
        outcome: BatchOutcome,
        started: DateTime<Utc>,
    ) -> Result<()> {
        let completed = Utc::now();
        let duration_ms = (completed - started).num_milliseconds();

        let mut run = run;
        run.status = RunStatus::Completed;
        run.started_at = Some(started);
        run.completed_at = Some(completed);
        run.duration_ms = Some(duration_ms);
        run.batches_processed = outcome.batches;
        run.success_count = outcome.success_count;
        run.fail_count = outcome.fail_count;
        run.response_code = Some(200);
        run.webhook_status = Some("queued".into());
        run.sample_report_id = outcome.sample_report_id.clone();
        self.store.update_run(
            &run.id,
            &RunPatch {
                status: Some(RunStatus::Completed),
                completed_at: Some(completed),
                duration_ms: Some(duration_ms),
                batches_processed: Some(outcome.batches),
                success_count: Some(outcome.success_count),
                fail_count: Some(outcome.fail_count),
                response_code: Some(200),
                webhook_status: Some("queued".into()),
                sample_report_id: outcome.sample_report_id.clone(),
                ..Default::default()
            },
        )?;

        // Recompute from the completion instant, not the enqueue time
        let schedule = cadence::effective_schedule(&task);
        let (status, next_run_at) = if task.cadence == Cadence::Manual {
            (TaskStatus::Inactive, None)
        } else {
            (
                TaskStatus::Scheduled,
                cadence::next_run_at(task.cadence, &schedule, completed),
            )
        };
        let last_result = serde_json::json!({
            "runId": run.id,
            "batches": outcome.batches,
            "successCount": outcome.success_count,
            "failCount": outcome.fail_count,
            "sampleReportId": outcome.sample_report_id,
            "durationMs": duration_ms,
        });
        self.store.update_task(
            &task.id,
            &TaskPatch {
                status: Some(status),
                next_run_at: Some(next_run_at),
                last_run_at: Some(Some(completed)),
                last_status: Some("completed".into()),
                retry_attempts: Some(0),
                last_result: Some(last_result),
                ..Default::default()
            },
            completed,
        )?;

        let mut task = task;
        task.status = status;
        task.next_run_at = next_run_at;
        task.last_run_at = Some(completed);

        let report = self
            .notifier
            .emit_event(&self.store, EVENT_RUN_COMPLETED, &task, &run)
            .await;
        self.store.update_run(
            &run.id,
            &RunPatch {
                webhook_status: Some(webhook_status(report.attempted, report.delivered)),
                ..Default::default()
            },
        )?;

        tracing::info!(
            "run {} completed: {} ok / {} failed across {} batches",
            run.id,
            outcome.success_count,
            outcome.fail_count,
            outcome.batches
        );
        Ok(())
    }

    async fn finish_failure(
        &self,
        task: AutomationTask,
        run: TaskRun,
        attempts: u32,
        error: String,
        started: DateTime<Utc>,
    ) -> Result<()> {
        let completed = Utc::now();
        let duration_ms = (completed - started).num_milliseconds();

        let mut run = run;
        run.status = RunStatus::Failed;
        run.started_at = Some(started);
        run.completed_at = Some(completed);
        run.duration_ms = Some(duration_ms);
        run.error = Some(error.clone());
        self.store.update_run(
            &run.id,
            &RunPatch {
                status: Some(RunStatus::Failed),
                completed_at: Some(completed),
                duration_ms: Some(duration_ms),
                error: Some(error.clone()),
                ..Default::default()
            },
        )?;

        let patch = self.failure_policy(&task, attempts, completed);
        let status = patch.status.unwrap_or(TaskStatus::Failed);
        let next_run_at = patch.next_run_at.unwrap_or(None);
        self.store.update_task(&task.id, &patch, completed)?;

        let mut task = task;
        task.status = status;
        task.next_run_at = next_run_at;

        let report = self
            .notifier
            .emit_event(&self.store, EVENT_RUN_FAILED, &task, &run)
            .await;
        self.store.update_run(
            &run.id,
            &RunPatch {
                webhook_status: Some(webhook_status(report.attempted, report.delivered)),
                ..Default::default()
            },
        )?;

        match status {
            TaskStatus::Scheduled => tracing::warn!(
                "run {} failed ({error}), retry {} of {} scheduled",
                run.id,
                attempts + 1,
                task.retry_limit
            ),
            _ => tracing::warn!("run {} failed terminally: {error}", run.id),
        }
        Ok(())
    }

    /// Bounded retry with exponential backoff: while attempts remain, the
    /// task goes back to `scheduled` with a delayed `next_run_at`; once the
    /// limit is reached it fails.
    fn failure_policy(&self, task: &AutomationTask, attempts: u32, now: DateTime<Utc>) -> TaskPatch {
        if attempts < task.retry_limit {
            let backoff = Duration::minutes(backoff_minutes(attempts));
            TaskPatch {
                status: Some(TaskStatus::Scheduled),
                next_run_at: Some(Some(now + backoff)),
                last_status: Some("retry".into()),
                retry_attempts: Some(attempts + 1),
                ..Default::default()
            }
        } else {
            TaskPatch {
                status: Some(TaskStatus::Failed),
                next_run_at: Some(None),
                last_status: Some("failed".into()),
                ..Default::default()
            }
        }
    }

    // ─── Stale-run sweeper ────────────────────────────────────────────────

    /// Fail runs orphaned in `running` by a crashed executor and put their
    /// task back through the failure policy. Returns how many were swept.
    pub fn requeue_stale_runs(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::minutes(self.scheduler.stale_after_minutes);
        let stale = match self.store.list_stale_running_runs(cutoff) {
            Ok(runs) => runs,
            Err(e) => {
                tracing::error!("stale-run scan failed: {e}");
                return 0;
            }
        };

        let mut swept = 0;
        for run in stale {
            let failed = self.store.update_run(
                &run.id,
                &RunPatch {
                    status: Some(RunStatus::Failed),
                    completed_at: Some(now),
                    error: Some("executor never completed this run".into()),
                    ..Default::default()
                },
            );
            if let Err(e) = failed {
                tracing::error!("stale run {} not updated: {e}", run.id);
                continue;
            }

            match self.store.get_task(&run.task_id) {
                Ok(Some(task)) => {
                    let patch = self.failure_policy(&task, task.retry_attempts, now);
                    if let Err(e) = self.store.update_task(&task.id, &patch, now) {
                        tracing::error!("task {} not updated for stale run: {e}", task.id);
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::error!("task lookup for stale run {} failed: {e}", run.id),
            }
            tracing::warn!("swept stale run {} (started {:?})", run.id, run.started_at);
            swept += 1;
        }
        swept
    }
}

fn webhook_status(attempted: usize, delivered: usize) -> String {
    if attempted == 0 {
        "skipped".into()
    } else if delivered == attempted {
        "delivered".into()
    } else {
        "failed".into()
    }
}

fn backoff_minutes(attempts: u32) -> i64 {
    (1i64 << attempts.min(6)).min(MAX_BACKOFF_MINUTES)
}

/// Background heartbeat: dispatch due tasks, drain the queue, sweep stale
/// runs. Intended to be spawned once from the binary.
pub async fn run_heartbeat(engine: Arc<AutomationEngine>) {
    let tick = engine.scheduler_config().tick_secs;
    let dispatch_limit = engine.scheduler_config().dispatch_limit;
    let queue_limit = engine.scheduler_config().queue_limit;
    tracing::info!("heartbeat started (every {tick}s)");

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(tick.max(1)));
    loop {
        interval.tick().await;
        let now = Utc::now();

        match engine.dispatch_due(now, dispatch_limit) {
            Ok(0) => {}
            Ok(n) => tracing::info!("dispatched {n} due task(s)"),
            Err(e) => tracing::error!("dispatch failed: {e}"),
        }

        let processed = engine.process_queue(queue_limit).await;
        if processed > 0 {
            tracing::info!("processed {processed} queued run(s)");
        }

        let swept = engine.requeue_stale_runs(Utc::now());
        if swept > 0 {
            tracing::warn!("swept {swept} stale run(s)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use scanloop_core::config::WebhookConfig;
    use scanloop_core::model::TaskTarget;
    use crate::runner::LocalRunner;

    struct FailingRunner;

    #[async_trait]
    impl BatchRunner for FailingRunner {
        async fn execute(&self, _targets: &[TaskTarget]) -> Result<BatchOutcome> {
            Err(ScanloopError::Runner("backend exploded".into()))
        }
    }

    fn engine_with(runner: Arc<dyn BatchRunner>) -> AutomationEngine {
        let store = Arc::new(StoreDb::open_in_memory().unwrap());
        AutomationEngine::new(
            store,
            runner,
            WebhookNotifier::new(&WebhookConfig::default()),
            SchedulerConfig::default(),
        )
    }

    fn target(label: &str, batch_size: i64) -> TaskTarget {
        TaskTarget {
            kind: "scan".into(),
            label: label.into(),
            batch_size,
            profile_id: None,
            metadata: None,
        }
    }

    fn interval_spec(name: &str, activate: bool) -> TaskSpec {
        TaskSpec {
            name: name.into(),
            project_id: None,
            cadence: Cadence::Interval,
            timezone: None,
            schedule: ScheduleConfig { interval_minutes: Some(30), ..Default::default() },
            targets: vec![target("A", 50), target("B", 10)],
            webhook_url: None,
            webhook_secret: None,
            retry_limit: 0,
            metadata: None,
            activate,
        }
    }

    fn force_due(engine: &AutomationEngine, task_id: &str, now: DateTime<Utc>) {
        engine
            .store()
            .update_task(
                task_id,
                &TaskPatch {
                    next_run_at: Some(Some(now - Duration::minutes(1))),
                    ..Default::default()
                },
                now,
            )
            .unwrap();
    }

    #[test]
    fn test_create_task_activation_schedules() {
        let engine = engine_with(Arc::new(LocalRunner));
        let now = Utc::now();
        let task = engine.create_task(interval_spec("activated", true), now).unwrap();

        assert_eq!(task.status, TaskStatus::Scheduled);
        let next = task.next_run_at.unwrap();
        assert!(next >= now + Duration::minutes(29));
        assert!(next <= now + Duration::minutes(31));
    }

    #[test]
    fn test_create_task_without_activation_is_inactive() {
        let engine = engine_with(Arc::new(LocalRunner));
        let now = Utc::now();
        let task = engine.create_task(interval_spec("dormant", false), now).unwrap();
        assert_eq!(task.status, TaskStatus::Inactive);
        assert!(task.next_run_at.is_none());

        // Manual cadence ignores the activate flag
        let mut spec = interval_spec("manual", true);
        spec.cadence = Cadence::Manual;
        spec.schedule = ScheduleConfig::default();
        let task = engine.create_task(spec, now).unwrap();
        assert_eq!(task.status, TaskStatus::Inactive);
        assert!(task.next_run_at.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_enqueues_only_due_tasks() {
        let engine = engine_with(Arc::new(LocalRunner));
        let now = Utc::now();

        let due_a = engine.create_task(interval_spec("due-a", true), now).unwrap();
        let due_b = engine.create_task(interval_spec("due-b", true), now).unwrap();
        let future = engine.create_task(interval_spec("future", true), now).unwrap();
        engine.create_task(interval_spec("inactive", false), now).unwrap();
        force_due(&engine, &due_a.id, now);
        force_due(&engine, &due_b.id, now);

        let dispatched = engine.dispatch_due(now, 10).unwrap();
        assert_eq!(dispatched, 2);
        assert_eq!(engine.store().kv_count(queue::QUEUE_PREFIX).unwrap(), 2);
        assert_eq!(engine.store().list_runs_for_task(&due_a.id, 10).unwrap().len(), 1);
        assert_eq!(engine.store().list_runs_for_task(&due_b.id, 10).unwrap().len(), 1);
        assert!(engine.store().list_runs_for_task(&future.id, 10).unwrap().is_empty());

        // Nothing left due
        assert_eq!(engine.dispatch_due(now, 10).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_process_empty_queue_returns_zero() {
        let engine = engine_with(Arc::new(LocalRunner));
        assert_eq!(engine.process_queue(10).await, 0);
    }

    #[tokio::test]
    async fn test_successful_run_updates_run_and_reschedules_task() {
        let engine = engine_with(Arc::new(LocalRunner));
        let now = Utc::now();
        let task = engine.create_task(interval_spec("scan", true), now).unwrap();
        force_due(&engine, &task.id, now);

        assert_eq!(engine.dispatch_due(now, 10).unwrap(), 1);
        assert_eq!(engine.process_queue(10).await, 1);

        let runs = engine.store().list_runs_for_task(&task.id, 10).unwrap();
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.batches_processed, 2);
        assert_eq!(run.success_count, 60);
        assert_eq!(run.fail_count, 0);
        assert_eq!(run.response_code, Some(200));
        assert!(run.duration_ms.is_some());
        assert_eq!(run.webhook_status.as_deref(), Some("skipped"));

        let task = engine.store().get_task(&task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Scheduled);
        assert_eq!(task.last_status.as_deref(), Some("completed"));
        // next_run_at strictly increases relative to completion
        assert!(task.next_run_at.unwrap() > run.completed_at.unwrap());
        assert!(task.last_result.is_some());
    }

    #[tokio::test]
    async fn test_manual_task_goes_inactive_after_success() {
        let engine = engine_with(Arc::new(LocalRunner));
        let now = Utc::now();
        let mut spec = interval_spec("one-shot", false);
        spec.cadence = Cadence::Manual;
        spec.schedule = ScheduleConfig::default();
        let task = engine.create_task(spec, now).unwrap();

        engine.trigger_task(&task.id, now).unwrap();
        assert_eq!(engine.process_queue(10).await, 1);

        let task = engine.store().get_task(&task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Inactive);
        assert!(task.next_run_at.is_none());
    }

    #[tokio::test]
    async fn test_process_respects_limit() {
        let engine = engine_with(Arc::new(LocalRunner));
        let now = Utc::now();
        for i in 0..3i64 {
            let task = engine
                .create_task(interval_spec(&format!("t{i}"), false), now)
                .unwrap();
            engine.trigger_task(&task.id, now - Duration::seconds(10 - i)).unwrap();
        }

        assert_eq!(engine.process_queue(2).await, 2);
        assert_eq!(engine.store().kv_count(queue::QUEUE_PREFIX).unwrap(), 1);
        assert_eq!(engine.process_queue(2).await, 1);
    }

    #[tokio::test]
    async fn test_failure_retries_with_backoff_then_fails() {
        let engine = engine_with(Arc::new(FailingRunner));
        let now = Utc::now();
        let mut spec = interval_spec("flaky", true);
        spec.retry_limit = 1;
        let task = engine.create_task(spec, now).unwrap();
        force_due(&engine, &task.id, now);

        // First attempt: run fails, task is rescheduled with backoff
        engine.dispatch_due(now, 10).unwrap();
        assert_eq!(engine.process_queue(10).await, 1);

        let after_first = engine.store().get_task(&task.id).unwrap().unwrap();
        assert_eq!(after_first.status, TaskStatus::Scheduled);
        assert_eq!(after_first.last_status.as_deref(), Some("retry"));
        assert_eq!(after_first.retry_attempts, 1);
        let next = after_first.next_run_at.unwrap();
        assert!(next > Utc::now() - Duration::seconds(5));
        assert!(next <= Utc::now() + Duration::minutes(1));

        let runs = engine.store().list_runs_for_task(&task.id, 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].error.as_deref(), Some("batch runner error: backend exploded"));

        // Second attempt: the retry budget is spent, the task fails
        let later = Utc::now();
        force_due(&engine, &task.id, later);
        engine.dispatch_due(later, 10).unwrap();
        assert_eq!(engine.process_queue(10).await, 1);

        let after_second = engine.store().get_task(&task.id).unwrap().unwrap();
        assert_eq!(after_second.status, TaskStatus::Failed);
        assert_eq!(after_second.last_status.as_deref(), Some("failed"));
        assert!(after_second.next_run_at.is_none());
        assert_eq!(engine.store().list_runs_for_task(&task.id, 10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stale_runs_are_swept() {
        let engine = engine_with(Arc::new(LocalRunner));
        let now = Utc::now();
        let task = engine.create_task(interval_spec("stuck", true), now).unwrap();

        // Simulate an executor that claimed and died mid-run
        let run = TaskRun::queued(&task.id, now - Duration::hours(2));
        engine.store().create_run(&run).unwrap();
        engine
            .store()
            .update_run(
                &run.id,
                &RunPatch {
                    status: Some(RunStatus::Running),
                    started_at: Some(now - Duration::hours(2)),
                    ..Default::default()
                },
            )
            .unwrap();
        engine
            .store()
            .update_task(
                &task.id,
                &TaskPatch { status: Some(TaskStatus::Running), ..Default::default() },
                now,
            )
            .unwrap();

        assert_eq!(engine.requeue_stale_runs(now), 1);

        let run = engine.store().get_run(&run.id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        // retry_limit 0: the task fails terminally
        let task = engine.store().get_task(&task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);

        // Nothing left to sweep
        assert_eq!(engine.requeue_stale_runs(now), 0);
    }

    #[test]
    fn test_trigger_unknown_task() {
        let engine = engine_with(Arc::new(LocalRunner));
        let err = engine.trigger_task("missing", Utc::now()).unwrap_err();
        assert!(matches!(err, ScanloopError::TaskNotFound(_)));
    }

    #[test]
    fn test_patch_task_transitions() {
        let engine = engine_with(Arc::new(LocalRunner));
        let now = Utc::now();
        let task = engine.create_task(interval_spec("ops", true), now).unwrap();

        // scheduled → paused clears next_run_at
        let paused = engine
            .patch_task(&task.id, TaskUpdate { status: Some(TaskStatus::Paused), ..Default::default() }, now)
            .unwrap();
        assert_eq!(paused.status, TaskStatus::Paused);
        assert!(paused.next_run_at.is_none());

        // paused → scheduled recomputes it
        let rescheduled = engine
            .patch_task(&task.id, TaskUpdate { status: Some(TaskStatus::Scheduled), ..Default::default() }, now)
            .unwrap();
        assert_eq!(rescheduled.status, TaskStatus::Scheduled);
        assert!(rescheduled.next_run_at.is_some());

        // scheduled → running is not an operator transition
        let err = engine
            .patch_task(&task.id, TaskUpdate { status: Some(TaskStatus::Running), ..Default::default() }, now)
            .unwrap_err();
        assert!(matches!(err, ScanloopError::InvalidTransition(_)));
    }

    #[test]
    fn test_patch_schedule_recomputes_next_run() {
        let engine = engine_with(Arc::new(LocalRunner));
        let now = Utc::now();
        let task = engine.create_task(interval_spec("tune", true), now).unwrap();
        let before = task.next_run_at.unwrap();

        let updated = engine
            .patch_task(
                &task.id,
                TaskUpdate {
                    schedule: Some(ScheduleConfig {
                        interval_minutes: Some(120),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                now,
            )
            .unwrap();
        let after = updated.next_run_at.unwrap();
        assert!(after > before);
        assert_eq!((after - now).num_minutes(), 120);
    }

    #[test]
    fn test_backoff_is_bounded() {
        assert_eq!(backoff_minutes(0), 1);
        assert_eq!(backoff_minutes(1), 2);
        assert_eq!(backoff_minutes(3), 8);
        assert_eq!(backoff_minutes(6), 60);
        assert_eq!(backoff_minutes(60), 60);
    }
}
