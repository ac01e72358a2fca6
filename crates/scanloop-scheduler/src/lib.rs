//! # Scanloop Scheduler
//!
//! The automation pipeline: cadence-to-next-run computation, the durable
//! queue protocol over the store's KV namespace, the dispatcher that turns
//! due tasks into queued runs, the executor that claims and runs them, and
//! the signed webhook notifier.
//!
//! ## Architecture
//! ```text
//! Heartbeat (tokio interval, or one-shot CLI/API calls)
//!   ├── dispatch_due:   scheduled tasks with next_run_at <= now
//!   │     └── enqueue → Run row + time-ordered KV entry (TTL 24h)
//!   ├── process_queue:  claim oldest entry → BatchRunner → run/task updates
//!   │     └── emit automation.run.completed / .failed
//!   │           ├── matching subscriptions (project-scoped or global)
//!   │           └── task direct webhook
//!   └── requeue_stale_runs: fail runs orphaned by a crashed executor
//! ```

pub mod cadence;
pub mod engine;
pub mod queue;
pub mod runner;
pub mod webhook;

pub use engine::{AutomationEngine, TaskSpec, TaskUpdate, run_heartbeat};
pub use queue::{EnqueueReason, QUEUE_PREFIX, build_queue_key, claim_next, enqueue_task};
pub use runner::{BatchRunner, HttpRunner, LocalRunner};
pub use webhook::{EVENT_RUN_COMPLETED, EVENT_RUN_FAILED, WebhookNotifier};
