//! # Scanloop Store
//!
//! SQLite-backed system of record. Holds the durable task/run tables, webhook
//! subscriptions with their append-only delivery log, and the sorted
//! key-value namespace the queue is built on.
//!
//! All state transitions are single-row updates; there are no multi-row
//! transactions. Conditional updates (`rows_affected` checks) provide the
//! dispatch guard and the queue claim.

mod db;
mod kv;
mod tasks;
mod webhooks;

pub use db::StoreDb;
pub use tasks::{NewTask, RunPatch, TaskPatch};
