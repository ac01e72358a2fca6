//! Database handle and schema migrations.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use scanloop_core::error::{Result, ScanloopError};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Scanloop system-of-record database.
pub struct StoreDb {
    conn: Mutex<Connection>,
}

impl StoreDb {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| ScanloopError::Store(format!("DB open: {e}")))?;

        // WAL mode for concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();

        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ScanloopError::Store(format!("DB open: {e}")))?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ScanloopError::Store("connection lock poisoned".into()))
    }

    /// Create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            -- Automation task definitions
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                project_id TEXT,
                status TEXT NOT NULL DEFAULT 'inactive',
                cadence TEXT NOT NULL DEFAULT 'manual',
                timezone TEXT NOT NULL DEFAULT 'UTC',
                schedule TEXT NOT NULL DEFAULT '{}',       -- JSON
                targets TEXT NOT NULL DEFAULT '[]',        -- JSON array
                last_run_at TEXT,
                next_run_at TEXT,
                last_status TEXT,
                webhook_url TEXT,
                webhook_secret TEXT,
                retry_limit INTEGER NOT NULL DEFAULT 0,
                retry_attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT 'null',     -- JSON
                last_result TEXT                           -- JSON
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(status, next_run_at);

            -- Execution attempts, one row per enqueue
            CREATE TABLE IF NOT EXISTS task_runs (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                queued_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                duration_ms INTEGER,
                batches_processed INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                fail_count INTEGER NOT NULL DEFAULT 0,
                webhook_status TEXT,
                response_code INTEGER,
                error TEXT,
                sample_report_id TEXT,
                metadata TEXT NOT NULL DEFAULT 'null'      -- JSON
            );
            CREATE INDEX IF NOT EXISTS idx_runs_task ON task_runs(task_id, queued_at);
            CREATE INDEX IF NOT EXISTS idx_runs_stale ON task_runs(status, started_at);

            -- Webhook subscriptions
            CREATE TABLE IF NOT EXISTS webhook_subscriptions (
                id TEXT PRIMARY KEY,
                project_id TEXT,
                name TEXT NOT NULL,
                url TEXT NOT NULL,
                secret TEXT NOT NULL,
                events TEXT NOT NULL DEFAULT '[]',         -- JSON array
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_delivery_at TEXT
            );

            -- Delivery audit log, append-only
            CREATE TABLE IF NOT EXISTS webhook_deliveries (
                id TEXT PRIMARY KEY,
                subscription_id TEXT,
                event TEXT NOT NULL,
                status TEXT NOT NULL,
                response_code INTEGER,
                error TEXT,
                payload TEXT NOT NULL,
                delivered_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_deliveries_sub
                ON webhook_deliveries(subscription_id, delivered_at);

            -- Sorted key-value namespace (queue entries live here)
            CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                ready_at INTEGER NOT NULL DEFAULT 0,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_kv_expiry ON kv_entries(expires_at);
         ",
            )
            .map_err(|e| ScanloopError::Store(format!("Migration: {e}")))?;
        Ok(())
    }
}

// ─── Timestamp encoding ───────────────────────────────────────────────────

// Fixed-width RFC 3339 with millisecond precision, so TEXT comparison in SQL
// orders chronologically.

pub(crate) fn ts_to_string(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn opt_ts_to_string(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(ts_to_string)
}

pub(crate) fn ts_from_string(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

pub(crate) fn opt_ts_from_string(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().and_then(ts_from_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_migrate() {
        let db = StoreDb::open_in_memory().unwrap();
        assert!(db.list_recent_tasks(10).unwrap().is_empty());
    }

    #[test]
    fn test_timestamp_round_trip_is_fixed_width() {
        let a = ts_to_string(Utc::now());
        let b = ts_to_string(Utc::now());
        assert_eq!(a.len(), b.len());
        assert!(ts_from_string(&a).is_some());
    }
}
