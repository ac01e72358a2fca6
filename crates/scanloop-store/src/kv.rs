//! Sorted key-value namespace with TTL — the durable substrate the queue is
//! built on.
//!
//! Keys order lexicographically; `kv_first_ready` returns the smallest key
//! whose `ready_at` has passed. Deletion reports the affected-row count so a
//! claimer can tell whether it actually consumed the entry or lost the race.

use rusqlite::params;
use scanloop_core::error::{Result, ScanloopError};

use crate::db::StoreDb;

impl StoreDb {
    /// Insert or replace an entry. `ready_at` / `expires_at` are epoch ms.
    pub fn kv_put(&self, key: &str, value: &str, ready_at: i64, expires_at: i64) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO kv_entries (key, value, ready_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![key, value, ready_at, expires_at],
            )
            .map_err(|e| ScanloopError::Store(format!("KV put: {e}")))?;
        Ok(())
    }

    /// The lexicographically-smallest ready, unexpired entry under a prefix.
    pub fn kv_first_ready(&self, prefix: &str, now_ms: i64) -> Result<Option<(String, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT key, value FROM kv_entries \
                 WHERE key LIKE ?1 || '%' \
                   AND ready_at <= ?2 AND expires_at > ?2 \
                 ORDER BY key ASC LIMIT 1",
            )
            .map_err(|e| ScanloopError::Store(format!("KV first: {e}")))?;
        let mut rows = stmt
            .query_map(params![prefix, now_ms], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| ScanloopError::Store(format!("KV first: {e}")))?;
        Ok(rows.next().transpose().map_err(|e| ScanloopError::Store(e.to_string()))?)
    }

    /// Delete an entry. Returns whether a row was actually removed — the
    /// claim-consumption check.
    pub fn kv_delete(&self, key: &str) -> Result<bool> {
        let affected = self
            .conn()?
            .execute("DELETE FROM kv_entries WHERE key = ?1", [key])
            .map_err(|e| ScanloopError::Store(format!("KV delete: {e}")))?;
        Ok(affected == 1)
    }

    /// Drop entries whose TTL has lapsed. Returns how many were removed.
    pub fn kv_sweep_expired(&self, now_ms: i64) -> Result<usize> {
        let removed = self
            .conn()?
            .execute("DELETE FROM kv_entries WHERE expires_at <= ?1", [now_ms])
            .map_err(|e| ScanloopError::Store(format!("KV sweep: {e}")))?;
        if removed > 0 {
            tracing::debug!("swept {removed} expired KV entries");
        }
        Ok(removed)
    }

    /// Number of entries under a prefix (queue depth).
    pub fn kv_count(&self, prefix: &str) -> Result<i64> {
        self.conn()?
            .query_row(
                "SELECT COUNT(*) FROM kv_entries WHERE key LIKE ?1 || '%'",
                [prefix],
                |r| r.get(0),
            )
            .map_err(|e| ScanloopError::Store(format!("KV count: {e}")))
    }
}
