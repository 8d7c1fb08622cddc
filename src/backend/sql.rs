//! SQL-table backend.
//!
//! Emulates the key/value and list primitives on two SQLite tables:
//!
//! - `queuedtracking_kv`: one row per key, with an optional expiry in epoch
//!   milliseconds
//! - `queuedtracking_list`: one row per list entry; `id` (autoincrement) gives
//!   FIFO order within a `list_key`
//!
//! Each primitive is a single statement, so SQLite's statement atomicity gives
//! the same guarantees as the Redis scripts: the conditional upsert only
//! replaces an expired row, and compare-and-delete/expire carry the expected
//! value in their `WHERE` clause.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use super::{Backend, NO_EXPIRY_TTL_MILLIS};
use crate::error::BackendError;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS queuedtracking_kv (
    key         TEXT    NOT NULL PRIMARY KEY,
    value       TEXT    NOT NULL,
    -- epoch milliseconds; NULL means no expiry
    expires_at  INTEGER
);

CREATE TABLE IF NOT EXISTS queuedtracking_list (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    list_key    TEXT    NOT NULL,
    value       TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queuedtracking_list_key ON queuedtracking_list(list_key, id);
"#;

/// SQLite implementation of [`Backend`].
#[derive(Clone)]
pub struct SqlBackend {
    pool: SqlitePool,
}

impl SqlBackend {
    /// Opens (creating if missing) the database file and ensures the schema.
    pub async fn open(path: &str) -> Result<Self, BackendError> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))
            .map_err(|e| BackendError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(|e| BackendError::ConnectionFailed(e.to_string()))?;

        Self::from_pool(pool).await
    }

    /// Opens a private in-memory database.
    pub async fn in_memory() -> Result<Self, BackendError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| BackendError::ConnectionFailed(e.to_string()))?;

        Self::from_pool(pool).await
    }

    /// Wraps an existing pool, creating the tables if they do not exist.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, BackendError> {
        sqlx::query(SCHEMA_SQL).execute(&pool).await?;
        tracing::info!("SQL backend schema ready");
        Ok(Self { pool })
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Absolute expiry for a TTL; a zero TTL means no expiry.
fn expires_at(ttl: Duration) -> Option<i64> {
    if ttl.is_zero() {
        None
    } else {
        Some(now_millis() + ttl.as_millis() as i64)
    }
}

/// Escapes everything but `*` for SQLite's case-sensitive `GLOB`.
fn glob_to_sqlite(pattern: &str) -> String {
    let mut glob = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '?' => glob.push_str("[?]"),
            '[' => glob.push_str("[[]"),
            c => glob.push(c),
        }
    }
    glob
}

#[async_trait]
impl Backend for SqlBackend {
    async fn append_to_list(&self, key: &str, values: &[String]) -> Result<(), BackendError> {
        if values.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for value in values {
            sqlx::query("INSERT INTO queuedtracking_list (list_key, value) VALUES (?1, ?2)")
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn peek_first_n(&self, key: &str, n: usize) -> Result<Vec<String>, BackendError> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT value FROM queuedtracking_list WHERE list_key = ?1 ORDER BY id LIMIT ?2",
        )
        .bind(key)
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("value")).collect())
    }

    async fn trim_first_n(&self, key: &str, n: usize) -> Result<(), BackendError> {
        if n == 0 {
            return Ok(());
        }

        sqlx::query(
            r#"
            DELETE FROM queuedtracking_list
            WHERE id IN (
                SELECT id FROM queuedtracking_list WHERE list_key = ?1 ORDER BY id LIMIT ?2
            )
            "#,
        )
        .bind(key)
        .bind(n as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count(&self, key: &str) -> Result<usize, BackendError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM queuedtracking_list WHERE list_key = ?1")
                .bind(key)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as usize)
    }

    async fn has_at_least_n(&self, key: &str, n: usize) -> Result<bool, BackendError> {
        if n == 0 {
            return Ok(true);
        }

        let row = sqlx::query(
            "SELECT id FROM queuedtracking_list WHERE list_key = ?1 ORDER BY id LIMIT 1 OFFSET ?2",
        )
        .bind(key)
        .bind(n as i64 - 1)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO queuedtracking_kv (key, value, expires_at) VALUES (?1, ?2, ?3)
            ON CONFLICT (key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            WHERE queuedtracking_kv.expires_at IS NOT NULL
              AND queuedtracking_kv.expires_at <= ?4
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at(ttl))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let row = sqlx::query(
            r#"
            SELECT value FROM queuedtracking_kv
            WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)
            "#,
        )
        .bind(key)
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get("value")))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, BackendError> {
        let result = sqlx::query(
            r#"
            DELETE FROM queuedtracking_kv
            WHERE key = ?1 AND value = ?2 AND (expires_at IS NULL OR expires_at > ?3)
            "#,
        )
        .bind(key)
        .bind(expected)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            UPDATE queuedtracking_kv SET expires_at = ?3
            WHERE key = ?1 AND value = ?2 AND (expires_at IS NULL OR expires_at > ?4)
            "#,
        )
        .bind(key)
        .bind(expected)
        .bind(expires_at(ttl))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
        let glob = glob_to_sqlite(pattern);
        let rows = sqlx::query(
            r#"
            SELECT key FROM queuedtracking_kv
            WHERE key GLOB ?1 AND (expires_at IS NULL OR expires_at > ?2)
            UNION
            SELECT DISTINCT list_key FROM queuedtracking_list WHERE list_key GLOB ?1
            ORDER BY 1
            "#,
        )
        .bind(&glob)
        .bind(now_millis())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn time_to_live_millis(&self, key: &str) -> Result<u64, BackendError> {
        let now = now_millis();
        let row = sqlx::query(
            r#"
            SELECT expires_at FROM queuedtracking_kv
            WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)
            "#,
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            let expires: Option<i64> = row.get("expires_at");
            return Ok(match expires {
                Some(at) => (at - now).max(0) as u64,
                None => NO_EXPIRY_TTL_MILLIS,
            });
        }

        if self.count(key).await? > 0 {
            return Ok(NO_EXPIRY_TTL_MILLIS);
        }
        Ok(0)
    }

    async fn delete_key(&self, key: &str) -> Result<bool, BackendError> {
        let mut tx = self.pool.begin().await?;
        let values = sqlx::query("DELETE FROM queuedtracking_kv WHERE key = ?1")
            .bind(key)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let entries = sqlx::query("DELETE FROM queuedtracking_list WHERE list_key = ?1")
            .bind(key)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(values + entries > 0)
    }

    async fn flush_all(&self) -> Result<(), BackendError> {
        sqlx::query("DELETE FROM queuedtracking_kv; DELETE FROM queuedtracking_list;")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_escapes_sqlite_metacharacters() {
        assert_eq!(glob_to_sqlite("QueuedTrackingLock*"), "QueuedTrackingLock*");
        assert_eq!(glob_to_sqlite("what?*"), "what[?]*");
        assert_eq!(glob_to_sqlite("[a]*"), "[[]a]*");
    }

    #[test]
    fn test_expires_at_zero_ttl_is_none() {
        assert_eq!(expires_at(Duration::ZERO), None);
        let at = expires_at(Duration::from_secs(1)).expect("should expire");
        assert!(at > now_millis());
    }
}
