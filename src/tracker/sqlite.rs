//! SQLite-backed tracker.
//!
//! Every tracked request becomes one row in `tracked_requests`, written inside
//! the transaction opened by [`Tracker::begin_transaction`].

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::info;

use super::{require_site_id, Tracker};
use crate::error::TrackerError;
use crate::request_set::{Environment, RequestSet, TrackingRequest};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tracked_requests (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    idsite          INTEGER NOT NULL,
    visitor_id      TEXT,
    url             TEXT,
    params          TEXT    NOT NULL,
    environment     TEXT    NOT NULL,
    -- unix time the request was captured, when known
    request_time    INTEGER,
    created_at      TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tracked_requests_site ON tracked_requests(idsite);
"#;

/// Creates the `tracked_requests` table if it does not exist.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<(), TrackerError> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;
    info!("Tracker schema ready");
    Ok(())
}

/// Tracker writing requests into SQLite.
pub struct SqliteTracker {
    pool: SqlitePool,
    tx: Option<Transaction<'static, Sqlite>>,
    environment: Environment,
    request_time: Option<i64>,
    requests_logged: u64,
    enabled: bool,
}

impl SqliteTracker {
    /// Opens (creating if missing) the database file and ensures the schema.
    pub async fn open(path: &str) -> Result<Self, TrackerError> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        Self::from_pool(pool).await
    }

    /// Wraps an existing pool, creating the table if it does not exist.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, TrackerError> {
        ensure_schema(&pool).await?;
        Ok(Self::with_pool(pool))
    }

    /// Wraps a pool whose schema is already in place.
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            tx: None,
            environment: Environment::new(),
            request_time: None,
            requests_logged: 0,
            enabled: true,
        }
    }

    /// Builder method to toggle recording.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns the number of stored requests, optionally for one site.
    pub async fn count_tracked(&self, site_id: Option<i64>) -> Result<i64, TrackerError> {
        let (count,): (i64,) = match site_id {
            Some(id) => {
                sqlx::query_as("SELECT COUNT(*) FROM tracked_requests WHERE idsite = ?1")
                    .bind(id)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as("SELECT COUNT(*) FROM tracked_requests")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }
}

#[async_trait]
impl Tracker for SqliteTracker {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn begin_transaction(&mut self) -> Result<(), TrackerError> {
        if let Some(stale) = self.tx.take() {
            stale.rollback().await?;
        }
        self.tx = Some(self.pool.begin().await?);
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<(), TrackerError> {
        let tx = self.tx.take().ok_or(TrackerError::NotInTransaction)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback_transaction(&mut self) -> Result<(), TrackerError> {
        let tx = self.tx.take().ok_or(TrackerError::NotInTransaction)?;
        tx.rollback().await?;
        Ok(())
    }

    fn restore_environment(&mut self, request_set: &RequestSet) {
        self.environment = request_set.environment().clone();
        self.request_time = request_set.time();
    }

    async fn track_request(&mut self, request: &TrackingRequest) -> Result<(), TrackerError> {
        let site_id = require_site_id(request)?;
        let params = serde_json::to_string(request)
            .map_err(|e| TrackerError::Failed(e.to_string()))?;
        let environment = serde_json::to_string(&self.environment)
            .map_err(|e| TrackerError::Failed(e.to_string()))?;

        let tx = self.tx.as_mut().ok_or(TrackerError::NotInTransaction)?;
        sqlx::query(
            r#"
            INSERT INTO tracked_requests
                (idsite, visitor_id, url, params, environment, request_time, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(site_id)
        .bind(request.visitor_identity())
        .bind(request.param("url"))
        .bind(params)
        .bind(environment)
        .bind(self.request_time)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await?;

        self.requests_logged += 1;
        Ok(())
    }

    fn requests_logged(&self) -> u64 {
        self.requests_logged
    }

    fn set_requests_logged(&mut self, count: u64) {
        self.requests_logged = count;
    }
}
