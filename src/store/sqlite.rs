// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable progress store backed by SQLite.
//!
//! # Write-Through Cache
//!
//! Every upsert goes to disk first, then to the in-process
//! [`ProgressCache`]. Reads are served from the cache. A job that is not
//! cached (e.g. after a restart) is loaded from disk in full on first
//! access, so the cache never holds a partial job.
//!
//! The upsert's `DO UPDATE` only fires while the stored row is still
//! QUEUED or IN_PROGRESS, so a finished row stays finished on disk too.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended by concurrent kind tasks. We handle this with:
//! - Automatic retry with exponential backoff
//! - A fixed retry budget (5 attempts)
//! - A busy timeout on every connection
//!
//! ## Schema
//!
//! ```text
//! replay_progress
//!   (data_partition_id, replay_id, kind)  PRIMARY KEY
//!   operation, state   TEXT
//!   total_records, processed_records   INTEGER
//!   started_at, last_updated_at        INTEGER (unix millis, nullable)
//!   filter             TEXT (JSON, nullable)
//!   last_cursor        TEXT (nullable)
//! ```

use super::{job_key, JobKey, ProgressCache, ProgressStore, StoreFuture};
use crate::error::{ReplayError, Result};
use crate::model::{KindProgress, ReplayFilter, ReplayOperation, ReplayState};
use crate::tenant::TenantContext;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const UPSERT_SQL: &str = r#"
    INSERT INTO replay_progress (
        data_partition_id, replay_id, kind, operation, state, total_records,
        processed_records, started_at, last_updated_at, filter, last_cursor
    )
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(data_partition_id, replay_id, kind) DO UPDATE SET
        operation = excluded.operation,
        state = excluded.state,
        total_records = excluded.total_records,
        processed_records = excluded.processed_records,
        started_at = excluded.started_at,
        last_updated_at = excluded.last_updated_at,
        filter = excluded.filter,
        last_cursor = excluded.last_cursor
    WHERE replay_progress.state NOT IN ('COMPLETED', 'FAILED')
"#;

const SELECT_JOB_SQL: &str = r#"
    SELECT data_partition_id, replay_id, kind, operation, state, total_records,
           processed_records, started_at, last_updated_at, filter, last_cursor
    FROM replay_progress
    WHERE data_partition_id = ? AND replay_id = ?
    ORDER BY kind
"#;

const PURGEABLE_SQL: &str = r#"
    SELECT data_partition_id, replay_id
    FROM replay_progress
    GROUP BY data_partition_id, replay_id
    HAVING SUM(CASE WHEN state IN ('COMPLETED', 'FAILED') THEN 0 ELSE 1 END) = 0
       AND MAX(COALESCE(last_updated_at, started_at, 0)) < ?
"#;

type ProgressRecord = (
    String,
    String,
    String,
    String,
    String,
    i64,
    i64,
    Option<i64>,
    Option<i64>,
    Option<String>,
    Option<String>,
);

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

fn millis_to_utc(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}

fn decode_record(record: ProgressRecord) -> Result<KindProgress> {
    let (
        data_partition_id,
        replay_id,
        kind,
        operation,
        state,
        total_records,
        processed_records,
        started_at,
        last_updated_at,
        filter,
        last_cursor,
    ) = record;

    let operation = ReplayOperation::parse(Some(&operation)).map_err(|_| {
        ReplayError::Internal(format!("unknown operation '{operation}' in progress store"))
    })?;
    let state = ReplayState::from_str(&state)?;
    let filter = filter
        .map(|raw| serde_json::from_str::<ReplayFilter>(&raw))
        .transpose()
        .map_err(|e| ReplayError::Internal(format!("corrupt filter in progress store: {e}")))?;

    Ok(KindProgress {
        data_partition_id,
        replay_id,
        kind,
        operation,
        state,
        total_records,
        processed_records,
        started_at: millis_to_utc(started_at),
        last_updated_at: millis_to_utc(last_updated_at),
        filter,
        last_cursor,
    })
}

/// Progress rows persisted in SQLite with a write-through cache.
pub struct SqliteProgressStore {
    pool: SqlitePool,
    cache: ProgressCache,
    wal_mode: bool,
    path: String,
}

impl SqliteProgressStore {
    /// Open (or create) the database at `path`. `":memory:"` gives a
    /// private in-memory database.
    pub async fn open(path: impl AsRef<Path>, wal_mode: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, wal_mode, "Initializing progress store");

        let in_memory = path_str == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path_str)
        };
        let journal = if wal_mode && !in_memory {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| ReplayError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        // An in-memory database exists per connection.
        let max_connections = if in_memory { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replay_progress (
                data_partition_id TEXT NOT NULL,
                replay_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                operation TEXT NOT NULL,
                state TEXT NOT NULL,
                total_records INTEGER NOT NULL DEFAULT 0,
                processed_records INTEGER NOT NULL DEFAULT 0,
                started_at INTEGER,
                last_updated_at INTEGER,
                filter TEXT,
                last_cursor TEXT,
                PRIMARY KEY (data_partition_id, replay_id, kind)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            cache: ProgressCache::new(),
            wal_mode: wal_mode && !in_memory,
            path: path_str,
        })
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    async fn load_job(&self, key: &JobKey) -> Result<Vec<KindProgress>> {
        let pool = &self.pool;
        let (partition, replay_id) = (key.0.as_str(), key.1.as_str());
        let records: Vec<ProgressRecord> = execute_with_retry("progress_load", || async move {
            sqlx::query_as::<_, ProgressRecord>(SELECT_JOB_SQL)
                .bind(partition)
                .bind(replay_id)
                .fetch_all(pool)
                .await
        })
        .await?;

        let rows = records
            .into_iter()
            .map(decode_record)
            .collect::<Result<Vec<_>>>()?;

        if !rows.is_empty() {
            debug!(
                partition = %partition,
                replay_id = %replay_id,
                rows = rows.len(),
                "Loaded replay job from disk"
            );
            self.cache.put_job(key.clone(), rows.clone());
        }
        Ok(rows)
    }

    async fn write_row(&self, row: &KindProgress) -> Result<()> {
        let filter = row
            .filter
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| ReplayError::Internal(format!("cannot encode filter: {e}")))?;
        let filter = filter.as_deref();
        let started_at = row.started_at.map(|t| t.timestamp_millis());
        let last_updated_at = row.last_updated_at.map(|t| t.timestamp_millis());
        let pool = &self.pool;

        execute_with_retry("progress_upsert", || async move {
            sqlx::query(UPSERT_SQL)
                .bind(row.data_partition_id.as_str())
                .bind(row.replay_id.as_str())
                .bind(row.kind.as_str())
                .bind(row.operation.as_str())
                .bind(row.state.as_str())
                .bind(row.total_records)
                .bind(row.processed_records)
                .bind(started_at)
                .bind(last_updated_at)
                .bind(filter)
                .bind(row.last_cursor.as_deref())
                .execute(pool)
                .await
        })
        .await?;
        Ok(())
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("progress_checkpoint", || async move {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }
}

impl ProgressStore for SqliteProgressStore {
    fn upsert_progress<'a>(&'a self, row: &'a KindProgress) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.write_row(row).await?;
            let key = job_key(&row.data_partition_id, &row.replay_id);
            if !self.cache.contains_job(&key) {
                self.load_job(&key).await?;
            } else if !self.cache.upsert(row.clone()) {
                debug!(replay_id = %row.replay_id, kind = %row.kind, "Ignoring write to finished row");
            }
            Ok(())
        })
    }

    fn get_progress<'a>(
        &'a self,
        ctx: &'a TenantContext,
        replay_id: &'a str,
    ) -> StoreFuture<'a, Vec<KindProgress>> {
        Box::pin(async move {
            let key = job_key(&ctx.data_partition_id, replay_id);
            match self.cache.get_job(&key) {
                Some(rows) => Ok(rows),
                None => self.load_job(&key).await,
            }
        })
    }

    fn get_kind_progress<'a>(
        &'a self,
        ctx: &'a TenantContext,
        replay_id: &'a str,
        kind: &'a str,
    ) -> StoreFuture<'a, Option<KindProgress>> {
        Box::pin(async move {
            let key = job_key(&ctx.data_partition_id, replay_id);
            if !self.cache.contains_job(&key) {
                self.load_job(&key).await?;
            }
            Ok(self.cache.get_row(&key, kind))
        })
    }

    fn purge_finished_before<'a>(&'a self, cutoff: DateTime<Utc>) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let pool = &self.pool;
            let cutoff_ms = cutoff.timestamp_millis();

            let keys: Vec<JobKey> = execute_with_retry("progress_purge_scan", || async move {
                sqlx::query_as::<_, JobKey>(PURGEABLE_SQL)
                    .bind(cutoff_ms)
                    .fetch_all(pool)
                    .await
            })
            .await?;

            for key in &keys {
                let (partition, replay_id) = (key.0.as_str(), key.1.as_str());
                execute_with_retry("progress_purge", || async move {
                    sqlx::query(
                        "DELETE FROM replay_progress WHERE data_partition_id = ? AND replay_id = ?",
                    )
                    .bind(partition)
                    .bind(replay_id)
                    .execute(pool)
                    .await
                })
                .await?;
                self.cache.remove_job(key);
            }

            if !keys.is_empty() {
                info!(jobs = keys.len(), "Purged finished replay jobs");
            }
            Ok(keys.len())
        })
    }

    fn close<'a>(&'a self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if self.wal_mode {
                if let Err(e) = self.checkpoint().await {
                    warn!(error = %e, "Failed to checkpoint WAL on close");
                }
            }
            self.pool.close().await;
            info!("Progress store closed");
        })
    }
}

impl std::fmt::Debug for SqliteProgressStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteProgressStore")
            .field("path", &self.path)
            .field("wal_mode", &self.wal_mode)
            .field("cached_jobs", &self.cache.job_count())
            .finish()
    }
}
