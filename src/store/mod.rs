// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replay progress persistence.
//!
//! Rows are keyed by `(data_partition_id, replay_id, kind)` and written with
//! idempotent upserts. Reads always name the caller's partition, so a
//! replay id reused by another tenant resolves to a different job.
//!
//! A row that reached COMPLETED or FAILED is never overwritten. Upserts
//! against a terminal row are dropped by both the cache and the SQL.
//!
//! ```text
//!                 ┌──────────────────────────────────┐
//! upsert ───────► │ ProgressCache                    │ ◄─── get (hit)
//!                 │ (partition, replay_id) → kind→row │
//!                 └────────────────┬─────────────────┘
//!                                  │ write-through (sqlite only)
//!                                  ▼
//!                 ┌──────────────────────────────────┐
//!                 │ replay_progress                  │ ◄─── get (miss → load)
//!                 └──────────────────────────────────┘
//! ```

pub mod memory;
pub mod sqlite;

pub use memory::MemoryProgressStore;
pub use sqlite::SqliteProgressStore;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;
use crate::model::KindProgress;
use crate::tenant::TenantContext;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by [`ProgressStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Identity of a replay job: `(data_partition_id, replay_id)`.
pub type JobKey = (String, String);

pub fn job_key(data_partition_id: &str, replay_id: &str) -> JobKey {
    (data_partition_id.to_string(), replay_id.to_string())
}

/// Durable keyed progress rows.
pub trait ProgressStore: Send + Sync + 'static {
    /// Insert or replace the row for `(row.data_partition_id, row.replay_id, row.kind)`.
    ///
    /// Writes against a row that is already terminal are ignored.
    fn upsert_progress<'a>(&'a self, row: &'a KindProgress) -> StoreFuture<'a, ()>;

    /// All rows of a job in the caller's partition, ordered by kind. Empty if
    /// the job is unknown there.
    fn get_progress<'a>(
        &'a self,
        ctx: &'a TenantContext,
        replay_id: &'a str,
    ) -> StoreFuture<'a, Vec<KindProgress>>;

    fn get_kind_progress<'a>(
        &'a self,
        ctx: &'a TenantContext,
        replay_id: &'a str,
        kind: &'a str,
    ) -> StoreFuture<'a, Option<KindProgress>>;

    /// Delete jobs (in any partition) whose rows are all terminal and were
    /// last touched before `cutoff`. Returns the number of jobs removed.
    fn purge_finished_before<'a>(&'a self, cutoff: DateTime<Utc>) -> StoreFuture<'a, usize>;

    /// Release resources. Default is a no-op.
    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async {})
    }
}

/// Open the store selected by `config`.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn ProgressStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryProgressStore::new())),
        StoreBackend::Sqlite => {
            let store = SqliteProgressStore::open(&config.sqlite_path, config.wal_mode).await?;
            Ok(Arc::new(store))
        }
    }
}

/// In-process row cache shared by both store implementations.
#[derive(Debug, Default)]
pub struct ProgressCache {
    jobs: DashMap<JobKey, BTreeMap<String, KindProgress>>,
}

impl ProgressCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `row` unless the cached row for its key is terminal.
    /// Returns whether the row was written.
    pub fn upsert(&self, row: KindProgress) -> bool {
        let mut job = self
            .jobs
            .entry(job_key(&row.data_partition_id, &row.replay_id))
            .or_default();
        if job.get(&row.kind).is_some_and(|existing| existing.state.is_terminal()) {
            return false;
        }
        job.insert(row.kind.clone(), row);
        true
    }

    /// Replace a whole job, e.g. after loading it from disk.
    pub fn put_job(&self, key: JobKey, rows: Vec<KindProgress>) {
        let job = rows.into_iter().map(|row| (row.kind.clone(), row)).collect();
        self.jobs.insert(key, job);
    }

    pub fn get_job(&self, key: &JobKey) -> Option<Vec<KindProgress>> {
        self.jobs.get(key).map(|job| job.values().cloned().collect())
    }

    pub fn get_row(&self, key: &JobKey, kind: &str) -> Option<KindProgress> {
        self.jobs.get(key).and_then(|job| job.get(kind).cloned())
    }

    pub fn contains_job(&self, key: &JobKey) -> bool {
        self.jobs.contains_key(key)
    }

    pub fn remove_job(&self, key: &JobKey) {
        self.jobs.remove(key);
    }

    /// Keys of cached jobs eligible for purge at `cutoff`.
    pub fn finished_before(&self, cutoff: DateTime<Utc>) -> Vec<JobKey> {
        self.jobs
            .iter()
            .filter(|job| is_purgeable(job.value().values(), cutoff))
            .map(|job| job.key().clone())
            .collect()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

/// A job may be purged once every row is terminal and the newest update
/// is older than `cutoff`.
pub(crate) fn is_purgeable<'a>(
    rows: impl IntoIterator<Item = &'a KindProgress>,
    cutoff: DateTime<Utc>,
) -> bool {
    let mut newest: Option<DateTime<Utc>> = None;
    let mut any = false;
    for row in rows {
        any = true;
        if !row.state.is_terminal() {
            return false;
        }
        let touched = row.last_updated_at.or(row.started_at);
        newest = newest.max(touched);
    }
    any && newest.is_some_and(|t| t < cutoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ReplayOperation, ReplayState};

    fn row(replay_id: &str, kind: &str, state: ReplayState, at: DateTime<Utc>) -> KindProgress {
        let mut row = KindProgress::queued("p", replay_id, kind, ReplayOperation::Replay, 0, at);
        row.state = state;
        row
    }

    #[test]
    fn test_cache_upsert_replaces_same_key() {
        let cache = ProgressCache::new();
        let now = Utc::now();
        cache.upsert(row("r", "a", ReplayState::Queued, now));
        cache.upsert(row("r", "a", ReplayState::InProgress, now));
        cache.upsert(row("r", "b", ReplayState::Queued, now));

        let key = job_key("p", "r");
        let job = cache.get_job(&key).unwrap();
        assert_eq!(job.len(), 2);
        assert_eq!(cache.get_row(&key, "a").unwrap().state, ReplayState::InProgress);
    }

    #[test]
    fn test_cache_keeps_terminal_rows() {
        let cache = ProgressCache::new();
        let now = Utc::now();
        let mut done = row("r", "a", ReplayState::Completed, now);
        done.processed_records = 40;
        assert!(cache.upsert(done));

        let mut stale = row("r", "a", ReplayState::InProgress, now);
        stale.processed_records = 30;
        assert!(!cache.upsert(stale));

        let kept = cache.get_row(&job_key("p", "r"), "a").unwrap();
        assert_eq!(kept.state, ReplayState::Completed);
        assert_eq!(kept.processed_records, 40);
    }

    #[test]
    fn test_cache_separates_partitions() {
        let cache = ProgressCache::new();
        let now = Utc::now();
        cache.upsert(row("r", "a", ReplayState::Completed, now));
        let mut other = row("r", "a", ReplayState::Queued, now);
        other.data_partition_id = "q".to_string();
        assert!(cache.upsert(other));

        assert_eq!(
            cache.get_row(&job_key("p", "r"), "a").unwrap().state,
            ReplayState::Completed
        );
        assert_eq!(
            cache.get_row(&job_key("q", "r"), "a").unwrap().state,
            ReplayState::Queued
        );
        assert_eq!(cache.job_count(), 2);
    }

    #[test]
    fn test_purgeable_requires_all_terminal() {
        let old = Utc::now() - chrono::Duration::days(2);
        let cutoff = Utc::now() - chrono::Duration::days(1);

        let done = vec![
            row("r", "a", ReplayState::Completed, old),
            row("r", "b", ReplayState::Failed, old),
        ];
        assert!(is_purgeable(&done, cutoff));

        let running = vec![
            row("r", "a", ReplayState::Completed, old),
            row("r", "b", ReplayState::InProgress, old),
        ];
        assert!(!is_purgeable(&running, cutoff));
    }

    #[test]
    fn test_purgeable_respects_cutoff() {
        let cutoff = Utc::now() - chrono::Duration::days(1);
        let recent = vec![row("r", "a", ReplayState::Completed, Utc::now())];
        assert!(!is_purgeable(&recent, cutoff));
        assert!(!is_purgeable(&Vec::<KindProgress>::new(), cutoff));
    }
}
