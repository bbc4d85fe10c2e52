// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Active-kind counting.
//!
//! Two paths with very different costs:
//!
//! - [`ActiveKindCounter::count_active`]: targeted lookup for a known kind
//!   list, chunked into `count_batch_size` kinds per backend call. Cheap
//!   enough to run on the request path for validation.
//! - [`ActiveKindCounter::count_active_all`]: full catalog scan. Only ever
//!   run from a background task.

use crate::backend::RecordRepository;
use crate::error::{ReplayError, Result};
use crate::resilience::with_timeout;
use crate::tenant::TenantContext;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Counts active records per kind through the record repository.
#[derive(Clone)]
pub struct ActiveKindCounter {
    records: Arc<dyn RecordRepository>,
    batch_size: usize,
    call_timeout: Duration,
    scan_timeout: Duration,
}

impl ActiveKindCounter {
    pub fn new(
        records: Arc<dyn RecordRepository>,
        batch_size: usize,
        call_timeout: Duration,
        scan_timeout: Duration,
    ) -> Self {
        Self {
            records,
            batch_size: batch_size.max(1),
            call_timeout,
            scan_timeout,
        }
    }

    /// Counts for `kinds`. Every requested kind is present in the result;
    /// kinds the backend did not report count as zero.
    pub async fn count_active(
        &self,
        ctx: &TenantContext,
        kinds: &[String],
    ) -> Result<HashMap<String, u64>> {
        let mut counts: HashMap<String, u64> = kinds.iter().map(|k| (k.clone(), 0)).collect();

        for chunk in kinds.chunks(self.batch_size) {
            let found = with_timeout("count_active", self.call_timeout, async {
                self.records
                    .count_active(ctx, chunk)
                    .await
                    .map_err(|e| ReplayError::backend("count_active", e))
            })
            .await?;

            for (kind, count) in found {
                if let Some(slot) = counts.get_mut(&kind) {
                    *slot = count;
                }
            }
        }

        debug!(kinds = kinds.len(), "Counted active records for kinds");
        Ok(counts)
    }

    /// Counts for every kind with at least one active record.
    pub async fn count_active_all(&self, ctx: &TenantContext) -> Result<HashMap<String, u64>> {
        let counts = with_timeout("count_active_all", self.scan_timeout, async {
            self.records
                .count_active_all(ctx)
                .await
                .map_err(|e| ReplayError::backend("count_active_all", e))
        })
        .await?;

        Ok(counts.into_iter().filter(|(_, count)| *count > 0).collect())
    }

    /// Fail-fast validation: every kind must have at least one active record.
    ///
    /// Rejects the whole list if any kind is empty, naming the offenders.
    pub async fn validate_kinds(
        &self,
        ctx: &TenantContext,
        kinds: &[String],
    ) -> Result<HashMap<String, u64>> {
        let counts = self.count_active(ctx, kinds).await?;

        let missing: Vec<&str> = kinds
            .iter()
            .filter(|kind| counts.get(*kind).copied().unwrap_or(0) == 0)
            .map(String::as_str)
            .collect();

        if !missing.is_empty() {
            return Err(ReplayError::Validation(format!(
                "The requested kind does not exist: {}",
                missing.join(", ")
            )));
        }
        Ok(counts)
    }
}

impl std::fmt::Debug for ActiveKindCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveKindCounter")
            .field("batch_size", &self.batch_size)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, BoxFuture, InMemoryRecordRepository, Page};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> TenantContext {
        TenantContext::new("p")
    }

    fn kinds(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn counter_over(repo: Arc<dyn RecordRepository>, batch: usize) -> ActiveKindCounter {
        ActiveKindCounter::new(repo, batch, Duration::from_secs(1), Duration::from_secs(1))
    }

    /// Counts calls and chunk sizes; optionally hangs.
    struct ChunkRecorder {
        calls: AtomicUsize,
        max_chunk: AtomicUsize,
        hang: bool,
    }

    impl RecordRepository for ChunkRecorder {
        fn count_active<'a>(
            &'a self,
            _ctx: &'a TenantContext,
            kinds: &'a [String],
        ) -> BoxFuture<'a, HashMap<String, u64>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.max_chunk.fetch_max(kinds.len(), Ordering::SeqCst);
                if self.hang {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok(kinds.iter().map(|k| (k.clone(), 1)).collect())
            })
        }

        fn count_active_all<'a>(&'a self, _ctx: &'a TenantContext) -> BoxFuture<'a, HashMap<String, u64>> {
            Box::pin(async { Err(BackendError::Unavailable("scan throttled".into())) })
        }

        fn list_active_ids_page<'a>(
            &'a self,
            _ctx: &'a TenantContext,
            _kind: &'a str,
            _continuation: Option<String>,
            _limit: usize,
        ) -> BoxFuture<'a, Page<String>> {
            Box::pin(async { Ok(Page::empty()) })
        }

        fn list_kinds_page<'a>(
            &'a self,
            _ctx: &'a TenantContext,
            _continuation: Option<String>,
            _limit: usize,
        ) -> BoxFuture<'a, Page<String>> {
            Box::pin(async { Ok(Page::empty()) })
        }
    }

    #[tokio::test]
    async fn test_count_active_fills_zeroes() {
        let repo = InMemoryRecordRepository::new();
        repo.seed("p", "a", 2);
        let counter = counter_over(Arc::new(repo), 10);

        let counts = counter.count_active(&ctx(), &kinds(&["a", "b"])).await.unwrap();
        assert_eq!(counts.get("a"), Some(&2));
        assert_eq!(counts.get("b"), Some(&0));
    }

    #[tokio::test]
    async fn test_count_active_chunks_requests() {
        let recorder = Arc::new(ChunkRecorder {
            calls: AtomicUsize::new(0),
            max_chunk: AtomicUsize::new(0),
            hang: false,
        });
        let counter = counter_over(recorder.clone(), 10);
        let many: Vec<String> = (0..25).map(|i| format!("k{i}")).collect();

        let counts = counter.count_active(&ctx(), &many).await.unwrap();
        assert_eq!(counts.len(), 25);
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 3);
        assert_eq!(recorder.max_chunk.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_validate_rejects_any_empty_kind() {
        let repo = InMemoryRecordRepository::new();
        repo.seed("p", "k2", 4);
        let counter = counter_over(Arc::new(repo), 10);

        let err = counter
            .validate_kinds(&ctx(), &kinds(&["k1", "k2"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::Validation(_)));
        assert!(err.to_string().contains("k1"));
        assert!(!err.to_string().contains("k2"));
    }

    #[tokio::test]
    async fn test_validate_accepts_populated_kinds() {
        let repo = InMemoryRecordRepository::new();
        repo.seed("p", "k1", 1);
        repo.seed("p", "k2", 4);
        let counter = counter_over(Arc::new(repo), 1);

        let counts = counter.validate_kinds(&ctx(), &kinds(&["k1", "k2"])).await.unwrap();
        assert_eq!(counts.get("k2"), Some(&4));
    }

    #[tokio::test]
    async fn test_count_active_times_out() {
        let recorder = Arc::new(ChunkRecorder {
            calls: AtomicUsize::new(0),
            max_chunk: AtomicUsize::new(0),
            hang: true,
        });
        let counter = ActiveKindCounter::new(
            recorder,
            10,
            Duration::from_millis(20),
            Duration::from_secs(1),
        );
        let err = counter.count_active(&ctx(), &kinds(&["a"])).await.unwrap_err();
        assert!(matches!(err, ReplayError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_count_active_all_wraps_backend_error() {
        let recorder = Arc::new(ChunkRecorder {
            calls: AtomicUsize::new(0),
            max_chunk: AtomicUsize::new(0),
            hang: false,
        });
        let err = counter_over(recorder, 10).count_active_all(&ctx()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("count_active_all"));
    }
}
