// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Parallel replay dispatcher.
//!
//! One task per kind. Kinds run concurrently, bounded by a shared
//! [`WorkerPool`]; pages within a kind run strictly in order because each
//! page resumes from the previous page's continuation.
//!
//! # Per-Kind Flow
//!
//! ```text
//! load row ── terminal? ──yes──► skip
//!    │
//!    ▼
//! IN_PROGRESS ──► PageIterator(last_cursor) ──► publish in batches ──► persist row
//!                      ▲                                                   │
//!                      └─────────────── continuation? ─────────────────────┘
//!                                             │ none
//!                                             ▼
//!                                         COMPLETED
//! ```
//!
//! Any error inside a kind marks that kind FAILED and nothing else.
//! Progress is persisted after the page's notifications are published, so a
//! crash re-publishes at most one page (at-least-once).
//!
//! A kind task first claims `(partition, replay_id, kind)`. While the claim
//! is held, a second dispatch of the same job reports the kind as
//! [`KindOutcome::InFlight`] and leaves it alone.

use crate::backend::{NotificationPublisher, RecordChangedEvent, RecordRepository};
use crate::config::ReplayConfig;
use crate::cursor::PageIterator;
use crate::error::{ReplayError, Result};
use crate::metrics;
use crate::model::{KindProgress, ReplayOperation, ReplayState};
use crate::resilience::{with_timeout, PublishRetry, RateLimiter, WorkerPool};
use crate::store::ProgressStore;
use crate::tenant::TenantContext;
use chrono::Utc;
use dashmap::DashSet;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Work handed to the dispatcher for one replay.
#[derive(Debug, Clone)]
pub struct DispatchJob {
    /// Captured request context. Kind tasks derive their own correlation ids from it.
    pub ctx: TenantContext,
    pub replay_id: String,
    pub operation: ReplayOperation,
    pub kinds: Vec<String>,
    /// Pre-fetched active counts. Missing entries fall back to the processed count.
    pub totals: HashMap<String, u64>,
}

/// Terminal outcome of one kind task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindOutcome {
    Completed,
    Failed,
    /// Already terminal from an earlier trigger.
    Skipped,
    /// The worker pool closed before the kind started; the row stays QUEUED.
    Interrupted,
    /// Another dispatch of the same job is already driving this kind.
    InFlight,
}

/// Per-kind outcomes of one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub interrupted: Vec<String>,
    pub in_flight: Vec<String>,
}

impl DispatchSummary {
    fn record(&mut self, kind: String, outcome: KindOutcome) {
        match outcome {
            KindOutcome::Completed => self.completed.push(kind),
            KindOutcome::Failed => self.failed.push(kind),
            KindOutcome::Skipped => self.skipped.push(kind),
            KindOutcome::Interrupted => self.interrupted.push(kind),
            KindOutcome::InFlight => self.in_flight.push(kind),
        }
    }

    pub fn total(&self) -> usize {
        self.completed.len()
            + self.failed.len()
            + self.skipped.len()
            + self.interrupted.len()
            + self.in_flight.len()
    }

    /// Whether every kind of this dispatch reached a terminal state here.
    pub fn is_final(&self) -> bool {
        self.interrupted.is_empty() && self.in_flight.is_empty()
    }
}

/// `(data_partition_id, replay_id, kind)`
type KindKey = (String, String, String);

/// Ownership of one kind key; released on drop.
struct KindClaim {
    claims: Arc<DashSet<KindKey>>,
    key: KindKey,
}

impl Drop for KindClaim {
    fn drop(&mut self) {
        self.claims.remove(&self.key);
    }
}

/// Fans replay work out over kinds.
///
/// Cheap to clone; all clones share the same worker pool and kind claims.
#[derive(Clone)]
pub struct ReplayDispatcher {
    records: Arc<dyn RecordRepository>,
    publisher: Arc<dyn NotificationPublisher>,
    store: Arc<dyn ProgressStore>,
    pool: Arc<WorkerPool>,
    rate_limiter: Option<Arc<RateLimiter>>,
    pages: PageIterator,
    retry: PublishRetry,
    page_size: usize,
    publish_batch_size: usize,
    call_timeout: Duration,
    active: Arc<AtomicUsize>,
    claims: Arc<DashSet<KindKey>>,
}

impl ReplayDispatcher {
    pub fn new(
        records: Arc<dyn RecordRepository>,
        publisher: Arc<dyn NotificationPublisher>,
        store: Arc<dyn ProgressStore>,
        config: &ReplayConfig,
    ) -> Self {
        let dispatcher = &config.dispatcher;

        let rate_limiter = dispatcher.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled for notification publishing"
            );
            Arc::new(RateLimiter::new(cfg))
        });

        Self {
            records,
            publisher,
            store,
            pool: Arc::new(WorkerPool::new(dispatcher.max_concurrent_kinds)),
            rate_limiter,
            pages: PageIterator::from_config(&config.pagination),
            retry: PublishRetry::new(dispatcher.publish_retry_attempts),
            page_size: dispatcher.page_size.max(1),
            publish_batch_size: dispatcher.publish_batch_size.max(1),
            call_timeout: config.timeouts.backend_call_duration(),
            active: Arc::new(AtomicUsize::new(0)),
            claims: Arc::new(DashSet::new()),
        }
    }

    /// Override the publish backoff (tests use short delays).
    pub fn with_retry(mut self, retry: PublishRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Kind tasks currently holding a worker slot.
    pub fn active_kinds(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Whether a kind task currently owns this kind of the job.
    pub fn is_in_flight(&self, data_partition_id: &str, replay_id: &str, kind: &str) -> bool {
        self.claims.contains(&(
            data_partition_id.to_string(),
            replay_id.to_string(),
            kind.to_string(),
        ))
    }

    fn claim(&self, data_partition_id: &str, replay_id: &str, kind: &str) -> Option<KindClaim> {
        let key = (
            data_partition_id.to_string(),
            replay_id.to_string(),
            kind.to_string(),
        );
        self.claims.insert(key.clone()).then(|| KindClaim {
            claims: Arc::clone(&self.claims),
            key,
        })
    }

    /// Stop handing out worker slots. Kinds still waiting stay QUEUED.
    pub fn close(&self) {
        self.pool.close();
    }

    /// Process every kind of `job` and wait for all of them.
    pub async fn dispatch(&self, job: DispatchJob) -> DispatchSummary {
        let DispatchJob {
            ctx,
            replay_id,
            operation,
            kinds,
            totals,
        } = job;

        info!(replay_id = %replay_id, kinds = kinds.len(), "Dispatching replay");
        let mut tasks = JoinSet::new();

        for (index, kind) in kinds.into_iter().enumerate() {
            let this = self.clone();
            let ctx = ctx.for_kind(index + 1);
            let replay_id = replay_id.clone();
            let total = totals.get(&kind).copied();
            let span = info_span!(
                "replay_kind",
                replay_id = %replay_id,
                kind = %kind,
                correlation_id = %ctx.correlation_id,
            );

            metrics::record_kind_dispatched();
            tasks.spawn(
                async move {
                    let outcome = this.run_kind(&ctx, &replay_id, &kind, operation, total).await;
                    (kind, outcome)
                }
                .instrument(span),
            );
        }

        let mut summary = DispatchSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((kind, outcome)) => summary.record(kind, outcome),
                Err(e) => error!(replay_id = %replay_id, error = %e, "Kind task panicked"),
            }
        }

        info!(
            replay_id = %replay_id,
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            skipped = summary.skipped.len(),
            interrupted = summary.interrupted.len(),
            in_flight = summary.in_flight.len(),
            "Replay dispatch finished"
        );
        summary
    }

    /// One kind, from worker slot to terminal state.
    async fn run_kind(
        &self,
        ctx: &TenantContext,
        replay_id: &str,
        kind: &str,
        operation: ReplayOperation,
        total: Option<u64>,
    ) -> KindOutcome {
        let Some(_claim) = self.claim(&ctx.data_partition_id, replay_id, kind) else {
            debug!("Kind is already being replayed by another dispatch");
            return KindOutcome::InFlight;
        };
        let _permit = match self.pool.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                warn!(error = %e, "Worker pool closed before kind started");
                return KindOutcome::Interrupted;
            }
        };
        metrics::set_active_kind_tasks(self.active.fetch_add(1, Ordering::Relaxed) + 1);
        let started = Instant::now();

        let outcome = self.process_kind(ctx, replay_id, kind, operation, total).await;

        metrics::set_active_kind_tasks(self.active.fetch_sub(1, Ordering::Relaxed).saturating_sub(1));
        match outcome {
            KindOutcome::Completed => {
                metrics::record_kind_finished(ReplayState::Completed.as_str(), started.elapsed())
            }
            KindOutcome::Failed => {
                metrics::record_kind_finished(ReplayState::Failed.as_str(), started.elapsed())
            }
            KindOutcome::Skipped => metrics::record_kind_skipped(),
            KindOutcome::Interrupted | KindOutcome::InFlight => {}
        }
        outcome
    }

    async fn process_kind(
        &self,
        ctx: &TenantContext,
        replay_id: &str,
        kind: &str,
        operation: ReplayOperation,
        total: Option<u64>,
    ) -> KindOutcome {
        let mut row = match self.load_row(ctx, replay_id, kind, operation, total).await {
            Ok(row) => row,
            Err(e) => {
                error!(error = %e, "Could not load progress row");
                let mut fresh = KindProgress::queued(
                    ctx.data_partition_id.as_str(),
                    replay_id,
                    kind,
                    operation,
                    total_as_i64(total),
                    Utc::now(),
                );
                self.mark_failed(&mut fresh).await;
                return KindOutcome::Failed;
            }
        };

        if row.state.is_terminal() {
            debug!(state = %row.state, "Kind already finished, skipping");
            return KindOutcome::Skipped;
        }

        match self.drive_kind(ctx, &mut row, total).await {
            Ok(()) => {
                info!(processed = row.processed_records, "Kind replay completed");
                KindOutcome::Completed
            }
            Err(e) => {
                error!(
                    error = %e,
                    processed = row.processed_records,
                    "Kind replay failed"
                );
                self.mark_failed(&mut row).await;
                KindOutcome::Failed
            }
        }
    }

    async fn load_row(
        &self,
        ctx: &TenantContext,
        replay_id: &str,
        kind: &str,
        operation: ReplayOperation,
        total: Option<u64>,
    ) -> Result<KindProgress> {
        let existing = with_timeout(
            "get_kind_progress",
            self.call_timeout,
            self.store.get_kind_progress(ctx, replay_id, kind),
        )
        .await?;

        Ok(existing.unwrap_or_else(|| {
            KindProgress::queued(
                ctx.data_partition_id.as_str(),
                replay_id,
                kind,
                operation,
                total_as_i64(total),
                Utc::now(),
            )
        }))
    }

    /// Walk all pages of the kind, publishing and persisting as we go.
    async fn drive_kind(
        &self,
        ctx: &TenantContext,
        row: &mut KindProgress,
        total: Option<u64>,
    ) -> Result<()> {
        row.transition(ReplayState::InProgress, Utc::now())?;
        self.persist(row).await?;

        let kind = row.kind.clone();
        let mut continuation = row.last_cursor.clone();
        if continuation.is_some() {
            info!(processed = row.processed_records, "Resuming kind from stored cursor");
        }

        loop {
            let page = self.fetch_page(ctx, &kind, continuation.take()).await?;

            if page.items.is_empty() && page.continuation.is_some() {
                return Err(ReplayError::Internal(format!(
                    "backend returned no records for kind '{kind}' while reporting more"
                )));
            }

            for chunk in page.items.chunks(self.publish_batch_size) {
                let events: Vec<RecordChangedEvent> = chunk
                    .iter()
                    .map(|id| RecordChangedEvent::update(id.as_str(), kind.as_str()))
                    .collect();
                self.publish_with_retry(ctx, events).await?;
            }

            row.processed_records += page.items.len() as i64;
            row.last_cursor = page.continuation.clone();
            row.transition(ReplayState::InProgress, Utc::now())?;
            self.persist(row).await?;

            debug!(
                page_items = page.items.len(),
                processed = row.processed_records,
                "Page replayed"
            );

            match page.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }

        row.total_records = match total {
            Some(total) => total_as_i64(Some(total)),
            None => row.processed_records,
        };
        row.last_cursor = None;
        row.transition(ReplayState::Completed, Utc::now())?;
        self.persist(row).await
    }

    async fn fetch_page(
        &self,
        ctx: &TenantContext,
        kind: &str,
        start: Option<String>,
    ) -> Result<crate::backend::Page<String>> {
        let records = &self.records;
        let call_timeout = self.call_timeout;

        self.pages
            .collect(self.page_size, start, |token, remaining| async move {
                with_timeout("list_active_ids", call_timeout, async {
                    records
                        .list_active_ids_page(ctx, kind, token, remaining)
                        .await
                        .map_err(|e| ReplayError::backend("list_active_ids", e))
                })
                .await
            })
            .await
    }

    async fn publish_with_retry(
        &self,
        ctx: &TenantContext,
        events: Vec<RecordChangedEvent>,
    ) -> Result<()> {
        let count = events.len();
        let mut attempt = 0;

        loop {
            attempt += 1;
            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }

            let result = with_timeout("publish", self.call_timeout, async {
                self.publisher
                    .publish(ctx, events.clone())
                    .await
                    .map_err(|e| ReplayError::backend("publish", e))
            })
            .await;

            match result {
                Ok(()) => {
                    metrics::record_records_published(count);
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish failed, retrying"
                    );
                    metrics::record_publish_retry();
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn persist(&self, row: &KindProgress) -> Result<()> {
        with_timeout(
            "upsert_progress",
            self.call_timeout,
            self.store.upsert_progress(row),
        )
        .await
    }

    /// Best effort: the kind has already failed, so a failed write is only logged.
    async fn mark_failed(&self, row: &mut KindProgress) {
        if let Err(e) = row.transition(ReplayState::Failed, Utc::now()) {
            warn!(error = %e, "Cannot mark kind as failed");
            return;
        }
        if let Err(e) = self.persist(row).await {
            error!(error = %e, "Failed to persist FAILED state");
        }
    }
}

fn total_as_i64(total: Option<u64>) -> i64 {
    total
        .map(|t| i64::try_from(t).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

impl std::fmt::Debug for ReplayDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayDispatcher")
            .field("page_size", &self.page_size)
            .field("publish_batch_size", &self.publish_batch_size)
            .field("max_concurrent", &self.pool.size())
            .field("active", &self.active_kinds())
            .field("claimed_kinds", &self.claims.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, BoxFuture, InMemoryRecordRepository};
    use crate::store::MemoryProgressStore;
    use std::sync::Mutex;

    /// Records published ids; fails the first `failures` calls with `Unavailable`.
    #[derive(Default)]
    struct Recorder {
        ids: Mutex<Vec<String>>,
        calls: AtomicUsize,
        failures: usize,
        fail_kind: Option<String>,
    }

    impl NotificationPublisher for Recorder {
        fn publish<'a>(
            &'a self,
            _ctx: &'a TenantContext,
            events: Vec<RecordChangedEvent>,
        ) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call < self.failures {
                    return Err(BackendError::Unavailable("broker down".into()));
                }
                if let Some(bad) = &self.fail_kind {
                    if events.iter().any(|e| &e.kind == bad) {
                        return Err(BackendError::Internal("poisoned kind".into()));
                    }
                }
                self.ids
                    .lock()
                    .unwrap()
                    .extend(events.into_iter().map(|e| e.id));
                Ok(())
            })
        }
    }

    struct Harness {
        repo: Arc<InMemoryRecordRepository>,
        publisher: Arc<Recorder>,
        store: Arc<MemoryProgressStore>,
        dispatcher: ReplayDispatcher,
    }

    fn harness(publisher: Recorder) -> Harness {
        let repo = Arc::new(InMemoryRecordRepository::new().with_max_page_size(4));
        let publisher = Arc::new(publisher);
        let store = Arc::new(MemoryProgressStore::new());
        let config = ReplayConfig::for_testing();
        let dispatcher = ReplayDispatcher::new(repo.clone(), publisher.clone(), store.clone(), &config)
            .with_retry(PublishRetry::fast(config.dispatcher.publish_retry_attempts));
        Harness {
            repo,
            publisher,
            store,
            dispatcher,
        }
    }

    fn ctx() -> TenantContext {
        TenantContext::new("p")
    }

    fn job(kinds: &[&str], totals: &[(&str, u64)]) -> DispatchJob {
        DispatchJob {
            ctx: ctx(),
            replay_id: "r1".to_string(),
            operation: ReplayOperation::Replay,
            kinds: kinds.iter().map(|k| k.to_string()).collect(),
            totals: totals.iter().map(|(k, n)| (k.to_string(), *n)).collect(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_publishes_every_record() {
        let h = harness(Recorder::default());
        h.repo.seed("p", "a", 23);
        h.repo.seed("p", "b", 5);

        let summary = h.dispatcher.dispatch(job(&["a", "b"], &[("a", 23), ("b", 5)])).await;
        assert_eq!(summary.completed.len(), 2);

        let mut ids = h.publisher.ids.lock().unwrap().clone();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 28);

        let a = h.store.get_kind_progress(&ctx(), "r1", "a").await.unwrap().unwrap();
        assert_eq!(a.state, ReplayState::Completed);
        assert_eq!(a.processed_records, 23);
        assert_eq!(a.total_records, 23);
        assert!(a.last_cursor.is_none());
    }

    #[tokio::test]
    async fn test_total_falls_back_to_processed() {
        let h = harness(Recorder::default());
        h.repo.seed("p", "a", 7);

        h.dispatcher.dispatch(job(&["a"], &[])).await;
        let a = h.store.get_kind_progress(&ctx(), "r1", "a").await.unwrap().unwrap();
        assert_eq!(a.total_records, 7);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_per_kind() {
        let h = harness(Recorder {
            fail_kind: Some("bad".to_string()),
            ..Default::default()
        });
        h.repo.seed("p", "good", 6);
        h.repo.seed("p", "bad", 6);

        let summary = h.dispatcher.dispatch(job(&["good", "bad"], &[])).await;
        assert_eq!(summary.completed, vec!["good".to_string()]);
        assert_eq!(summary.failed, vec!["bad".to_string()]);

        let bad = h.store.get_kind_progress(&ctx(), "r1", "bad").await.unwrap().unwrap();
        assert_eq!(bad.state, ReplayState::Failed);
        let good = h.store.get_kind_progress(&ctx(), "r1", "good").await.unwrap().unwrap();
        assert_eq!(good.state, ReplayState::Completed);
    }

    #[tokio::test]
    async fn test_publish_retries_transient_failures() {
        let h = harness(Recorder {
            failures: 1,
            ..Default::default()
        });
        h.repo.seed("p", "a", 2);

        let summary = h.dispatcher.dispatch(job(&["a"], &[])).await;
        assert_eq!(summary.completed.len(), 1);
        assert_eq!(h.publisher.ids.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_publish_gives_up_after_attempts() {
        let h = harness(Recorder {
            failures: 100,
            ..Default::default()
        });
        h.repo.seed("p", "a", 2);

        let summary = h.dispatcher.dispatch(job(&["a"], &[])).await;
        assert_eq!(summary.failed.len(), 1);
        // publish_retry_attempts = 2 in the test config
        assert_eq!(h.publisher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_terminal_rows_are_skipped() {
        let h = harness(Recorder::default());
        h.repo.seed("p", "a", 3);
        let mut done = KindProgress::queued("p", "r1", "a", ReplayOperation::Replay, 3, Utc::now());
        done.state = ReplayState::Completed;
        h.store.upsert_progress(&done).await.unwrap();

        let summary = h.dispatcher.dispatch(job(&["a"], &[])).await;
        assert_eq!(summary.skipped, vec!["a".to_string()]);
        assert!(h.publisher.ids.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resume_from_last_cursor() {
        let h = harness(Recorder::default());
        h.repo.seed("p", "a", 10);
        let mut partial = KindProgress::queued("p", "r1", "a", ReplayOperation::Replay, 10, Utc::now());
        partial.state = ReplayState::InProgress;
        partial.processed_records = 6;
        partial.last_cursor = Some("a:000005".to_string());
        h.store.upsert_progress(&partial).await.unwrap();

        h.dispatcher.dispatch(job(&["a"], &[])).await;

        let ids = h.publisher.ids.lock().unwrap().clone();
        assert_eq!(ids, vec!["a:000006", "a:000007", "a:000008", "a:000009"]);
        let row = h.store.get_kind_progress(&ctx(), "r1", "a").await.unwrap().unwrap();
        assert_eq!(row.processed_records, 10);
        assert_eq!(row.state, ReplayState::Completed);
    }

    #[tokio::test]
    async fn test_closed_pool_leaves_rows_queued() {
        let h = harness(Recorder::default());
        h.repo.seed("p", "a", 3);
        h.dispatcher.close();

        let summary = h.dispatcher.dispatch(job(&["a"], &[])).await;
        assert_eq!(summary.interrupted, vec!["a".to_string()]);
        assert!(h.store.get_kind_progress(&ctx(), "r1", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_kind_completes_with_zero() {
        let h = harness(Recorder::default());
        let summary = h.dispatcher.dispatch(job(&["ghost"], &[])).await;
        assert_eq!(summary.completed.len(), 1);
        let row = h.store.get_kind_progress(&ctx(), "r1", "ghost").await.unwrap().unwrap();
        assert_eq!(row.processed_records, 0);
        assert_eq!(row.state, ReplayState::Completed);
    }

    #[tokio::test]
    async fn test_claimed_kind_is_left_alone() {
        let h = harness(Recorder::default());
        h.repo.seed("p", "a", 5);
        let claim = h.dispatcher.claim("p", "r1", "a").unwrap();
        assert!(h.dispatcher.is_in_flight("p", "r1", "a"));
        assert!(!h.dispatcher.is_in_flight("q", "r1", "a"));

        let summary = h.dispatcher.dispatch(job(&["a"], &[])).await;
        assert_eq!(summary.in_flight, vec!["a".to_string()]);
        assert!(!summary.is_final());
        assert!(h.publisher.ids.lock().unwrap().is_empty());
        assert!(h.store.get_kind_progress(&ctx(), "r1", "a").await.unwrap().is_none());

        drop(claim);
        assert!(!h.dispatcher.is_in_flight("p", "r1", "a"));
        let summary = h.dispatcher.dispatch(job(&["a"], &[])).await;
        assert_eq!(summary.completed, vec!["a".to_string()]);
        assert_eq!(h.publisher.ids.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_overlapping_dispatches_publish_each_record_once() {
        let h = harness(Recorder::default());
        h.repo.seed("p", "a", 40);

        let (first, second) = tokio::join!(
            h.dispatcher.dispatch(job(&["a"], &[])),
            h.dispatcher.dispatch(job(&["a"], &[])),
        );
        assert_eq!(first.completed.len() + second.completed.len(), 1);

        let mut ids = h.publisher.ids.lock().unwrap().clone();
        assert_eq!(ids.len(), 40);
        ids.dedup();
        assert_eq!(ids.len(), 40);
        let row = h.store.get_kind_progress(&ctx(), "r1", "a").await.unwrap().unwrap();
        assert_eq!(row.state, ReplayState::Completed);
        assert_eq!(row.processed_records, 40);
        assert!(!h.dispatcher.is_in_flight("p", "r1", "a"));
    }
}
