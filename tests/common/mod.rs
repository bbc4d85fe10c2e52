//! Shared test utilities for integration tests.
//!
//! This module provides:
//! - A publisher that records every event and can fail chosen kinds
//! - A repository wrapper that delays calls (timeout paths)
//! - A progress store that refuses writes for one kind
//! - An audit logger that counts outcomes
//! - Harness helpers wiring a coordinator and router together

#![allow(dead_code)]

use replay_engine::backend::{
    AuditLogger, BackendError, BoxFuture, InMemoryRecordRepository, NotificationPublisher, Page,
    RecordChangedEvent, RecordRepository,
};
use chrono::{DateTime, Utc};
use replay_engine::config::ReplayConfig;
use replay_engine::coordinator::ReplayCoordinator;
use replay_engine::error::ReplayError;
use replay_engine::model::KindProgress;
use replay_engine::query::QueryService;
use replay_engine::store::{MemoryProgressStore, ProgressStore, StoreFuture};
use replay_engine::tenant::TenantContext;
use replay_engine::web::{create_router, AppState};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PARTITION: &str = "opendes";

// =============================================================================
// Publisher
// =============================================================================

/// Records published events. Batches for a kind in `fail_kinds` are rejected
/// with a non-retryable error.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<RecordChangedEvent>>,
    correlation_ids: Mutex<HashSet<String>>,
    fail_kinds: Mutex<HashSet<String>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(kinds: &[&str]) -> Self {
        let publisher = Self::default();
        publisher
            .fail_kinds
            .lock()
            .unwrap()
            .extend(kinds.iter().map(|k| k.to_string()));
        publisher
    }

    pub fn ids_for(&self, kind: &str) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.id.clone())
            .collect()
    }

    pub fn total(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn correlation_ids(&self) -> HashSet<String> {
        self.correlation_ids.lock().unwrap().clone()
    }
}

impl NotificationPublisher for RecordingPublisher {
    fn publish<'a>(
        &'a self,
        ctx: &'a TenantContext,
        events: Vec<RecordChangedEvent>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let failing = {
                let fail_kinds = self.fail_kinds.lock().unwrap();
                events.iter().any(|e| fail_kinds.contains(&e.kind))
            };
            if failing {
                return Err(BackendError::Internal("topic rejected batch".to_string()));
            }
            self.correlation_ids
                .lock()
                .unwrap()
                .insert(ctx.correlation_id.clone());
            self.events.lock().unwrap().extend(events);
            Ok(())
        })
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Delays selected calls of an inner repository.
pub struct SlowRepository {
    inner: InMemoryRecordRepository,
    count_delay: Duration,
    list_delay: Duration,
}

impl SlowRepository {
    pub fn new(inner: InMemoryRecordRepository) -> Self {
        Self {
            inner,
            count_delay: Duration::ZERO,
            list_delay: Duration::ZERO,
        }
    }

    pub fn with_count_delay(mut self, delay: Duration) -> Self {
        self.count_delay = delay;
        self
    }

    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = delay;
        self
    }
}

impl RecordRepository for SlowRepository {
    fn count_active<'a>(
        &'a self,
        ctx: &'a TenantContext,
        kinds: &'a [String],
    ) -> BoxFuture<'a, HashMap<String, u64>> {
        Box::pin(async move {
            tokio::time::sleep(self.count_delay).await;
            self.inner.count_active(ctx, kinds).await
        })
    }

    fn count_active_all<'a>(&'a self, ctx: &'a TenantContext) -> BoxFuture<'a, HashMap<String, u64>> {
        Box::pin(async move {
            tokio::time::sleep(self.count_delay).await;
            self.inner.count_active_all(ctx).await
        })
    }

    fn list_active_ids_page<'a>(
        &'a self,
        ctx: &'a TenantContext,
        kind: &'a str,
        continuation: Option<String>,
        limit: usize,
    ) -> BoxFuture<'a, Page<String>> {
        Box::pin(async move {
            tokio::time::sleep(self.list_delay).await;
            self.inner
                .list_active_ids_page(ctx, kind, continuation, limit)
                .await
        })
    }

    fn list_kinds_page<'a>(
        &'a self,
        ctx: &'a TenantContext,
        continuation: Option<String>,
        limit: usize,
    ) -> BoxFuture<'a, Page<String>> {
        Box::pin(async move {
            tokio::time::sleep(self.list_delay).await;
            self.inner.list_kinds_page(ctx, continuation, limit).await
        })
    }
}

// =============================================================================
// Store
// =============================================================================

/// In-memory store whose upserts fail for one kind.
pub struct RejectingStore {
    inner: MemoryProgressStore,
    reject_kind: String,
}

impl RejectingStore {
    pub fn new(reject_kind: &str) -> Self {
        Self {
            inner: MemoryProgressStore::new(),
            reject_kind: reject_kind.to_string(),
        }
    }
}

impl ProgressStore for RejectingStore {
    fn upsert_progress<'a>(&'a self, row: &'a KindProgress) -> StoreFuture<'a, ()> {
        if row.kind == self.reject_kind {
            return Box::pin(async { Err(ReplayError::Internal("write rejected".to_string())) });
        }
        self.inner.upsert_progress(row)
    }

    fn get_progress<'a>(
        &'a self,
        ctx: &'a TenantContext,
        replay_id: &'a str,
    ) -> StoreFuture<'a, Vec<KindProgress>> {
        self.inner.get_progress(ctx, replay_id)
    }

    fn get_kind_progress<'a>(
        &'a self,
        ctx: &'a TenantContext,
        replay_id: &'a str,
        kind: &'a str,
    ) -> StoreFuture<'a, Option<KindProgress>> {
        self.inner.get_kind_progress(ctx, replay_id, kind)
    }

    fn purge_finished_before<'a>(&'a self, cutoff: DateTime<Utc>) -> StoreFuture<'a, usize> {
        self.inner.purge_finished_before(cutoff)
    }
}

// =============================================================================
// Audit
// =============================================================================

#[derive(Default)]
pub struct CountingAudit {
    pub successes: AtomicUsize,
    pub failures: AtomicUsize,
}

impl CountingAudit {
    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

impl AuditLogger for CountingAudit {
    fn replay_request_success(&self, _ctx: &TenantContext, _resources: &[String]) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    fn replay_request_fail(&self, _ctx: &TenantContext, _resources: &[String]) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub coordinator: Arc<ReplayCoordinator>,
    pub publisher: Arc<RecordingPublisher>,
    pub audit: Arc<CountingAudit>,
    pub store: Arc<dyn ProgressStore>,
    pub router: axum::Router,
}

impl Harness {
    pub fn new(records: Arc<dyn RecordRepository>, publisher: RecordingPublisher) -> Self {
        Self::with_config(
            ReplayConfig::for_testing(),
            records,
            publisher,
            Arc::new(MemoryProgressStore::new()),
        )
    }

    pub fn with_config(
        config: ReplayConfig,
        records: Arc<dyn RecordRepository>,
        publisher: RecordingPublisher,
        store: Arc<dyn ProgressStore>,
    ) -> Self {
        let publisher = Arc::new(publisher);
        let audit = Arc::new(CountingAudit::default());
        let coordinator = Arc::new(ReplayCoordinator::new(
            config.clone(),
            Arc::clone(&records),
            publisher.clone(),
            audit.clone(),
            Arc::clone(&store),
        ));
        let query = QueryService::new(records, &config);
        let router = create_router(AppState::new(Arc::clone(&coordinator), query));
        Self {
            coordinator,
            publisher,
            audit,
            store,
            router,
        }
    }

    pub async fn settle(&self) {
        assert!(
            self.coordinator.drain(Duration::from_secs(5)).await,
            "background tasks did not finish"
        );
    }
}

/// Repository seeded with `counts` active records per kind in [`PARTITION`].
pub fn seeded(counts: &[(&str, usize)]) -> InMemoryRecordRepository {
    let repo = InMemoryRecordRepository::new();
    for (kind, count) in counts {
        repo.seed(PARTITION, kind, *count);
    }
    repo
}

pub fn tenant() -> TenantContext {
    TenantContext::new(PARTITION).with_correlation_id("it-correlation")
}
