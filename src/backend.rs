// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! External collaborator interfaces.
//!
//! The engine never talks to a cloud backend directly. Each deployment
//! supplies implementations of these narrow traits:
//!
//! - [`RecordRepository`]: active-record counts and id/kind listing by page
//! - [`NotificationPublisher`]: emits record-changed events (at-least-once)
//! - [`AuditLogger`]: fire-and-forget audit events
//!
//! Methods return boxed futures so collaborators can be held as
//! `Arc<dyn Trait>` and shared across spawned tasks.
//!
//! [`InMemoryRecordRepository`], [`TracingPublisher`] and
//! [`TracingAuditLogger`] are self-contained implementations used by the
//! standalone server and by tests.
//!
//! # Example
//!
//! ```rust,no_run
//! use replay_engine::backend::{BoxFuture, NotificationPublisher, RecordChangedEvent};
//! use replay_engine::tenant::TenantContext;
//!
//! struct StdoutPublisher;
//!
//! impl NotificationPublisher for StdoutPublisher {
//!     fn publish<'a>(
//!         &'a self,
//!         _ctx: &'a TenantContext,
//!         events: Vec<RecordChangedEvent>,
//!     ) -> BoxFuture<'a, ()> {
//!         Box::pin(async move {
//!             for event in events {
//!                 println!("{} {}", event.kind, event.id);
//!             }
//!             Ok(())
//!         })
//!     }
//! }
//! ```

use crate::tenant::TenantContext;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::ops::Bound;
use std::pin::Pin;
use tracing::{debug, info, warn};

/// Result type for collaborator calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Boxed future returned by collaborator methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = BackendResult<T>> + Send + 'a>>;

/// Failure reported by a collaborator.
///
/// The variant decides how the engine classifies the error; see
/// [`ReplayError::backend`](crate::error::ReplayError::backend).
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The backend refused the request because of its content.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Transient unavailability (throttling, network, failover).
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Anything else.
    #[error("internal: {0}")]
    Internal(String),
}

/// One page in a backend's native ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Backend continuation token; `None` means the ordering is exhausted.
    pub continuation: Option<String>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, continuation: Option<String>) -> Self {
        Self { items, continuation }
    }

    pub fn last(items: Vec<T>) -> Self {
        Self::new(items, None)
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), None)
    }

    pub fn has_more(&self) -> bool {
        self.continuation.is_some()
    }
}

/// Read access to record metadata.
///
/// All methods count or list **active** records only. Orderings are
/// ascending by record id / kind name, and a continuation token resumes
/// strictly after the last item returned.
pub trait RecordRepository: Send + Sync + 'static {
    /// Active-record counts for the given kinds. Kinds with no active
    /// records may be omitted from the map.
    fn count_active<'a>(
        &'a self,
        ctx: &'a TenantContext,
        kinds: &'a [String],
    ) -> BoxFuture<'a, HashMap<String, u64>>;

    /// Active-record counts for every kind in the partition (full scan).
    fn count_active_all<'a>(&'a self, ctx: &'a TenantContext) -> BoxFuture<'a, HashMap<String, u64>>;

    /// Up to `limit` active record ids of `kind`, resuming after `continuation`.
    ///
    /// May return fewer than `limit` items while still reporting a continuation.
    fn list_active_ids_page<'a>(
        &'a self,
        ctx: &'a TenantContext,
        kind: &'a str,
        continuation: Option<String>,
        limit: usize,
    ) -> BoxFuture<'a, Page<String>>;

    /// Up to `limit` kind names, resuming after `continuation`.
    fn list_kinds_page<'a>(
        &'a self,
        ctx: &'a TenantContext,
        continuation: Option<String>,
        limit: usize,
    ) -> BoxFuture<'a, Page<String>>;
}

/// Record-changed notification emitted for every replayed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordChangedEvent {
    pub id: String,
    pub kind: String,
    pub op: String,
    pub record_blocks: String,
}

impl RecordChangedEvent {
    /// Replays and reindexes are both delivered downstream as updates
    /// covering the data and metadata blocks.
    pub fn update(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            op: "update".to_string(),
            record_blocks: "data metadata".to_string(),
        }
    }
}

/// Message transport for change notifications.
pub trait NotificationPublisher: Send + Sync + 'static {
    /// Publish one batch of events. Retried by the caller on failure, so
    /// implementations must tolerate duplicates downstream.
    fn publish<'a>(&'a self, ctx: &'a TenantContext, events: Vec<RecordChangedEvent>)
        -> BoxFuture<'a, ()>;
}

/// Audit sink. Calls must not block or fail the caller.
pub trait AuditLogger: Send + Sync + 'static {
    fn replay_request_success(&self, ctx: &TenantContext, resources: &[String]);
    fn replay_request_fail(&self, ctx: &TenantContext, resources: &[String]);
}

// =============================================================================
// Self-contained implementations
// =============================================================================

/// Publisher that only logs what it would send.
#[derive(Debug, Default)]
pub struct TracingPublisher;

impl NotificationPublisher for TracingPublisher {
    fn publish<'a>(
        &'a self,
        ctx: &'a TenantContext,
        events: Vec<RecordChangedEvent>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            debug!(
                partition = %ctx.data_partition_id,
                correlation_id = %ctx.correlation_id,
                count = events.len(),
                "Published record-changed batch"
            );
            Ok(())
        })
    }
}

/// Audit logger writing to the `audit` tracing target.
#[derive(Debug, Default)]
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn replay_request_success(&self, ctx: &TenantContext, resources: &[String]) {
        info!(
            target: "audit",
            action = "replay_request",
            result = "success",
            partition = %ctx.data_partition_id,
            user = ctx.user.as_deref().unwrap_or("unknown"),
            resources = ?resources,
        );
    }

    fn replay_request_fail(&self, ctx: &TenantContext, resources: &[String]) {
        warn!(
            target: "audit",
            action = "replay_request",
            result = "failure",
            partition = %ctx.data_partition_id,
            user = ctx.user.as_deref().unwrap_or("unknown"),
            resources = ?resources,
        );
    }
}

/// kind -> record id -> active flag
type KindTable = BTreeMap<String, BTreeMap<String, bool>>;

/// Partition-scoped, in-memory record catalogue.
///
/// Continuation tokens are the last id (or kind) returned. `max_page_size`
/// caps how many items one call returns, which mimics backends whose
/// physical page is smaller than the requested limit.
#[derive(Debug)]
pub struct InMemoryRecordRepository {
    partitions: DashMap<String, KindTable>,
    max_page_size: usize,
}

impl Default for InMemoryRecordRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRecordRepository {
    pub fn new() -> Self {
        Self {
            partitions: DashMap::new(),
            max_page_size: usize::MAX,
        }
    }

    /// Cap the number of items any single page call returns.
    pub fn with_max_page_size(mut self, max_page_size: usize) -> Self {
        self.max_page_size = max_page_size.max(1);
        self
    }

    /// Insert (or reactivate) a record.
    pub fn insert(&self, partition: &str, kind: &str, id: &str) {
        self.set_active(partition, kind, id, true);
    }

    /// Insert `count` active records named `{kind}:{n:06}`.
    pub fn seed(&self, partition: &str, kind: &str, count: usize) {
        for n in 0..count {
            self.insert(partition, kind, &format!("{kind}:{n:06}"));
        }
    }

    /// Mark a record active or soft-deleted, creating it if needed.
    pub fn set_active(&self, partition: &str, kind: &str, id: &str, active: bool) {
        self.partitions
            .entry(partition.to_string())
            .or_default()
            .entry(kind.to_string())
            .or_default()
            .insert(id.to_string(), active);
    }

    fn active_count(records: &BTreeMap<String, bool>) -> u64 {
        records.values().filter(|active| **active).count() as u64
    }

    fn page_from<I>(iter: I, limit: usize) -> Page<String>
    where
        I: Iterator<Item = String>,
    {
        let mut items: Vec<String> = iter.take(limit.saturating_add(1)).collect();
        if items.len() > limit {
            items.truncate(limit);
            let continuation = items.last().cloned();
            Page::new(items, continuation)
        } else {
            Page::last(items)
        }
    }

    fn lower_bound(continuation: &Option<String>) -> Bound<String> {
        match continuation {
            Some(token) => Bound::Excluded(token.clone()),
            None => Bound::Unbounded,
        }
    }
}

impl RecordRepository for InMemoryRecordRepository {
    fn count_active<'a>(
        &'a self,
        ctx: &'a TenantContext,
        kinds: &'a [String],
    ) -> BoxFuture<'a, HashMap<String, u64>> {
        Box::pin(async move {
            let Some(table) = self.partitions.get(&ctx.data_partition_id) else {
                return Ok(HashMap::new());
            };
            Ok(kinds
                .iter()
                .filter_map(|kind| {
                    let count = Self::active_count(table.get(kind)?);
                    (count > 0).then(|| (kind.clone(), count))
                })
                .collect())
        })
    }

    fn count_active_all<'a>(&'a self, ctx: &'a TenantContext) -> BoxFuture<'a, HashMap<String, u64>> {
        Box::pin(async move {
            let Some(table) = self.partitions.get(&ctx.data_partition_id) else {
                return Ok(HashMap::new());
            };
            Ok(table
                .iter()
                .filter_map(|(kind, records)| {
                    let count = Self::active_count(records);
                    (count > 0).then(|| (kind.clone(), count))
                })
                .collect())
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
            let limit = limit.clamp(1, self.max_page_size);
            let Some(table) = self.partitions.get(&ctx.data_partition_id) else {
                return Ok(Page::empty());
            };
            let Some(records) = table.get(kind) else {
                return Ok(Page::empty());
            };
            let range = (Self::lower_bound(&continuation), Bound::Unbounded);
            let ids = records
                .range::<String, _>(range)
                .filter(|(_, active)| **active)
                .map(|(id, _)| id.clone());
            Ok(Self::page_from(ids, limit))
        })
    }

    fn list_kinds_page<'a>(
        &'a self,
        ctx: &'a TenantContext,
        continuation: Option<String>,
        limit: usize,
    ) -> BoxFuture<'a, Page<String>> {
        Box::pin(async move {
            let limit = limit.clamp(1, self.max_page_size);
            let Some(table) = self.partitions.get(&ctx.data_partition_id) else {
                return Ok(Page::empty());
            };
            let range = (Self::lower_bound(&continuation), Bound::Unbounded);
            let kinds = table
                .range::<String, _>(range)
                .filter(|(_, records)| Self::active_count(records) > 0)
                .map(|(kind, _)| kind.clone());
            Ok(Self::page_from(kinds, limit))
        })
    }
}
