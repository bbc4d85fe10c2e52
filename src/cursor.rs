// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Opaque cursors and page filling.
//!
//! # Cursor Codec
//!
//! Backends hand out native continuation tokens that are too large, too
//! revealing, or too backend-specific to give to clients. [`CursorCodec`]
//! stores each token in a TTL cache under an opaque id and returns the id.
//!
//! ```text
//! backend token ──encode(scope)──► cursor id ──► client
//! client cursor ──decode(scope)──► backend token      (or InvalidCursor)
//! ```
//!
//! Each cursor is bound to the *scope* (the logical ordering) that issued
//! it. A cache miss, whether the id was never issued or was evicted, is
//! [`ReplayError::InvalidCursor`]. It never silently restarts the scan.
//!
//! # Page Iterator
//!
//! Backends may return fewer items than asked for while still reporting
//! more data. [`PageIterator::collect`] keeps asking for the remainder
//! until the quota is met or the backend is exhausted, bounded by
//! `max_attempts` so a backend that keeps returning empty pages with a
//! token cannot spin forever.

use crate::backend::Page;
use crate::config::PaginationConfig;
use crate::error::{ReplayError, Result};
use moka::sync::Cache;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Scope of the kind listing for a partition.
pub fn kinds_scope(partition: &str) -> String {
    format!("kinds:{partition}")
}

/// Scope of the active-record listing of one kind.
pub fn records_scope(partition: &str, kind: &str) -> String {
    format!("records:{partition}:{kind}")
}

#[derive(Debug, Clone)]
struct CursorEntry {
    scope: String,
    continuation: String,
}

/// Maps opaque cursor ids to backend continuation tokens.
///
/// The cache is shared and may evict at any time; it is never a source of
/// truth, only a lookup.
#[derive(Clone)]
pub struct CursorCodec {
    cache: Cache<String, CursorEntry>,
}

impl CursorCodec {
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn from_config(config: &PaginationConfig) -> Self {
        Self::new(config.cursor_ttl_duration(), config.cursor_cache_capacity)
    }

    /// Issue a cursor for `continuation` within `scope`.
    ///
    /// Ids are derived from the scope and token, so re-issuing the same
    /// position yields the same cursor.
    pub fn encode(&self, scope: &str, continuation: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(scope.as_bytes());
        hasher.update([0u8]);
        hasher.update(continuation.as_bytes());
        let cursor = hex::encode(hasher.finalize());

        self.cache.insert(
            cursor.clone(),
            CursorEntry {
                scope: scope.to_string(),
                continuation: continuation.to_string(),
            },
        );
        cursor
    }

    /// Resolve a client cursor. Missing or blank means "first page".
    pub fn decode(&self, scope: &str, cursor: Option<&str>) -> Result<Option<String>> {
        let Some(cursor) = cursor.map(str::trim).filter(|c| !c.is_empty()) else {
            return Ok(None);
        };

        match self.cache.get(cursor) {
            Some(entry) if entry.scope == scope => Ok(Some(entry.continuation)),
            Some(entry) => {
                crate::metrics::record_cursor_miss("scope_mismatch");
                debug!(expected = %scope, actual = %entry.scope, "Cursor presented to a different listing");
                Err(ReplayError::InvalidCursor(
                    "the cursor was issued for a different listing".to_string(),
                ))
            }
            None => {
                crate::metrics::record_cursor_miss("unknown");
                Err(ReplayError::InvalidCursor(
                    "the cursor is unknown or has expired".to_string(),
                ))
            }
        }
    }

    /// Wrap a backend page's continuation as a client cursor.
    pub fn encode_page<T>(&self, scope: &str, page: Page<T>) -> (Vec<T>, Option<String>) {
        let cursor = page
            .continuation
            .as_deref()
            .map(|token| self.encode(scope, token));
        (page.items, cursor)
    }
}

impl std::fmt::Debug for CursorCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorCodec")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

/// Drives "keep querying until N items are collected" loops.
#[derive(Debug, Clone, Copy)]
pub struct PageIterator {
    max_attempts: usize,
}

impl PageIterator {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(config: &PaginationConfig) -> Self {
        Self::new(config.max_fill_attempts)
    }

    /// Collect up to `requested` items starting at `start`.
    ///
    /// `fetch(continuation, remaining)` performs one backend call. The
    /// returned page carries the backend continuation to resume from, or
    /// `None` when the ordering is exhausted. If the attempt budget runs out
    /// first, the partial page is returned together with its continuation.
    pub async fn collect<T, F, Fut>(
        &self,
        requested: usize,
        start: Option<String>,
        mut fetch: F,
    ) -> Result<Page<T>>
    where
        F: FnMut(Option<String>, usize) -> Fut,
        Fut: Future<Output = Result<Page<T>>>,
    {
        let requested = requested.max(1);
        let mut items: Vec<T> = Vec::new();
        let mut continuation = start;
        let mut attempts = 0;
        let mut guard_hit = false;

        loop {
            if attempts >= self.max_attempts {
                guard_hit = true;
                warn!(
                    attempts,
                    collected = items.len(),
                    requested,
                    "Page fill stopped at attempt limit; returning partial page"
                );
                break;
            }
            attempts += 1;

            let remaining = requested - items.len();
            let page = fetch(continuation.take(), remaining).await?;
            items.extend(page.items);
            continuation = page.continuation;

            if items.len() >= requested || continuation.is_none() {
                break;
            }
        }

        crate::metrics::record_page_fill(attempts, guard_hit);
        Ok(Page::new(items, continuation))
    }
}
