// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cursor-paginated listings of kinds and active record ids.
//!
//! Both listings go through the same steps:
//!
//! 1. Resolve the client cursor within the listing's scope (400 on a miss)
//! 2. Fill the page to the effective limit with [`PageIterator`]
//! 3. Wrap any remaining continuation in a fresh cursor

use crate::backend::{Page, RecordRepository};
use crate::config::{PaginationConfig, ReplayConfig};
use crate::cursor::{kinds_scope, records_scope, CursorCodec, PageIterator};
use crate::error::{ReplayError, Result};
use crate::resilience::with_timeout;
use crate::tenant::TenantContext;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// One page of a listing. No `cursor` means the listing is exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPage {
    pub results: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// Paginated read access over the record repository.
#[derive(Clone)]
pub struct QueryService {
    records: Arc<dyn RecordRepository>,
    codec: CursorCodec,
    pages: PageIterator,
    pagination: PaginationConfig,
    call_timeout: Duration,
}

impl QueryService {
    pub fn new(records: Arc<dyn RecordRepository>, config: &ReplayConfig) -> Self {
        Self {
            records,
            codec: CursorCodec::from_config(&config.pagination),
            pages: PageIterator::from_config(&config.pagination),
            pagination: config.pagination.clone(),
            call_timeout: config.timeouts.backend_call_duration(),
        }
    }

    /// Kinds with at least one active record, ascending by name.
    pub async fn list_kinds(
        &self,
        ctx: &TenantContext,
        cursor: Option<&str>,
        limit: Option<i64>,
    ) -> Result<QueryPage> {
        let scope = kinds_scope(&ctx.data_partition_id);
        let start = self.codec.decode(&scope, cursor)?;
        let limit = self.pagination.effective_limit(limit);
        let records = &self.records;
        let call_timeout = self.call_timeout;

        let page = self
            .pages
            .collect(limit, start, |token, remaining| async move {
                with_timeout("list_kinds", call_timeout, async {
                    records
                        .list_kinds_page(ctx, token, remaining)
                        .await
                        .map_err(|e| ReplayError::backend("list_kinds", e))
                })
                .await
            })
            .await?;

        Ok(self.finish(&scope, page))
    }

    /// Active record ids of `kind`, ascending.
    pub async fn list_records(
        &self,
        ctx: &TenantContext,
        kind: &str,
        cursor: Option<&str>,
        limit: Option<i64>,
    ) -> Result<QueryPage> {
        let kind = kind.trim();
        if kind.is_empty() {
            return Err(ReplayError::Validation("kind must not be empty".to_string()));
        }

        let scope = records_scope(&ctx.data_partition_id, kind);
        let start = self.codec.decode(&scope, cursor)?;
        let limit = self.pagination.effective_limit(limit);
        let records = &self.records;
        let call_timeout = self.call_timeout;

        let page = self
            .pages
            .collect(limit, start, |token, remaining| async move {
                with_timeout("list_active_ids", call_timeout, async {
                    records
                        .list_active_ids_page(ctx, kind, token, remaining)
                        .await
                        .map_err(|e| ReplayError::backend("list_active_ids", e))
                })
                .await
            })
            .await?;

        Ok(self.finish(&scope, page))
    }

    fn finish(&self, scope: &str, page: Page<String>) -> QueryPage {
        let (results, cursor) = self.codec.encode_page(scope, page);
        QueryPage { results, cursor }
    }
}

impl std::fmt::Debug for QueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryService")
            .field("codec", &self.codec)
            .field("pages", &self.pages)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryRecordRepository;

    fn service(repo: InMemoryRecordRepository) -> QueryService {
        QueryService::new(Arc::new(repo), &ReplayConfig::for_testing())
    }

    #[tokio::test]
    async fn test_records_paginate_without_gaps() {
        let repo = InMemoryRecordRepository::new().with_max_page_size(1);
        repo.seed("p", "a", 5);
        let svc = service(repo);
        let ctx = TenantContext::new("p");

        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        let mut calls = 0;
        loop {
            calls += 1;
            let page = svc
                .list_records(&ctx, "a", cursor.as_deref(), Some(2))
                .await
                .unwrap();
            seen.extend(page.results);
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(calls, 3);
        assert_eq!(seen, vec!["a:000000", "a:000001", "a:000002", "a:000003", "a:000004"]);
    }

    #[tokio::test]
    async fn test_cursor_is_bound_to_kind() {
        let repo = InMemoryRecordRepository::new();
        repo.seed("p", "a", 5);
        repo.seed("p", "b", 5);
        let svc = service(repo);
        let ctx = TenantContext::new("p");

        let page = svc.list_records(&ctx, "a", None, Some(2)).await.unwrap();
        let cursor = page.cursor.unwrap();
        let err = svc
            .list_records(&ctx, "b", Some(&cursor), Some(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::InvalidCursor(_)));
    }

    #[tokio::test]
    async fn test_blank_kind_rejected() {
        let svc = service(InMemoryRecordRepository::new());
        let err = svc
            .list_records(&TenantContext::new("p"), " ", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::Validation(_)));
    }

    #[tokio::test]
    async fn test_kinds_listing_uses_default_limit() {
        let repo = InMemoryRecordRepository::new();
        for i in 0..15 {
            repo.seed("p", &format!("kind-{i:02}"), 1);
        }
        let svc = service(repo);
        let ctx = TenantContext::new("p");

        // default_limit is 10 in the test config
        let first = svc.list_kinds(&ctx, None, Some(0)).await.unwrap();
        assert_eq!(first.results.len(), 10);
        let rest = svc
            .list_kinds(&ctx, first.cursor.as_deref(), None)
            .await
            .unwrap();
        assert_eq!(rest.results.len(), 5);
        assert!(rest.cursor.is_none());
    }

    #[tokio::test]
    async fn test_unknown_cursor_rejected() {
        let svc = service(InMemoryRecordRepository::new());
        let err = svc
            .list_kinds(&TenantContext::new("p"), Some("not-a-cursor"), None)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Cursor invalid"));
    }
}
