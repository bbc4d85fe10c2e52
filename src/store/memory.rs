// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Non-durable progress store for tests and single-process deployments.

use super::{job_key, ProgressCache, ProgressStore, StoreFuture};
use crate::model::KindProgress;
use crate::tenant::TenantContext;
use chrono::{DateTime, Utc};
use tracing::debug;

/// Progress rows held only in the process cache. Lost on restart.
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    cache: ProgressCache,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_count(&self) -> usize {
        self.cache.job_count()
    }
}

impl ProgressStore for MemoryProgressStore {
    fn upsert_progress<'a>(&'a self, row: &'a KindProgress) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if !self.cache.upsert(row.clone()) {
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
            Ok(self.cache.get_job(&key).unwrap_or_default())
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
            Ok(self.cache.get_row(&key, kind))
        })
    }

    fn purge_finished_before<'a>(&'a self, cutoff: DateTime<Utc>) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let keys = self.cache.finished_before(cutoff);
            for key in &keys {
                self.cache.remove_job(key);
            }
            Ok(keys.len())
        })
    }
}
