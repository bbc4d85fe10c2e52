// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background paths of the coordinator.
//!
//! Everything here runs after the trigger response has been sent, so no
//! error can reach the caller. Failures are logged and written to progress
//! rows, which the status endpoint then reports.
//!
//! # Paths
//!
//! - [`run_dispatch`]: kinds already known and registered; dispatch them.
//! - [`run_discovery`]: no kind filter; scan the catalog, register every
//!   kind with active records, then dispatch. If discovery fails, every
//!   unfinished row of the job moves to FAILED so the status shows it.
//! - [`run_retention`]: periodic purge of finished jobs (only when a
//!   retention window is configured).

use crate::backend::AuditLogger;
use crate::counter::ActiveKindCounter;
use crate::dispatcher::{DispatchJob, DispatchSummary, ReplayDispatcher};
use crate::error::Result;
use crate::metrics;
use crate::model::{KindProgress, ReplayOperation, ReplayState, SYSTEM_KIND};
use crate::resilience::with_timeout;
use crate::store::ProgressStore;
use crate::tenant::TenantContext;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Write `row` unless a row with the same key already exists.
///
/// Re-triggering a replay id must never regress a row, so the existing row
/// wins and is returned.
pub(super) async fn ensure_row(
    store: &dyn ProgressStore,
    call_timeout: Duration,
    ctx: &TenantContext,
    row: KindProgress,
) -> Result<KindProgress> {
    let existing = with_timeout(
        "get_kind_progress",
        call_timeout,
        store.get_kind_progress(ctx, &row.replay_id, &row.kind),
    )
    .await?;

    if let Some(existing) = existing {
        debug!(replay_id = %row.replay_id, kind = %row.kind, state = %existing.state, "Keeping existing progress row");
        return Ok(existing);
    }

    with_timeout("upsert_progress", call_timeout, store.upsert_progress(&row)).await?;
    Ok(row)
}

/// Collaborators shared by the background paths.
#[derive(Clone)]
pub(super) struct BackgroundContext {
    pub store: Arc<dyn ProgressStore>,
    pub counter: ActiveKindCounter,
    pub dispatcher: ReplayDispatcher,
    pub audit: Arc<dyn AuditLogger>,
    pub call_timeout: Duration,
}

/// Dispatch known kinds, then close out the system row.
pub(super) async fn run_dispatch(bg: BackgroundContext, job: DispatchJob) {
    let ctx = job.ctx.clone();
    let replay_id = job.replay_id.clone();
    let summary = bg.dispatcher.dispatch(job).await;
    finish_system_row(&bg, &ctx, &replay_id, &summary).await;
}

/// Discover all kinds, register them, dispatch.
pub(super) async fn run_discovery(
    bg: BackgroundContext,
    ctx: TenantContext,
    replay_id: String,
    operation: ReplayOperation,
) {
    info!(replay_id = %replay_id, "Discovering kinds for replay");

    match discover(&bg, &ctx, &replay_id, operation).await {
        Ok(job) => {
            bg.audit.replay_request_success(&ctx, &job.kinds);
            if job.kinds.is_empty() {
                info!(replay_id = %replay_id, "No kinds with active records; nothing to replay");
            }
            run_dispatch(bg, job).await;
        }
        Err(e) => {
            error!(replay_id = %replay_id, error = %e, "Kind discovery failed");
            metrics::record_discovery_failure();
            bg.audit.replay_request_fail(&ctx, &[]);
            fail_open_rows(&bg, &ctx, &replay_id).await;
        }
    }
}

async fn discover(
    bg: &BackgroundContext,
    ctx: &TenantContext,
    replay_id: &str,
    operation: ReplayOperation,
) -> Result<DispatchJob> {
    let totals = bg.counter.count_active_all(ctx).await?;

    let mut kinds: Vec<String> = totals
        .keys()
        .filter(|kind| kind.as_str() != SYSTEM_KIND)
        .cloned()
        .collect();
    kinds.sort();

    let now = Utc::now();
    for kind in &kinds {
        let total = totals.get(kind).copied().unwrap_or(0);
        let row = KindProgress::queued(
            ctx.data_partition_id.as_str(),
            replay_id,
            kind.as_str(),
            operation,
            i64::try_from(total).unwrap_or(i64::MAX),
            now,
        );
        ensure_row(bg.store.as_ref(), bg.call_timeout, ctx, row).await?;
    }

    info!(replay_id = %replay_id, kinds = kinds.len(), "Discovered kinds");
    Ok(DispatchJob {
        ctx: ctx.clone(),
        replay_id: replay_id.to_string(),
        operation,
        kinds,
        totals,
    })
}

async fn load_system_row(
    bg: &BackgroundContext,
    ctx: &TenantContext,
    replay_id: &str,
) -> Option<KindProgress> {
    match with_timeout(
        "get_kind_progress",
        bg.call_timeout,
        bg.store.get_kind_progress(ctx, replay_id, SYSTEM_KIND),
    )
    .await
    {
        Ok(row) => row,
        Err(e) => {
            error!(replay_id = %replay_id, error = %e, "Could not load system row");
            None
        }
    }
}

async fn persist_system_row(bg: &BackgroundContext, row: &KindProgress) {
    if let Err(e) = with_timeout("upsert_progress", bg.call_timeout, bg.store.upsert_progress(row)).await {
        error!(replay_id = %row.replay_id, error = %e, "Failed to persist system row");
    }
}

/// Move every QUEUED or IN_PROGRESS row of the job to FAILED.
///
/// Kinds a running dispatch still owns are left to that dispatch. Best
/// effort: write failures are logged and the remaining rows still tried.
pub(super) async fn fail_open_rows(bg: &BackgroundContext, ctx: &TenantContext, replay_id: &str) {
    let rows = match with_timeout(
        "get_progress",
        bg.call_timeout,
        bg.store.get_progress(ctx, replay_id),
    )
    .await
    {
        Ok(rows) => rows,
        Err(e) => {
            error!(replay_id = %replay_id, error = %e, "Could not load rows to fail");
            return;
        }
    };

    let now = Utc::now();
    for mut row in rows {
        if row.state.is_terminal()
            || bg
                .dispatcher
                .is_in_flight(&ctx.data_partition_id, replay_id, &row.kind)
        {
            continue;
        }
        if let Err(e) = row.transition(ReplayState::Failed, now) {
            warn!(replay_id = %replay_id, kind = %row.kind, error = %e, "Cannot fail row");
            continue;
        }
        if let Err(e) = with_timeout("upsert_progress", bg.call_timeout, bg.store.upsert_progress(&row)).await {
            error!(replay_id = %replay_id, kind = %row.kind, error = %e, "Failed to persist FAILED state");
        }
    }
}

/// Move the system row to COMPLETED once every kind reached a terminal state.
///
/// Kinds interrupted by shutdown, or still owned by an earlier dispatch of
/// the same job, leave the job open. The owner (or a re-trigger) closes it.
async fn finish_system_row(
    bg: &BackgroundContext,
    ctx: &TenantContext,
    replay_id: &str,
    summary: &DispatchSummary,
) {
    if !summary.is_final() {
        return;
    }
    let Some(mut row) = load_system_row(bg, ctx, replay_id).await else {
        return;
    };
    if row.state.is_terminal() {
        return;
    }

    let now = Utc::now();
    let finished = row
        .transition(ReplayState::InProgress, now)
        .and_then(|()| row.transition(ReplayState::Completed, now));
    match finished {
        Ok(()) => persist_system_row(bg, &row).await,
        Err(e) => warn!(replay_id = %replay_id, error = %e, "Cannot close system row"),
    }
}

/// Purge finished jobs older than `retention` every `interval` until shutdown.
pub(super) async fn run_retention(
    store: Arc<dyn ProgressStore>,
    retention: Duration,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let window = chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(36_500));
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
        retention_secs = retention.as_secs(),
        interval_secs = interval.as_secs(),
        "Starting retention task"
    );

    loop {
        tokio::select! {
            _ = timer.tick() => {
                match store.purge_finished_before(Utc::now() - window).await {
                    Ok(purged) => {
                        if purged > 0 {
                            metrics::record_jobs_purged(purged);
                        }
                    }
                    Err(e) => warn!(error = %e, "Retention purge failed"),
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("Retention task stopping");
                    break;
                }
            }
        }
    }
}
