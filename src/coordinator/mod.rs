// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replay coordinator.
//!
//! The root orchestrator that ties together:
//! - Request validation and fast-fail kind checks via [`ActiveKindCounter`]
//! - Progress persistence via [`ProgressStore`]
//! - Per-kind fan-out via [`ReplayDispatcher`]
//! - Status aggregation via [`crate::aggregate`]
//!
//! # Trigger Flow
//!
//! ```text
//! trigger_replay
//!   ├─ parse operation            (400 on failure, nothing written)
//!   ├─ reserved kind requested?   (400, nothing written)
//!   ├─ kinds given?
//!   │    yes: validate counts     (400 if any kind is empty, nothing written)
//!   │         write system row + QUEUED kind rows
//!   │         (a failed write moves the rows already written to FAILED)
//!   │         spawn dispatch ───────────────► background
//!   │    no:  write system row
//!   │         spawn discovery ──────────────► background
//!   └─ return {replayId}          (before any dispatch completes)
//! ```
//!
//! The caller's tenant context is captured by value and moved into the
//! background task; nothing request-scoped is read ambiently. Every job is
//! scoped to the caller's partition, including status lookups.

mod background;
mod types;

pub use types::{CoordinatorState, TriggerResponse};

use crate::aggregate::{build_status, ReplayStatus};
use crate::backend::{AuditLogger, NotificationPublisher, RecordRepository};
use crate::config::ReplayConfig;
use crate::counter::ActiveKindCounter;
use crate::dispatcher::{DispatchJob, ReplayDispatcher};
use crate::error::{ReplayError, Result};
use crate::metrics;
use crate::model::{KindProgress, ReplayFilter, ReplayOperation, ReplayRequest, SYSTEM_KIND};
use crate::resilience::with_timeout;
use crate::store::ProgressStore;
use crate::tenant::TenantContext;
use background::{ensure_row, BackgroundContext};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Entry point for triggering replays and reading their status.
pub struct ReplayCoordinator {
    config: ReplayConfig,
    store: Arc<dyn ProgressStore>,
    counter: ActiveKindCounter,
    dispatcher: ReplayDispatcher,
    audit: Arc<dyn AuditLogger>,
    call_timeout: Duration,

    state_tx: watch::Sender<CoordinatorState>,
    state_rx: watch::Receiver<CoordinatorState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Dispatch, discovery and retention task handles
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplayCoordinator {
    pub fn new(
        config: ReplayConfig,
        records: Arc<dyn RecordRepository>,
        publisher: Arc<dyn NotificationPublisher>,
        audit: Arc<dyn AuditLogger>,
        store: Arc<dyn ProgressStore>,
    ) -> Self {
        let dispatcher = ReplayDispatcher::new(records.clone(), publisher, store.clone(), &config);
        Self::with_dispatcher(config, records, audit, store, dispatcher)
    }

    /// Build with a preconfigured dispatcher (e.g. custom publish backoff).
    pub fn with_dispatcher(
        config: ReplayConfig,
        records: Arc<dyn RecordRepository>,
        audit: Arc<dyn AuditLogger>,
        store: Arc<dyn ProgressStore>,
        dispatcher: ReplayDispatcher,
    ) -> Self {
        let call_timeout = config.timeouts.backend_call_duration();
        let counter = ActiveKindCounter::new(
            records,
            config.dispatcher.count_batch_size,
            call_timeout,
            config.timeouts.discovery_duration(),
        );
        let (state_tx, state_rx) = watch::channel(CoordinatorState::Running);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            store,
            counter,
            dispatcher,
            audit,
            call_timeout,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn periodic tasks. Currently only retention, when configured.
    pub async fn start(&self) {
        let Some(retention) = self.config.store.retention_duration() else {
            debug!("No retention window configured; progress rows are kept");
            return;
        };
        let interval = self.config.store.retention_interval_duration();
        let handle = tokio::spawn(background::run_retention(
            Arc::clone(&self.store),
            retention,
            interval,
            self.shutdown_rx.clone(),
        ));
        self.track(handle).await;
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state_rx.borrow()
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ProgressStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &ReplayDispatcher {
        &self.dispatcher
    }

    /// Accept a replay request and return before any dispatch completes.
    pub async fn trigger_replay(
        &self,
        ctx: TenantContext,
        request: ReplayRequest,
    ) -> Result<TriggerResponse> {
        if !self.state().accepts_triggers() {
            return Err(ReplayError::Shutdown);
        }

        let operation = match ReplayOperation::parse(request.operation.as_deref()) {
            Ok(op) => op,
            Err(e) => {
                metrics::record_trigger("invalid", false);
                return Err(e);
            }
        };

        let replay_id = request
            .replay_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let kinds = request
            .filter
            .as_ref()
            .map(ReplayFilter::normalized_kinds)
            .unwrap_or_default();

        if kinds.iter().any(|kind| kind == SYSTEM_KIND) {
            metrics::record_trigger(operation.as_str(), false);
            return Err(ReplayError::Validation(format!(
                "The kind '{SYSTEM_KIND}' is reserved and cannot be replayed"
            )));
        }

        info!(
            replay_id = %replay_id,
            operation = %operation,
            kinds = kinds.len(),
            partition = %ctx.data_partition_id,
            "Replay requested"
        );

        if kinds.is_empty() {
            self.trigger_discovery(ctx, &replay_id, operation).await?;
        } else {
            self.trigger_for_kinds(ctx, &replay_id, operation, kinds).await?;
        }

        metrics::record_trigger(operation.as_str(), true);
        Ok(TriggerResponse { replay_id })
    }

    async fn trigger_for_kinds(
        &self,
        ctx: TenantContext,
        replay_id: &str,
        operation: ReplayOperation,
        kinds: Vec<String>,
    ) -> Result<()> {
        let totals = match self.counter.validate_kinds(&ctx, &kinds).await {
            Ok(totals) => totals,
            Err(e) => {
                metrics::record_trigger(operation.as_str(), false);
                if e.is_client_error() {
                    self.audit.replay_request_fail(&ctx, &kinds);
                }
                return Err(e);
            }
        };

        if let Err(e) = self.register_kinds(&ctx, replay_id, operation, &kinds, &totals).await {
            error!(replay_id = %replay_id, error = %e, "Could not register replay rows");
            metrics::record_trigger(operation.as_str(), false);
            self.audit.replay_request_fail(&ctx, &kinds);
            background::fail_open_rows(&self.background(), &ctx, replay_id).await;
            return Err(e);
        }

        self.audit.replay_request_success(&ctx, &kinds);

        let job = DispatchJob {
            ctx,
            replay_id: replay_id.to_string(),
            operation,
            kinds,
            totals,
        };
        let span = info_span!("replay_dispatch", replay_id = %replay_id);
        let handle = tokio::spawn(background::run_dispatch(self.background(), job).instrument(span));
        self.track(handle).await;
        Ok(())
    }

    /// Write the system row and one QUEUED row per kind.
    async fn register_kinds(
        &self,
        ctx: &TenantContext,
        replay_id: &str,
        operation: ReplayOperation,
        kinds: &[String],
        totals: &HashMap<String, u64>,
    ) -> Result<()> {
        let now = Utc::now();
        let partition = ctx.data_partition_id.as_str();
        let filter = ReplayFilter::for_kinds(kinds.iter().cloned());
        ensure_row(
            self.store.as_ref(),
            self.call_timeout,
            ctx,
            KindProgress::system(partition, replay_id, operation, Some(filter), now),
        )
        .await?;

        for kind in kinds {
            let total = totals.get(kind).copied().unwrap_or(0);
            let row = KindProgress::queued(
                partition,
                replay_id,
                kind.as_str(),
                operation,
                i64::try_from(total).unwrap_or(i64::MAX),
                now,
            );
            ensure_row(self.store.as_ref(), self.call_timeout, ctx, row).await?;
        }
        Ok(())
    }

    async fn trigger_discovery(
        &self,
        ctx: TenantContext,
        replay_id: &str,
        operation: ReplayOperation,
    ) -> Result<()> {
        ensure_row(
            self.store.as_ref(),
            self.call_timeout,
            &ctx,
            KindProgress::system(
                ctx.data_partition_id.as_str(),
                replay_id,
                operation,
                None,
                Utc::now(),
            ),
        )
        .await?;

        let span = info_span!("replay_discovery", replay_id = %replay_id);
        let handle = tokio::spawn(
            background::run_discovery(self.background(), ctx, replay_id.to_string(), operation)
                .instrument(span),
        );
        self.track(handle).await;
        Ok(())
    }

    /// Aggregated status of a replay job in the caller's partition.
    ///
    /// A replay id issued in another partition is reported as unknown.
    pub async fn get_replay_status(
        &self,
        ctx: &TenantContext,
        replay_id: &str,
    ) -> Result<ReplayStatus> {
        let started = Instant::now();
        let replay_id = replay_id.trim();
        if replay_id.is_empty() {
            return Err(ReplayError::Validation(
                "Replay ID cannot be null or empty".to_string(),
            ));
        }

        let rows = with_timeout(
            "get_progress",
            self.call_timeout,
            self.store.get_progress(ctx, replay_id),
        )
        .await?;

        let status = build_status(replay_id, &rows, Utc::now());
        metrics::record_status_query(started.elapsed(), status.is_some());
        status.ok_or_else(|| ReplayError::NotFound(format!("The replay ID {replay_id} is invalid.")))
    }

    fn background(&self) -> BackgroundContext {
        BackgroundContext {
            store: Arc::clone(&self.store),
            counter: self.counter.clone(),
            dispatcher: self.dispatcher.clone(),
            audit: Arc::clone(&self.audit),
            call_timeout: self.call_timeout,
        }
    }

    async fn track(&self, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock().await;
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Background tasks still running.
    pub async fn pending_tasks(&self) -> usize {
        self.handles
            .lock()
            .await
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Wait up to `timeout` for dispatch and discovery tasks to finish.
    ///
    /// Returns `true` if nothing is left running. Periodic tasks are
    /// excluded because they only end at shutdown.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let running = {
                let mut handles = self.handles.lock().await;
                handles.retain(|h| !h.is_finished());
                handles.len()
            };
            let periodic = usize::from(self.config.store.retention_duration().is_some());
            if running <= periodic {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop accepting triggers and wait up to `timeout` for in-flight work.
    ///
    /// Shutdown sequence:
    /// 1. Reject new triggers, stop the retention task
    /// 2. Close the worker pool so queued kinds stay QUEUED (resumable)
    /// 3. Wait for running kinds; abort whatever outlives `timeout`
    /// 4. Close the progress store
    pub async fn shutdown(&self, timeout: Duration) {
        info!("Shutting down replay coordinator");
        let _ = self.state_tx.send(CoordinatorState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);
        self.dispatcher.close();

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock().await);
        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for background tasks to finish");
        }

        let deadline = tokio::time::Instant::now() + timeout;
        for (i, mut handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown; aborting (kind resumes on re-trigger)");
                    handle.abort();
                }
            }
        }

        self.store.close().await;
        let _ = self.state_tx.send(CoordinatorState::Stopped);
        info!("Replay coordinator stopped");
    }
}

impl std::fmt::Debug for ReplayCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayCoordinator")
            .field("state", &self.state())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}
