//! # Replay Engine
//!
//! Replay orchestration for a multi-tenant record store: re-publish
//! "record changed" notifications for every active record of selected kinds,
//! track per-kind progress durably, and expose cursor-paginated listings of
//! kinds and record ids.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              replay-engine                                │
//! │                                                                           │
//! │  POST /replay ──► ┌───────────────────┐   spawn   ┌──────────────────────┐ │
//! │                   │ ReplayCoordinator │──────────►│ ReplayDispatcher     │ │
//! │                   │ (validate, rows)  │           │ (one task per kind,  │ │
//! │                   └───────────────────┘           │  pool-bounded)       │ │
//! │                        │        ▲                 └──────────────────────┘ │
//! │                        ▼        │ status               │          │        │
//! │                   ┌───────────────────┐                ▼          ▼        │
//! │                   │ ProgressStore     │◄──── rows ─ RecordRepository        │
//! │                   │ (memory | SQLite) │             NotificationPublisher   │
//! │                   └───────────────────┘                                    │
//! │                                                                           │
//! │  GET /query/* ──► QueryService ──► CursorCodec + PageIterator             │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Replay Lifecycle
//!
//! 1. **Trigger**: the request is validated, a `system` progress row is
//!    written, and the replay id is returned before any dispatch completes.
//! 2. **Dispatch**: each kind pages through its active ids, publishes them in
//!    batches and checkpoints its cursor after every page.
//! 3. **Status**: per-kind rows are aggregated into one overall state with
//!    precedence FAILED > IN_PROGRESS > QUEUED > COMPLETED.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use replay_engine::{ReplayConfig, ReplayCoordinator, ReplayRequest, TenantContext};
//! use replay_engine::backend::{InMemoryRecordRepository, TracingAuditLogger, TracingPublisher};
//! use replay_engine::store::MemoryProgressStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let records = Arc::new(InMemoryRecordRepository::new());
//!     records.seed("opendes", "well", 100);
//!
//!     let coordinator = ReplayCoordinator::new(
//!         ReplayConfig::default(),
//!         records,
//!         Arc::new(TracingPublisher),
//!         Arc::new(TracingAuditLogger),
//!         Arc::new(MemoryProgressStore::new()),
//!     );
//!
//!     let ctx = TenantContext::new("opendes");
//!     let ack = coordinator
//!         .trigger_replay(ctx.clone(), ReplayRequest::new("replay").with_kinds(["well"]))
//!         .await
//!         .expect("trigger");
//!
//!     coordinator.drain(Duration::from_secs(5)).await;
//!     let status = coordinator
//!         .get_replay_status(&ctx, &ack.replay_id)
//!         .await
//!         .expect("status");
//!     println!("{}", status.overall_state);
//! }
//! ```

pub mod aggregate;
pub mod backend;
pub mod config;
pub mod coordinator;
pub mod counter;
pub mod cursor;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod model;
pub mod query;
pub mod resilience;
pub mod store;
pub mod tenant;
pub mod web;

// Re-exports for convenience
pub use aggregate::{KindStatus, ReplayStatus};
pub use backend::{AuditLogger, BackendError, NotificationPublisher, Page, RecordRepository};
pub use config::ReplayConfig;
pub use coordinator::{CoordinatorState, ReplayCoordinator, TriggerResponse};
pub use cursor::{CursorCodec, PageIterator};
pub use dispatcher::ReplayDispatcher;
pub use error::{ReplayError, Result};
pub use model::{KindProgress, ReplayFilter, ReplayOperation, ReplayRequest, ReplayState};
pub use query::{QueryPage, QueryService};
pub use store::{open_store, ProgressStore};
pub use tenant::TenantContext;
