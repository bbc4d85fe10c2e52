// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP surface of the replay engine.
//!
//! ## Route Structure
//!
//! - `GET /health` - Health check
//! - `POST /replay` - Trigger a replay, `202 {replayId}`
//! - `GET /replay/status/{replay_id}` - Aggregate status of a replay
//! - `GET /query/kinds?cursor&limit` - Kinds with active records
//! - `GET /query/records?kind&cursor&limit` - Active record ids of a kind
//!
//! Tenant identity is read from the `data-partition-id`, `correlation-id`,
//! `user` and `x-collaboration` headers. Every error is rendered as RFC 7807
//! problem details.

pub mod error;
pub mod routes;

pub use error::{AppError, ErrorResponse};

use crate::coordinator::ReplayCoordinator;
use crate::query::QueryService;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ReplayCoordinator>,
    pub query: QueryService,
    pub default_partition: Arc<str>,
}

impl AppState {
    pub fn new(coordinator: Arc<ReplayCoordinator>, query: QueryService) -> Self {
        let default_partition = Arc::from(coordinator.config().server.default_partition.as_str());
        Self {
            coordinator,
            query,
            default_partition,
        }
    }
}

/// Permissive CORS for browser clients.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Assemble the full application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health_check))
        .route("/replay", post(routes::trigger_replay))
        .route("/replay/status/", get(routes::replay_status_missing_id))
        .route("/replay/status/{replay_id}", get(routes::replay_status))
        .route("/query/kinds", get(routes::list_kinds))
        .route("/query/records", get(routes::list_records))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(state)
}
