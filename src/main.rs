// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replay server binary.
//!
//! Reads its config from the file named by `REPLAY_CONFIG` (YAML or JSON),
//! falling back to defaults, and serves the HTTP API until Ctrl-C.

use replay_engine::backend::{InMemoryRecordRepository, TracingAuditLogger, TracingPublisher};
use replay_engine::config::ReplayConfig;
use replay_engine::coordinator::ReplayCoordinator;
use replay_engine::query::QueryService;
use replay_engine::store::open_store;
use replay_engine::web::{create_router, AppState};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CONFIG_ENV: &str = "REPLAY_CONFIG";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,replay_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::var(CONFIG_ENV) {
        Ok(path) => {
            info!(path = %path, "Loading config");
            ReplayConfig::from_file(&path)?
        }
        Err(_) => {
            warn!("{} not set; using default config", CONFIG_ENV);
            ReplayConfig::default()
        }
    };

    let store = open_store(&config.store).await?;
    let records = Arc::new(InMemoryRecordRepository::new());

    let coordinator = Arc::new(ReplayCoordinator::new(
        config.clone(),
        records.clone(),
        Arc::new(TracingPublisher),
        Arc::new(TracingAuditLogger),
        store,
    ));
    coordinator.start().await;

    let query = QueryService::new(records, &config);
    let app = create_router(AppState::new(Arc::clone(&coordinator), query));

    let listener = TcpListener::bind(config.server.bind_addr.as_str()).await?;
    info!(addr = %config.server.bind_addr, "Replay server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C; serving until killed");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await?;

    coordinator
        .shutdown(config.server.shutdown_grace_duration())
        .await;
    info!("Replay server stopped");
    Ok(())
}
