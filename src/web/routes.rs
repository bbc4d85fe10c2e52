// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request handlers.
//!
//! Extractor rejections (malformed JSON, mistyped fields, bad query strings)
//! are turned into problem-details 400s instead of axum's plain-text bodies.

use super::error::{AppError, Result};
use super::AppState;
use crate::aggregate::ReplayStatus;
use crate::coordinator::TriggerResponse;
use crate::model::ReplayRequest;
use crate::query::QueryPage;
use crate::tenant::{
    TenantContext, COLLABORATION_HEADER, CORRELATION_ID_HEADER, DATA_PARTITION_HEADER, USER_HEADER,
};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::Json,
};
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct KindsQuery {
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RecordsQuery {
    pub kind: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Build the tenant context from request headers.
///
/// A missing partition header falls back to `default_partition`; a missing
/// correlation id gets a generated one.
pub fn tenant_from_headers(headers: &HeaderMap, default_partition: &str) -> TenantContext {
    let partition = header(headers, DATA_PARTITION_HEADER).unwrap_or(default_partition);
    let mut ctx = TenantContext::new(partition);
    if let Some(id) = header(headers, CORRELATION_ID_HEADER) {
        ctx = ctx.with_correlation_id(id);
    }
    if let Some(user) = header(headers, USER_HEADER) {
        ctx = ctx.with_user(user);
    }
    if let Some(collaboration) = header(headers, COLLABORATION_HEADER) {
        ctx = ctx.with_collaboration_header(collaboration);
    }
    ctx
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// POST /replay
pub async fn trigger_replay(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<ReplayRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<TriggerResponse>)> {
    let Json(request) = payload?;
    let ctx = tenant_from_headers(&headers, &state.default_partition);
    let response = state.coordinator.trigger_replay(ctx, request).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /replay/status/{replay_id}
pub async fn replay_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(replay_id): Path<String>,
) -> Result<Json<ReplayStatus>> {
    let ctx = tenant_from_headers(&headers, &state.default_partition);
    let status = state.coordinator.get_replay_status(&ctx, &replay_id).await?;
    Ok(Json(status))
}

/// GET /replay/status/ with no id
pub async fn replay_status_missing_id() -> AppError {
    AppError::BadRequest("Replay ID cannot be null or empty".to_string())
}

/// GET /query/kinds
pub async fn list_kinds(
    State(state): State<AppState>,
    headers: HeaderMap,
    params: std::result::Result<Query<KindsQuery>, QueryRejection>,
) -> Result<Json<QueryPage>> {
    let Query(params) = params?;
    let ctx = tenant_from_headers(&headers, &state.default_partition);
    let page = state
        .query
        .list_kinds(&ctx, params.cursor.as_deref(), params.limit)
        .await?;
    Ok(Json(page))
}

/// GET /query/records
pub async fn list_records(
    State(state): State<AppState>,
    headers: HeaderMap,
    params: std::result::Result<Query<RecordsQuery>, QueryRejection>,
) -> Result<Json<QueryPage>> {
    let Query(params) = params?;
    let ctx = tenant_from_headers(&headers, &state.default_partition);
    let kind = params.kind.as_deref().unwrap_or_default();
    let page = state
        .query
        .list_records(&ctx, kind, params.cursor.as_deref(), params.limit)
        .await?;
    Ok(Json(page))
}
