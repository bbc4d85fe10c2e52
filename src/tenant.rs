// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-request tenant context.
//!
//! Background tasks outlive the request that started them, so they never
//! read ambient request state. The coordinator captures a [`TenantContext`]
//! at trigger time and moves it into every task it spawns.

use tracing::warn;
use uuid::Uuid;

/// Header carrying the data partition (tenant) id.
pub const DATA_PARTITION_HEADER: &str = "data-partition-id";
/// Header carrying the request correlation id.
pub const CORRELATION_ID_HEADER: &str = "correlation-id";
/// Header carrying the optional collaboration context.
pub const COLLABORATION_HEADER: &str = "x-collaboration";
/// Header carrying the calling user, when known.
pub const USER_HEADER: &str = "user";

/// Correlation ids are truncated to this many characters before suffixing.
const MAX_CORRELATION_BASE: usize = 64;

/// Collaboration (namespace) scoping attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaborationContext {
    pub id: Uuid,
    pub application: String,
}

impl CollaborationContext {
    /// Parse `id=<uuid>,application=<name>`.
    ///
    /// Returns `None` on anything malformed.
    pub fn parse(header: &str) -> Option<Self> {
        let mut id = None;
        let mut application = None;
        for part in header.split(',') {
            let (key, value) = part.split_once('=')?;
            match key.trim() {
                "id" => id = Uuid::parse_str(value.trim()).ok(),
                "application" => application = Some(value.trim().to_string()),
                _ => {}
            }
        }
        match (id, application) {
            (Some(id), Some(application)) if !application.is_empty() => {
                Some(Self { id, application })
            }
            _ => None,
        }
    }
}

/// Identity and partition scoping of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub data_partition_id: String,
    pub correlation_id: String,
    pub user: Option<String>,
    pub collaboration: Option<CollaborationContext>,
}

impl TenantContext {
    /// Context for a partition with a freshly generated correlation id.
    pub fn new(data_partition_id: impl Into<String>) -> Self {
        Self {
            data_partition_id: data_partition_id.into(),
            correlation_id: Uuid::new_v4().to_string(),
            user: None,
            collaboration: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Attach a collaboration context from its raw header value.
    ///
    /// Malformed values are dropped with a warning rather than failing the request.
    pub fn with_collaboration_header(mut self, header: &str) -> Self {
        self.collaboration = CollaborationContext::parse(header);
        if self.collaboration.is_none() {
            warn!(header = %header, "Ignoring malformed collaboration header");
        }
        self
    }

    /// Child context for the `index`-th kind task of a replay (1-based).
    pub fn for_kind(&self, index: usize) -> Self {
        Self {
            correlation_id: kind_correlation_id(&self.correlation_id, index),
            ..self.clone()
        }
    }
}

/// Derive a per-kind correlation id: `{base[..64]}_kind_{index}`.
pub fn kind_correlation_id(base: &str, index: usize) -> String {
    let truncated: String = base.chars().take(MAX_CORRELATION_BASE).collect();
    format!("{truncated}_kind_{index}")
}
