// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replay data model.
//!
//! A replay job is not a stored row of its own. It is the set of
//! [`KindProgress`] rows sharing a `(data_partition_id, replay_id)` pair:
//! one system row created at trigger time, plus one row per target kind once
//! the kinds are known. Two partitions may use the same replay id without
//! seeing each other's rows.
//!
//! # Row State Machine
//!
//! ```text
//!            dispatch starts             success
//! QUEUED ─────────────────────→ IN_PROGRESS ─────────→ COMPLETED
//!    │                               │
//!    │ (fails before dispatch)       │ error
//!    └──────────────────────────────→┴────────────────→ FAILED
//! ```
//!
//! COMPLETED and FAILED are terminal. Self-transitions are allowed so that
//! progress updates can be written through the same path.

use crate::error::{ReplayError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reserved kind name of the per-job sentinel row.
pub const SYSTEM_KIND: &str = "system";

/// State of a single progress row (and of the aggregated job).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplayState {
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl ReplayState {
    /// All states, in declaration order.
    pub const ALL: [ReplayState; 4] = [
        ReplayState::Queued,
        ReplayState::InProgress,
        ReplayState::Completed,
        ReplayState::Failed,
    ];

    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, ReplayState::Completed | ReplayState::Failed)
    }

    /// Whether `self -> next` is an edge of the row state machine.
    pub fn can_transition_to(self, next: ReplayState) -> bool {
        use ReplayState::*;
        match (self, next) {
            (Completed, _) | (Failed, _) => false,
            (Queued, Queued) | (InProgress, InProgress) => true,
            (Queued, InProgress) | (Queued, Failed) => true,
            (InProgress, Completed) | (InProgress, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReplayState::Queued => "QUEUED",
            ReplayState::InProgress => "IN_PROGRESS",
            ReplayState::Completed => "COMPLETED",
            ReplayState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ReplayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplayState {
    type Err = ReplayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "QUEUED" => Ok(ReplayState::Queued),
            "IN_PROGRESS" => Ok(ReplayState::InProgress),
            "COMPLETED" => Ok(ReplayState::Completed),
            "FAILED" => Ok(ReplayState::Failed),
            other => Err(ReplayError::Internal(format!("unknown replay state '{other}'"))),
        }
    }
}

/// Operations a replay may be triggered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayOperation {
    Replay,
    Reindex,
}

impl ReplayOperation {
    pub const ALL: [ReplayOperation; 2] = [ReplayOperation::Replay, ReplayOperation::Reindex];

    pub fn as_str(self) -> &'static str {
        match self {
            ReplayOperation::Replay => "replay",
            ReplayOperation::Reindex => "reindex",
        }
    }

    /// Parse a client-supplied operation, rejecting anything outside the allowed set.
    pub fn parse(raw: Option<&str>) -> Result<Self> {
        let raw = raw.map(str::trim).unwrap_or_default();
        Self::ALL
            .into_iter()
            .find(|op| op.as_str().eq_ignore_ascii_case(raw))
            .ok_or_else(|| {
                let valid: Vec<&str> = Self::ALL.iter().map(|op| op.as_str()).collect();
                ReplayError::Validation(format!(
                    "Not a valid operation. The valid operations are: {}",
                    valid.join(", ")
                ))
            })
    }
}

impl fmt::Display for ReplayOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional restriction of a replay to specific kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<String>,
}

impl ReplayFilter {
    pub fn for_kinds<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kinds: kinds.into_iter().map(Into::into).collect(),
        }
    }

    /// Requested kinds with blanks dropped and duplicates removed, order kept.
    pub fn normalized_kinds(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.kinds
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .filter(|k| seen.insert(k.to_string()))
            .map(str::to_string)
            .collect()
    }
}

/// Body of `POST /replay`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayRequest {
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub replay_id: Option<String>,
    #[serde(default)]
    pub filter: Option<ReplayFilter>,
}

impl ReplayRequest {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            ..Default::default()
        }
    }

    pub fn with_replay_id(mut self, replay_id: impl Into<String>) -> Self {
        self.replay_id = Some(replay_id.into());
        self
    }

    pub fn with_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter = Some(ReplayFilter::for_kinds(kinds));
        self
    }
}

/// Progress of one kind (or the system sentinel) within a replay job.
///
/// At most one row exists per `(data_partition_id, replay_id, kind)`; stores
/// upsert on that key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindProgress {
    pub data_partition_id: String,
    pub replay_id: String,
    pub kind: String,
    pub operation: ReplayOperation,
    pub state: ReplayState,
    pub total_records: i64,
    pub processed_records: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<ReplayFilter>,
    /// Backend continuation after the last fully processed page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cursor: Option<String>,
}

impl KindProgress {
    /// A fresh QUEUED row.
    pub fn queued(
        data_partition_id: impl Into<String>,
        replay_id: impl Into<String>,
        kind: impl Into<String>,
        operation: ReplayOperation,
        total_records: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            data_partition_id: data_partition_id.into(),
            replay_id: replay_id.into(),
            kind: kind.into(),
            operation,
            state: ReplayState::Queued,
            total_records,
            processed_records: 0,
            started_at: Some(now),
            last_updated_at: Some(now),
            filter: None,
            last_cursor: None,
        }
    }

    /// The sentinel row created synchronously at trigger time.
    pub fn system(
        data_partition_id: impl Into<String>,
        replay_id: impl Into<String>,
        operation: ReplayOperation,
        filter: Option<ReplayFilter>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            filter,
            ..Self::queued(data_partition_id, replay_id, SYSTEM_KIND, operation, 0, now)
        }
    }

    pub fn is_system(&self) -> bool {
        self.kind == SYSTEM_KIND
    }

    /// Move to `next`, stamping `last_updated_at`.
    pub fn transition(&mut self, next: ReplayState, now: DateTime<Utc>) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ReplayError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.last_updated_at = Some(now);
        Ok(())
    }
}
