// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Status aggregation.
//!
//! Pure functions from a job's progress rows to the status response. Nothing
//! here is stored; the aggregate is recomputed on every read.
//!
//! # Precedence
//!
//! ```text
//! FAILED  >  IN_PROGRESS  >  QUEUED  >  COMPLETED
//! ```
//!
//! Any failed kind makes the whole job FAILED, even if every other kind
//! finished. The system row only counts while no kind rows exist.

use crate::model::{KindProgress, ReplayFilter, ReplayOperation, ReplayState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rows that take part in aggregation: kind rows if any exist, else the system row.
fn effective_rows(rows: &[KindProgress]) -> Vec<&KindProgress> {
    let kinds: Vec<&KindProgress> = rows.iter().filter(|r| !r.is_system()).collect();
    if kinds.is_empty() {
        rows.iter().collect()
    } else {
        kinds
    }
}

/// Overall state of a job.
pub fn aggregate_state(rows: &[KindProgress]) -> ReplayState {
    let rows = effective_rows(rows);
    let any = |state: ReplayState| rows.iter().any(|r| r.state == state);

    if any(ReplayState::Failed) {
        ReplayState::Failed
    } else if any(ReplayState::InProgress) {
        ReplayState::InProgress
    } else if any(ReplayState::Queued) {
        ReplayState::Queued
    } else if !rows.is_empty() && rows.iter().all(|r| r.state == ReplayState::Completed) {
        ReplayState::Completed
    } else {
        ReplayState::Queued
    }
}

/// `HH:MM:SS`, negative durations clamped to zero. Hours may exceed 99.
pub fn format_elapsed(elapsed: chrono::Duration) -> String {
    let secs = elapsed.num_seconds().max(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Per-kind entry of the status response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindStatus {
    pub kind: String,
    pub state: ReplayState,
    pub total_records: i64,
    pub processed_records: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_time: String,
}

/// Body of `GET /replay/status/{replay_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayStatus {
    pub replay_id: String,
    pub operation: ReplayOperation,
    pub overall_state: ReplayState,
    pub started_at: DateTime<Utc>,
    pub elapsed_time: String,
    pub total_records: i64,
    pub processed_records: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<ReplayFilter>,
    pub status: Vec<KindStatus>,
}

fn kind_status(row: &KindProgress, now: DateTime<Utc>) -> KindStatus {
    let end = if row.state.is_terminal() {
        row.last_updated_at.unwrap_or(now)
    } else {
        now
    };
    let elapsed = row
        .started_at
        .map(|start| end - start)
        .unwrap_or_else(chrono::Duration::zero);

    KindStatus {
        kind: row.kind.clone(),
        state: row.state,
        total_records: row.total_records,
        processed_records: row.processed_records,
        started_at: row.started_at,
        elapsed_time: format_elapsed(elapsed),
    }
}

/// Build the status response from a non-empty set of rows.
///
/// Returns `None` when `rows` is empty.
pub fn build_status(
    replay_id: &str,
    rows: &[KindProgress],
    now: DateTime<Utc>,
) -> Option<ReplayStatus> {
    let header = rows.iter().find(|r| r.is_system()).or_else(|| rows.first())?;
    let overall_state = aggregate_state(rows);

    let started_at = rows.iter().filter_map(|r| r.started_at).min().unwrap_or(now);

    let end = if overall_state.is_terminal() {
        rows.iter()
            .filter(|r| r.state.is_terminal())
            .filter_map(|r| r.last_updated_at)
            .max()
            .unwrap_or(now)
    } else {
        now
    };

    let kind_rows: Vec<&KindProgress> = rows.iter().filter(|r| !r.is_system()).collect();
    let total_records = kind_rows.iter().map(|r| r.total_records).sum();
    let processed_records = kind_rows.iter().map(|r| r.processed_records).sum();
    let status = kind_rows.iter().map(|r| kind_status(r, now)).collect();

    Some(ReplayStatus {
        replay_id: replay_id.to_string(),
        operation: header.operation,
        overall_state,
        started_at,
        elapsed_time: format_elapsed(end - started_at),
        total_records,
        processed_records,
        filter: header.filter.clone(),
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SYSTEM_KIND;

    fn row(kind: &str, state: ReplayState, total: i64, processed: i64) -> KindProgress {
        let mut row = KindProgress::queued("p", "r", kind, ReplayOperation::Replay, total, Utc::now());
        row.state = state;
        row.processed_records = processed;
        row
    }

    #[test]
    fn test_failed_dominates() {
        let rows = vec![
            row(SYSTEM_KIND, ReplayState::InProgress, 0, 0),
            row("a", ReplayState::Completed, 100, 100),
            row("b", ReplayState::Failed, 50, 25),
        ];
        assert_eq!(aggregate_state(&rows), ReplayState::Failed);

        let status = build_status("r", &rows, Utc::now()).unwrap();
        assert_eq!(status.overall_state, ReplayState::Failed);
        assert_eq!(status.total_records, 150);
        assert_eq!(status.processed_records, 125);
        assert_eq!(status.status.len(), 2);
        assert!(status.status.iter().all(|k| k.kind != SYSTEM_KIND));
    }

    #[test]
    fn test_system_only() {
        let rows = vec![row(SYSTEM_KIND, ReplayState::Queued, 0, 0)];
        let status = build_status("r", &rows, Utc::now()).unwrap();
        assert_eq!(status.overall_state, ReplayState::Queued);
        assert_eq!(status.total_records, 0);
        assert_eq!(status.processed_records, 0);
        assert!(status.status.is_empty());
    }

    #[test]
    fn test_system_row_state_used_until_kinds_exist() {
        let rows = vec![row(SYSTEM_KIND, ReplayState::Failed, 0, 0)];
        assert_eq!(aggregate_state(&rows), ReplayState::Failed);

        let rows = vec![
            row(SYSTEM_KIND, ReplayState::Failed, 0, 0),
            row("a", ReplayState::Completed, 1, 1),
        ];
        assert_eq!(aggregate_state(&rows), ReplayState::Completed);
    }

    #[test]
    fn test_in_progress_over_queued() {
        let rows = vec![
            row("a", ReplayState::Queued, 1, 0),
            row("b", ReplayState::InProgress, 1, 0),
            row("c", ReplayState::Completed, 1, 1),
        ];
        assert_eq!(aggregate_state(&rows), ReplayState::InProgress);
    }

    #[test]
    fn test_empty_defaults_to_queued() {
        assert_eq!(aggregate_state(&[]), ReplayState::Queued);
        assert!(build_status("r", &[], Utc::now()).is_none());
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(chrono::Duration::seconds(0)), "00:00:00");
        assert_eq!(format_elapsed(chrono::Duration::seconds(3725)), "01:02:05");
        assert_eq!(format_elapsed(chrono::Duration::seconds(-30)), "00:00:00");
        assert_eq!(format_elapsed(chrono::Duration::hours(123)), "123:00:00");
    }

    #[test]
    fn test_terminal_elapsed_uses_latest_terminal_update() {
        let t0 = Utc::now() - chrono::Duration::hours(5);
        let mut a = KindProgress::queued("p", "r", "a", ReplayOperation::Replay, 1, t0);
        a.state = ReplayState::Completed;
        a.last_updated_at = Some(t0 + chrono::Duration::seconds(90));
        let mut b = KindProgress::queued("p", "r", "b", ReplayOperation::Replay, 1, t0);
        b.state = ReplayState::Completed;
        b.last_updated_at = Some(t0 + chrono::Duration::seconds(30));

        let status = build_status("r", &[a, b], Utc::now()).unwrap();
        assert_eq!(status.overall_state, ReplayState::Completed);
        assert_eq!(status.elapsed_time, "00:01:30");
        assert_eq!(status.status[0].elapsed_time, "00:01:30");
        assert_eq!(status.status[1].elapsed_time, "00:00:30");
    }

    #[test]
    fn test_running_elapsed_uses_now() {
        let t0 = Utc::now();
        let a = KindProgress::queued("p", "r", "a", ReplayOperation::Replay, 1, t0);
        let status = build_status("r", &[a], t0 + chrono::Duration::seconds(61)).unwrap();
        assert_eq!(status.elapsed_time, "00:01:01");
    }

    #[test]
    fn test_operation_and_filter_from_system_row() {
        let now = Utc::now();
        let system = KindProgress::system(
            "p",
            "r",
            ReplayOperation::Reindex,
            Some(ReplayFilter::for_kinds(["a"])),
            now,
        );
        let a = KindProgress::queued("p", "r", "a", ReplayOperation::Reindex, 1, now);
        let status = build_status("r", &[a, system], now).unwrap();
        assert_eq!(status.operation, ReplayOperation::Reindex);
        assert_eq!(status.filter.unwrap().kinds, vec!["a"]);
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let rows = vec![row("a", ReplayState::Completed, 2, 2)];
        let json = serde_json::to_value(build_status("r", &rows, Utc::now()).unwrap()).unwrap();
        assert_eq!(json["overallState"], "COMPLETED");
        assert_eq!(json["replayId"], "r");
        assert_eq!(json["status"][0]["processedRecords"], 2);
        assert!(json["elapsedTime"].is_string());
    }
}
