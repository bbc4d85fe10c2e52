//! Metrics for observability.
//!
//! All metrics are prefixed with `replay_` and follow Prometheus conventions:
//! counters end in `_total`, gauges represent current state, histograms
//! track durations. Recording is a no-op until the host installs a
//! `metrics` recorder.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a replay trigger and whether it was accepted.
pub fn record_trigger(operation: &str, accepted: bool) {
    let outcome = if accepted { "accepted" } else { "rejected" };
    counter!("replay_triggers_total", "operation" => operation.to_string(), "outcome" => outcome).increment(1);
}

/// Record a kind handed to the dispatcher.
pub fn record_kind_dispatched() {
    counter!("replay_kinds_dispatched_total").increment(1);
}

/// Record a kind reaching a terminal state.
pub fn record_kind_finished(state: &str, duration: Duration) {
    counter!("replay_kinds_finished_total", "state" => state.to_string()).increment(1);
    histogram!("replay_kind_duration_seconds", "state" => state.to_string())
        .record(duration.as_secs_f64());
}

/// Record a kind skipped because it was already terminal.
pub fn record_kind_skipped() {
    counter!("replay_kinds_skipped_total").increment(1);
}

/// Number of kind tasks currently holding a worker slot.
pub fn set_active_kind_tasks(count: usize) {
    gauge!("replay_active_kind_tasks").set(count as f64);
}

/// Record notifications published for a kind.
pub fn record_records_published(count: usize) {
    counter!("replay_records_published_total").increment(count as u64);
}

/// Record a publish retry.
pub fn record_publish_retry() {
    counter!("replay_publish_retries_total").increment(1);
}

/// Record a backend call that hit its deadline.
pub fn record_backend_timeout(operation: &str) {
    counter!("replay_backend_timeouts_total", "operation" => operation.to_string()).increment(1);
}

/// Record how many backend calls one page fill needed.
pub fn record_page_fill(attempts: usize, exhausted_guard: bool) {
    histogram!("replay_page_fill_attempts").record(attempts as f64);
    if exhausted_guard {
        counter!("replay_page_fill_guard_hits_total").increment(1);
    }
}

/// Record a cursor that could not be resolved.
pub fn record_cursor_miss(reason: &str) {
    counter!("replay_cursor_misses_total", "reason" => reason.to_string()).increment(1);
}

/// Record an SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn store_retries_total(operation: &str) {
    counter!("replay_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record jobs purged by the retention task.
pub fn record_jobs_purged(count: usize) {
    counter!("replay_jobs_purged_total").increment(count as u64);
}

/// Record a background discovery failure.
pub fn record_discovery_failure() {
    counter!("replay_discovery_failures_total").increment(1);
}

/// Record status query latency.
pub fn record_status_query(duration: Duration, found: bool) {
    let outcome = if found { "found" } else { "not_found" };
    histogram!("replay_status_query_duration_seconds", "outcome" => outcome)
        .record(duration.as_secs_f64());
}
