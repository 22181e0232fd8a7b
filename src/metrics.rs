//! Metrics for observability.
//!
//! Prometheus-compatible metrics covering event throughput, conflict
//! resolution outcomes and engine lifecycle. All metrics are prefixed with
//! `apply_`; counters end in `_total`.

use metrics::{counter, gauge};

/// Record one event consumed from the bus.
pub fn record_event_consumed(table: &str) {
    counter!("apply_events_consumed_total", "table" => table.to_string()).increment(1);
}

/// Record one event fully applied (all row-changes processed).
pub fn record_event_applied(table: &str) {
    counter!("apply_events_applied_total", "table" => table.to_string()).increment(1);
}

/// Record one event skipped as an exact duplicate redelivery.
pub fn record_event_deduped(table: &str) {
    counter!("apply_events_deduped_total", "table" => table.to_string()).increment(1);
}

/// Record a row-change discarded by conflict resolution (stale version,
/// echo of a local write, already-applied replay).
pub fn record_row_discarded(table: &str, reason: &'static str) {
    counter!("apply_rows_discarded_total", "table" => table.to_string(), "reason" => reason)
        .increment(1);
}

/// Record a row-change applied as local DML.
pub fn record_row_applied(table: &str, operation: &'static str) {
    counter!("apply_rows_applied_total", "table" => table.to_string(), "operation" => operation)
        .increment(1);
}

/// Record a conflict anomaly (logged, non-fatal).
pub fn record_anomaly(table: &str, kind: &'static str) {
    counter!("apply_conflict_anomalies_total", "table" => table.to_string(), "kind" => kind)
        .increment(1);
}

/// Record a row frozen for manual reconciliation (lock bit set).
pub fn record_row_frozen(table: &str) {
    counter!("apply_rows_frozen_total", "table" => table.to_string()).increment(1);
}

/// Record the engine lifecycle state.
pub fn set_engine_state(state: &str) {
    gauge!("apply_engine_state", "state" => state.to_string()).set(1.0);
}

/// Record the number of routed physical tables.
pub fn set_routed_tables(count: usize) {
    gauge!("apply_routed_tables").set(count as f64);
}
