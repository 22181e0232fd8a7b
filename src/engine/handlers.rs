// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Row-level conflict resolution.
//!
//! Each row-change runs in its own short-lived transaction: `begin`, lock
//! the target row with `SELECT ... FOR UPDATE` on the lock key, at most one
//! DML, then `commit` or `rollback`. Every path through a handler ends its
//! transaction, and the session is rolled back once more and released in a
//! guaranteed-cleanup step, so nothing uncommitted ever reaches the pool.
//!
//! The decision tables follow the optimistic rules:
//!
//! - **UPDATE** resolves by per-row write counter; equal counters with
//!   divergent content freeze the row (lock bit) when this zone owns it.
//! - **INSERT** conflicts are conservative: log only, never overwrite,
//!   never freeze.
//! - **DELETE** always wins: absence must converge on both sides, content
//!   mismatches are logged after the fact.

use tracing::{debug, error, warn};

use crate::bus::BusConsumer;
use crate::error::{ApplyError, Result};
use crate::event::{ChangeEvent, Row, RowChange};
use crate::metrics;
use crate::route::ShardRoute;
use crate::session::Session;
use crate::sql;
use crate::version_vector::{self, VersionVector, VERSION_COLUMN};

use super::ApplyEngine;

impl<B: BusConsumer> ApplyEngine<B> {
    pub(super) async fn apply_update(&self, event: &ChangeEvent) -> Result<()> {
        let route = self.route_for(event)?;
        let mut session = self.pool.acquire().await?;
        let result = self.update_rows(session.as_mut(), &route, event).await;
        // Guaranteed cleanup: any transaction still open is rolled back
        // before the session returns to the pool.
        let cleanup = session.rollback().await;
        self.pool.release(session);
        result.and(cleanup)
    }

    pub(super) async fn apply_insert(&self, event: &ChangeEvent) -> Result<()> {
        let route = self.route_for(event)?;
        let mut session = self.pool.acquire().await?;
        let result = self.insert_rows(session.as_mut(), &route, event).await;
        let cleanup = session.rollback().await;
        self.pool.release(session);
        result.and(cleanup)
    }

    pub(super) async fn apply_delete(&self, event: &ChangeEvent) -> Result<()> {
        let route = self.route_for(event)?;
        let mut session = self.pool.acquire().await?;
        let result = self.delete_rows(session.as_mut(), &route, event).await;
        let cleanup = session.rollback().await;
        self.pool.release(session);
        result.and(cleanup)
    }

    fn route_for(&self, event: &ChangeEvent) -> Result<ShardRoute> {
        self.router
            .route(&event.table)
            .cloned()
            .ok_or_else(|| ApplyError::UnknownTable {
                table: event.table.clone(),
            })
    }

    async fn update_rows(
        &self,
        session: &mut dyn Session,
        route: &ShardRoute,
        event: &ChangeEvent,
    ) -> Result<()> {
        for change in &event.values {
            let RowChange::Update {
                before_values: before,
                after_values: after,
            } = change
            else {
                return Err(ApplyError::EventParse(format!(
                    "update event {} carries a non-update row-change",
                    event.lsn
                )));
            };

            // Both images must be able to target a unique row.
            let predicate = sql::where_clause(&event.table, &route.lock_key, before)?;
            sql::where_clause(&event.table, &route.lock_key, after)?;

            session.begin().await?;
            let current = session
                .query_one(&sql::select_for_update(&event.table, &predicate))
                .await?;

            let Some(current) = current else {
                // The precondition row does not exist locally; nothing an
                // UPDATE can safely target. Keep the event moving.
                self.note_anomaly(session, "update_row_missing", event, before, false, &predicate)
                    .await?;
                continue;
            };

            if current == *after {
                // Idempotent replay: the change is already reflected.
                session.commit().await?;
                metrics::record_row_discarded(&event.table, "already_applied");
                continue;
            }

            let owner = self.router.resolve_owner(&event.table, before)?;
            if owner == self.zone_id() && event.source_zone_id == self.zone_id() {
                // A write to a row this zone owns, captured from this
                // zone's own log: an echo of our own mutation. Remote-
                // sourced events for locally owned rows are NOT echoes and
                // fall through to the conflict checks below.
                session.rollback().await?;
                metrics::record_row_discarded(&event.table, "own_write_echo");
                continue;
            }

            let claimed = decode_marker(&event.table, after)?;
            let local = decode_marker(&event.table, &current)?;

            if owner != claimed.zone_id {
                // Shard ownership and the event's claimed origin disagree:
                // someone wrote a row outside their shard.
                let freeze = owner == self.zone_id() && !local.lock;
                self.note_anomaly(session, "owner_mismatch", event, before, freeze, &predicate)
                    .await?;
                continue;
            }

            if current == *before {
                // Local state matches the event's precondition; no
                // interleaving write happened. Apply.
                session
                    .execute(&sql::update(&event.table, after, &predicate))
                    .await?;
                session.commit().await?;
                metrics::record_row_applied(&event.table, "update");
                continue;
            }

            if claimed.version < local.version {
                // Stale remote write.
                session.rollback().await?;
                metrics::record_row_discarded(&event.table, "stale_version");
                debug!(
                    table = %event.table,
                    claimed = claimed.version,
                    local = local.version,
                    "discarded stale update"
                );
            } else if claimed.version == local.version {
                // Same counter, divergent content: a true concurrent
                // conflict. The owning zone freezes its copy for manual
                // reconciliation; the other side discards.
                let freeze = owner == self.zone_id() && !local.lock;
                self.note_anomaly(session, "version_conflict", event, &current, freeze, &predicate)
                    .await?;
            } else {
                // Local state is far behind; the remote image wins.
                session
                    .execute(&sql::update(&event.table, after, &predicate))
                    .await?;
                session.commit().await?;
                metrics::record_row_applied(&event.table, "update_overwrite");
                warn!(
                    table = %event.table,
                    claimed = claimed.version,
                    local = local.version,
                    "local row was behind, overwrote with remote image"
                );
            }
        }
        Ok(())
    }

    async fn insert_rows(
        &self,
        session: &mut dyn Session,
        route: &ShardRoute,
        event: &ChangeEvent,
    ) -> Result<()> {
        for change in &event.values {
            let RowChange::Values { values } = change else {
                return Err(ApplyError::EventParse(format!(
                    "insert event {} carries an update row-change",
                    event.lsn
                )));
            };

            let predicate = sql::where_clause(&event.table, &route.lock_key, values)?;

            session.begin().await?;
            let current = session
                .query_one(&sql::select_for_update(&event.table, &predicate))
                .await?;

            let Some(current) = current else {
                session.execute(&sql::insert(&event.table, values)).await?;
                session.commit().await?;
                metrics::record_row_applied(&event.table, "insert");
                continue;
            };

            if current == *values {
                // Already inserted.
                session.rollback().await?;
                metrics::record_row_discarded(&event.table, "already_applied");
                continue;
            }

            // A different row occupies the key. Insert conflicts are
            // deliberately conservative: log, never overwrite, never
            // freeze. Local data wins whether or not this zone owns the
            // row; the anomaly log is the reconciliation trail.
            let owner = self.router.resolve_owner(&event.table, values)?;
            let claimed = decode_marker(&event.table, values)?;
            let kind = if owner != self.zone_id() && claimed.zone_id != owner {
                "insert_owner_mismatch"
            } else {
                "insert_conflict"
            };
            self.note_anomaly(session, kind, event, &current, false, &predicate)
                .await?;
        }
        Ok(())
    }

    async fn delete_rows(
        &self,
        session: &mut dyn Session,
        route: &ShardRoute,
        event: &ChangeEvent,
    ) -> Result<()> {
        for change in &event.values {
            let RowChange::Values { values } = change else {
                return Err(ApplyError::EventParse(format!(
                    "delete event {} carries an update row-change",
                    event.lsn
                )));
            };

            let predicate = sql::where_clause(&event.table, &route.lock_key, values)?;

            session.begin().await?;
            let current = session
                .query_one(&sql::select_for_update(&event.table, &predicate))
                .await?;

            let Some(current) = current else {
                // Already gone.
                session.rollback().await?;
                metrics::record_row_discarded(&event.table, "already_applied");
                continue;
            };

            // Absence must win so both sides converge on "row does not
            // exist": delete unconditionally, report mismatches after.
            session.execute(&sql::delete(&event.table, &predicate)).await?;
            session.commit().await?;
            metrics::record_row_applied(&event.table, "delete");

            if current != *values {
                self.log_anomaly("delete_content_mismatch", event, &current);
            }
        }
        Ok(())
    }

    /// Record a conflict anomaly inside an open transaction, optionally
    /// freezing the row, and end the transaction.
    async fn note_anomaly(
        &self,
        session: &mut dyn Session,
        kind: &'static str,
        event: &ChangeEvent,
        snapshot: &Row,
        freeze: bool,
        predicate: &str,
    ) -> Result<()> {
        self.log_anomaly(kind, event, snapshot);
        if freeze {
            session
                .execute(&sql::freeze(&event.table, predicate))
                .await?;
            session.commit().await?;
            metrics::record_row_frozen(&event.table);
            warn!(
                table = %event.table,
                zone_id = self.zone_id(),
                "froze row pending manual reconciliation"
            );
        } else {
            session.rollback().await?;
        }
        Ok(())
    }

    /// Log an anomaly with enough context for manual reconciliation.
    fn log_anomaly(&self, kind: &'static str, event: &ChangeEvent, snapshot: &Row) {
        error!(
            kind,
            zone_id = self.zone_id(),
            source_zone_id = event.source_zone_id,
            table = %event.table,
            lsn = %event.lsn,
            observed_at = %chrono::Utc::now().to_rfc3339(),
            row = %serde_json::to_string(snapshot).unwrap_or_default(),
            "conflict anomaly"
        );
        metrics::record_anomaly(&event.table, kind);
    }
}

/// Extract and decode the packed marker from a row image.
fn decode_marker(table: &str, values: &Row) -> Result<VersionVector> {
    let word = values
        .get(VERSION_COLUMN)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| ApplyError::MissingVersionColumn {
            table: table.to_string(),
        })?;
    Ok(version_vector::decode(word))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::row;
    use serde_json::json;

    #[test]
    fn test_decode_marker() {
        let word = version_vector::encode(2, 10, 5, false).unwrap();
        let values = row(&[("order_id", json!(1)), (VERSION_COLUMN, json!(word))]);
        let marker = decode_marker("orders_0", &values).unwrap();
        assert_eq!(marker.zone_id, 2);
        assert_eq!(marker.version, 5);
        assert!(!marker.lock);
    }

    #[test]
    fn test_decode_marker_missing_column() {
        let values = row(&[("order_id", json!(1))]);
        match decode_marker("orders_0", &values) {
            Err(ApplyError::MissingVersionColumn { table }) => assert_eq!(table, "orders_0"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_decode_marker_non_integer_column() {
        let values = row(&[(VERSION_COLUMN, json!("not a number"))]);
        assert!(decode_marker("orders_0", &values).is_err());
    }
}
