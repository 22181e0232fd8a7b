// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The apply engine: the consume loop and its causal guarantees.
//!
//! One engine instance owns one zone's inbound change stream and applies it
//! to the local database, strictly sequentially: events are processed one
//! at a time, in arrival order, because causal-gap detection depends on it.
//! Concurrency across an engine instance's events would make
//! `last_applied_lsn` meaningless.
//!
//! # Per-event pipeline
//!
//! 1. Drop messages with an empty payload.
//! 2. Verify causal continuity against `last_applied_lsn` (`check_lsn`);
//!    a broken chain is fatal.
//! 3. Reject events for tables with no route — stale metadata, fatal.
//! 4. Skip exact duplicate redeliveries (`lsn == last_applied_lsn`).
//! 5. Dispatch to the row-level handler for the event type; on success,
//!    advance `last_applied_lsn`.
//!
//! Row-level conflict resolution lives in the `handlers` sibling module.
//!
//! # Failure posture
//!
//! Causality gaps and metadata inconsistencies stop the worker: resuming
//! past them can silently diverge the replica. Conflict anomalies do not —
//! they are logged with a row snapshot and counted, and the loop continues.

mod handlers;
mod types;

pub use types::EngineState;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::bus::{BusConsumer, BusMessage};
use crate::config::ApplyConfig;
use crate::error::{ApplyError, Result};
use crate::event::{ChangeEvent, EventType, Lsn};
use crate::meta::{DbNode, MetaClient, MetaManager, NodeType};
use crate::metrics;
use crate::route::{PartitionAlgorithm, ShardRoute, ShardRouter};
use crate::session::{connect_node, SessionPool};
use crate::sql;

/// Signals a running engine to stop after the in-flight event.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Request shutdown. The engine finishes the event it is processing,
    /// then exits its run loop cleanly.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// The apply engine for one zone.
///
/// Generic over the bus consumer so tests can feed events in-process; the
/// database is reached through the [`SessionPool`] seam.
pub struct ApplyEngine<B: BusConsumer> {
    config: ApplyConfig,
    meta: MetaManager,
    node: DbNode,
    pool: Arc<dyn SessionPool>,
    bus: B,
    router: ShardRouter,
    last_applied_lsn: Option<Lsn>,
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<B: BusConsumer> std::fmt::Debug for ApplyEngine<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyEngine")
            .field("config", &self.config)
            .field("node", &self.node)
            .field("last_applied_lsn", &self.last_applied_lsn)
            .finish_non_exhaustive()
    }
}

impl<B: BusConsumer> ApplyEngine<B> {
    /// Create an engine, resolving the local node from metadata and
    /// building the session pool for its DSN platform.
    pub async fn new(
        config: ApplyConfig,
        meta_client: Arc<dyn MetaClient>,
        bus: B,
    ) -> Result<Self> {
        config.validate()?;
        let meta = MetaManager::new(meta_client, config.zone_id);
        let node = Self::resolve_node(&meta, &config).await?;
        let pool = connect_node(&node)?;
        Ok(Self::assemble(config, meta, node, pool, bus))
    }

    /// Create an engine against an existing session pool.
    ///
    /// The primary constructor for tests and for hosts that manage their
    /// own pool.
    pub async fn with_pool(
        config: ApplyConfig,
        meta_client: Arc<dyn MetaClient>,
        bus: B,
        pool: Arc<dyn SessionPool>,
    ) -> Result<Self> {
        config.validate()?;
        let meta = MetaManager::new(meta_client, config.zone_id);
        let node = Self::resolve_node(&meta, &config).await?;
        Ok(Self::assemble(config, meta, node, pool, bus))
    }

    async fn resolve_node(meta: &MetaManager, config: &ApplyConfig) -> Result<DbNode> {
        let version = meta.load_latest().await?;
        let db = meta.get_db(version).await?;
        let node = db
            .nodes
            .get(&config.node)
            .cloned()
            .ok_or_else(|| ApplyError::UnknownNode(config.node.clone()))?;
        if node.node_type == NodeType::Replica {
            return Err(ApplyError::Config(format!(
                "node [{}] is a replica; apply targets source nodes",
                node.name
            )));
        }
        Ok(node)
    }

    fn assemble(
        config: ApplyConfig,
        meta: MetaManager,
        node: DbNode,
        pool: Arc<dyn SessionPool>,
        bus: B,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            meta,
            node,
            pool,
            bus,
            router: ShardRouter::new(),
            last_applied_lsn: None,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// The local zone id.
    pub fn zone_id(&self) -> u32 {
        self.config.zone_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Watch lifecycle state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Whether the engine is consuming.
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// LSN of the last fully applied event, if any.
    pub fn last_applied_lsn(&self) -> Option<&Lsn> {
        self.last_applied_lsn.as_ref()
    }

    /// The routes currently in effect.
    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    /// Handle for stopping the run loop from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Connect the pool and load shard routes for this node's tables.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ApplyError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }
        let _ = self.state_tx.send(EngineState::Starting);
        metrics::set_engine_state("Starting");

        info!(
            zone_id = self.config.zone_id,
            node = %self.node.name,
            "starting apply engine"
        );

        if let Err(e) = self.bootstrap().await {
            let _ = self.state_tx.send(EngineState::Failed);
            metrics::set_engine_state("Failed");
            return Err(e);
        }

        let _ = self.state_tx.send(EngineState::Running);
        metrics::set_engine_state("Running");
        info!(
            tables = self.router.len(),
            "apply engine running"
        );
        Ok(())
    }

    async fn bootstrap(&mut self) -> Result<()> {
        self.pool.connect().await?;
        self.load_routes().await?;
        metrics::set_routed_tables(self.router.len());
        Ok(())
    }

    /// Build the route map and zsid ownership table for the current
    /// metadata version.
    async fn load_routes(&mut self) -> Result<()> {
        let version = self.meta.latest_version().await;
        let db = self.meta.get_db(version).await?;
        let zones = self.meta.get_zones(version).await?;

        let mut router = ShardRouter::new();
        for zone in &zones {
            for sharding in &zone.shardings {
                router.insert_shard(sharding.zsid, zone.zone_id);
            }
        }

        for table in db.tables.values() {
            let physical = table.backends_for(&self.node.name)?;
            let Some(first) = physical.first() else {
                continue; // no backends on this node
            };
            let lock_key = self.lock_key_columns(first, &table.lock_key).await?;
            let route = ShardRoute {
                lock_key,
                partition_keys: table.partition_keys.clone(),
                algorithm: PartitionAlgorithm::from_name(&table.algorithm)?,
                algorithm_args: table.algorithm_args.clone(),
            };
            debug!(
                table = %table.name,
                backends = physical.len(),
                lock_key = ?route.lock_key,
                "routed table"
            );
            for name in physical {
                router.insert(name, route.clone());
            }
        }

        self.router = router;
        Ok(())
    }

    /// Discover the lock-key columns of a physical table, in index order.
    async fn lock_key_columns(&self, table: &str, index_name: &str) -> Result<Vec<String>> {
        let query = format!(
            "SHOW KEYS FROM {} WHERE Non_unique = 0 AND Key_name = '{}'",
            sql::ident(table),
            index_name.replace('\'', "''")
        );
        let rows = self.pool.query(&query).await?;
        if rows.is_empty() {
            return Err(ApplyError::UnknownTable {
                table: table.to_string(),
            });
        }

        let mut columns: Vec<(u64, String)> = Vec::with_capacity(rows.len());
        for row in &rows {
            let seq = row
                .get("Seq_in_index")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| ApplyError::db_msg("show keys", "missing Seq_in_index"))?;
            let name = row
                .get("Column_name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ApplyError::db_msg("show keys", "missing Column_name"))?;
            columns.push((seq, name.to_string()));
        }
        columns.sort_by_key(|(seq, _)| *seq);
        Ok(columns.into_iter().map(|(_, name)| name).collect())
    }

    /// Consume the stream until shutdown, end of stream, or a fatal error.
    pub async fn run(&mut self) -> Result<()> {
        if self.state() != EngineState::Running {
            return Err(ApplyError::InvalidState {
                expected: "Running".to_string(),
                actual: self.state().to_string(),
            });
        }

        let mut shutdown_rx = self.shutdown_rx.clone();
        let outcome = loop {
            let polled = tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("shutdown signalled, stopping consume loop");
                        break Ok(());
                    }
                    continue;
                }
                polled = self.bus.poll() => polled,
            };

            let message = match polled {
                Ok(Some(message)) => message,
                Ok(None) => {
                    info!("change stream ended");
                    break Ok(());
                }
                Err(e) => break Err(e),
            };

            if message.value.is_empty() {
                continue;
            }
            if let Err(e) = self.process(&message).await {
                break Err(e);
            }
        };

        match &outcome {
            Ok(()) => {
                let _ = self.state_tx.send(EngineState::Stopped);
                metrics::set_engine_state("Stopped");
                info!(last_lsn = ?self.last_applied_lsn, "apply engine stopped");
            }
            Err(e) => {
                let _ = self.state_tx.send(EngineState::Failed);
                metrics::set_engine_state("Failed");
                error!(error = %e, fatal = e.is_fatal(), "apply engine halted");
            }
        }
        outcome
    }

    /// Apply one bus message end to end.
    async fn process(&mut self, message: &BusMessage) -> Result<()> {
        let event = ChangeEvent::decode(&message.value)?;
        metrics::record_event_consumed(&event.table);

        if !lsn_chain_continues(self.last_applied_lsn.as_ref(), &event) {
            return Err(ApplyError::LsnGap {
                last: self.last_applied_lsn.as_ref().map(|l| l.to_string()),
                lsn: event.lsn.to_string(),
            });
        }

        if !self.router.knows(&event.table) {
            return Err(ApplyError::UnknownTable {
                table: event.table.clone(),
            });
        }

        if self.last_applied_lsn.as_ref() == Some(&event.lsn) {
            debug!(lsn = %event.lsn, table = %event.table, "duplicate redelivery, skipping");
            metrics::record_event_deduped(&event.table);
            return Ok(());
        }

        match event.event_type {
            EventType::Update => self.apply_update(&event).await?,
            EventType::Insert => self.apply_insert(&event).await?,
            EventType::Delete => self.apply_delete(&event).await?,
        }

        self.last_applied_lsn = Some(event.lsn.clone());
        metrics::record_event_applied(&event.table);
        Ok(())
    }
}

/// The causality check: may `event` be applied after `last`?
///
/// Accepts when the producer has just (re)started (`is_retry`), when this
/// is the first event since our own startup, when the chain continues
/// (`last == prev_lsn`), or when the event is an exact duplicate of the
/// last applied one (deduplicated downstream, not a gap).
pub fn lsn_chain_continues(last: Option<&Lsn>, event: &ChangeEvent) -> bool {
    if event.is_retry {
        return true;
    }
    let Some(last) = last else {
        return true;
    };
    if event.prev_lsn.as_ref() == Some(last) {
        return true;
    }
    *last == event.lsn
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{row, RowChange};
    use serde_json::json;

    fn lsn(n: u64) -> Lsn {
        Lsn {
            source_zone_change_no: n,
            server_id: 1,
            log_index: 1,
            log_position: n * 100,
            xid: 0,
        }
    }

    fn event(lsn_no: u64, prev: Option<u64>, is_retry: bool) -> ChangeEvent {
        ChangeEvent {
            lsn: lsn(lsn_no),
            prev_lsn: prev.map(lsn),
            timestamp: 0,
            event_type: EventType::Update,
            source_zone_id: 2,
            node: "node1".to_string(),
            db: "shop".to_string(),
            table: "orders_0".to_string(),
            values: vec![RowChange::Update {
                before_values: row(&[("order_id", json!(1))]),
                after_values: row(&[("order_id", json!(1))]),
            }],
            is_retry,
        }
    }

    #[test]
    fn test_chain_accepts_first_event() {
        assert!(lsn_chain_continues(None, &event(1, None, false)));
        assert!(lsn_chain_continues(None, &event(5, Some(4), false)));
    }

    #[test]
    fn test_chain_accepts_continuation() {
        let last = lsn(4);
        assert!(lsn_chain_continues(Some(&last), &event(5, Some(4), false)));
    }

    #[test]
    fn test_chain_accepts_duplicate() {
        let last = lsn(5);
        assert!(lsn_chain_continues(Some(&last), &event(5, Some(4), false)));
    }

    #[test]
    fn test_chain_accepts_retry_regardless() {
        let last = lsn(2);
        assert!(lsn_chain_continues(Some(&last), &event(9, Some(8), true)));
        assert!(lsn_chain_continues(Some(&last), &event(9, None, true)));
    }

    #[test]
    fn test_chain_rejects_gap() {
        let last = lsn(4);
        // prev_lsn skips 5: event 6 chained onto 5, but we applied 4 last.
        assert!(!lsn_chain_continues(Some(&last), &event(6, Some(5), false)));
        // Missing prev entirely (not a producer restart).
        assert!(!lsn_chain_continues(Some(&last), &event(6, None, false)));
    }
}
