//! Shared fixtures: mock database, metadata snapshots, event builders.

pub mod mock_db;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use zone_apply::meta::{
    DbConfig, DbNode, DbTable, NodeType, RuleStatus, TableStrategy, TableType, ZoneConfig,
    ZoneSharding,
};
use zone_apply::{
    version_vector, ApplyConfig, ApplyEngine, BusMessage, ChangeEvent, ChannelBus, EventType, Lsn,
    Row, RowChange, StaticMetaClient, VERSION_COLUMN,
};

use mock_db::{MockDb, MockPool};

/// Zone 1 (local in tests) owns zsids 0 and 1; zone 2 owns zsids 2 and 3.
/// One logical table `orders`, one physical backend `orders_0` on `node1`,
/// partitioned by `order_id % 4`.
pub fn test_zones() -> Vec<ZoneConfig> {
    let table = DbTable {
        name: "orders".to_string(),
        table_type: TableType::Sharding,
        status: RuleStatus::Active,
        partition_keys: vec!["order_id".to_string()],
        algorithm: "mod".to_string(),
        algorithm_args: vec![4],
        lock_key: "PRIMARY".to_string(),
        strategies: vec![TableStrategy {
            backends: vec!["node1.orders_0".to_string()],
        }],
    };
    let node = DbNode {
        node_type: NodeType::Source,
        name: "node1".to_string(),
        dsn: "mysql://app:pw@db1:3306/shop".to_string(),
        minimum_pool_size: 1,
        maximum_pool_size: 4,
        wait_time: 3600,
        acquire_timeout: 5,
        follow: None,
    };
    let db = DbConfig {
        name: "shop".to_string(),
        nodes: HashMap::from([(node.name.clone(), node)]),
        tables: HashMap::from([(table.name.clone(), table)]),
    };

    vec![
        ZoneConfig {
            zone_id: 1,
            zone_name: "zone-1".to_string(),
            shardings: shardings(&[0, 1]),
            db: Some(db),
        },
        ZoneConfig {
            zone_id: 2,
            zone_name: "zone-2".to_string(),
            shardings: shardings(&[2, 3]),
            db: None,
        },
    ]
}

fn shardings(zsids: &[u32]) -> Vec<ZoneSharding> {
    zsids
        .iter()
        .map(|&zsid| ZoneSharding {
            zsid,
            status: RuleStatus::Active,
        })
        .collect()
}

/// A SHOW KEYS result row for lock-key discovery.
pub fn show_keys_row(seq: u64, column: &str) -> Row {
    zone_apply::event::row(&[
        ("Seq_in_index", json!(seq)),
        ("Column_name", json!(column)),
    ])
}

/// A started engine over the mock pool, plus the bus producer handle.
///
/// Local zone is 1 on node1. The SHOW KEYS answer for `orders_0` is
/// pre-queued so `start()` discovers the lock key `order_id`.
pub async fn started_engine(
    db: &Arc<MockDb>,
) -> (ApplyEngine<ChannelBus>, mpsc::Sender<BusMessage>) {
    let config = ApplyConfig::for_testing(1, "node1");
    let meta = Arc::new(StaticMetaClient::new(1, test_zones()));
    let (tx, bus) = ChannelBus::pair(64);
    let pool = Arc::new(MockPool::new(Arc::clone(db)));

    db.push_pool_rows(vec![show_keys_row(1, "order_id")]).await;

    let mut engine = ApplyEngine::with_pool(config, meta, bus, pool)
        .await
        .expect("engine construction");
    engine.start().await.expect("engine start");
    (engine, tx)
}

/// Packed marker: `zone` wrote the row at counter `version`, unlocked.
pub fn marker(zone: u32, version: u32) -> u64 {
    version_vector::encode(zone, 1, version, false).expect("marker")
}

/// Packed marker with the lock bit set.
pub fn locked_marker(zone: u32, version: u32) -> u64 {
    version_vector::encode(zone, 1, version, true).expect("marker")
}

/// An order-table row image.
pub fn order_row(order_id: i64, state: &str, vector: u64) -> Row {
    zone_apply::event::row(&[
        ("order_id", json!(order_id)),
        ("state", json!(state)),
        (VERSION_COLUMN, json!(vector)),
    ])
}

pub fn lsn(change_no: u64) -> Lsn {
    Lsn {
        source_zone_change_no: change_no,
        server_id: 201,
        log_index: 4,
        log_position: change_no * 100,
        xid: 0,
    }
}

pub struct EventParts {
    pub lsn_no: u64,
    pub prev: Option<u64>,
    pub event_type: EventType,
    pub source_zone_id: u32,
    pub values: Vec<RowChange>,
    pub is_retry: bool,
}

pub fn build_event(parts: EventParts) -> ChangeEvent {
    ChangeEvent {
        lsn: lsn(parts.lsn_no),
        prev_lsn: parts.prev.map(lsn),
        timestamp: 1700000000,
        event_type: parts.event_type,
        source_zone_id: parts.source_zone_id,
        node: "node-remote".to_string(),
        db: "shop".to_string(),
        table: "orders_0".to_string(),
        values: parts.values,
        is_retry: parts.is_retry,
    }
}

/// UPDATE event from zone 2.
pub fn update_event(lsn_no: u64, prev: Option<u64>, before: Row, after: Row) -> ChangeEvent {
    build_event(EventParts {
        lsn_no,
        prev,
        event_type: EventType::Update,
        source_zone_id: 2,
        values: vec![RowChange::Update {
            before_values: before,
            after_values: after,
        }],
        is_retry: prev.is_none(),
    })
}

/// INSERT event from zone 2.
pub fn insert_event(lsn_no: u64, prev: Option<u64>, values: Row) -> ChangeEvent {
    build_event(EventParts {
        lsn_no,
        prev,
        event_type: EventType::Insert,
        source_zone_id: 2,
        values: vec![RowChange::Values { values }],
        is_retry: prev.is_none(),
    })
}

/// DELETE event from zone 2.
pub fn delete_event(lsn_no: u64, prev: Option<u64>, values: Row) -> ChangeEvent {
    build_event(EventParts {
        lsn_no,
        prev,
        event_type: EventType::Delete,
        source_zone_id: 2,
        values: vec![RowChange::Values { values }],
        is_retry: prev.is_none(),
    })
}

/// Wrap an event as its bus message.
pub fn message(event: &ChangeEvent) -> BusMessage {
    BusMessage::new(event.table.clone().into_bytes(), event.encode().unwrap())
}
