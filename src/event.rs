// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change events and their causal positions.
//!
//! One [`ChangeEvent`] is one table mutation captured from a remote zone's
//! binary log, batched as one or more row-changes and published on the
//! message bus as a UTF-8 JSON document. Events are created once on the
//! capture side, carried unchanged through the bus, and consumed
//! exactly-once-intended by the apply engine (duplicates are possible and
//! must be deduplicated by LSN).
//!
//! # Causal chain
//!
//! Each event carries its own [`Lsn`] and the LSN of the immediately
//! preceding event from the same producer (`prev_lsn`), forming a
//! singly-linked chain. The consumer verifies `last_applied == prev_lsn`
//! before applying; a broken link is a fatal gap. `is_retry` is set only on
//! the first event of a freshly (re)started producer, telling the consumer
//! that continuity cannot be verified across the restart.
//!
//! LSNs are compared only for equality — ordering them numerically across
//! zones is meaningless.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ApplyError, Result};

/// An ordered row image: column name to value.
pub type Row = BTreeMap<String, Value>;

/// Log sequence number: one event's position within one zone's change stream.
///
/// Immutable once created by the capture side. Two LSNs are compared only
/// for equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lsn {
    /// Change counter of the source zone.
    ///
    /// Wire quirk kept for compatibility: the capture side has always
    /// serialized this field under the key `source_zone_id`.
    #[serde(rename = "source_zone_id")]
    pub source_zone_change_no: u64,
    /// Server id of the MySQL instance the event was captured from.
    pub server_id: u64,
    /// Binlog file index.
    pub log_index: u64,
    /// Byte offset within the binlog file.
    pub log_position: u64,
    /// Transaction id, when the event closed a transaction.
    #[serde(default)]
    pub xid: u64,
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{{}:{}:{}:{}:{}}}",
            self.source_zone_change_no, self.server_id, self.log_index, self.log_position, self.xid
        )
    }
}

/// Kind of table mutation. Serialized as its integer code on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum EventType {
    Insert = 1,
    Update = 2,
    Delete = 3,
}

impl From<EventType> for u8 {
    fn from(t: EventType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for EventType {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, String> {
        match code {
            1 => Ok(EventType::Insert),
            2 => Ok(EventType::Update),
            3 => Ok(EventType::Delete),
            other => Err(format!("unknown event type code [{other}]")),
        }
    }
}

/// One row-level change within an event.
///
/// UPDATE carries the full before and after row images; INSERT and DELETE
/// carry a single image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowChange {
    Update {
        before_values: Row,
        after_values: Row,
    },
    Values {
        values: Row,
    },
}

/// One replicated table mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub lsn: Lsn,
    /// LSN of the immediately preceding event from the same producer;
    /// `None` only on the first event a producer ever emits.
    pub prev_lsn: Option<Lsn>,
    /// Capture timestamp (seconds since epoch, from the binlog event).
    pub timestamp: i64,
    pub event_type: EventType,
    /// Zone that originated the mutation.
    pub source_zone_id: u32,
    /// Node name within the source zone.
    pub node: String,
    /// Schema the table lives in.
    pub db: String,
    /// Physical table name.
    pub table: String,
    /// Row-changes, in binlog order.
    pub values: Vec<RowChange>,
    /// Set on the first event after a producer (re)start: chain continuity
    /// cannot be verified against it.
    #[serde(default)]
    pub is_retry: bool,
}

impl ChangeEvent {
    /// Serialize to the UTF-8 JSON wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ApplyError::EventParse(e.to_string()))
    }

    /// Decode from the UTF-8 JSON wire form.
    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| ApplyError::EventParse(e.to_string()))
    }

    /// True when the event carries no row-changes at all.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Build a row image from `(column, value)` pairs. Test-friendly helper.
pub fn row(pairs: &[(&str, Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lsn(n: u64, pos: u64) -> Lsn {
        Lsn {
            source_zone_change_no: n,
            server_id: 101,
            log_index: 4,
            log_position: pos,
            xid: 0,
        }
    }

    fn update_event() -> ChangeEvent {
        ChangeEvent {
            lsn: lsn(2, 450),
            prev_lsn: Some(lsn(1, 120)),
            timestamp: 1700000000,
            event_type: EventType::Update,
            source_zone_id: 2,
            node: "node-a".to_string(),
            db: "shop".to_string(),
            table: "orders_1".to_string(),
            values: vec![RowChange::Update {
                before_values: row(&[("order_id", json!(7)), ("state", json!("open"))]),
                after_values: row(&[("order_id", json!(7)), ("state", json!("paid"))]),
            }],
            is_retry: false,
        }
    }

    #[test]
    fn test_lsn_equality_only() {
        let a = lsn(1, 120);
        let b = lsn(1, 120);
        let c = lsn(2, 450);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_lsn_display() {
        assert_eq!(lsn(2, 450).to_string(), "{2:101:4:450:0}");
    }

    #[test]
    fn test_lsn_wire_field_name() {
        // source_zone_change_no serializes under the historical key.
        let json = serde_json::to_value(lsn(9, 1)).unwrap();
        assert_eq!(json["source_zone_id"], json!(9));
        assert!(json.get("source_zone_change_no").is_none());
    }

    #[test]
    fn test_event_type_codes() {
        assert_eq!(serde_json::to_value(EventType::Insert).unwrap(), json!(1));
        assert_eq!(serde_json::to_value(EventType::Update).unwrap(), json!(2));
        assert_eq!(serde_json::to_value(EventType::Delete).unwrap(), json!(3));

        let t: EventType = serde_json::from_value(json!(3)).unwrap();
        assert_eq!(t, EventType::Delete);
        assert!(serde_json::from_value::<EventType>(json!(4)).is_err());
        assert!(serde_json::from_value::<EventType>(json!(0)).is_err());
    }

    #[test]
    fn test_event_round_trip() {
        let event = update_event();
        let bytes = event.encode().unwrap();
        let decoded = ChangeEvent::decode(&bytes).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = update_event();
        let doc: Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(doc["event_type"], json!(2));
        assert_eq!(doc["lsn"]["source_zone_id"], json!(2));
        assert_eq!(doc["prev_lsn"]["log_position"], json!(120));
        assert_eq!(doc["values"][0]["before_values"]["state"], json!("open"));
        assert_eq!(doc["values"][0]["after_values"]["state"], json!("paid"));
    }

    #[test]
    fn test_event_null_prev_lsn() {
        let mut event = update_event();
        event.prev_lsn = None;
        event.is_retry = true;
        let doc: Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(doc["prev_lsn"], Value::Null);
        assert_eq!(doc["is_retry"], json!(true));

        let decoded = ChangeEvent::decode(&event.encode().unwrap()).unwrap();
        assert!(decoded.prev_lsn.is_none());
        assert!(decoded.is_retry);
    }

    #[test]
    fn test_decode_capture_side_document() {
        // A document as the capture side writes it, insert flavor.
        let data = br#"{
            "lsn": {"source_zone_id": 0, "server_id": 7, "log_index": 2, "log_position": 800, "xid": 31},
            "prev_lsn": null,
            "timestamp": 1700000001,
            "event_type": 1,
            "source_zone_id": 1,
            "node": "node-b",
            "db": "shop",
            "table": "orders_0",
            "values": [{"values": {"order_id": 3, "state": "open", "version_vector": 9007199254740994}}],
            "is_retry": true
        }"#;
        let event = ChangeEvent::decode(data).unwrap();
        assert_eq!(event.event_type, EventType::Insert);
        assert_eq!(event.lsn.xid, 31);
        assert!(event.prev_lsn.is_none());
        match &event.values[0] {
            RowChange::Values { values } => {
                assert_eq!(values["order_id"], json!(3));
            }
            other => panic!("expected insert values, got {other:?}"),
        }
    }

    #[test]
    fn test_row_change_untagged_disambiguation() {
        let update: RowChange = serde_json::from_value(json!({
            "before_values": {"id": 1},
            "after_values": {"id": 1}
        }))
        .unwrap();
        assert!(matches!(update, RowChange::Update { .. }));

        let plain: RowChange = serde_json::from_value(json!({
            "values": {"id": 1}
        }))
        .unwrap();
        assert!(matches!(plain, RowChange::Values { .. }));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(ChangeEvent::decode(b"not json").is_err());
        assert!(ChangeEvent::decode(b"{}").is_err());
    }

    #[test]
    fn test_is_empty() {
        let mut event = update_event();
        assert!(!event.is_empty());
        event.values.clear();
        assert!(event.is_empty());
    }
}
