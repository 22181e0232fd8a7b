// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shard routing: from a row's key values to the zone that owns it.
//!
//! Every replicated table names a partition algorithm from a closed
//! registry. Applying the algorithm to the row's partition key columns
//! (plus any static arguments) yields a shard id (zsid); the
//! metadata-derived zsid table maps that to the owning zone. Ownership is
//! what lets the apply engine distinguish echoes of its own writes from
//! genuine remote mutations, and decide which side may freeze a row.

use std::collections::HashMap;

use rand::Rng;
use serde_json::Value;

use crate::error::{ApplyError, Result};
use crate::event::Row;

/// The closed set of partition algorithms.
///
/// New algorithms are added by adding a variant here and a name in
/// [`from_name`](Self::from_name) — never by runtime registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionAlgorithm {
    /// `key % args[0]`.
    Mod,
    /// Uniform zsid in `0..=100`; for tables whose placement is irrelevant.
    Random,
}

impl PartitionAlgorithm {
    /// Resolve a registry name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "mod" => Ok(PartitionAlgorithm::Mod),
            "random" => Ok(PartitionAlgorithm::Random),
            other => Err(ApplyError::UnknownAlgorithm(other.to_string())),
        }
    }

    /// Compute the shard id for one row's key values.
    pub fn apply(&self, args: &[i64], keys: &[Value]) -> Result<u32> {
        match self {
            PartitionAlgorithm::Mod => {
                let modulus = *args.first().ok_or_else(|| {
                    ApplyError::Config("mod algorithm needs a modulus argument".to_string())
                })?;
                if modulus <= 0 {
                    return Err(ApplyError::Config(format!(
                        "mod algorithm modulus [{modulus}] must be positive"
                    )));
                }
                let key = keys.first().ok_or_else(|| {
                    ApplyError::Config("mod algorithm needs one key column".to_string())
                })?;
                let key = value_as_i64(key)?;
                Ok(key.rem_euclid(modulus) as u32)
            }
            PartitionAlgorithm::Random => Ok(rand::rng().random_range(0..=100)),
        }
    }
}

/// Convert a key column value to an integer for hashing.
fn value_as_i64(value: &Value) -> Result<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| ApplyError::Config(format!("key value [{n}] is not an integer"))),
        Value::String(s) => s
            .parse()
            .map_err(|_| ApplyError::Config(format!("key value [{s}] is not an integer"))),
        other => Err(ApplyError::Config(format!(
            "key value [{other}] is not an integer"
        ))),
    }
}

/// Routing description for one physical table.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardRoute {
    /// Columns of the unique index that locks a row for writes, in index
    /// order.
    pub lock_key: Vec<String>,
    /// Columns fed to the partition algorithm.
    pub partition_keys: Vec<String>,
    pub algorithm: PartitionAlgorithm,
    pub algorithm_args: Vec<i64>,
}

/// Table routes plus the zsid-to-zone ownership table.
///
/// Built once per metadata version and read-only thereafter.
#[derive(Debug, Clone, Default)]
pub struct ShardRouter {
    routes: HashMap<String, ShardRoute>,
    zone_by_zsid: HashMap<u32, u32>,
}

impl ShardRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the route for a physical table.
    pub fn insert(&mut self, table: impl Into<String>, route: ShardRoute) {
        self.routes.insert(table.into(), route);
    }

    /// Register a shard's owning zone.
    pub fn insert_shard(&mut self, zsid: u32, zone_id: u32) {
        self.zone_by_zsid.insert(zsid, zone_id);
    }

    /// The route for a physical table, if known.
    pub fn route(&self, table: &str) -> Option<&ShardRoute> {
        self.routes.get(table)
    }

    /// Whether any route exists for `table`.
    pub fn knows(&self, table: &str) -> bool {
        self.routes.contains_key(table)
    }

    /// Number of routed tables.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// True when no tables are routed.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// The zone owning the row described by `values`.
    pub fn resolve_owner(&self, table: &str, values: &Row) -> Result<u32> {
        let route = self.route(table).ok_or_else(|| ApplyError::UnknownTable {
            table: table.to_string(),
        })?;

        let mut keys = Vec::with_capacity(route.partition_keys.len());
        for column in &route.partition_keys {
            let value = values.get(column).ok_or_else(|| ApplyError::MissingLockKey {
                table: table.to_string(),
                column: column.clone(),
            })?;
            keys.push(value.clone());
        }

        let zsid = route.algorithm.apply(&route.algorithm_args, &keys)?;
        self.zone_by_zsid
            .get(&zsid)
            .copied()
            .ok_or(ApplyError::UnknownShard { zsid })
    }
}
