// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Zone, shard and node metadata.
//!
//! The central configuration service owns the description of the fabric:
//! which zones exist, which shard ids (zsids) each zone owns, and per zone
//! the database nodes and replicated tables. This module types that
//! contract ([`MetaClient`]), caches it per metadata version
//! ([`MetaManager`]), and exposes new-version notification as a watch
//! channel that consumers select on.
//!
//! Metadata for a version is loaded once and read-only thereafter; a new
//! version announced on the channel triggers a reload, never an in-place
//! mutation.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info};

use crate::circular::CircularCounter;
use crate::error::{ApplyError, Result};
use crate::session::BoxFuture;
use crate::version_vector::MAX_META_VERSION;

/// Wraparound buffer for the shard-topology version counter: one day of
/// minutely bumps.
pub const META_VERSION_BUFFER: u64 = 1440;

// ─────────────────────────────────────────────────────────────────────────────
// Enums
// ─────────────────────────────────────────────────────────────────────────────

/// Role of a database node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "NameOrCode")]
pub enum NodeType {
    Source = 1,
    Replica = 2,
}

/// Layout of a replicated table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "NameOrCode")]
pub enum TableType {
    Raw = 1,
    Sharding = 2,
    DoubleSharding = 3,
    SyncTable = 4,
}

/// Lifecycle status of a routing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "NameOrCode")]
pub enum RuleStatus {
    Block = 1,
    Resharding = 2,
    Active = 3,
}

/// Metadata enums arrive either as their integer code or as a name string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NameOrCode {
    Code(u8),
    Name(String),
}

macro_rules! impl_name_or_code {
    ($ty:ident { $($name:literal => $variant:ident),+ $(,)? }) => {
        impl $ty {
            /// Resolve a case-insensitive name to a variant.
            pub fn from_name(name: &str) -> std::result::Result<Self, String> {
                match name.to_ascii_uppercase().as_str() {
                    $($name => Ok($ty::$variant),)+
                    other => Err(format!(
                        concat!(stringify!($ty), " [{}] is not supported"), other
                    )),
                }
            }
        }

        impl From<$ty> for u8 {
            fn from(v: $ty) -> u8 {
                v as u8
            }
        }

        impl TryFrom<NameOrCode> for $ty {
            type Error = String;

            fn try_from(v: NameOrCode) -> std::result::Result<Self, String> {
                match v {
                    NameOrCode::Code(code) => {
                        $(if code == $ty::$variant as u8 { return Ok($ty::$variant); })+
                        Err(format!(
                            concat!(stringify!($ty), " code [{}] is not supported"), code
                        ))
                    }
                    NameOrCode::Name(name) => $ty::from_name(&name),
                }
            }
        }
    };
}

impl_name_or_code!(NodeType {
    "SOURCE" => Source,
    "REPLICA" => Replica,
});

impl_name_or_code!(TableType {
    "RAW" => Raw,
    "SHARDING" => Sharding,
    "DOUBLE_SHARDING" => DoubleSharding,
    "SYNC_TABLE" => SyncTable,
});

impl_name_or_code!(RuleStatus {
    "BLOCK" => Block,
    "RESHARDING" => Resharding,
    "ACTIVE" => Active,
});

// ─────────────────────────────────────────────────────────────────────────────
// Zone / node / table models
// ─────────────────────────────────────────────────────────────────────────────

/// One shard owned by a zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneSharding {
    pub zsid: u32,
    pub status: RuleStatus,
}

/// One independently-writable regional replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub zone_id: u32,
    pub zone_name: String,
    pub shardings: Vec<ZoneSharding>,
    /// Database layout, present for the local zone.
    #[serde(default)]
    pub db: Option<DbConfig>,
}

/// A database node within a zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbNode {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub name: String,
    pub dsn: String,
    #[serde(default = "default_min_pool")]
    pub minimum_pool_size: u32,
    #[serde(default = "default_max_pool")]
    pub maximum_pool_size: u32,
    /// Longest idle time for a pooled session, seconds.
    #[serde(default = "default_wait_time")]
    pub wait_time: u64,
    /// Timeout for acquiring a session from the pool, seconds.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: u64,
    /// Name of the source node a replica follows.
    #[serde(default)]
    pub follow: Option<String>,
}

fn default_min_pool() -> u32 {
    1
}

fn default_max_pool() -> u32 {
    100
}

fn default_wait_time() -> u64 {
    3600
}

fn default_acquire_timeout() -> u64 {
    5
}

/// One replication strategy: the physical backends a logical table maps to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableStrategy {
    /// Backend expressions: `node.table`, `node.table_3`, or the range form
    /// `node.table_{start,stop[,step]}`.
    pub backends: Vec<String>,
}

/// A replicated logical table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbTable {
    pub name: String,
    #[serde(rename = "type")]
    pub table_type: TableType,
    pub status: RuleStatus,
    /// Columns fed to the partition algorithm.
    pub partition_keys: Vec<String>,
    /// Name of the partition algorithm in the closed registry.
    pub algorithm: String,
    /// Static arguments for the algorithm (e.g. the modulus).
    #[serde(default)]
    pub algorithm_args: Vec<i64>,
    /// Name of the unique index whose columns lock a row for writes.
    pub lock_key: String,
    #[serde(default)]
    pub strategies: Vec<TableStrategy>,
}

impl DbTable {
    /// Physical table names this logical table maps to on `node`.
    pub fn backends_for(&self, node: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for strategy in &self.strategies {
            for expr in &strategy.backends {
                for backend in TableBackend::expand(expr)? {
                    if backend.node == node {
                        names.push(backend.physical_name());
                    }
                }
            }
        }
        Ok(names)
    }
}

/// The database layout of one zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbConfig {
    pub name: String,
    pub nodes: HashMap<String, DbNode>,
    pub tables: HashMap<String, DbTable>,
}

/// A physical backend table on a named node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableBackend {
    pub node: String,
    pub prefix: String,
    pub number: Option<u32>,
}

impl TableBackend {
    /// Expand a backend expression into its physical backends.
    ///
    /// Three forms are accepted:
    /// - `node.table_{start,stop[,step]}` — a half-open numbered range
    /// - `node.table_3` — a single numbered table
    /// - `node.table` — a raw table name
    pub fn expand(expression: &str) -> Result<Vec<TableBackend>> {
        if let Some(backends) = Self::parse_range(expression)? {
            return Ok(backends);
        }
        if let Some(backend) = Self::parse_numbered(expression)? {
            return Ok(vec![backend]);
        }
        Ok(vec![Self::parse_raw(expression)?])
    }

    /// The concrete table name: prefix plus number, if any.
    pub fn physical_name(&self) -> String {
        match self.number {
            Some(n) => format!("{}{}", self.prefix, n),
            None => self.prefix.clone(),
        }
    }

    fn parse_range(expression: &str) -> Result<Option<Vec<TableBackend>>> {
        let Some(body) = expression.strip_suffix('}') else {
            return Ok(None);
        };
        let Some((base, range)) = body.split_once("_{") else {
            return Ok(None);
        };
        let (node, prefix) = split_node_table(base, expression)?;
        let prefix = format!("{prefix}_");

        let parts: Vec<&str> = range
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        if parts.len() < 2 {
            return Err(bad_expression(expression, "needs start and stop"));
        }
        if parts.len() > 3 {
            return Err(bad_expression(expression, "only start, stop, step allowed"));
        }
        let start: u32 = parse_number(parts[0], expression)?;
        let stop: u32 = parse_number(parts[1], expression)?;
        let step: u32 = if parts.len() > 2 {
            parse_number(parts[2], expression)?
        } else {
            1
        };
        if step == 0 {
            return Err(bad_expression(expression, "step must be positive"));
        }

        let backends = (start..stop)
            .step_by(step as usize)
            .map(|n| TableBackend {
                node: node.clone(),
                prefix: prefix.clone(),
                number: Some(n),
            })
            .collect();
        Ok(Some(backends))
    }

    fn parse_numbered(expression: &str) -> Result<Option<TableBackend>> {
        let Some((rest, digits)) = expression.rsplit_once('_') else {
            return Ok(None);
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(None);
        }
        let (node, prefix) = split_node_table(rest, expression)?;
        Ok(Some(TableBackend {
            node,
            prefix: format!("{prefix}_"),
            number: Some(parse_number(digits, expression)?),
        }))
    }

    fn parse_raw(expression: &str) -> Result<TableBackend> {
        let (node, table) = split_node_table(expression, expression)?;
        Ok(TableBackend {
            node,
            prefix: table,
            number: None,
        })
    }
}

fn split_node_table(base: &str, expression: &str) -> Result<(String, String)> {
    match base.split_once('.') {
        Some((node, table)) if !node.is_empty() && !table.is_empty() => {
            Ok((node.to_string(), table.to_string()))
        }
        _ => Err(bad_expression(expression, "needs [node.table]")),
    }
}

fn parse_number(text: &str, expression: &str) -> Result<u32> {
    text.parse()
        .map_err(|_| bad_expression(expression, "bad number"))
}

fn bad_expression(expression: &str, reason: &str) -> ApplyError {
    ApplyError::Config(format!("backend expression [{expression}]: {reason}"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Metadata service contract
// ─────────────────────────────────────────────────────────────────────────────

/// A resumable binlog position checkpoint for the capture side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatorPosition {
    pub log_file: String,
    pub log_pos: u64,
}

/// Read-only accessor contract of the central configuration service,
/// plus the capture side's position checkpointing.
///
/// New metadata versions are announced on the watch channel returned by
/// [`version_updates`](Self::version_updates); consumers select on it and
/// reload, rather than registering callbacks.
pub trait MetaClient: Send + Sync + 'static {
    /// Latest published metadata version.
    fn latest_version(&self) -> BoxFuture<'_, u64>;

    /// All zone configurations at `version`.
    fn zones(&self, version: u64) -> BoxFuture<'_, Vec<ZoneConfig>>;

    /// Database layout of `zone_id` at `version`.
    fn db(&self, version: u64, zone_id: u32) -> BoxFuture<'_, DbConfig>;

    /// Checkpoint the capture side's binlog position.
    fn report_replicator_position(
        &self,
        target_zone: u32,
        node: &str,
        position: ReplicatorPosition,
    ) -> BoxFuture<'_, ()>;

    /// Last checkpointed binlog position, if any.
    fn replicator_position(
        &self,
        target_zone: u32,
        node: &str,
    ) -> BoxFuture<'_, Option<ReplicatorPosition>>;

    /// Channel carrying newly published metadata versions.
    fn version_updates(&self) -> watch::Receiver<u64>;
}

/// In-process metadata source.
///
/// Serves a fixed snapshot per version; used in tests and for embedding the
/// engine without a live configuration service. New snapshots can be
/// published at runtime and are announced on the version channel.
pub struct StaticMetaClient {
    snapshots: RwLock<HashMap<u64, Vec<ZoneConfig>>>,
    latest: RwLock<u64>,
    positions: Mutex<HashMap<(u32, String), ReplicatorPosition>>,
    version_tx: watch::Sender<u64>,
}

impl StaticMetaClient {
    /// Create a client serving `zones` as version `version`.
    pub fn new(version: u64, zones: Vec<ZoneConfig>) -> Self {
        let (version_tx, _) = watch::channel(version);
        let mut snapshots = HashMap::new();
        snapshots.insert(version, zones);
        Self {
            snapshots: RwLock::new(snapshots),
            latest: RwLock::new(version),
            positions: Mutex::new(HashMap::new()),
            version_tx,
        }
    }

    /// Publish a new snapshot and announce it on the version channel.
    pub async fn publish(&self, version: u64, zones: Vec<ZoneConfig>) {
        self.snapshots.write().await.insert(version, zones);
        *self.latest.write().await = version;
        let _ = self.version_tx.send(version);
        info!(version, "published metadata snapshot");
    }
}

impl MetaClient for StaticMetaClient {
    fn latest_version(&self) -> BoxFuture<'_, u64> {
        Box::pin(async move { Ok(*self.latest.read().await) })
    }

    fn zones(&self, version: u64) -> BoxFuture<'_, Vec<ZoneConfig>> {
        Box::pin(async move {
            self.snapshots
                .read()
                .await
                .get(&version)
                .cloned()
                .ok_or_else(|| {
                    ApplyError::Config(format!("metadata version [{version}] is not published"))
                })
        })
    }

    fn db(&self, version: u64, zone_id: u32) -> BoxFuture<'_, DbConfig> {
        Box::pin(async move {
            let zones = self.zones(version).await?;
            zones
                .into_iter()
                .find(|z| z.zone_id == zone_id)
                .and_then(|z| z.db)
                .ok_or_else(|| {
                    ApplyError::Config(format!(
                        "zone [{zone_id}] has no db layout at version [{version}]"
                    ))
                })
        })
    }

    fn report_replicator_position(
        &self,
        target_zone: u32,
        node: &str,
        position: ReplicatorPosition,
    ) -> BoxFuture<'_, ()> {
        let node = node.to_string();
        Box::pin(async move {
            self.positions
                .lock()
                .await
                .insert((target_zone, node), position);
            Ok(())
        })
    }

    fn replicator_position(
        &self,
        target_zone: u32,
        node: &str,
    ) -> BoxFuture<'_, Option<ReplicatorPosition>> {
        let node = node.to_string();
        Box::pin(async move {
            Ok(self
                .positions
                .lock()
                .await
                .get(&(target_zone, node))
                .cloned())
        })
    }

    fn version_updates(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MetaManager
// ─────────────────────────────────────────────────────────────────────────────

/// Per-version cache over a [`MetaClient`].
///
/// Loads each version's zone list (and the local zone's db layout) once;
/// versions are immutable after load. Metadata version numbers wrap at
/// 2^20 - 1 and are compared through a [`CircularCounter`].
pub struct MetaManager {
    client: Arc<dyn MetaClient>,
    zone_id: u32,
    latest: RwLock<u64>,
    versions: RwLock<HashMap<u64, VersionMeta>>,
    comparator: CircularCounter,
}

#[derive(Clone)]
struct VersionMeta {
    zones: Vec<ZoneConfig>,
    db: DbConfig,
}

impl MetaManager {
    pub fn new(client: Arc<dyn MetaClient>, zone_id: u32) -> Self {
        Self {
            client,
            zone_id,
            latest: RwLock::new(0),
            versions: RwLock::new(HashMap::new()),
            comparator: CircularCounter::new(MAX_META_VERSION, META_VERSION_BUFFER),
        }
    }

    /// The local zone id this manager was constructed for.
    pub fn zone_id(&self) -> u32 {
        self.zone_id
    }

    /// Latest version seen so far.
    pub async fn latest_version(&self) -> u64 {
        *self.latest.read().await
    }

    /// Fetch and cache the service's latest version. Returns it.
    pub async fn load_latest(&self) -> Result<u64> {
        let version = self.client.latest_version().await?;
        self.load_version(version).await?;
        let mut latest = self.latest.write().await;
        if *latest == 0 || self.comparator.gt(version, *latest) {
            *latest = version;
        }
        Ok(version)
    }

    /// Load one version's metadata into the cache, if absent.
    pub async fn load_version(&self, version: u64) -> Result<()> {
        if self.versions.read().await.contains_key(&version) {
            return Ok(());
        }

        let zones = self.client.zones(version).await?;
        let mut seen = HashMap::new();
        for zone in &zones {
            if seen.insert(zone.zone_id, ()).is_some() {
                return Err(ApplyError::Config(format!(
                    "zone id [{}] is defined twice at version [{version}]",
                    zone.zone_id
                )));
            }
        }

        let db = match zones
            .iter()
            .find(|z| z.zone_id == self.zone_id)
            .and_then(|z| z.db.clone())
        {
            Some(db) => db,
            None => self.client.db(version, self.zone_id).await?,
        };

        debug!(version, zones = zones.len(), "loaded metadata version");
        self.versions
            .write()
            .await
            .insert(version, VersionMeta { zones, db });
        Ok(())
    }

    /// Whether a version has been loaded.
    pub async fn is_loaded(&self, version: u64) -> bool {
        self.versions.read().await.contains_key(&version)
    }

    /// Zone configurations at `version` (0 means latest).
    pub async fn get_zones(&self, version: u64) -> Result<Vec<ZoneConfig>> {
        let version = self.effective_version(version).await;
        self.versions
            .read()
            .await
            .get(&version)
            .map(|m| m.zones.clone())
            .ok_or_else(|| {
                ApplyError::Config(format!("metadata version [{version}] is not loaded"))
            })
    }

    /// Local zone's database layout at `version` (0 means latest).
    pub async fn get_db(&self, version: u64) -> Result<DbConfig> {
        let version = self.effective_version(version).await;
        self.versions
            .read()
            .await
            .get(&version)
            .map(|m| m.db.clone())
            .ok_or_else(|| {
                ApplyError::Config(format!("metadata version [{version}] is not loaded"))
            })
    }

    /// Wraparound-aware comparison of two metadata versions.
    pub fn version_gt(&self, a: u64, b: u64) -> bool {
        self.comparator.gt(a, b)
    }

    /// Channel carrying newly published metadata versions.
    pub fn version_updates(&self) -> watch::Receiver<u64> {
        self.client.version_updates()
    }

    async fn effective_version(&self, version: u64) -> u64 {
        if version == 0 {
            *self.latest.read().await
        } else {
            version
        }
    }
}
