//! # Zone Apply
//!
//! The apply side of a multi-zone, active-active MySQL replication fabric.
//! Each zone owns a shard of rows; every zone's writes are captured from
//! its binary log, published as ordered change events, and replayed into
//! every other zone's copy of the data by this engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │                              zone-apply                                │
//! │                                                                        │
//! │  ┌─────────────┐    ┌───────────────┐    ┌──────────────────────────┐  │
//! │  │ BusConsumer │───►│ ApplyEngine   │───►│ Conflict resolution      │  │
//! │  │ (ordered    │    │ (check_lsn +  │    │ (ShardRouter +           │  │
//! │  │  stream)    │    │  dedup)       │    │  VersionVector)          │  │
//! │  └─────────────┘    └───────────────┘    └──────────────────────────┘  │
//! │         │                   │                         │                │
//! │         ▼                   ▼                         ▼                │
//! │  ┌─────────────┐    ┌───────────────┐    ┌──────────────────────────┐  │
//! │  │ MetaManager │    │ SessionPool   │    │ per-row txn:             │  │
//! │  │ (zones,     │    │ (bounded,     │    │ SELECT..FOR UPDATE → DML │  │
//! │  │  shards)    │    │  MySQL)       │    │ → commit / rollback      │  │
//! │  └─────────────┘    └───────────────┘    └──────────────────────────┘  │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Because every zone accepts writes, the same logical row can be modified
//! concurrently in two zones. The engine decides — deterministically and
//! without talking to the remote zone — whether an incoming change is
//! applied, discarded, or frozen for manual reconciliation, using three
//! primitives:
//!
//! - [`event`] — change events with per-zone causal positions (LSNs),
//!   chained through `prev_lsn` for gap detection.
//! - [`version_vector`] — a packed per-row marker recording last writer,
//!   topology version, write counter, and the conflict-lock bit.
//! - [`circular`] — wraparound-safe comparison for the bounded topology
//!   version counter.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use zone_apply::{ApplyConfig, ApplyEngine, ChannelBus, StaticMetaClient};
//!
//! #[tokio::main]
//! async fn main() -> zone_apply::Result<()> {
//!     let config = ApplyConfig::from_toml_file("conf.toml", 0)?;
//!     let meta = Arc::new(StaticMetaClient::new(1, vec![/* zones */]));
//!     let (_tx, bus) = ChannelBus::pair(1024);
//!
//!     let mut engine = ApplyEngine::new(config, meta, bus).await?;
//!     engine.start().await?;
//!     engine.run().await // consumes until shutdown or end of stream
//! }
//! ```

pub mod bus;
pub mod circular;
pub mod config;
pub mod dsn;
pub mod engine;
pub mod error;
pub mod event;
pub mod meta;
pub mod metrics;
pub mod route;
pub mod session;
pub mod sql;
pub mod version_vector;

// Re-exports for convenience
pub use bus::{BusConsumer, BusMessage, ChannelBus};
pub use circular::CircularCounter;
pub use config::{ApplyConfig, BusConfig, MetaServiceConfig};
pub use engine::{lsn_chain_continues, ApplyEngine, EngineState, ShutdownHandle};
pub use error::{ApplyError, Result};
pub use event::{ChangeEvent, EventType, Lsn, Row, RowChange};
pub use meta::{DbConfig, DbNode, DbTable, MetaClient, MetaManager, StaticMetaClient, ZoneConfig};
pub use route::{PartitionAlgorithm, ShardRoute, ShardRouter};
pub use session::{Session, SessionPool};
pub use version_vector::{VersionVector, VERSION_COLUMN};
