// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the apply engine.
//!
//! Errors are split into two families:
//!
//! | Error Type | Fatal | Description |
//! |------------|-------|-------------|
//! | `LsnGap` | Yes | Causal discontinuity in the event stream |
//! | `UnknownTable` | Yes | Event for a table with no route (stale metadata) |
//! | `UnknownNode` | Yes | Configured node absent from metadata |
//! | `UnknownAlgorithm` | Yes | Partition algorithm name not registered |
//! | `UnknownShard` | Yes | zsid with no owning zone |
//! | `MissingLockKey` | Yes | Row-change missing a lock-key column |
//! | `MissingVersionColumn` | Yes | Row without the reserved conflict marker |
//! | `FieldRange` | Yes | Version-vector field exceeds its bit width |
//! | `EventParse` | Yes | Malformed change event on the bus |
//! | `Config` | Yes | Configuration invalid |
//! | `InvalidState` | Yes | Engine lifecycle violation |
//! | `Db` | No | Database session failure (operator attention) |
//! | `Bus` | No | Message bus consume failure |
//! | `Shutdown` | Yes | Engine is shutting down |
//! | `Internal` | Yes | Unexpected internal error |
//!
//! Fatal errors mean the local replica's state can no longer be proven
//! consistent with the remote stream; the worker must stop consuming rather
//! than silently skip data. Conflict anomalies are NOT errors: they are
//! logged with enough context for manual reconciliation and the loop
//! continues (see the engine module).

use thiserror::Error;

/// Result type alias for apply operations.
pub type Result<T> = std::result::Result<T, ApplyError>;

/// Errors that can occur while applying a remote change stream.
#[derive(Error, Debug)]
pub enum ApplyError {
    /// A change event arrived whose `prev_lsn` does not chain onto the last
    /// applied LSN. A missed event means the local replica is no longer
    /// provably consistent; processing must stop.
    #[error("lsn gap: last applied {last:?}, incoming event {lsn}")]
    LsnGap { last: Option<String>, lsn: String },

    /// Event for a table with no known shard route.
    ///
    /// Indicates stale or missing metadata; continuing would silently drop
    /// mutations for that table.
    #[error("unknown table [{table}]")]
    UnknownTable { table: String },

    /// The configured node name is absent from the metadata's node map.
    #[error("unknown node [{0}]")]
    UnknownNode(String),

    /// Partition algorithm name not in the closed registry.
    #[error("unknown algorithm [{0}]")]
    UnknownAlgorithm(String),

    /// A computed shard id has no owning zone in the zsid table.
    #[error("unknown shard [zsid {zsid}]")]
    UnknownShard { zsid: u32 },

    /// A row-change payload is missing one of the table's lock-key columns,
    /// so a unique row cannot be targeted safely.
    #[error("row-change for table [{table}] missing lock key column [{column}]")]
    MissingLockKey { table: String, column: String },

    /// A row (event-side or local) lacks the reserved version-vector column.
    #[error("row for table [{table}] missing version vector column")]
    MissingVersionColumn { table: String },

    /// A version-vector field exceeds its packed bit width.
    #[error("version vector field {field} = {value} exceeds max {max}")]
    FieldRange {
        field: &'static str,
        value: u64,
        max: u64,
    },

    /// Change event could not be decoded from its wire form.
    #[error("event parse error: {0}")]
    EventParse(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Engine lifecycle violation (e.g. `start()` on a running engine).
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Database session or pool error.
    #[error("db error ({operation}): {message}")]
    Db {
        operation: String,
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },

    /// Message bus consume failure.
    #[error("bus error: {0}")]
    Bus(String),

    /// Shutdown in progress.
    #[error("shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApplyError {
    /// Create a db error from an sqlx error.
    pub fn db(operation: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Db {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a db error without a source.
    pub fn db_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Db {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check whether this error must halt the consume loop.
    ///
    /// Fatal errors indicate causal discontinuity or metadata inconsistency:
    /// resuming past them risks silent divergence between zones. Non-fatal
    /// errors are transient infrastructure failures where a supervisor may
    /// reconnect and resume from the last applied LSN.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::LsnGap { .. } => true,
            Self::UnknownTable { .. } => true,
            Self::UnknownNode(_) => true,
            Self::UnknownAlgorithm(_) => true,
            Self::UnknownShard { .. } => true,
            Self::MissingLockKey { .. } => true,
            Self::MissingVersionColumn { .. } => true,
            Self::FieldRange { .. } => true,
            Self::EventParse(_) => true,
            Self::Config(_) => true,
            Self::InvalidState { .. } => true,
            Self::Db { .. } => false,
            Self::Bus(_) => false,
            Self::Shutdown => true,
            Self::Internal(_) => true,
        }
    }
}
