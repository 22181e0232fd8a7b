// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Packed per-row conflict marker.
//!
//! Every replicated table carries a reserved unsigned column holding a
//! [`VersionVector`]: the only channel through which the apply engine learns
//! who wrote a row last, under which shard topology, and whether the row is
//! frozen pending manual reconciliation.
//!
//! # Bit layout
//!
//! ```text
//!  63           53 52            33 32   21 20             1  0
//! ┌───────────────┬────────────────┬───────┬────────────────┬────┐
//! │    zone_id    │  meta_version  │ unused│    version     │lock│
//! │   (11 bits)   │   (20 bits)    │       │   (20 bits)    │    │
//! └───────────────┴────────────────┴───────┴────────────────┴────┘
//! ```
//!
//! `zone_id` is the zone that last wrote the row, `meta_version` the
//! shard-topology version in effect at that write (compared with a
//! [`crate::circular::CircularCounter`]), `version` a per-row monotonic
//! write counter, and `lock` the freeze flag set when automatic conflict
//! resolution cannot safely proceed.

use crate::error::{ApplyError, Result};

/// Column name of the packed marker on every replicated table.
pub const VERSION_COLUMN: &str = "version_vector";

/// Highest encodable shard-topology version (20 bits).
pub const MAX_META_VERSION: u64 = (1 << META_BITS) - 1;

/// Highest encodable per-row write counter (20 bits).
pub const MAX_ROW_VERSION: u64 = (1 << VERSION_BITS) - 1;

/// Highest encodable zone id (11 bits above position 53).
pub const MAX_ZONE_ID: u64 = (1 << (64 - ZONE_SHIFT)) - 1;

const META_BITS: u32 = 20;
const VERSION_BITS: u32 = 20;
const ZONE_SHIFT: u32 = 53;
const META_SHIFT: u32 = 33;
const VERSION_SHIFT: u32 = 1;

/// Decoded form of the packed per-row marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionVector {
    /// Zone that last wrote the row.
    pub zone_id: u32,
    /// Shard-topology version in effect at that write.
    pub meta_version: u32,
    /// Per-row monotonic write counter.
    pub version: u32,
    /// Frozen pending manual conflict reconciliation.
    pub lock: bool,
}

impl VersionVector {
    /// Build a marker, validating each field against its bit width.
    pub fn new(zone_id: u32, meta_version: u32, version: u32, lock: bool) -> Result<Self> {
        check_width("zone_id", zone_id as u64, MAX_ZONE_ID)?;
        check_width("meta_version", meta_version as u64, MAX_META_VERSION)?;
        check_width("version", version as u64, MAX_ROW_VERSION)?;
        Ok(Self {
            zone_id,
            meta_version,
            version,
            lock,
        })
    }

    /// Pack into the stored word.
    pub fn encode(&self) -> Result<u64> {
        encode(self.zone_id, self.meta_version, self.version, self.lock)
    }

    /// Unpack a stored word.
    pub fn decode(word: u64) -> Self {
        decode(word)
    }
}

fn check_width(field: &'static str, value: u64, max: u64) -> Result<()> {
    if value > max {
        return Err(ApplyError::FieldRange { field, value, max });
    }
    Ok(())
}

/// Pack the four fields into the stored word.
///
/// Fails with a range error when any field exceeds its bit width.
pub fn encode(zone_id: u32, meta_version: u32, version: u32, lock: bool) -> Result<u64> {
    check_width("zone_id", zone_id as u64, MAX_ZONE_ID)?;
    check_width("meta_version", meta_version as u64, MAX_META_VERSION)?;
    check_width("version", version as u64, MAX_ROW_VERSION)?;
    Ok(((zone_id as u64) << ZONE_SHIFT)
        | ((meta_version as u64) << META_SHIFT)
        | ((version as u64) << VERSION_SHIFT)
        | (lock as u64))
}

/// Unpack a stored word into its four fields.
///
/// The lock flag is the literal bit-0 value. (The system this replaces
/// computed it as `not bool(word | 1)`, which can never observe a set lock;
/// the evident intent is `word & 1`.)
pub fn decode(word: u64) -> VersionVector {
    VersionVector {
        zone_id: (word >> ZONE_SHIFT) as u32,
        meta_version: ((word >> META_SHIFT) & MAX_META_VERSION) as u32,
        version: ((word >> VERSION_SHIFT) & MAX_ROW_VERSION) as u32,
        lock: word & 1 == 1,
    }
}
