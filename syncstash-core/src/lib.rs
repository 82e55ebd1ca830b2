//! syncstash Core - Data Types
//!
//! Pure data structures shared by the backing store contract and the caching
//! layer: timestamps, basic storage objects (BSOs), item queries, clocks,
//! errors and configuration.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod clock;
pub mod config;
pub mod error;
pub mod query;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::StashConfig;
pub use error::{ConfigError, QueryError, StashError, StashResult, StorageError};
pub use query::{ItemQuery, SortOrder};

// ============================================================================
// TIMESTAMPS
// ============================================================================

/// Last-modified timestamp, in milliseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn from_millis(millis: i64) -> Self {
        Timestamp(millis)
    }

    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Whole seconds, rounded down. Item TTLs are expressed in seconds.
    pub const fn as_secs(self) -> i64 {
        self.0.div_euclid(1000)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// BASIC STORAGE OBJECTS
// ============================================================================

/// A stored item.
///
/// `modified` is assigned by the write path. `ttl` is an absolute expiry time
/// in epoch seconds; expired items read as absent but stay stored until
/// deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bso {
    pub id: String,
    pub modified: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sortindex: Option<i64>,
    #[serde(default)]
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

impl Bso {
    /// Whether the item is still readable at `now_secs`.
    pub fn is_live(&self, now_secs: i64) -> bool {
        self.ttl.map_or(true, |ttl| ttl > now_secs)
    }

    pub fn payload_len(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// Caller-supplied data for creating or updating an item.
///
/// Only the fields that are `Some` are written. An update without a payload
/// changes metadata (sortindex, ttl) and leaves the item's `modified` alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BsoUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sortindex: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

impl BsoUpdate {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_sortindex(mut self, sortindex: i64) -> Self {
        self.sortindex = Some(sortindex);
        self
    }

    pub fn with_ttl(mut self, ttl: i64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Payload bytes this update contributes to the storage size.
    pub fn payload_len(&self) -> u64 {
        self.payload.as_ref().map_or(0, |p| p.len() as u64)
    }

    /// Merge the present fields into an existing item.
    pub fn merge_into(&self, bso: &mut Bso, modified: Timestamp) {
        if let Some(payload) = &self.payload {
            bso.payload = payload.clone();
            bso.modified = modified;
        }
        if let Some(sortindex) = self.sortindex {
            bso.sortindex = Some(sortindex);
        }
        if let Some(ttl) = self.ttl {
            bso.ttl = Some(ttl);
        }
    }

    /// Build a brand new item. New items are always stamped, with or without
    /// a payload.
    pub fn to_new_bso(&self, modified: Timestamp) -> Bso {
        Bso {
            id: self.id.clone(),
            modified,
            sortindex: self.sortindex,
            payload: self.payload.clone().unwrap_or_default(),
            ttl: self.ttl,
        }
    }
}

/// Result of a single-item write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetItemOutcome {
    pub created: bool,
    pub modified: Timestamp,
}

// ============================================================================
// LOCKING
// ============================================================================

/// Lock mode determining concurrency behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Only one holder can acquire the lock
    Exclusive,
    /// Multiple holders can acquire the lock
    Shared,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::Exclusive => "exclusive",
            LockMode::Shared => "shared",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
