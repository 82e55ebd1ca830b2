//! Error types for syncstash operations

use std::time::Duration;
use thiserror::Error;

/// Store-layer errors.
///
/// Every variant here counts as a recoverable store failure: the write that
/// raised it did not take effect, so provisional cache state may be rolled
/// back.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Conflicting concurrent modification of {key}")]
    Conflict { key: String },

    #[error("Collection not found: {collection}")]
    CollectionNotFound { collection: String },

    #[error("Item not found: {item} in collection {collection}")]
    ItemNotFound { collection: String, item: String },

    #[error("Backing store failure: {reason}")]
    Backend { reason: String },

    #[error("Cache failure: {reason}")]
    Cache { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    pub fn conflict(key: impl Into<String>) -> Self {
        StorageError::Conflict { key: key.into() }
    }

    pub fn collection_not_found(collection: impl Into<String>) -> Self {
        StorageError::CollectionNotFound {
            collection: collection.into(),
        }
    }

    pub fn item_not_found(collection: impl Into<String>, item: impl Into<String>) -> Self {
        StorageError::ItemNotFound {
            collection: collection.into(),
            item: item.into(),
        }
    }
}

/// Errors in how a caller built an item query.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("Unknown filter: {name}")]
    UnknownFilter { name: String },

    #[error("Invalid value for filter {name}: {value}")]
    InvalidFilterValue { name: String, value: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Master error type for all syncstash errors.
#[derive(Debug, Clone, Error)]
pub enum StashError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error for {key}: {reason}")]
    Serialization { key: String, reason: String },

    /// A cache-based lock outlived its TTL while still held. Exclusivity can
    /// no longer be assumed for whatever ran under it.
    #[error("Lock {key} expired while held: held for {held_for:?}, ttl {ttl:?}")]
    LockExpired {
        key: String,
        held_for: Duration,
        ttl: Duration,
    },
}

impl StashError {
    /// True for failures raised by the store layer (backing store or cache).
    ///
    /// Rollback guards only restore provisional state for these.
    pub fn is_store_error(&self) -> bool {
        matches!(self, StashError::Storage(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StashError::Storage(StorageError::Conflict { .. }))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StashError::Storage(
                StorageError::CollectionNotFound { .. } | StorageError::ItemNotFound { .. }
            )
        )
    }

    pub fn is_collection_not_found(&self) -> bool {
        matches!(
            self,
            StashError::Storage(StorageError::CollectionNotFound { .. })
        )
    }

    pub fn serialization(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        StashError::Serialization {
            key: key.into(),
            reason: err.to_string(),
        }
    }
}

/// Result type alias for syncstash operations.
pub type StashResult<T> = Result<T, StashError>;

// =============================================================================
// TESTS
// =============================================================================
