//! The backing store contract.
//!
//! The caching layer treats the backing store as the system of record. It
//! only relies on the operations below, and on errors being reported through
//! [`StorageError`](syncstash_core::StorageError) variants so that conflicts,
//! absences and generic failures can be told apart.

use async_trait::async_trait;
use std::collections::BTreeMap;
use syncstash_core::{Bso, BsoUpdate, ItemQuery, LockMode, SetItemOutcome, StashResult, Timestamp};

/// Per-user, per-collection item storage.
///
/// Timestamps returned by write operations are assigned by the store and
/// strictly increase per user.
#[async_trait]
pub trait SyncStorage: Send + Sync + std::fmt::Debug {
    // ========================================================================
    // STORAGE-LEVEL OPERATIONS
    // ========================================================================

    /// Last-modified time of the user's whole storage.
    async fn get_storage_timestamp(&self, user: &str) -> StashResult<Timestamp>;

    /// Last-modified time of every collection the user has.
    async fn get_collection_timestamps(&self, user: &str)
        -> StashResult<BTreeMap<String, Timestamp>>;

    /// Number of live items in each collection.
    async fn get_collection_counts(&self, user: &str) -> StashResult<BTreeMap<String, u64>>;

    /// Payload bytes held by live items, per collection.
    async fn get_collection_sizes(&self, user: &str) -> StashResult<BTreeMap<String, u64>>;

    /// Payload bytes across all collections.
    async fn get_total_size(&self, user: &str) -> StashResult<u64>;

    /// Remove everything stored for the user.
    async fn delete_storage(&self, user: &str) -> StashResult<()>;

    // ========================================================================
    // COLLECTION OPERATIONS
    // ========================================================================

    async fn get_collection_timestamp(&self, user: &str, collection: &str)
        -> StashResult<Timestamp>;

    async fn get_items(
        &self,
        user: &str,
        collection: &str,
        query: &ItemQuery,
    ) -> StashResult<Vec<Bso>>;

    async fn get_item_ids(
        &self,
        user: &str,
        collection: &str,
        query: &ItemQuery,
    ) -> StashResult<Vec<String>>;

    /// Create or update items, returning the timestamp of the write.
    async fn set_items(
        &self,
        user: &str,
        collection: &str,
        items: &[BsoUpdate],
    ) -> StashResult<Timestamp>;

    /// Delete a whole collection, returning the new storage timestamp.
    async fn delete_collection(&self, user: &str, collection: &str) -> StashResult<Timestamp>;

    /// Delete the given items, returning the timestamp of the write.
    async fn delete_items(
        &self,
        user: &str,
        collection: &str,
        ids: &[String],
    ) -> StashResult<Timestamp>;

    // ========================================================================
    // ITEM OPERATIONS
    // ========================================================================

    async fn get_item_timestamp(&self, user: &str, collection: &str, id: &str)
        -> StashResult<Timestamp>;

    async fn get_item(&self, user: &str, collection: &str, id: &str) -> StashResult<Bso>;

    async fn set_item(
        &self,
        user: &str,
        collection: &str,
        id: &str,
        item: &BsoUpdate,
    ) -> StashResult<SetItemOutcome>;

    async fn delete_item(&self, user: &str, collection: &str, id: &str) -> StashResult<Timestamp>;

    // ========================================================================
    // NATIVE LOCKING
    // ========================================================================

    /// Take a per-collection lock without waiting. An incompatible lock
    /// already held elsewhere is reported as a conflict.
    async fn lock_collection(&self, user: &str, collection: &str, mode: LockMode)
        -> StashResult<()>;

    /// Release a lock taken with [`SyncStorage::lock_collection`].
    async fn unlock_collection(&self, user: &str, collection: &str, mode: LockMode)
        -> StashResult<()>;
}
