//! Dirty marking of the metadata record around a write.
//!
//! A write touches the backing store and the cache in separate steps. Before
//! the write starts, the storage timestamp and the written collection's
//! timestamp are swapped for the dirty sentinel with a compare-and-swap.
//! Readers seeing the sentinel recompute from the backing store, so a crash
//! between the two steps can only cost a recomputation.
//!
//! [`DirtyMark::settle`] ends the protocol:
//! - success: the real timestamps are written with a plain set; the dirty
//!   claim makes a compare-and-swap unnecessary. The storage timestamp is
//!   kept at or above the prior value and every known collection timestamp;
//! - store-layer failure: the write did not happen, the prior values are
//!   restored;
//! - any other failure, or a mark dropped unsettled: the record stays dirty.

use super::records::{CachedStamp, MetadataRecord};
use super::traits::{CasToken, JsonCache};
use super::user_key::UserScopedKey;
use syncstash_core::{StashResult, StorageError, Timestamp};
use tracing::{debug, error, warn};

/// New metadata values produced by a completed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataUpdate {
    pub storage_modified: Timestamp,
    /// `None` when the collection was deleted.
    pub collection_modified: Option<Timestamp>,
    pub size_delta: i64,
}

impl MetadataUpdate {
    /// A write that left the collection at `modified`.
    pub fn written(modified: Timestamp, size_delta: i64) -> Self {
        Self {
            storage_modified: modified,
            collection_modified: Some(modified),
            size_delta,
        }
    }

    /// A delete of the whole collection, at storage time `modified`.
    pub fn collection_deleted(modified: Timestamp) -> Self {
        Self {
            storage_modified: modified,
            collection_modified: None,
            size_delta: 0,
        }
    }
}

/// A provisional dirty claim on one collection's metadata.
#[derive(Debug)]
#[must_use = "an unsettled dirty mark leaves the metadata dirty"]
pub struct DirtyMark {
    cache: JsonCache,
    key: UserScopedKey,
    collection: String,
    record: MetadataRecord,
    prior_modified: CachedStamp,
    prior_collection: Option<CachedStamp>,
    settled: bool,
}

impl DirtyMark {
    /// Mark `collection` dirty in `record`, which must have been read with
    /// `token`. Fails with a conflict if the record changed since.
    pub(crate) async fn begin(
        cache: &JsonCache,
        key: UserScopedKey,
        collection: &str,
        mut record: MetadataRecord,
        token: CasToken,
    ) -> StashResult<Self> {
        let (prior_modified, prior_collection) = record.mark_dirty(collection);
        if !cache.cas(key.as_str(), &record, Some(token)).await? {
            debug!(%key, collection, "Lost the race to mark metadata dirty");
            return Err(StorageError::conflict(key.as_str()).into());
        }
        Ok(Self {
            cache: cache.clone(),
            key,
            collection: collection.to_string(),
            record,
            prior_modified,
            prior_collection,
            settled: false,
        })
    }

    /// Finish the protocol with the wrapped write's outcome.
    ///
    /// `update` is called once, only on success, to derive the new metadata.
    /// Cache failures while settling are logged and downgraded to dropping
    /// the metadata record; they never replace `outcome`.
    pub async fn settle<T, F>(mut self, outcome: StashResult<T>, update: F) -> StashResult<T>
    where
        F: FnOnce(&T) -> MetadataUpdate,
    {
        self.settled = true;
        match outcome {
            Ok(value) => {
                let update = update(&value);
                // The storage timestamp never falls below what the record
                // already knew, whatever the write reports.
                let storage_modified = self
                    .prior_modified
                    .known()
                    .into_iter()
                    .chain(self.record.latest_known_collection())
                    .fold(update.storage_modified, Timestamp::max);
                self.record.apply(
                    CachedStamp::Known(storage_modified),
                    &self.collection,
                    update.collection_modified.map(CachedStamp::Known),
                    update.size_delta,
                );
                self.write_back().await;
                Ok(value)
            }
            Err(err) if err.is_store_error() => {
                debug!(key = %self.key, collection = %self.collection, %err, "Rolling back dirty mark");
                self.record.apply(
                    self.prior_modified,
                    &self.collection,
                    self.prior_collection,
                    0,
                );
                self.write_back().await;
                Err(err)
            }
            Err(err) => {
                warn!(key = %self.key, collection = %self.collection, %err, "Write failed; metadata left dirty");
                Err(err)
            }
        }
    }

    async fn write_back(&self) {
        if let Err(err) = self.cache.set(self.key.as_str(), &self.record).await {
            warn!(key = %self.key, %err, "Could not write metadata back; dropping it");
            if let Err(err) = self.cache.delete(self.key.as_str()).await {
                error!(key = %self.key, %err, "Could not drop metadata record");
            }
        }
    }
}

impl Drop for DirtyMark {
    fn drop(&mut self) {
        if !self.settled {
            warn!(key = %self.key, collection = %self.collection, "Dirty mark abandoned; metadata left dirty");
        }
    }
}
