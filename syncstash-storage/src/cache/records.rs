//! Records stored in the cache.
//!
//! Both records are JSON documents. [`MetadataRecord`] holds one user's
//! size and timestamp summary; [`CollectionRecord`] holds a whole cached
//! collection.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use syncstash_core::{Bso, BsoUpdate, Timestamp};

// ============================================================================
// METADATA
// ============================================================================

/// A timestamp in the metadata record, or the dirty sentinel.
///
/// `Dirty` means the value is unknown and must be recomputed from the
/// backing store. On the wire it is `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<Timestamp>", into = "Option<Timestamp>")]
pub enum CachedStamp {
    Known(Timestamp),
    Dirty,
}

impl CachedStamp {
    pub fn known(self) -> Option<Timestamp> {
        match self {
            CachedStamp::Known(ts) => Some(ts),
            CachedStamp::Dirty => None,
        }
    }

    pub fn is_dirty(self) -> bool {
        matches!(self, CachedStamp::Dirty)
    }
}

impl From<Option<Timestamp>> for CachedStamp {
    fn from(value: Option<Timestamp>) -> Self {
        value.map_or(CachedStamp::Dirty, CachedStamp::Known)
    }
}

impl From<CachedStamp> for Option<Timestamp> {
    fn from(value: CachedStamp) -> Self {
        value.known()
    }
}

impl From<Timestamp> for CachedStamp {
    fn from(value: Timestamp) -> Self {
        CachedStamp::Known(value)
    }
}

/// Per-user summary kept as a single cache entry.
///
/// When no field is dirty, `modified` is at least every collection
/// timestamp. The record is always replaced as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    /// Approximate payload bytes across all collections.
    pub size: u64,
    /// Epoch seconds of the last size recalculation; 0 if never.
    pub last_size_recalc: i64,
    /// Storage-level last-modified time.
    pub modified: CachedStamp,
    /// Last-modified time of each known collection.
    pub collections: BTreeMap<String, CachedStamp>,
}

impl MetadataRecord {
    /// Build a fully computed record.
    pub fn new(modified: Timestamp, collections: BTreeMap<String, Timestamp>) -> Self {
        Self {
            size: 0,
            last_size_recalc: 0,
            modified: CachedStamp::Known(modified),
            collections: collections
                .into_iter()
                .map(|(name, ts)| (name, CachedStamp::Known(ts)))
                .collect(),
        }
    }

    /// Mark the storage timestamp and one collection dirty.
    ///
    /// Returns the values that were replaced; a `None` collection value means
    /// the collection had no entry.
    pub fn mark_dirty(&mut self, collection: &str) -> (CachedStamp, Option<CachedStamp>) {
        let prior_modified = std::mem::replace(&mut self.modified, CachedStamp::Dirty);
        let prior_collection = self
            .collections
            .insert(collection.to_string(), CachedStamp::Dirty);
        (prior_modified, prior_collection)
    }

    /// Write new values for the storage timestamp and one collection.
    ///
    /// A `None` collection value removes the collection's entry.
    pub fn apply(
        &mut self,
        modified: CachedStamp,
        collection: &str,
        collection_modified: Option<CachedStamp>,
        size_delta: i64,
    ) {
        self.modified = modified;
        match collection_modified {
            Some(stamp) => {
                self.collections.insert(collection.to_string(), stamp);
            }
            None => {
                self.collections.remove(collection);
            }
        }
        self.size = self.size.saturating_add_signed(size_delta);
    }

    /// The newest collection timestamp that is not dirty.
    pub fn latest_known_collection(&self) -> Option<Timestamp> {
        self.collections.values().filter_map(|s| s.known()).max()
    }

    /// Whether any timestamp in the record is dirty.
    pub fn has_dirty(&self) -> bool {
        self.modified.is_dirty() || self.collections.values().any(|s| s.is_dirty())
    }
}

// ============================================================================
// COLLECTIONS
// ============================================================================

/// A collection held in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub modified: Timestamp,
    pub items: BTreeMap<String, Bso>,
}

impl CollectionRecord {
    pub fn new(modified: Timestamp) -> Self {
        Self {
            modified,
            items: BTreeMap::new(),
        }
    }

    pub fn from_items(modified: Timestamp, items: impl IntoIterator<Item = Bso>) -> Self {
        Self {
            modified,
            items: items.into_iter().map(|bso| (bso.id.clone(), bso)).collect(),
        }
    }

    /// A write stamped `modified` is only accepted if it is newer than
    /// the record.
    pub fn accepts(&self, modified: Timestamp) -> bool {
        modified > self.modified
    }

    /// Merge updates into the record. Items carrying a payload are stamped
    /// with `modified`. The record's own timestamp moves only when an item
    /// is created. Returns the number of created items.
    pub fn merge_items(&mut self, items: &[BsoUpdate], modified: Timestamp) -> usize {
        let mut created = 0;
        for update in items {
            match self.items.get_mut(&update.id) {
                Some(existing) => update.merge_into(existing, modified),
                None => {
                    created += 1;
                    self.items
                        .insert(update.id.clone(), update.to_new_bso(modified));
                }
            }
        }
        if created > 0 {
            self.modified = modified;
        }
        created
    }

    /// Remove items by id. The record's timestamp moves only when something
    /// was removed. Returns the number of removed items.
    pub fn remove_items(&mut self, ids: &[String], modified: Timestamp) -> usize {
        let removed = ids
            .iter()
            .filter(|id| self.items.remove(id.as_str()).is_some())
            .count();
        if removed > 0 {
            self.modified = modified;
        }
        removed
    }
}
