//! Per-collection caching strategies.
//!
//! Each configured collection gets one manager, chosen once when the facade
//! is built. Collections not named in the configuration are uncached.

mod base;
mod cache_only;
mod cached;
mod uncached;

use self::base::CachedCollection;
use self::cache_only::CacheOnlyManager;
use self::cached::CachedManager;
use self::uncached::UncachedManager;
use super::context::CallContext;
use super::locks::LockManager;
use super::traits::JsonCache;
use crate::backend::SyncStorage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use syncstash_core::{Bso, BsoUpdate, Clock, ItemQuery, SetItemOutcome, StashResult, Timestamp};

/// Collaborators shared by every manager.
#[derive(Debug, Clone)]
pub(crate) struct Backends {
    pub storage: Arc<dyn SyncStorage>,
    pub cache: JsonCache,
    pub clock: Arc<dyn Clock>,
    pub locks: LockManager,
}

/// How a collection is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachingStrategy {
    /// Backing store only.
    Uncached,
    /// Backing store, with a write-through copy in the cache.
    Cached,
    /// Cache only.
    CacheOnly,
}

impl CachingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CachingStrategy::Uncached => "uncached",
            CachingStrategy::Cached => "cached",
            CachingStrategy::CacheOnly => "cache_only",
        }
    }
}

impl fmt::Display for CachingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub(crate) enum CollectionManager {
    Uncached(UncachedManager),
    Cached(CachedManager),
    CacheOnly(CacheOnlyManager),
}

impl CollectionManager {
    pub(crate) fn build(strategy: CachingStrategy, collection: &str, backends: &Backends) -> Self {
        match strategy {
            CachingStrategy::Uncached => CollectionManager::Uncached(UncachedManager::new(
                collection,
                backends.storage.clone(),
            )),
            CachingStrategy::Cached => {
                CollectionManager::Cached(CachedManager::new(collection, backends.clone()))
            }
            CachingStrategy::CacheOnly => {
                CollectionManager::CacheOnly(CacheOnlyManager::new(collection, backends.clone()))
            }
        }
    }

    pub(crate) fn collection(&self) -> &str {
        match self {
            CollectionManager::Uncached(m) => m.collection(),
            CollectionManager::Cached(m) => CachedCollection::collection(m),
            CollectionManager::CacheOnly(m) => CachedCollection::collection(m),
        }
    }

    pub(crate) fn strategy(&self) -> CachingStrategy {
        match self {
            CollectionManager::Uncached(_) => CachingStrategy::Uncached,
            CollectionManager::Cached(_) => CachingStrategy::Cached,
            CollectionManager::CacheOnly(_) => CachingStrategy::CacheOnly,
        }
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub(crate) async fn get_timestamp(&self, ctx: &CallContext, user: &str) -> StashResult<Timestamp> {
        match self {
            CollectionManager::Uncached(m) => m.get_timestamp(user).await,
            CollectionManager::Cached(m) => m.get_timestamp(ctx, user).await,
            CollectionManager::CacheOnly(m) => m.get_timestamp(ctx, user).await,
        }
    }

    pub(crate) async fn get_items(
        &self,
        ctx: &CallContext,
        user: &str,
        query: &ItemQuery,
    ) -> StashResult<Vec<Bso>> {
        match self {
            CollectionManager::Uncached(m) => m.get_items(user, query).await,
            CollectionManager::Cached(m) => m.get_items(ctx, user, query).await,
            CollectionManager::CacheOnly(m) => m.get_items(ctx, user, query).await,
        }
    }

    pub(crate) async fn get_item_ids(
        &self,
        ctx: &CallContext,
        user: &str,
        query: &ItemQuery,
    ) -> StashResult<Vec<String>> {
        match self {
            CollectionManager::Uncached(m) => m.get_item_ids(user, query).await,
            CollectionManager::Cached(m) => m.get_item_ids(ctx, user, query).await,
            CollectionManager::CacheOnly(m) => m.get_item_ids(ctx, user, query).await,
        }
    }

    pub(crate) async fn get_item(&self, ctx: &CallContext, user: &str, id: &str) -> StashResult<Bso> {
        match self {
            CollectionManager::Uncached(m) => m.get_item(user, id).await,
            CollectionManager::Cached(m) => m.get_item(ctx, user, id).await,
            CollectionManager::CacheOnly(m) => m.get_item(ctx, user, id).await,
        }
    }

    pub(crate) async fn get_item_timestamp(
        &self,
        ctx: &CallContext,
        user: &str,
        id: &str,
    ) -> StashResult<Timestamp> {
        match self {
            CollectionManager::Uncached(m) => m.get_item_timestamp(user, id).await,
            CollectionManager::Cached(m) => m.get_item_timestamp(ctx, user, id).await,
            CollectionManager::CacheOnly(m) => m.get_item_timestamp(ctx, user, id).await,
        }
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    pub(crate) async fn set_items(
        &self,
        ctx: &CallContext,
        user: &str,
        items: &[BsoUpdate],
    ) -> StashResult<Timestamp> {
        match self {
            CollectionManager::Uncached(m) => m.set_items(user, items).await,
            CollectionManager::Cached(m) => m.set_items(ctx, user, items).await,
            CollectionManager::CacheOnly(m) => m.set_items(ctx, user, items).await,
        }
    }

    pub(crate) async fn del_collection(&self, user: &str) -> StashResult<Timestamp> {
        match self {
            CollectionManager::Uncached(m) => m.del_collection(user).await,
            CollectionManager::Cached(m) => m.del_collection(user).await,
            CollectionManager::CacheOnly(m) => m.del_collection(user).await,
        }
    }

    pub(crate) async fn del_items(
        &self,
        ctx: &CallContext,
        user: &str,
        ids: &[String],
    ) -> StashResult<Timestamp> {
        match self {
            CollectionManager::Uncached(m) => m.del_items(user, ids).await,
            CollectionManager::Cached(m) => m.del_items(ctx, user, ids).await,
            CollectionManager::CacheOnly(m) => m.del_items(ctx, user, ids).await,
        }
    }

    pub(crate) async fn set_item(
        &self,
        ctx: &CallContext,
        user: &str,
        id: &str,
        item: &BsoUpdate,
    ) -> StashResult<SetItemOutcome> {
        match self {
            CollectionManager::Uncached(m) => m.set_item(user, id, item).await,
            CollectionManager::Cached(m) => m.set_item(ctx, user, id, item).await,
            CollectionManager::CacheOnly(m) => m.set_item(ctx, user, id, item).await,
        }
    }

    pub(crate) async fn del_item(&self, ctx: &CallContext, user: &str, id: &str) -> StashResult<Timestamp> {
        match self {
            CollectionManager::Uncached(m) => m.del_item(user, id).await,
            CollectionManager::Cached(m) => m.del_item(ctx, user, id).await,
            CollectionManager::CacheOnly(m) => m.del_item(ctx, user, id).await,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
