//! The caching storage facade.
//!
//! [`CachedStorage`] presents the backing store's API with metadata and
//! selected collections served from the cache. Every mutation runs under the
//! dirty-marking protocol: the metadata is marked dirty, the collection's
//! manager performs the write, and the mark is settled with the outcome.

use super::context::CallContext;
use super::dirty::MetadataUpdate;
use super::locks::{CollectionLock, LockManager};
use super::managers::{Backends, CachingStrategy, CollectionManager};
use super::memory_client::MemoryCacheClient;
use super::metadata::{payload_total, MetadataCache};
use super::traits::{CacheClient, JsonCache};
use super::user_key::UserScopedKey;
use crate::backend::SyncStorage;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;
use syncstash_core::{
    Bso, BsoUpdate, Clock, ItemQuery, SetItemOutcome, StashConfig, StashResult, StorageError,
    SystemClock, Timestamp,
};
use tracing::{debug, info, warn};

/// Storage with a cache in front of it.
#[derive(Debug, Clone)]
pub struct CachedStorage {
    backends: Backends,
    /// Cached and cache-only collections; everything else is uncached.
    managers: BTreeMap<String, CollectionManager>,
    metadata: MetadataCache,
}

impl CachedStorage {
    /// Wrap `storage` with `cache`.
    ///
    /// Fails if the configuration does not validate.
    pub fn new(
        storage: Arc<dyn SyncStorage>,
        cache: Arc<dyn CacheClient>,
        clock: Arc<dyn Clock>,
        config: &StashConfig,
    ) -> StashResult<Self> {
        config.validate()?;

        let cache = JsonCache::new(cache);
        let locks = LockManager::new(storage.clone(), cache.clone(), clock.clone(), config);
        let backends = Backends {
            storage,
            cache,
            clock,
            locks,
        };

        let configured = config
            .cached_collections
            .iter()
            .map(|name| (name, CachingStrategy::Cached))
            .chain(
                config
                    .cache_only_collections
                    .iter()
                    .map(|name| (name, CachingStrategy::CacheOnly)),
            );
        let mut managers = BTreeMap::new();
        let mut caching = Vec::new();
        for (name, strategy) in configured {
            let manager = CollectionManager::build(strategy, name, &backends);
            caching.push(manager.clone());
            managers.insert(name.clone(), manager);
        }

        let metadata = MetadataCache::new(
            backends.clone(),
            caching,
            config.size_recalculation_period,
        );
        info!(
            cached = config.cached_collections.len(),
            cache_only = config.cache_only_collections.len(),
            cache_lock = config.cache_lock,
            "Caching storage ready"
        );
        Ok(Self {
            backends,
            managers,
            metadata,
        })
    }

    /// Wrap `storage` with an in-process cache built from `config`.
    pub fn with_memory_cache(
        storage: Arc<dyn SyncStorage>,
        config: &StashConfig,
    ) -> StashResult<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let cache = Arc::new(MemoryCacheClient::from_config(config, clock.clone()));
        Self::new(storage, cache, clock, config)
    }

    /// The wrapped backing store.
    pub fn storage(&self) -> &Arc<dyn SyncStorage> {
        &self.backends.storage
    }

    pub fn strategy(&self, collection: &str) -> CachingStrategy {
        self.managers
            .get(collection)
            .map_or(CachingStrategy::Uncached, CollectionManager::strategy)
    }

    fn manager(&self, collection: &str) -> Cow<'_, CollectionManager> {
        match self.managers.get(collection) {
            Some(manager) => Cow::Borrowed(manager),
            None => Cow::Owned(CollectionManager::build(
                CachingStrategy::Uncached,
                collection,
                &self.backends,
            )),
        }
    }

    // ========================================================================
    // LOCKING
    // ========================================================================

    /// Take a shared lock on a collection, reentrant within `ctx`.
    pub async fn lock_for_read(
        &self,
        ctx: &CallContext,
        user: &str,
        collection: &str,
    ) -> StashResult<CollectionLock> {
        self.backends.locks.lock_for_read(ctx, user, collection).await
    }

    /// Take an exclusive lock on a collection.
    pub async fn lock_for_write(
        &self,
        ctx: &CallContext,
        user: &str,
        collection: &str,
    ) -> StashResult<CollectionLock> {
        self.backends
            .locks
            .lock_for_write(ctx, user, collection)
            .await
    }

    // ========================================================================
    // WHOLE-STORAGE OPERATIONS
    // ========================================================================

    /// Last-modified time of the user's whole storage.
    pub async fn get_storage_timestamp(
        &self,
        ctx: &CallContext,
        user: &str,
    ) -> StashResult<Timestamp> {
        let record = self.metadata.get(ctx, user, false).await?;
        if let Some(ts) = record.modified.known() {
            return Ok(ts);
        }
        debug!(user, "Storage timestamp is dirty; reading live values");
        let stored = self.backends.storage.get_storage_timestamp(user).await?;
        let cache_only = self.metadata.cache_only_timestamps(ctx, user).await?;
        Ok(cache_only.into_values().fold(stored, Timestamp::max))
    }

    /// Last-modified time of every existing collection.
    pub async fn get_collection_timestamps(
        &self,
        ctx: &CallContext,
        user: &str,
    ) -> StashResult<BTreeMap<String, Timestamp>> {
        let record = self.metadata.get(ctx, user, false).await?;
        let mut stamps = BTreeMap::new();
        for (collection, stamp) in record.collections {
            let ts = match stamp.known() {
                Some(ts) => ts,
                None => match self.manager(&collection).get_timestamp(ctx, user).await {
                    Ok(ts) => ts,
                    Err(err) if err.is_collection_not_found() => continue,
                    Err(err) => return Err(err),
                },
            };
            stamps.insert(collection, ts);
        }
        Ok(stamps)
    }

    /// Live item counts per collection.
    pub async fn get_collection_counts(
        &self,
        ctx: &CallContext,
        user: &str,
    ) -> StashResult<BTreeMap<String, u64>> {
        let mut counts = self.backends.storage.get_collection_counts(user).await?;
        for (collection, items) in self.metadata.cache_only_items(ctx, user).await? {
            counts.insert(collection, items.len() as u64);
        }
        Ok(counts)
    }

    /// Live payload bytes per collection. Refreshes the cached total size.
    pub async fn get_collection_sizes(
        &self,
        ctx: &CallContext,
        user: &str,
    ) -> StashResult<BTreeMap<String, u64>> {
        let mut sizes = self.backends.storage.get_collection_sizes(user).await?;
        for (collection, items) in self.metadata.cache_only_items(ctx, user).await? {
            sizes.insert(collection, payload_total(&items));
        }
        self.metadata
            .update_total_size(ctx, user, sizes.values().sum())
            .await?;
        Ok(sizes)
    }

    /// Total payload bytes. With `recalculate`, a cached value older than
    /// the recalculation period is recomputed first.
    pub async fn get_total_size(
        &self,
        ctx: &CallContext,
        user: &str,
        recalculate: bool,
    ) -> StashResult<u64> {
        Ok(self.metadata.get(ctx, user, recalculate).await?.size)
    }

    /// Remove everything the user has, cache first.
    pub async fn delete_storage(&self, user: &str) -> StashResult<()> {
        let keys = std::iter::once(UserScopedKey::metadata(user)).chain(
            self.managers
                .keys()
                .map(|collection| UserScopedKey::collection(user, collection)),
        );
        for key in keys {
            self.backends.cache.delete(key.as_str()).await?;
        }
        self.backends.storage.delete_storage(user).await?;
        info!(user, "Deleted storage");
        Ok(())
    }

    // ========================================================================
    // COLLECTION OPERATIONS
    // ========================================================================

    pub async fn get_collection_timestamp(
        &self,
        ctx: &CallContext,
        user: &str,
        collection: &str,
    ) -> StashResult<Timestamp> {
        self.get_collection_timestamps(ctx, user)
            .await?
            .remove(collection)
            .ok_or_else(|| StorageError::collection_not_found(collection).into())
    }

    pub async fn get_items(
        &self,
        ctx: &CallContext,
        user: &str,
        collection: &str,
        query: &ItemQuery,
    ) -> StashResult<Vec<Bso>> {
        self.manager(collection).get_items(ctx, user, query).await
    }

    pub async fn get_item_ids(
        &self,
        ctx: &CallContext,
        user: &str,
        collection: &str,
        query: &ItemQuery,
    ) -> StashResult<Vec<String>> {
        self.manager(collection).get_item_ids(ctx, user, query).await
    }

    pub async fn set_items(
        &self,
        ctx: &CallContext,
        user: &str,
        collection: &str,
        items: &[BsoUpdate],
    ) -> StashResult<Timestamp> {
        let mark = self.metadata.mark_dirty(ctx, user, collection).await?;
        let outcome = self.manager(collection).set_items(ctx, user, items).await;
        let size: u64 = items.iter().map(BsoUpdate::payload_len).sum();
        mark.settle(outcome, |ts| MetadataUpdate::written(*ts, size_delta(size)))
            .await
    }

    pub async fn delete_collection(
        &self,
        ctx: &CallContext,
        user: &str,
        collection: &str,
    ) -> StashResult<Timestamp> {
        let mark = self.metadata.mark_dirty(ctx, user, collection).await?;
        let outcome = self.manager(collection).del_collection(user).await;
        mark.settle(outcome, |ts| MetadataUpdate::collection_deleted(*ts))
            .await
    }

    pub async fn delete_items(
        &self,
        ctx: &CallContext,
        user: &str,
        collection: &str,
        ids: &[String],
    ) -> StashResult<Timestamp> {
        let mark = self.metadata.mark_dirty(ctx, user, collection).await?;
        let outcome = self.manager(collection).del_items(ctx, user, ids).await;
        mark.settle(outcome, |ts| MetadataUpdate::written(*ts, 0))
            .await
    }

    // ========================================================================
    // ITEM OPERATIONS
    // ========================================================================

    pub async fn get_item_timestamp(
        &self,
        ctx: &CallContext,
        user: &str,
        collection: &str,
        id: &str,
    ) -> StashResult<Timestamp> {
        self.manager(collection)
            .get_item_timestamp(ctx, user, id)
            .await
    }

    pub async fn get_item(
        &self,
        ctx: &CallContext,
        user: &str,
        collection: &str,
        id: &str,
    ) -> StashResult<Bso> {
        self.manager(collection).get_item(ctx, user, id).await
    }

    pub async fn set_item(
        &self,
        ctx: &CallContext,
        user: &str,
        collection: &str,
        id: &str,
        item: &BsoUpdate,
    ) -> StashResult<SetItemOutcome> {
        let mark = self.metadata.mark_dirty(ctx, user, collection).await?;
        let outcome = self.manager(collection).set_item(ctx, user, id, item).await;
        let size = size_delta(item.payload_len());
        mark.settle(outcome, |res| MetadataUpdate::written(res.modified, size))
            .await
    }

    pub async fn delete_item(
        &self,
        ctx: &CallContext,
        user: &str,
        collection: &str,
        id: &str,
    ) -> StashResult<Timestamp> {
        let mark = self.metadata.mark_dirty(ctx, user, collection).await?;
        let outcome = self.manager(collection).del_item(ctx, user, id).await;
        mark.settle(outcome, |ts| MetadataUpdate::written(*ts, 0))
            .await
    }
}

fn size_delta(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or_else(|_| {
        warn!(bytes, "Write size overflows the size counter");
        i64::MAX
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::records::{CachedStamp, MetadataRecord};
    use crate::memory::MemoryStorage;
    use std::time::Duration;
    use syncstash_core::ManualClock;

    struct Fixture {
        clock: Arc<ManualClock>,
        storage: Arc<MemoryStorage>,
        cache: Arc<MemoryCacheClient>,
        stash: CachedStorage,
    }

    fn fixture() -> Fixture {
        let config = StashConfig::new()
            .with_cached_collections(["bookmarks"])
            .with_cache_only_collections(["tabs"]);
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(10_000_000)));
        let storage = Arc::new(MemoryStorage::with_clock(clock.clone()));
        let cache = Arc::new(MemoryCacheClient::from_config(&config, clock.clone()));
        let stash = CachedStorage::new(storage.clone(), cache.clone(), clock.clone(), &config)
            .unwrap();
        Fixture {
            clock,
            storage,
            cache,
            stash,
        }
    }

    async fn metadata(f: &Fixture, user: &str) -> MetadataRecord {
        JsonCache::new(f.cache.clone())
            .get(UserScopedKey::metadata(user).as_str())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let clock = Arc::new(ManualClock::new(Timestamp::ZERO));
        let storage = Arc::new(MemoryStorage::with_clock(clock.clone()));
        let cache = Arc::new(MemoryCacheClient::new(clock.clone()));
        let config = StashConfig::new()
            .with_cached_collections(["tabs"])
            .with_cache_only_collections(["tabs"]);
        assert!(CachedStorage::new(storage, cache, clock, &config).is_err());
    }

    #[tokio::test]
    async fn test_memory_cache_constructor_keeps_cache_only_out_of_store() {
        let config = StashConfig::new()
            .with_key_prefix("mem:")
            .with_cache_only_collections(["tabs"]);
        let storage = Arc::new(MemoryStorage::new());
        let stash = CachedStorage::with_memory_cache(storage.clone(), &config).unwrap();
        let ctx = CallContext::new();

        let ts = stash
            .set_items(&ctx, "u1", "tabs", &[BsoUpdate::new("a").with_payload("x")])
            .await
            .unwrap();
        let bso = stash.get_item(&ctx, "u1", "tabs", "a").await.unwrap();
        assert_eq!((bso.payload.as_str(), bso.modified), ("x", ts));
        assert_eq!(stash.get_storage_timestamp(&ctx, "u1").await.unwrap(), ts);
        assert!(storage.get_collection_timestamps("u1").await.unwrap().is_empty());
    }

    #[test]
    fn test_strategy_lookup() {
        let f = fixture();
        assert_eq!(f.stash.strategy("bookmarks"), CachingStrategy::Cached);
        assert_eq!(f.stash.strategy("tabs"), CachingStrategy::CacheOnly);
        assert_eq!(f.stash.strategy("history"), CachingStrategy::Uncached);
    }

    #[tokio::test]
    async fn test_write_commits_metadata() {
        let f = fixture();
        let ctx = CallContext::new();
        let ts = f
            .stash
            .set_items(&ctx, "u1", "history", &[BsoUpdate::new("a").with_payload("abc")])
            .await
            .unwrap();

        let record = metadata(&f, "u1").await;
        assert_eq!(record.modified, CachedStamp::Known(ts));
        assert_eq!(record.collections["history"], CachedStamp::Known(ts));
        assert_eq!(record.size, 3);
        assert_eq!(f.stash.get_storage_timestamp(&ctx, "u1").await.unwrap(), ts);
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back_metadata() {
        let f = fixture();
        let ctx = CallContext::new();
        f.stash
            .set_items(&ctx, "u1", "history", &[BsoUpdate::new("a")])
            .await
            .unwrap();
        let before = metadata(&f, "u1").await;

        let err = f
            .stash
            .delete_item(&ctx, "u1", "history", "missing")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(metadata(&f, "u1").await, before);
    }

    #[tokio::test]
    async fn test_dirty_timestamps_are_recomputed() {
        let f = fixture();
        let ctx = CallContext::new();
        let ts = f
            .stash
            .set_items(&ctx, "u1", "history", &[BsoUpdate::new("a")])
            .await
            .unwrap();

        // A writer that died mid-write leaves its mark behind.
        let mark = f.stash.metadata.mark_dirty(&ctx, "u1", "history").await.unwrap();
        drop(mark);
        assert!(metadata(&f, "u1").await.has_dirty());

        assert_eq!(f.stash.get_storage_timestamp(&ctx, "u1").await.unwrap(), ts);
        let stamps = f.stash.get_collection_timestamps(&ctx, "u1").await.unwrap();
        assert_eq!(stamps["history"], ts);
        assert_eq!(
            f.stash
                .get_collection_timestamp(&ctx, "u1", "history")
                .await
                .unwrap(),
            ts
        );
    }

    #[tokio::test]
    async fn test_collection_timestamp_of_missing_collection() {
        let f = fixture();
        let ctx = CallContext::new();
        let err = f
            .stash
            .get_collection_timestamp(&ctx, "u1", "history")
            .await
            .unwrap_err();
        assert!(err.is_collection_not_found());
    }

    #[tokio::test]
    async fn test_delete_collection_drops_entry() {
        let f = fixture();
        let ctx = CallContext::new();
        f.stash
            .set_items(&ctx, "u1", "tabs", &[BsoUpdate::new("a")])
            .await
            .unwrap();
        let ts = f.stash.delete_collection(&ctx, "u1", "tabs").await.unwrap();

        let record = metadata(&f, "u1").await;
        assert!(!record.collections.contains_key("tabs"));
        assert_eq!(record.modified, CachedStamp::Known(ts));
    }

    #[tokio::test]
    async fn test_total_size_recalculation_is_throttled() {
        let f = fixture();
        let ctx = CallContext::new();
        f.stash
            .set_items(&ctx, "u1", "tabs", &[BsoUpdate::new("a").with_payload("12345")])
            .await
            .unwrap();
        // Bootstrap happened before the write, without a size.
        assert_eq!(f.stash.get_total_size(&ctx, "u1", false).await.unwrap(), 5);

        // Writes straight to the store are invisible to the cached size
        // until a recalculation is due.
        f.storage
            .set_items("u1", "history", &[BsoUpdate::new("b").with_payload("xy")])
            .await
            .unwrap();
        assert_eq!(f.stash.get_total_size(&ctx, "u1", true).await.unwrap(), 7);
        f.storage
            .set_items("u1", "history", &[BsoUpdate::new("c").with_payload("z")])
            .await
            .unwrap();
        assert_eq!(f.stash.get_total_size(&ctx, "u1", true).await.unwrap(), 7);

        f.clock.advance(Duration::from_secs(3601));
        assert_eq!(f.stash.get_total_size(&ctx, "u1", true).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_delete_storage_clears_cache_first() {
        let f = fixture();
        let ctx = CallContext::new();
        f.stash
            .set_items(&ctx, "u1", "bookmarks", &[BsoUpdate::new("a")])
            .await
            .unwrap();
        f.stash
            .set_items(&ctx, "u1", "tabs", &[BsoUpdate::new("b")])
            .await
            .unwrap();
        assert!(f.cache.contains_key("u1:metadata"));

        f.stash.delete_storage("u1").await.unwrap();
        assert!(f.cache.is_empty());
        let stamps = f.stash.get_collection_timestamps(&ctx, "u1").await.unwrap();
        assert!(stamps.is_empty());
    }
}
