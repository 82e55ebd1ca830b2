//! The per-user metadata record.
//!
//! Holds the storage timestamp, per-collection timestamps and the total
//! size under `<user>:metadata`. A missing record is bootstrapped from the
//! backing store plus the cache-held collections and added without
//! clobbering a concurrent bootstrap.

use super::context::CallContext;
use super::dirty::DirtyMark;
use super::managers::{Backends, CachingStrategy, CollectionManager};
use super::records::MetadataRecord;
use super::traits::CasToken;
use super::user_key::UserScopedKey;
use std::collections::BTreeMap;
use std::time::Duration;
use syncstash_core::{Bso, ItemQuery, StashResult, StorageError, Timestamp};
use tracing::debug;

#[derive(Debug, Clone)]
pub(crate) struct MetadataCache {
    backends: Backends,
    /// Cached and cache-only managers, in configuration order.
    caching: Vec<CollectionManager>,
    recalculation_period: Duration,
}

impl MetadataCache {
    pub(crate) fn new(
        backends: Backends,
        caching: Vec<CollectionManager>,
        recalculation_period: Duration,
    ) -> Self {
        Self {
            backends,
            caching,
            recalculation_period,
        }
    }

    /// Read the record, bootstrapping it if absent.
    ///
    /// With `recalculate`, a cached total size older than the recalculation
    /// period is recomputed and written back. Losing either write race is
    /// not an error; the computed record is returned regardless.
    pub(crate) async fn get(
        &self,
        ctx: &CallContext,
        user: &str,
        recalculate: bool,
    ) -> StashResult<MetadataRecord> {
        let key = UserScopedKey::metadata(user);
        let cache = &self.backends.cache;
        let Some((mut record, token)) = cache.gets::<MetadataRecord>(key.as_str()).await? else {
            return self.bootstrap(ctx, user, recalculate).await;
        };

        if recalculate && self.size_is_stale(&record) {
            record.last_size_recalc = self.now_secs();
            record.size = self.recalculate_total_size(ctx, user).await?;
            if !cache.cas(key.as_str(), &record, Some(token)).await? {
                debug!(%key, "Size recalculation lost a race; keeping the computed value");
            }
        }
        Ok(record)
    }

    async fn bootstrap(
        &self,
        ctx: &CallContext,
        user: &str,
        recalculate: bool,
    ) -> StashResult<MetadataRecord> {
        let storage = &self.backends.storage;
        let mut stamps = storage.get_collection_timestamps(user).await?;
        for manager in &self.caching {
            if stamps.contains_key(manager.collection()) {
                continue;
            }
            match manager.get_timestamp(ctx, user).await {
                Ok(ts) => {
                    stamps.insert(manager.collection().to_string(), ts);
                }
                Err(err) if err.is_collection_not_found() => {}
                Err(err) => return Err(err),
            }
        }

        let storage_modified = storage.get_storage_timestamp(user).await?;
        let modified = stamps.values().copied().fold(storage_modified, Timestamp::max);
        let mut record = MetadataRecord::new(modified, stamps);
        if recalculate {
            record.last_size_recalc = self.now_secs();
            record.size = self.recalculate_total_size(ctx, user).await?;
        }

        let key = UserScopedKey::metadata(user);
        if self.backends.cache.cas(key.as_str(), &record, None).await? {
            debug!(%key, collections = record.collections.len(), "Bootstrapped metadata");
        } else {
            debug!(%key, "Metadata bootstrapped concurrently");
        }
        Ok(record)
    }

    /// Read the record with its token, bootstrapping once if absent.
    async fn gets(
        &self,
        ctx: &CallContext,
        user: &str,
    ) -> StashResult<Option<(MetadataRecord, CasToken)>> {
        let key = UserScopedKey::metadata(user);
        let cache = &self.backends.cache;
        if let Some(found) = cache.gets(key.as_str()).await? {
            return Ok(Some(found));
        }
        self.bootstrap(ctx, user, false).await?;
        cache.gets(key.as_str()).await
    }

    /// Overwrite the cached total size.
    pub(crate) async fn update_total_size(
        &self,
        ctx: &CallContext,
        user: &str,
        size: u64,
    ) -> StashResult<()> {
        let Some((mut record, token)) = self.gets(ctx, user).await? else {
            return Ok(());
        };
        record.last_size_recalc = self.now_secs();
        record.size = size;
        let key = UserScopedKey::metadata(user);
        if !self.backends.cache.cas(key.as_str(), &record, Some(token)).await? {
            debug!(%key, size, "Total size update lost a race");
        }
        Ok(())
    }

    /// Backing store total plus the live payload bytes of every cache-only
    /// collection.
    pub(crate) async fn recalculate_total_size(
        &self,
        ctx: &CallContext,
        user: &str,
    ) -> StashResult<u64> {
        let stored = self.backends.storage.get_total_size(user).await?;
        let cached: u64 = self
            .cache_only_items(ctx, user)
            .await?
            .values()
            .map(|items| payload_total(items))
            .sum();
        Ok(stored + cached)
    }

    /// Mark `collection` and the storage timestamp dirty ahead of a write.
    pub(crate) async fn mark_dirty(
        &self,
        ctx: &CallContext,
        user: &str,
        collection: &str,
    ) -> StashResult<DirtyMark> {
        let key = UserScopedKey::metadata(user);
        let Some((record, token)) = self.gets(ctx, user).await? else {
            return Err(StorageError::conflict(key.as_str()).into());
        };
        debug!(%key, collection, "Marking collection dirty");
        DirtyMark::begin(&self.backends.cache, key, collection, record, token).await
    }

    // ========================================================================
    // CACHE-ONLY COLLECTIONS
    // ========================================================================

    fn cache_only(&self) -> impl Iterator<Item = &CollectionManager> {
        self.caching
            .iter()
            .filter(|m| m.strategy() == CachingStrategy::CacheOnly)
    }

    /// Timestamps of the cache-only collections that currently exist.
    pub(crate) async fn cache_only_timestamps(
        &self,
        ctx: &CallContext,
        user: &str,
    ) -> StashResult<BTreeMap<String, Timestamp>> {
        let mut stamps = BTreeMap::new();
        for manager in self.cache_only() {
            match manager.get_timestamp(ctx, user).await {
                Ok(ts) => {
                    stamps.insert(manager.collection().to_string(), ts);
                }
                Err(err) if err.is_collection_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(stamps)
    }

    /// Live items of the cache-only collections that currently exist.
    pub(crate) async fn cache_only_items(
        &self,
        ctx: &CallContext,
        user: &str,
    ) -> StashResult<BTreeMap<String, Vec<Bso>>> {
        let mut found = BTreeMap::new();
        for manager in self.cache_only() {
            match manager.get_items(ctx, user, &ItemQuery::new()).await {
                Ok(items) => {
                    found.insert(manager.collection().to_string(), items);
                }
                Err(err) if err.is_collection_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(found)
    }

    fn now_secs(&self) -> i64 {
        self.backends.clock.now().as_secs()
    }

    fn size_is_stale(&self, record: &MetadataRecord) -> bool {
        let period = i64::try_from(self.recalculation_period.as_secs()).unwrap_or(i64::MAX);
        self.now_secs().saturating_sub(record.last_size_recalc) > period
    }
}

pub(crate) fn payload_total(items: &[Bso]) -> u64 {
    items.iter().map(Bso::payload_len).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SyncStorage;
    use crate::cache::dirty::MetadataUpdate;
    use crate::cache::locks::LockManager;
    use crate::cache::records::CachedStamp;
    use crate::cache::traits::JsonCache;
    use crate::cache::MemoryCacheClient;
    use crate::memory::MemoryStorage;
    use std::sync::Arc;
    use syncstash_core::{BsoUpdate, Clock, ManualClock, StashConfig};

    struct Fixture {
        clock: Arc<ManualClock>,
        storage: Arc<MemoryStorage>,
        cache: Arc<MemoryCacheClient>,
        tabs: CollectionManager,
        metadata: MetadataCache,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(10_000_000)));
        let storage = Arc::new(MemoryStorage::with_clock(clock.clone()));
        let cache = Arc::new(MemoryCacheClient::new(clock.clone()));
        let json = JsonCache::new(cache.clone());
        let config = StashConfig::new().with_cache_only_collections(["tabs"]);
        let locks = LockManager::new(storage.clone(), json.clone(), clock.clone(), &config);
        let backends = Backends {
            storage: storage.clone(),
            cache: json,
            clock: clock.clone(),
            locks,
        };
        let tabs = CollectionManager::build(CachingStrategy::CacheOnly, "tabs", &backends);
        let bookmarks = CollectionManager::build(CachingStrategy::Cached, "bookmarks", &backends);
        let metadata = MetadataCache::new(
            backends,
            vec![bookmarks, tabs.clone()],
            Duration::from_secs(3600),
        );
        Fixture {
            clock,
            storage,
            cache,
            tabs,
            metadata,
        }
    }

    async fn seed(f: &Fixture) -> (Timestamp, Timestamp) {
        let ctx = CallContext::new();
        let history = f
            .storage
            .set_items("u1", "history", &[BsoUpdate::new("h").with_payload("abc")])
            .await
            .unwrap();
        let tabs = f
            .tabs
            .set_items(&ctx, "u1", &[BsoUpdate::new("t").with_payload("12345")])
            .await
            .unwrap();
        (history, tabs)
    }

    #[tokio::test]
    async fn test_bootstrap_covers_store_and_cache_only_collections() {
        let f = fixture();
        let ctx = CallContext::new();
        let (history, tabs) = seed(&f).await;

        let record = f.metadata.get(&ctx, "u1", false).await.unwrap();
        assert_eq!(record.modified, CachedStamp::Known(history.max(tabs)));
        assert_eq!(record.collections["history"], CachedStamp::Known(history));
        assert_eq!(record.collections["tabs"], CachedStamp::Known(tabs));
        assert!(!record.collections.contains_key("bookmarks"));
        assert_eq!((record.size, record.last_size_recalc), (0, 0));
        assert!(f.cache.contains_key("u1:metadata"));

        // Later reads come from the cache, not from a fresh bootstrap.
        f.storage
            .set_items("u1", "forms", &[BsoUpdate::new("x")])
            .await
            .unwrap();
        assert_eq!(f.metadata.get(&ctx, "u1", false).await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_bootstrap_for_unknown_user_is_empty() {
        let f = fixture();
        let record = f.metadata.get(&CallContext::new(), "nobody", false).await.unwrap();
        assert_eq!(record.modified, CachedStamp::Known(Timestamp::ZERO));
        assert!(record.collections.is_empty());
    }

    #[tokio::test]
    async fn test_size_recalculation_is_throttled() {
        let f = fixture();
        let ctx = CallContext::new();
        seed(&f).await;

        let record = f.metadata.get(&ctx, "u1", true).await.unwrap();
        assert_eq!(record.size, 8);
        assert_eq!(record.last_size_recalc, f.clock.now().as_secs());

        f.storage
            .set_items("u1", "history", &[BsoUpdate::new("y").with_payload("xy")])
            .await
            .unwrap();
        assert_eq!(f.metadata.get(&ctx, "u1", true).await.unwrap().size, 8);

        f.clock.advance(Duration::from_secs(3601));
        assert_eq!(f.metadata.get(&ctx, "u1", true).await.unwrap().size, 10);
        assert_eq!(f.metadata.recalculate_total_size(&ctx, "u1").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_update_total_size_overwrites_cached_value() {
        let f = fixture();
        let ctx = CallContext::new();
        seed(&f).await;

        f.metadata.update_total_size(&ctx, "u1", 42).await.unwrap();
        let record = f.metadata.get(&ctx, "u1", false).await.unwrap();
        assert_eq!(record.size, 42);
        assert_eq!(record.last_size_recalc, f.clock.now().as_secs());
    }

    #[tokio::test]
    async fn test_mark_dirty_bootstraps_missing_record() {
        let f = fixture();
        let ctx = CallContext::new();
        let (history, _) = seed(&f).await;

        let mark = f.metadata.mark_dirty(&ctx, "u1", "history").await.unwrap();
        let record = f.metadata.get(&ctx, "u1", false).await.unwrap();
        assert!(record.modified.is_dirty());
        assert!(record.collections["history"].is_dirty());
        assert!(!record.collections["tabs"].is_dirty());

        mark.settle(Ok(history), |ts| MetadataUpdate::written(*ts, 0))
            .await
            .unwrap();
        assert!(!f.metadata.get(&ctx, "u1", false).await.unwrap().has_dirty());
    }

    #[tokio::test]
    async fn test_cache_only_views_skip_missing_collections() {
        let f = fixture();
        let ctx = CallContext::new();
        assert!(f.metadata.cache_only_timestamps(&ctx, "u1").await.unwrap().is_empty());
        assert!(f.metadata.cache_only_items(&ctx, "u1").await.unwrap().is_empty());

        let (_, tabs) = seed(&f).await;
        let stamps = f.metadata.cache_only_timestamps(&ctx, "u1").await.unwrap();
        assert_eq!(stamps.into_iter().collect::<Vec<_>>(), vec![("tabs".to_string(), tabs)]);
        let items = f.metadata.cache_only_items(&ctx, "u1").await.unwrap();
        assert_eq!(payload_total(&items["tabs"]), 5);
    }
}
