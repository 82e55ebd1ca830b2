//! Behaviour shared by the managers that keep collections in the cache.
//!
//! Reads work off a loaded [`CollectionRecord`]; writes apply a change to a
//! record snapshot and store it back with compare-and-swap against the token
//! the snapshot was read with.

use super::Backends;
use crate::cache::context::CallContext;
use crate::cache::records::CollectionRecord;
use crate::cache::traits::{CasToken, JsonCache};
use crate::cache::user_key::UserScopedKey;
use async_trait::async_trait;
use syncstash_core::{
    Bso, BsoUpdate, ItemQuery, StashResult, StorageError, Timestamp,
};

/// A collection record as read from the cache, with the token to write it
/// back. A `None` token means the record is not (or no longer) in the cache.
pub(crate) type CachedData = Option<(CollectionRecord, Option<CasToken>)>;

/// Separate a loaded record from its token.
pub(crate) fn split(data: CachedData) -> (Option<CollectionRecord>, Option<CasToken>) {
    match data {
        Some((record, token)) => (Some(record), token),
        None => (None, None),
    }
}

/// Read operations for a collection held in the cache.
#[async_trait]
pub(crate) trait CachedCollection: Send + Sync {
    fn collection(&self) -> &str;

    fn backends(&self) -> &Backends;

    fn key(&self, user: &str) -> UserScopedKey {
        UserScopedKey::collection(user, self.collection())
    }

    /// Load the record, from wherever this kind of collection lives.
    async fn cached_data(&self, ctx: &CallContext, user: &str) -> StashResult<CachedData>;

    async fn get_timestamp(&self, ctx: &CallContext, user: &str) -> StashResult<Timestamp> {
        match self.cached_data(ctx, user).await? {
            Some((record, _)) => Ok(record.modified),
            None => Err(StorageError::collection_not_found(self.collection()).into()),
        }
    }

    async fn get_items(
        &self,
        ctx: &CallContext,
        user: &str,
        query: &ItemQuery,
    ) -> StashResult<Vec<Bso>> {
        let now_secs = self.backends().clock.now().as_secs();
        match self.cached_data(ctx, user).await? {
            Some((record, _)) => query.select(self.collection(), &record.items, now_secs),
            None => Err(StorageError::collection_not_found(self.collection()).into()),
        }
    }

    async fn get_item_ids(
        &self,
        ctx: &CallContext,
        user: &str,
        query: &ItemQuery,
    ) -> StashResult<Vec<String>> {
        Ok(self
            .get_items(ctx, user, query)
            .await?
            .into_iter()
            .map(|bso| bso.id)
            .collect())
    }

    /// Read one live item. A missing collection reads as a missing item.
    async fn get_item(&self, ctx: &CallContext, user: &str, id: &str) -> StashResult<Bso> {
        let query = ItemQuery::new().with_ids([id]);
        let found = match self.get_items(ctx, user, &query).await {
            Ok(found) => found,
            Err(err) if err.is_collection_not_found() => Vec::new(),
            Err(err) => return Err(err),
        };
        found
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::item_not_found(self.collection(), id).into())
    }

    async fn get_item_timestamp(
        &self,
        ctx: &CallContext,
        user: &str,
        id: &str,
    ) -> StashResult<Timestamp> {
        Ok(self.get_item(ctx, user, id).await?.modified)
    }
}

/// Apply item updates to a snapshot and store it back.
///
/// An absent snapshot starts a new record. A write not newer than the
/// snapshot, or a stale token, is a conflict. Returns the number of items
/// created.
pub(crate) async fn apply_set_items(
    cache: &JsonCache,
    key: &UserScopedKey,
    items: &[BsoUpdate],
    modified: Timestamp,
    record: Option<CollectionRecord>,
    token: Option<CasToken>,
) -> StashResult<usize> {
    let mut record = match record {
        None => CollectionRecord::new(modified),
        Some(record) if !record.accepts(modified) => {
            return Err(StorageError::conflict(key.as_str()).into())
        }
        Some(record) => record,
    };
    let created = record.merge_items(items, modified);
    if !cache.cas(key.as_str(), &record, token).await? {
        return Err(StorageError::conflict(key.as_str()).into());
    }
    Ok(created)
}

/// Remove items from a snapshot and store it back.
///
/// An absent snapshot is a missing collection. Returns the number of items
/// removed and the record's resulting timestamp.
pub(crate) async fn apply_del_items(
    cache: &JsonCache,
    key: &UserScopedKey,
    collection: &str,
    ids: &[String],
    modified: Timestamp,
    record: Option<CollectionRecord>,
    token: Option<CasToken>,
) -> StashResult<(usize, Timestamp)> {
    let mut record = record.ok_or_else(|| StorageError::collection_not_found(collection))?;
    if !record.accepts(modified) {
        return Err(StorageError::conflict(key.as_str()).into());
    }
    let removed = record.remove_items(ids, modified);
    if !cache.cas(key.as_str(), &record, token).await? {
        return Err(StorageError::conflict(key.as_str()).into());
    }
    Ok((removed, record.modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheClient;
    use std::sync::Arc;
    use syncstash_core::ManualClock;

    fn ts(ms: i64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    fn cache() -> JsonCache {
        let clock = Arc::new(ManualClock::new(ts(0)));
        JsonCache::new(Arc::new(MemoryCacheClient::new(clock)))
    }

    async fn load(cache: &JsonCache, key: &UserScopedKey) -> (CollectionRecord, CasToken) {
        cache.gets(key.as_str()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_set_items_creates_record() {
        let cache = cache();
        let key = UserScopedKey::collection("u1", "tabs");
        let created = apply_set_items(
            &cache,
            &key,
            &[BsoUpdate::new("a").with_payload("x")],
            ts(10),
            None,
            None,
        )
        .await
        .unwrap();
        assert_eq!(created, 1);

        let (record, _) = load(&cache, &key).await;
        assert_eq!(record.modified, ts(10));
        assert_eq!(record.items["a"].payload, "x");
    }

    #[tokio::test]
    async fn test_set_items_rejects_stale_timestamp() {
        let cache = cache();
        let key = UserScopedKey::collection("u1", "tabs");
        apply_set_items(&cache, &key, &[BsoUpdate::new("a")], ts(10), None, None)
            .await
            .unwrap();
        let (record, token) = load(&cache, &key).await;

        let err = apply_set_items(
            &cache,
            &key,
            &[BsoUpdate::new("b")],
            ts(10),
            Some(record),
            Some(token),
        )
        .await
        .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_only_one_writer_per_generation_wins() {
        let cache = cache();
        let key = UserScopedKey::collection("u1", "tabs");
        apply_set_items(&cache, &key, &[BsoUpdate::new("a")], ts(10), None, None)
            .await
            .unwrap();

        let (first, token) = load(&cache, &key).await;
        let second = first.clone();

        apply_set_items(
            &cache,
            &key,
            &[BsoUpdate::new("b")],
            ts(20),
            Some(first),
            Some(token),
        )
        .await
        .unwrap();
        let err = apply_set_items(
            &cache,
            &key,
            &[BsoUpdate::new("c")],
            ts(30),
            Some(second),
            Some(token),
        )
        .await
        .unwrap_err();
        assert!(err.is_conflict());

        let (record, _) = load(&cache, &key).await;
        assert!(record.items.contains_key("b"));
        assert!(!record.items.contains_key("c"));
    }

    #[tokio::test]
    async fn test_new_record_conflicts_with_concurrent_creator() {
        let cache = cache();
        let key = UserScopedKey::collection("u1", "tabs");
        apply_set_items(&cache, &key, &[BsoUpdate::new("a")], ts(10), None, None)
            .await
            .unwrap();
        let err = apply_set_items(&cache, &key, &[BsoUpdate::new("b")], ts(20), None, None)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_del_items_requires_record() {
        let cache = cache();
        let key = UserScopedKey::collection("u1", "tabs");
        let err = apply_del_items(&cache, &key, "tabs", &["a".to_string()], ts(10), None, None)
            .await
            .unwrap_err();
        assert!(err.is_collection_not_found());
    }

    #[tokio::test]
    async fn test_del_items_reports_removals_and_timestamp() {
        let cache = cache();
        let key = UserScopedKey::collection("u1", "tabs");
        apply_set_items(
            &cache,
            &key,
            &[BsoUpdate::new("a"), BsoUpdate::new("b")],
            ts(10),
            None,
            None,
        )
        .await
        .unwrap();

        let (record, token) = load(&cache, &key).await;
        let (removed, modified) = apply_del_items(
            &cache,
            &key,
            "tabs",
            &["zz".to_string()],
            ts(20),
            Some(record),
            Some(token),
        )
        .await
        .unwrap();
        assert_eq!((removed, modified), (0, ts(10)));

        let (record, token) = load(&cache, &key).await;
        let (removed, modified) = apply_del_items(
            &cache,
            &key,
            "tabs",
            &["a".to_string(), "b".to_string()],
            ts(30),
            Some(record),
            Some(token),
        )
        .await
        .unwrap();
        assert_eq!((removed, modified), (2, ts(30)));
    }
}
