//! Collections stored only in the cache.
//!
//! The backing store is never consulted. Write timestamps come from the
//! process-wide clock, and every write is a compare-and-swap against the
//! record as it was read, so concurrent writers surface as conflicts.

use super::base::{apply_del_items, apply_set_items, split, CachedCollection, CachedData};
use super::Backends;
use crate::cache::context::CallContext;
use async_trait::async_trait;
use syncstash_core::{BsoUpdate, SetItemOutcome, StashResult, StorageError, Timestamp};
use tracing::debug;

#[derive(Debug, Clone)]
pub(crate) struct CacheOnlyManager {
    collection: String,
    backends: Backends,
}

impl CacheOnlyManager {
    pub(crate) fn new(collection: &str, backends: Backends) -> Self {
        Self {
            collection: collection.to_string(),
            backends,
        }
    }

    pub(crate) async fn set_items(
        &self,
        ctx: &CallContext,
        user: &str,
        items: &[BsoUpdate],
    ) -> StashResult<Timestamp> {
        let modified = self.backends.clock.next_timestamp();
        let (record, token) = split(self.cached_data(ctx, user).await?);
        apply_set_items(
            &self.backends.cache,
            &self.key(user),
            items,
            modified,
            record,
            token,
        )
        .await?;
        Ok(modified)
    }

    pub(crate) async fn del_collection(&self, user: &str) -> StashResult<Timestamp> {
        let key = self.key(user);
        if !self.backends.cache.delete(key.as_str()).await? {
            return Err(StorageError::collection_not_found(&self.collection).into());
        }
        debug!(%key, "Deleted cache-only collection");
        Ok(self.backends.clock.next_timestamp())
    }

    /// Returns the collection's timestamp after the delete, which only moves
    /// if something was removed.
    pub(crate) async fn del_items(
        &self,
        ctx: &CallContext,
        user: &str,
        ids: &[String],
    ) -> StashResult<Timestamp> {
        let modified = self.backends.clock.next_timestamp();
        let (record, token) = split(self.cached_data(ctx, user).await?);
        let (_, record_modified) = apply_del_items(
            &self.backends.cache,
            &self.key(user),
            &self.collection,
            ids,
            modified,
            record,
            token,
        )
        .await?;
        Ok(record_modified)
    }

    pub(crate) async fn set_item(
        &self,
        ctx: &CallContext,
        user: &str,
        id: &str,
        item: &BsoUpdate,
    ) -> StashResult<SetItemOutcome> {
        let mut update = item.clone();
        update.id = id.to_string();

        let modified = self.backends.clock.next_timestamp();
        let (record, token) = split(self.cached_data(ctx, user).await?);
        let created = apply_set_items(
            &self.backends.cache,
            &self.key(user),
            std::slice::from_ref(&update),
            modified,
            record,
            token,
        )
        .await?;
        Ok(SetItemOutcome {
            created: created == 1,
            modified,
        })
    }

    pub(crate) async fn del_item(
        &self,
        ctx: &CallContext,
        user: &str,
        id: &str,
    ) -> StashResult<Timestamp> {
        let modified = self.backends.clock.next_timestamp();
        let (record, token) = split(self.cached_data(ctx, user).await?);
        let (removed, _) = apply_del_items(
            &self.backends.cache,
            &self.key(user),
            &self.collection,
            &[id.to_string()],
            modified,
            record,
            token,
        )
        .await?;
        if removed == 0 {
            return Err(StorageError::item_not_found(&self.collection, id).into());
        }
        Ok(modified)
    }
}

#[async_trait]
impl CachedCollection for CacheOnlyManager {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn backends(&self) -> &Backends {
        &self.backends
    }

    async fn cached_data(&self, _ctx: &CallContext, user: &str) -> StashResult<CachedData> {
        let key = self.key(user);
        Ok(self
            .backends
            .cache
            .gets(key.as_str())
            .await?
            .map(|(record, token)| (record, Some(token))))
    }
}
