//! Write-through collections.
//!
//! The backing store stays authoritative; the cache holds a copy of the whole
//! collection. A cache miss repopulates from the store under a read lock,
//! with add-if-absent so a concurrent reader's copy is never overwritten.
//!
//! Writes first capture the cached copy and delete it, so no reader sees a
//! half-applied write. After the store write succeeds the change is applied
//! to the captured copy and stored again. If the store write fails with a
//! store-layer error the captured copy is put back; any other failure leaves
//! the key cleared to heal on the next read. Problems refreshing the cache
//! after a successful store write only ever clear the key.

use super::base::{apply_del_items, apply_set_items, CachedCollection, CachedData};
use super::Backends;
use crate::cache::context::CallContext;
use crate::cache::records::CollectionRecord;
use async_trait::async_trait;
use std::future::Future;
use syncstash_core::{
    BsoUpdate, ItemQuery, SetItemOutcome, StashError, StashResult, Timestamp,
};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub(crate) struct CachedManager {
    collection: String,
    backends: Backends,
}

impl CachedManager {
    pub(crate) fn new(collection: &str, backends: Backends) -> Self {
        Self {
            collection: collection.to_string(),
            backends,
        }
    }

    /// Read the cached record, loading it from the store on a miss.
    ///
    /// With `add_if_missing` a loaded record is added to the cache and read
    /// back for a fresh token; without it the loaded record is returned
    /// untokened and the cache is left alone.
    async fn load(
        &self,
        ctx: &CallContext,
        user: &str,
        add_if_missing: bool,
    ) -> StashResult<CachedData> {
        let key = self.key(user);
        let cache = &self.backends.cache;
        if let Some((record, token)) = cache.gets::<CollectionRecord>(key.as_str()).await? {
            return Ok(Some((record, Some(token))));
        }

        let lock = self
            .backends
            .locks
            .lock_for_read(ctx, user, &self.collection)
            .await?;
        let loaded = self.read_from_store(user).await;
        lock.release().await?;

        let record = match loaded {
            Ok(record) => record,
            Err(err) if err.is_collection_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };
        if !add_if_missing {
            return Ok(Some((record, None)));
        }

        if cache.add(key.as_str(), &record, None).await? {
            debug!(%key, items = record.items.len(), "Populated cached collection");
        } else {
            debug!(%key, "Cached collection populated concurrently");
        }
        match cache.gets::<CollectionRecord>(key.as_str()).await? {
            Some((cached, token)) => Ok(Some((cached, Some(token)))),
            None => Ok(Some((record, None))),
        }
    }

    async fn read_from_store(&self, user: &str) -> StashResult<CollectionRecord> {
        let storage = &self.backends.storage;
        let modified = storage
            .get_collection_timestamp(user, &self.collection)
            .await?;
        let items = storage
            .get_items(user, &self.collection, &ItemQuery::new())
            .await?;
        Ok(CollectionRecord::from_items(modified, items))
    }

    /// Run a store write with the cached copy removed for its duration.
    ///
    /// Returns the write's result together with the captured copy, which
    /// the caller applies the write to afterwards.
    async fn write_through<T, W>(
        &self,
        ctx: &CallContext,
        user: &str,
        write: W,
    ) -> StashResult<(T, Option<CollectionRecord>)>
    where
        W: Future<Output = StashResult<T>> + Send,
    {
        let key = self.key(user);
        let snapshot = self.load(ctx, user, false).await?.map(|(record, _)| record);
        if snapshot.is_some() {
            self.backends.cache.delete(key.as_str()).await?;
        }

        match write.await {
            Ok(value) => Ok((value, snapshot)),
            Err(err) => {
                self.restore_after_failure(user, snapshot, &err).await;
                Err(err)
            }
        }
    }

    async fn restore_after_failure(
        &self,
        user: &str,
        snapshot: Option<CollectionRecord>,
        err: &StashError,
    ) {
        let key = self.key(user);
        let Some(snapshot) = snapshot.filter(|_| err.is_store_error()) else {
            debug!(%key, %err, "Store write failed; leaving cached collection cleared");
            return;
        };
        match self.backends.cache.add(key.as_str(), &snapshot, None).await {
            Ok(true) => debug!(%key, "Restored cached collection after failed write"),
            Ok(false) => debug!(%key, "Cached collection repopulated before restore"),
            Err(restore_err) => {
                warn!(%key, %restore_err, "Could not restore cached collection")
            }
        }
    }

    /// The store write succeeded; a failure to refresh the cached copy only
    /// clears it.
    async fn heal_on_failure<T>(&self, user: &str, refreshed: StashResult<T>) {
        let Err(err) = refreshed else {
            return;
        };
        let key = self.key(user);
        warn!(%key, %err, "Cached collection refresh failed; clearing it");
        if let Err(err) = self.backends.cache.delete(key.as_str()).await {
            warn!(%key, %err, "Could not clear cached collection");
        }
    }

    pub(crate) async fn set_items(
        &self,
        ctx: &CallContext,
        user: &str,
        items: &[BsoUpdate],
    ) -> StashResult<Timestamp> {
        let storage = &self.backends.storage;
        let (modified, snapshot) = self
            .write_through(ctx, user, storage.set_items(user, &self.collection, items))
            .await?;
        let refreshed = apply_set_items(
            &self.backends.cache,
            &self.key(user),
            items,
            modified,
            snapshot,
            None,
        )
        .await;
        self.heal_on_failure(user, refreshed).await;
        Ok(modified)
    }

    pub(crate) async fn del_collection(&self, user: &str) -> StashResult<Timestamp> {
        self.backends
            .cache
            .delete(self.key(user).as_str())
            .await?;
        self.backends
            .storage
            .delete_collection(user, &self.collection)
            .await
    }

    pub(crate) async fn del_items(
        &self,
        ctx: &CallContext,
        user: &str,
        ids: &[String],
    ) -> StashResult<Timestamp> {
        let storage = &self.backends.storage;
        let (modified, snapshot) = self
            .write_through(ctx, user, storage.delete_items(user, &self.collection, ids))
            .await?;
        let refreshed = apply_del_items(
            &self.backends.cache,
            &self.key(user),
            &self.collection,
            ids,
            modified,
            snapshot,
            None,
        )
        .await;
        self.heal_on_failure(user, refreshed).await;
        Ok(modified)
    }

    pub(crate) async fn set_item(
        &self,
        ctx: &CallContext,
        user: &str,
        id: &str,
        item: &BsoUpdate,
    ) -> StashResult<SetItemOutcome> {
        let storage = &self.backends.storage;
        let (outcome, snapshot) = self
            .write_through(ctx, user, storage.set_item(user, &self.collection, id, item))
            .await?;

        let mut update = item.clone();
        update.id = id.to_string();
        let refreshed = apply_set_items(
            &self.backends.cache,
            &self.key(user),
            std::slice::from_ref(&update),
            outcome.modified,
            snapshot,
            None,
        )
        .await;
        self.heal_on_failure(user, refreshed).await;
        Ok(outcome)
    }

    pub(crate) async fn del_item(
        &self,
        ctx: &CallContext,
        user: &str,
        id: &str,
    ) -> StashResult<Timestamp> {
        let storage = &self.backends.storage;
        let (modified, snapshot) = self
            .write_through(ctx, user, storage.delete_item(user, &self.collection, id))
            .await?;
        let refreshed = apply_del_items(
            &self.backends.cache,
            &self.key(user),
            &self.collection,
            &[id.to_string()],
            modified,
            snapshot,
            None,
        )
        .await;
        self.heal_on_failure(user, refreshed).await;
        Ok(modified)
    }
}

#[async_trait]
impl CachedCollection for CachedManager {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn backends(&self) -> &Backends {
        &self.backends
    }

    async fn cached_data(&self, ctx: &CallContext, user: &str) -> StashResult<CachedData> {
        self.load(ctx, user, true).await
    }
}
