//! Collections that never touch the cache.

use crate::backend::SyncStorage;
use std::sync::Arc;
use syncstash_core::{Bso, BsoUpdate, ItemQuery, SetItemOutcome, StashResult, Timestamp};

/// Passes every operation straight to the backing store.
#[derive(Debug, Clone)]
pub(crate) struct UncachedManager {
    collection: String,
    storage: Arc<dyn SyncStorage>,
}

impl UncachedManager {
    pub(crate) fn new(collection: &str, storage: Arc<dyn SyncStorage>) -> Self {
        Self {
            collection: collection.to_string(),
            storage,
        }
    }

    pub(crate) fn collection(&self) -> &str {
        &self.collection
    }

    pub(crate) async fn get_timestamp(&self, user: &str) -> StashResult<Timestamp> {
        self.storage
            .get_collection_timestamp(user, &self.collection)
            .await
    }

    pub(crate) async fn get_items(&self, user: &str, query: &ItemQuery) -> StashResult<Vec<Bso>> {
        self.storage.get_items(user, &self.collection, query).await
    }

    pub(crate) async fn get_item_ids(
        &self,
        user: &str,
        query: &ItemQuery,
    ) -> StashResult<Vec<String>> {
        self.storage.get_item_ids(user, &self.collection, query).await
    }

    pub(crate) async fn get_item(&self, user: &str, id: &str) -> StashResult<Bso> {
        self.storage.get_item(user, &self.collection, id).await
    }

    pub(crate) async fn get_item_timestamp(&self, user: &str, id: &str) -> StashResult<Timestamp> {
        self.storage
            .get_item_timestamp(user, &self.collection, id)
            .await
    }

    pub(crate) async fn set_items(&self, user: &str, items: &[BsoUpdate]) -> StashResult<Timestamp> {
        self.storage.set_items(user, &self.collection, items).await
    }

    pub(crate) async fn del_collection(&self, user: &str) -> StashResult<Timestamp> {
        self.storage.delete_collection(user, &self.collection).await
    }

    pub(crate) async fn del_items(&self, user: &str, ids: &[String]) -> StashResult<Timestamp> {
        self.storage.delete_items(user, &self.collection, ids).await
    }

    pub(crate) async fn set_item(
        &self,
        user: &str,
        id: &str,
        item: &BsoUpdate,
    ) -> StashResult<SetItemOutcome> {
        self.storage.set_item(user, &self.collection, id, item).await
    }

    pub(crate) async fn del_item(&self, user: &str, id: &str) -> StashResult<Timestamp> {
        self.storage.delete_item(user, &self.collection, id).await
    }
}
