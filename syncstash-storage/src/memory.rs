//! In-memory backing store.
//!
//! A complete [`SyncStorage`] kept in process memory. It stamps writes from
//! an injected [`Clock`], applies the same item selection rules as the cache
//! layer and supports non-blocking native locks.

use crate::backend::SyncStorage;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use syncstash_core::{
    Bso, BsoUpdate, Clock, ItemQuery, LockMode, SetItemOutcome, StashResult, StorageError,
    SystemClock, Timestamp,
};

#[derive(Debug, Default)]
struct CollectionData {
    modified: Timestamp,
    items: BTreeMap<String, Bso>,
}

#[derive(Debug, Default)]
struct UserData {
    modified: Timestamp,
    collections: BTreeMap<String, CollectionData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NativeLock {
    Exclusive,
    Shared(usize),
}

/// In-memory storage for tests and single-process deployments.
#[derive(Debug)]
pub struct MemoryStorage {
    clock: Arc<dyn Clock>,
    users: RwLock<HashMap<String, UserData>>,
    locks: Mutex<HashMap<(String, String), NativeLock>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Create an empty store stamped by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            users: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Number of stored items in a collection, expired ones included.
    pub fn stored_item_count(&self, user: &str, collection: &str) -> StashResult<usize> {
        let users = self.read_users()?;
        Ok(users
            .get(user)
            .and_then(|u| u.collections.get(collection))
            .map_or(0, |c| c.items.len()))
    }

    fn read_users(&self) -> StashResult<RwLockReadGuard<'_, HashMap<String, UserData>>> {
        Ok(self.users.read().map_err(|_| StorageError::LockPoisoned)?)
    }

    fn write_users(&self) -> StashResult<RwLockWriteGuard<'_, HashMap<String, UserData>>> {
        Ok(self.users.write().map_err(|_| StorageError::LockPoisoned)?)
    }

    fn now_secs(&self) -> i64 {
        self.clock.now().as_secs()
    }

    fn select(
        &self,
        user: &str,
        collection: &str,
        query: &ItemQuery,
    ) -> StashResult<Vec<Bso>> {
        let users = self.read_users()?;
        let data = users
            .get(user)
            .and_then(|u| u.collections.get(collection))
            .ok_or_else(|| StorageError::collection_not_found(collection))?;
        query.select(collection, &data.items, self.now_secs())
    }

    /// Apply updates to a collection, creating it if needed. Returns the
    /// number of newly created items.
    fn apply_updates(
        user_data: &mut UserData,
        collection: &str,
        items: &[BsoUpdate],
        modified: Timestamp,
    ) -> usize {
        let data = user_data
            .collections
            .entry(collection.to_string())
            .or_default();
        let mut created = 0;
        for update in items {
            match data.items.get_mut(&update.id) {
                Some(existing) => update.merge_into(existing, modified),
                None => {
                    created += 1;
                    data.items
                        .insert(update.id.clone(), update.to_new_bso(modified));
                }
            }
        }
        data.modified = modified;
        user_data.modified = modified;
        created
    }

    fn live_totals<F>(&self, user: &str, measure: F) -> StashResult<BTreeMap<String, u64>>
    where
        F: Fn(&Bso) -> u64,
    {
        let now_secs = self.now_secs();
        let users = self.read_users()?;
        Ok(users
            .get(user)
            .map(|u| {
                u.collections
                    .iter()
                    .map(|(name, data)| {
                        let total: u64 = data
                            .items
                            .values()
                            .filter(|bso| bso.is_live(now_secs))
                            .map(&measure)
                            .sum();
                        (name.clone(), total)
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl SyncStorage for MemoryStorage {
    // === Storage Operations ===

    async fn get_storage_timestamp(&self, user: &str) -> StashResult<Timestamp> {
        let users = self.read_users()?;
        Ok(users.get(user).map_or(Timestamp::ZERO, |u| u.modified))
    }

    async fn get_collection_timestamps(
        &self,
        user: &str,
    ) -> StashResult<BTreeMap<String, Timestamp>> {
        let users = self.read_users()?;
        Ok(users
            .get(user)
            .map(|u| {
                u.collections
                    .iter()
                    .map(|(name, data)| (name.clone(), data.modified))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_collection_counts(&self, user: &str) -> StashResult<BTreeMap<String, u64>> {
        self.live_totals(user, |_| 1)
    }

    async fn get_collection_sizes(&self, user: &str) -> StashResult<BTreeMap<String, u64>> {
        self.live_totals(user, Bso::payload_len)
    }

    async fn get_total_size(&self, user: &str) -> StashResult<u64> {
        Ok(self.live_totals(user, Bso::payload_len)?.values().sum())
    }

    async fn delete_storage(&self, user: &str) -> StashResult<()> {
        self.write_users()?.remove(user);
        Ok(())
    }

    // === Collection Operations ===

    async fn get_collection_timestamp(
        &self,
        user: &str,
        collection: &str,
    ) -> StashResult<Timestamp> {
        let users = self.read_users()?;
        users
            .get(user)
            .and_then(|u| u.collections.get(collection))
            .map(|c| c.modified)
            .ok_or_else(|| StorageError::collection_not_found(collection).into())
    }

    async fn get_items(
        &self,
        user: &str,
        collection: &str,
        query: &ItemQuery,
    ) -> StashResult<Vec<Bso>> {
        self.select(user, collection, query)
    }

    async fn get_item_ids(
        &self,
        user: &str,
        collection: &str,
        query: &ItemQuery,
    ) -> StashResult<Vec<String>> {
        Ok(self
            .select(user, collection, query)?
            .into_iter()
            .map(|bso| bso.id)
            .collect())
    }

    async fn set_items(
        &self,
        user: &str,
        collection: &str,
        items: &[BsoUpdate],
    ) -> StashResult<Timestamp> {
        let mut users = self.write_users()?;
        let modified = self.clock.next_timestamp();
        let user_data = users.entry(user.to_string()).or_default();
        Self::apply_updates(user_data, collection, items, modified);
        Ok(modified)
    }

    async fn delete_collection(&self, user: &str, collection: &str) -> StashResult<Timestamp> {
        let mut users = self.write_users()?;
        let user_data = users
            .get_mut(user)
            .filter(|u| u.collections.contains_key(collection))
            .ok_or_else(|| StorageError::collection_not_found(collection))?;
        user_data.collections.remove(collection);
        let modified = self.clock.next_timestamp();
        user_data.modified = modified;
        Ok(modified)
    }

    async fn delete_items(
        &self,
        user: &str,
        collection: &str,
        ids: &[String],
    ) -> StashResult<Timestamp> {
        let mut users = self.write_users()?;
        let user_data = users
            .get_mut(user)
            .ok_or_else(|| StorageError::collection_not_found(collection))?;
        let data = user_data
            .collections
            .get_mut(collection)
            .ok_or_else(|| StorageError::collection_not_found(collection))?;
        let modified = self.clock.next_timestamp();
        for id in ids {
            data.items.remove(id);
        }
        data.modified = modified;
        user_data.modified = modified;
        Ok(modified)
    }

    // === Item Operations ===

    async fn get_item_timestamp(
        &self,
        user: &str,
        collection: &str,
        id: &str,
    ) -> StashResult<Timestamp> {
        Ok(self.get_item(user, collection, id).await?.modified)
    }

    async fn get_item(&self, user: &str, collection: &str, id: &str) -> StashResult<Bso> {
        let query = ItemQuery::new().with_ids([id]);
        let found = match self.select(user, collection, &query) {
            Ok(found) => found,
            Err(err) if err.is_collection_not_found() => Vec::new(),
            Err(err) => return Err(err),
        };
        found
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::item_not_found(collection, id).into())
    }

    async fn set_item(
        &self,
        user: &str,
        collection: &str,
        id: &str,
        item: &BsoUpdate,
    ) -> StashResult<SetItemOutcome> {
        let mut update = item.clone();
        update.id = id.to_string();

        let mut users = self.write_users()?;
        let modified = self.clock.next_timestamp();
        let user_data = users.entry(user.to_string()).or_default();
        let created = Self::apply_updates(user_data, collection, &[update], modified);
        Ok(SetItemOutcome {
            created: created == 1,
            modified,
        })
    }

    async fn delete_item(&self, user: &str, collection: &str, id: &str) -> StashResult<Timestamp> {
        let mut users = self.write_users()?;
        let user_data = users
            .get_mut(user)
            .ok_or_else(|| StorageError::collection_not_found(collection))?;
        let data = user_data
            .collections
            .get_mut(collection)
            .ok_or_else(|| StorageError::collection_not_found(collection))?;
        if data.items.remove(id).is_none() {
            return Err(StorageError::item_not_found(collection, id).into());
        }
        let modified = self.clock.next_timestamp();
        data.modified = modified;
        user_data.modified = modified;
        Ok(modified)
    }

    // === Native Locking ===

    async fn lock_collection(
        &self,
        user: &str,
        collection: &str,
        mode: LockMode,
    ) -> StashResult<()> {
        let mut locks = self.locks.lock().map_err(|_| StorageError::LockPoisoned)?;
        let key = (user.to_string(), collection.to_string());
        let next = match (locks.get(&key).copied(), mode) {
            (None, LockMode::Exclusive) => NativeLock::Exclusive,
            (None, LockMode::Shared) => NativeLock::Shared(1),
            (Some(NativeLock::Shared(n)), LockMode::Shared) => NativeLock::Shared(n + 1),
            _ => {
                return Err(StorageError::conflict(format!("{}:{}", user, collection)).into())
            }
        };
        locks.insert(key, next);
        Ok(())
    }

    async fn unlock_collection(
        &self,
        user: &str,
        collection: &str,
        mode: LockMode,
    ) -> StashResult<()> {
        let mut locks = self.locks.lock().map_err(|_| StorageError::LockPoisoned)?;
        let key = (user.to_string(), collection.to_string());
        match (locks.get(&key).copied(), mode) {
            (Some(NativeLock::Shared(n)), LockMode::Shared) if n > 1 => {
                locks.insert(key, NativeLock::Shared(n - 1));
            }
            (Some(NativeLock::Shared(_)), LockMode::Shared)
            | (Some(NativeLock::Exclusive), LockMode::Exclusive) => {
                locks.remove(&key);
            }
            (held, _) => {
                tracing::debug!(user, collection, ?held, %mode, "Unlock of a lock not held");
            }
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use syncstash_core::{ManualClock, StashError};

    fn store() -> (Arc<ManualClock>, MemoryStorage) {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000_000)));
        let storage = MemoryStorage::with_clock(clock.clone());
        (clock, storage)
    }

    #[tokio::test]
    async fn test_set_and_get_item() {
        let (_, storage) = store();
        let outcome = storage
            .set_item("u1", "bookmarks", "a", &BsoUpdate::new("ignored").with_payload("x"))
            .await
            .unwrap();
        assert!(outcome.created);

        let bso = storage.get_item("u1", "bookmarks", "a").await.unwrap();
        assert_eq!(bso.id, "a");
        assert_eq!(bso.payload, "x");
        assert_eq!(bso.modified, outcome.modified);
        assert_eq!(
            storage.get_collection_timestamp("u1", "bookmarks").await.unwrap(),
            outcome.modified
        );
        assert_eq!(storage.get_storage_timestamp("u1").await.unwrap(), outcome.modified);
    }

    #[tokio::test]
    async fn test_update_without_payload_keeps_item_timestamp() {
        let (_, storage) = store();
        let first = storage
            .set_item("u1", "c", "a", &BsoUpdate::new("a").with_payload("x"))
            .await
            .unwrap();
        let second = storage
            .set_item("u1", "c", "a", &BsoUpdate::new("a").with_sortindex(9))
            .await
            .unwrap();
        assert!(!second.created);
        assert!(second.modified > first.modified);

        let bso = storage.get_item("u1", "c", "a").await.unwrap();
        assert_eq!(bso.modified, first.modified);
        assert_eq!(bso.sortindex, Some(9));
        assert_eq!(bso.payload, "x");
    }

    #[tokio::test]
    async fn test_missing_collection_and_item() {
        let (_, storage) = store();
        let err = storage.get_collection_timestamp("u1", "nope").await.unwrap_err();
        assert!(err.is_collection_not_found());

        let err = storage.get_item("u1", "nope", "a").await.unwrap_err();
        assert!(matches!(err, StashError::Storage(StorageError::ItemNotFound { .. })));

        let err = storage.delete_collection("u1", "nope").await.unwrap_err();
        assert!(err.is_collection_not_found());

        storage
            .set_items("u1", "c", &[BsoUpdate::new("a").with_payload("x")])
            .await
            .unwrap();
        let err = storage.delete_item("u1", "c", "b").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_expired_items_are_hidden_but_kept() {
        let (clock, storage) = store();
        let expiry = clock.now().as_secs() + 10;
        storage
            .set_items(
                "u1",
                "c",
                &[
                    BsoUpdate::new("short").with_payload("abc").with_ttl(expiry),
                    BsoUpdate::new("long").with_payload("de"),
                ],
            )
            .await
            .unwrap();

        clock.advance(Duration::from_secs(11));

        let ids = storage.get_item_ids("u1", "c", &ItemQuery::new()).await.unwrap();
        assert_eq!(ids, vec!["long"]);
        assert!(storage.get_item("u1", "c", "short").await.unwrap_err().is_not_found());
        assert_eq!(storage.stored_item_count("u1", "c").unwrap(), 2);

        let counts = storage.get_collection_counts("u1").await.unwrap();
        assert_eq!(counts.get("c"), Some(&1));
        assert_eq!(storage.get_total_size("u1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delete_operations_bump_timestamps() {
        let (_, storage) = store();
        let written = storage
            .set_items(
                "u1",
                "c",
                &[BsoUpdate::new("a").with_payload("1"), BsoUpdate::new("b").with_payload("2")],
            )
            .await
            .unwrap();
        let deleted = storage
            .delete_items("u1", "c", &["a".to_string()])
            .await
            .unwrap();
        assert!(deleted > written);

        let removed = storage.delete_collection("u1", "c").await.unwrap();
        assert!(removed > deleted);
        assert_eq!(storage.get_storage_timestamp("u1").await.unwrap(), removed);
        assert!(storage.get_collection_timestamps("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_native_locks() {
        let (_, storage) = store();
        storage.lock_collection("u1", "c", LockMode::Shared).await.unwrap();
        storage.lock_collection("u1", "c", LockMode::Shared).await.unwrap();

        let err = storage
            .lock_collection("u1", "c", LockMode::Exclusive)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        storage.unlock_collection("u1", "c", LockMode::Shared).await.unwrap();
        storage.unlock_collection("u1", "c", LockMode::Shared).await.unwrap();
        storage.lock_collection("u1", "c", LockMode::Exclusive).await.unwrap();

        let err = storage
            .lock_collection("u1", "c", LockMode::Shared)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        // Other collections are independent.
        storage.lock_collection("u1", "d", LockMode::Exclusive).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_storage() {
        let (_, storage) = store();
        storage
            .set_items("u1", "c", &[BsoUpdate::new("a").with_payload("1")])
            .await
            .unwrap();
        storage.delete_storage("u1").await.unwrap();
        assert_eq!(storage.get_storage_timestamp("u1").await.unwrap(), Timestamp::ZERO);
        assert!(storage.get_collection_timestamps("u1").await.unwrap().is_empty());
    }
}
