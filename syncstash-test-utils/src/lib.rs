//! syncstash Test Utilities
//!
//! Shared test infrastructure for the syncstash workspace:
//! - A failure-injecting backing store
//! - Proptest generators for items and ids
//! - A fully wired caching facade over in-memory collaborators
//! - Custom assertions for the error taxonomy
//! - Tracing setup for tests

pub use syncstash_core::{
    Bso, BsoUpdate, Clock, ItemQuery, LockMode, ManualClock, SetItemOutcome, SortOrder,
    StashConfig, StashError, StashResult, StorageError, Timestamp,
};
pub use syncstash_storage::{
    CachedStorage, CallContext, CollectionRecord, JsonCache, MemoryCacheClient, MemoryStorage,
    MetadataRecord, SyncStorage, UserScopedKey,
};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// TRACING
// ============================================================================

/// Install a test subscriber filtered by `RUST_LOG`. Safe to call from
/// every test; only the first call installs anything.
pub fn init_test_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("syncstash_storage=debug,warn"));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

// ============================================================================
// FAILURE INJECTION
// ============================================================================

/// How [`FailingStorage`] answers write operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FailureMode {
    /// Writes go through.
    Healthy = 0,
    /// Writes fail with a backing store error, before taking effect.
    StoreError = 1,
    /// Writes fail with an error from outside the store layer.
    OtherError = 2,
}

impl FailureMode {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => FailureMode::StoreError,
            2 => FailureMode::OtherError,
            _ => FailureMode::Healthy,
        }
    }
}

/// A [`MemoryStorage`] whose writes can be made to fail on demand.
///
/// Reads and locks always reach the inner store.
#[derive(Debug)]
pub struct FailingStorage {
    inner: MemoryStorage,
    mode: AtomicU8,
}

impl FailingStorage {
    pub fn new(inner: MemoryStorage) -> Self {
        Self {
            inner,
            mode: AtomicU8::new(FailureMode::Healthy as u8),
        }
    }

    pub fn inner(&self) -> &MemoryStorage {
        &self.inner
    }

    pub fn set_mode(&self, mode: FailureMode) {
        self.mode.store(mode as u8, Ordering::Release);
    }

    pub fn mode(&self) -> FailureMode {
        FailureMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    fn check_write(&self, operation: &str) -> StashResult<()> {
        match self.mode() {
            FailureMode::Healthy => Ok(()),
            FailureMode::StoreError => {
                debug!(operation, "Injecting store failure");
                Err(StorageError::Backend {
                    reason: format!("injected failure in {}", operation),
                }
                .into())
            }
            FailureMode::OtherError => {
                debug!(operation, "Injecting non-store failure");
                Err(StashError::serialization(operation, "injected failure"))
            }
        }
    }
}

#[async_trait]
impl SyncStorage for FailingStorage {
    async fn get_storage_timestamp(&self, user: &str) -> StashResult<Timestamp> {
        self.inner.get_storage_timestamp(user).await
    }

    async fn get_collection_timestamps(
        &self,
        user: &str,
    ) -> StashResult<BTreeMap<String, Timestamp>> {
        self.inner.get_collection_timestamps(user).await
    }

    async fn get_collection_counts(&self, user: &str) -> StashResult<BTreeMap<String, u64>> {
        self.inner.get_collection_counts(user).await
    }

    async fn get_collection_sizes(&self, user: &str) -> StashResult<BTreeMap<String, u64>> {
        self.inner.get_collection_sizes(user).await
    }

    async fn get_total_size(&self, user: &str) -> StashResult<u64> {
        self.inner.get_total_size(user).await
    }

    async fn delete_storage(&self, user: &str) -> StashResult<()> {
        self.check_write("delete_storage")?;
        self.inner.delete_storage(user).await
    }

    async fn get_collection_timestamp(
        &self,
        user: &str,
        collection: &str,
    ) -> StashResult<Timestamp> {
        self.inner.get_collection_timestamp(user, collection).await
    }

    async fn get_items(
        &self,
        user: &str,
        collection: &str,
        query: &ItemQuery,
    ) -> StashResult<Vec<Bso>> {
        self.inner.get_items(user, collection, query).await
    }

    async fn get_item_ids(
        &self,
        user: &str,
        collection: &str,
        query: &ItemQuery,
    ) -> StashResult<Vec<String>> {
        self.inner.get_item_ids(user, collection, query).await
    }

    async fn set_items(
        &self,
        user: &str,
        collection: &str,
        items: &[BsoUpdate],
    ) -> StashResult<Timestamp> {
        self.check_write("set_items")?;
        self.inner.set_items(user, collection, items).await
    }

    async fn delete_collection(&self, user: &str, collection: &str) -> StashResult<Timestamp> {
        self.check_write("delete_collection")?;
        self.inner.delete_collection(user, collection).await
    }

    async fn delete_items(
        &self,
        user: &str,
        collection: &str,
        ids: &[String],
    ) -> StashResult<Timestamp> {
        self.check_write("delete_items")?;
        self.inner.delete_items(user, collection, ids).await
    }

    async fn get_item_timestamp(
        &self,
        user: &str,
        collection: &str,
        id: &str,
    ) -> StashResult<Timestamp> {
        self.inner.get_item_timestamp(user, collection, id).await
    }

    async fn get_item(&self, user: &str, collection: &str, id: &str) -> StashResult<Bso> {
        self.inner.get_item(user, collection, id).await
    }

    async fn set_item(
        &self,
        user: &str,
        collection: &str,
        id: &str,
        item: &BsoUpdate,
    ) -> StashResult<SetItemOutcome> {
        self.check_write("set_item")?;
        self.inner.set_item(user, collection, id, item).await
    }

    async fn delete_item(&self, user: &str, collection: &str, id: &str) -> StashResult<Timestamp> {
        self.check_write("delete_item")?;
        self.inner.delete_item(user, collection, id).await
    }

    async fn lock_collection(
        &self,
        user: &str,
        collection: &str,
        mode: LockMode,
    ) -> StashResult<()> {
        self.inner.lock_collection(user, collection, mode).await
    }

    async fn unlock_collection(
        &self,
        user: &str,
        collection: &str,
        mode: LockMode,
    ) -> StashResult<()> {
        self.inner.unlock_collection(user, collection, mode).await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for items and queries.

    use super::*;
    use proptest::prelude::*;

    /// Generate an item id from a small alphabet, so generated batches
    /// collide often.
    pub fn arb_id() -> impl Strategy<Value = String> {
        "[a-f]{1,2}"
    }

    /// Generate a payload.
    pub fn arb_payload() -> impl Strategy<Value = String> {
        "[ -~]{0,32}"
    }

    /// Generate a millisecond timestamp in a fixed window.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1_000_000i64..2_000_000i64).prop_map(Timestamp::from_millis)
    }

    /// Generate an item update with any subset of fields present.
    pub fn arb_bso_update() -> impl Strategy<Value = BsoUpdate> {
        (
            arb_id(),
            proptest::option::of(arb_payload()),
            proptest::option::of(-100i64..100),
            proptest::option::of(0i64..5_000),
        )
            .prop_map(|(id, payload, sortindex, ttl)| BsoUpdate {
                id,
                payload,
                sortindex,
                ttl,
            })
    }

    /// Generate a batch of item updates.
    pub fn arb_bso_updates(max: usize) -> impl Strategy<Value = Vec<BsoUpdate>> {
        prop::collection::vec(arb_bso_update(), 1..=max.max(1))
    }

    /// Generate a stored item.
    pub fn arb_bso() -> impl Strategy<Value = Bso> {
        (
            arb_id(),
            arb_timestamp(),
            proptest::option::of(-100i64..100),
            arb_payload(),
            proptest::option::of(0i64..5_000),
        )
            .prop_map(|(id, modified, sortindex, payload, ttl)| Bso {
                id,
                modified,
                sortindex,
                payload,
                ttl,
            })
    }

    /// Generate a collection's items, keyed by id.
    pub fn arb_items() -> impl Strategy<Value = BTreeMap<String, Bso>> {
        prop::collection::vec(arb_bso(), 0..16)
            .prop_map(|bsos| bsos.into_iter().map(|bso| (bso.id.clone(), bso)).collect())
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! A caching facade wired to in-memory collaborators.

    use super::*;

    /// Wall-clock start for fixtures, in milliseconds. Far enough from zero
    /// that size recalculation is due on first request.
    pub const FIXTURE_START_MS: i64 = 10_000_000;

    /// `bookmarks` write-through cached, `tabs` cache-only, everything else
    /// uncached.
    pub fn standard_config() -> StashConfig {
        StashConfig::new()
            .with_key_prefix("test:")
            .with_cached_collections(["bookmarks"])
            .with_cache_only_collections(["tabs"])
    }

    /// Everything needed to drive and inspect a [`CachedStorage`].
    pub struct StashFixture {
        pub clock: Arc<ManualClock>,
        pub storage: Arc<FailingStorage>,
        pub cache: Arc<MemoryCacheClient>,
        pub stash: CachedStorage,
    }

    impl StashFixture {
        pub fn new(config: StashConfig) -> Self {
            let clock = Arc::new(ManualClock::new(Timestamp::from_millis(FIXTURE_START_MS)));
            let storage = Arc::new(FailingStorage::new(MemoryStorage::with_clock(clock.clone())));
            let cache = Arc::new(MemoryCacheClient::from_config(&config, clock.clone()));
            let stash = match CachedStorage::new(
                storage.clone(),
                cache.clone(),
                clock.clone(),
                &config,
            ) {
                Ok(stash) => stash,
                Err(err) => panic!("fixture config must validate: {}", err),
            };
            Self {
                clock,
                storage,
                cache,
                stash,
            }
        }

        pub fn standard() -> Self {
            Self::new(standard_config())
        }

        /// A typed view of the fixture's cache.
        pub fn json(&self) -> JsonCache {
            JsonCache::new(self.cache.clone())
        }

        /// The cached metadata record, if any.
        pub async fn metadata(&self, user: &str) -> Option<MetadataRecord> {
            match self.json().get(UserScopedKey::metadata(user).as_str()).await {
                Ok(record) => record,
                Err(err) => panic!("metadata read failed: {}", err),
            }
        }

        /// The cached collection record, if any.
        pub async fn collection(&self, user: &str, collection: &str) -> Option<CollectionRecord> {
            let key = UserScopedKey::collection(user, collection);
            match self.json().get(key.as_str()).await {
                Ok(record) => record,
                Err(err) => panic!("collection read failed: {}", err),
            }
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over the error taxonomy.

    use super::*;

    /// Assert that a result is a conflict.
    #[track_caller]
    pub fn assert_conflict<T: std::fmt::Debug>(result: &StashResult<T>) {
        match result {
            Err(StashError::Storage(StorageError::Conflict { .. })) => {}
            other => panic!("Expected Conflict, got: {:?}", other),
        }
    }

    /// Assert that a result is a missing collection.
    #[track_caller]
    pub fn assert_collection_not_found<T: std::fmt::Debug>(result: &StashResult<T>) {
        match result {
            Err(StashError::Storage(StorageError::CollectionNotFound { .. })) => {}
            other => panic!("Expected CollectionNotFound, got: {:?}", other),
        }
    }

    /// Assert that a result is a missing item with the given id.
    #[track_caller]
    pub fn assert_item_not_found<T: std::fmt::Debug>(result: &StashResult<T>, id: &str) {
        match result {
            Err(StashError::Storage(StorageError::ItemNotFound { item, .. })) => {
                assert_eq!(item, id, "Wrong item in ItemNotFound error");
            }
            other => panic!("Expected ItemNotFound for {}, got: {:?}", id, other),
        }
    }

    /// Assert that a result is the fatal expired-lock error.
    #[track_caller]
    pub fn assert_lock_expired<T: std::fmt::Debug>(result: &StashResult<T>) {
        match result {
            Err(StashError::LockExpired { .. }) => {}
            other => panic!("Expected LockExpired, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
