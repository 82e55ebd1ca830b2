//! Collection locks.
//!
//! A collection is locked either through the backing store's native locks,
//! or, when cache locking is configured or the collection lives only in the
//! cache, through an add-if-absent placeholder key with a TTL. The cache has
//! no shared-lock primitive, so cache-based read locks are exclusive too.
//!
//! Read locks are reentrant within one [`CallContext`]. Cache-based locks are
//! only guaranteed exclusive for their TTL; releasing one after the TTL has
//! elapsed fails with [`StashError::LockExpired`].

use super::context::CallContext;
use super::traits::JsonCache;
use super::user_key::UserScopedKey;
use crate::backend::SyncStorage;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use syncstash_core::{
    Clock, LockMode, StashConfig, StashError, StashResult, StorageError, Timestamp,
};
use tracing::{debug, error, warn};

/// Hands out collection locks.
#[derive(Debug, Clone)]
pub struct LockManager {
    storage: Arc<dyn SyncStorage>,
    cache: JsonCache,
    clock: Arc<dyn Clock>,
    cache_lock: bool,
    cache_only: Arc<BTreeSet<String>>,
    ttl: Duration,
}

impl LockManager {
    pub fn new(
        storage: Arc<dyn SyncStorage>,
        cache: JsonCache,
        clock: Arc<dyn Clock>,
        config: &StashConfig,
    ) -> Self {
        Self {
            storage,
            cache,
            clock,
            cache_lock: config.cache_lock,
            cache_only: Arc::new(config.cache_only_collections.iter().cloned().collect()),
            ttl: config.cache_lock_ttl,
        }
    }

    /// Whether locks on `collection` are taken in the cache rather than the
    /// backing store.
    pub fn uses_cache_lock(&self, collection: &str) -> bool {
        self.cache_lock || self.cache_only.contains(collection)
    }

    /// Take a shared read lock. A no-op if `ctx` already holds a lock on the
    /// collection.
    pub async fn lock_for_read(
        &self,
        ctx: &CallContext,
        user: &str,
        collection: &str,
    ) -> StashResult<CollectionLock> {
        if ctx.holds(user, collection) {
            debug!(user, collection, "Read lock already held by this call chain");
            return Ok(CollectionLock::reentrant());
        }
        let held = self.acquire(user, collection, LockMode::Shared).await?;
        Ok(CollectionLock::registered(held, ctx, user, collection))
    }

    /// Take an exclusive write lock.
    pub async fn lock_for_write(
        &self,
        ctx: &CallContext,
        user: &str,
        collection: &str,
    ) -> StashResult<CollectionLock> {
        let held = self.acquire(user, collection, LockMode::Exclusive).await?;
        if ctx.holds(user, collection) {
            return Ok(CollectionLock {
                held: Some(held),
                registration: None,
            });
        }
        Ok(CollectionLock::registered(held, ctx, user, collection))
    }

    async fn acquire(&self, user: &str, collection: &str, mode: LockMode) -> StashResult<Held> {
        if !self.uses_cache_lock(collection) {
            self.storage.lock_collection(user, collection, mode).await?;
            debug!(user, collection, %mode, "Acquired store lock");
            return Ok(Held::Store {
                storage: self.storage.clone(),
                user: user.to_string(),
                collection: collection.to_string(),
                mode,
            });
        }

        let key = UserScopedKey::lock(user, collection);
        let acquired_at = self.clock.now();
        if !self.cache.add(key.as_str(), &true, Some(self.ttl)).await? {
            debug!(%key, "Cache lock is held elsewhere");
            return Err(StorageError::conflict(key.as_str()).into());
        }
        debug!(%key, ttl = ?self.ttl, "Acquired cache lock");
        Ok(Held::Cache {
            cache: self.cache.clone(),
            clock: self.clock.clone(),
            key,
            acquired_at,
            ttl: self.ttl,
        })
    }
}

#[derive(Debug)]
enum Held {
    Cache {
        cache: JsonCache,
        clock: Arc<dyn Clock>,
        key: UserScopedKey,
        acquired_at: Timestamp,
        ttl: Duration,
    },
    Store {
        storage: Arc<dyn SyncStorage>,
        user: String,
        collection: String,
        mode: LockMode,
    },
}

impl Held {
    async fn release(self) -> StashResult<()> {
        match self {
            Held::Cache {
                cache,
                clock,
                key,
                acquired_at,
                ttl,
            } => {
                let held_ms = clock.now().as_millis() - acquired_at.as_millis();
                let held_for = Duration::from_millis(u64::try_from(held_ms).unwrap_or(0));
                if held_for >= ttl {
                    error!(%key, ?held_for, ?ttl, "Cache lock expired while held");
                    return Err(StashError::LockExpired {
                        key: key.to_string(),
                        held_for,
                        ttl,
                    });
                }
                cache.delete(key.as_str()).await?;
                debug!(%key, "Released cache lock");
                Ok(())
            }
            Held::Store {
                storage,
                user,
                collection,
                mode,
            } => {
                storage.unlock_collection(&user, &collection, mode).await?;
                debug!(%user, %collection, %mode, "Released store lock");
                Ok(())
            }
        }
    }
}

/// A held collection lock.
///
/// Call [`CollectionLock::release`] when the critical section ends; it is
/// the only way to observe an expired cache lock. A lock dropped without
/// release is released in the background where a tokio runtime is available.
#[derive(Debug)]
#[must_use = "a collection lock should be released explicitly"]
pub struct CollectionLock {
    held: Option<Held>,
    registration: Option<(CallContext, String, String)>,
}

impl CollectionLock {
    fn reentrant() -> Self {
        Self {
            held: None,
            registration: None,
        }
    }

    fn registered(held: Held, ctx: &CallContext, user: &str, collection: &str) -> Self {
        ctx.insert(user, collection);
        Self {
            held: Some(held),
            registration: Some((ctx.clone(), user.to_string(), collection.to_string())),
        }
    }

    /// True when this acquisition was nested inside one already held by the
    /// same call chain, and so holds nothing itself.
    pub fn is_reentrant(&self) -> bool {
        self.held.is_none()
    }

    /// Release the lock.
    pub async fn release(mut self) -> StashResult<()> {
        self.unregister();
        match self.held.take() {
            Some(held) => held.release().await,
            None => Ok(()),
        }
    }

    fn unregister(&mut self) {
        if let Some((ctx, user, collection)) = self.registration.take() {
            ctx.remove(&user, &collection);
        }
    }
}

impl Drop for CollectionLock {
    fn drop(&mut self) {
        self.unregister();
        let Some(held) = self.held.take() else {
            return;
        };
        warn!(?held, "Collection lock dropped without release");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = held.release().await {
                        error!(%err, "Background lock release failed");
                    }
                });
            }
            Err(_) => warn!("No runtime to release dropped lock; it will expire or stay held"),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
