//! In-process cache client.
//!
//! [`MemoryCacheClient`] implements the full [`CacheClient`] contract
//! (version tokens, add-if-absent, compare-and-swap, per-entry TTL) over a
//! mutex-guarded map. Expiry is driven by an injected [`Clock`] so lock TTLs
//! can be exercised deterministically. Concurrent operations are bounded by
//! a connection-pool semaphore sized like a real client's pool.

use super::traits::{CacheClient, CasToken};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use syncstash_core::{Clock, StashConfig, StashError, StashResult, StorageError, Timestamp};
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};

/// Errors raised by the in-process cache client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MemoryCacheError {
    #[error("Timed out after {0:?} waiting for a cache connection")]
    PoolTimeout(Duration),

    #[error("Cache connection pool closed")]
    PoolClosed,

    #[error("Cache servers unavailable: {servers}")]
    Unavailable { servers: String },

    #[error("Cache entry map poisoned")]
    Poisoned,
}

impl From<MemoryCacheError> for StashError {
    fn from(err: MemoryCacheError) -> Self {
        StashError::Storage(StorageError::Cache {
            reason: err.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    cas: u64,
    expires_at: Option<Timestamp>,
}

impl Entry {
    fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Cache client keeping entries in process memory.
#[derive(Debug)]
pub struct MemoryCacheClient {
    servers: Vec<String>,
    prefix: String,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
    next_cas: AtomicU64,
    pool: Semaphore,
    pool_timeout: Duration,
    available: AtomicBool,
}

impl MemoryCacheClient {
    /// Create a client with default pool settings and no key prefix.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::from_config(&StashConfig::default(), clock)
    }

    /// Create a client using the cache settings of `config`.
    pub fn from_config(config: &StashConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            servers: config.cache_servers.clone(),
            prefix: config.cache_key_prefix.clone(),
            clock,
            entries: Mutex::new(HashMap::new()),
            next_cas: AtomicU64::new(1),
            pool: Semaphore::new(config.cache_pool_size),
            pool_timeout: config.cache_pool_timeout,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the cache servers going away (or coming back). While
    /// unavailable every operation fails with a cache error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Whether a live entry exists for `key` (given without prefix).
    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .get(&self.full_key(key))
                    .is_some_and(|entry| !entry.is_expired(now))
            })
            .unwrap_or(false)
    }

    /// Number of stored entries, expired ones not yet purged included.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn checkout(&self) -> Result<SemaphorePermit<'_>, MemoryCacheError> {
        if !self.available.load(Ordering::Acquire) {
            return Err(MemoryCacheError::Unavailable {
                servers: self.servers.join(","),
            });
        }
        match tokio::time::timeout(self.pool_timeout, self.pool.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(MemoryCacheError::PoolClosed),
            Err(_) => Err(MemoryCacheError::PoolTimeout(self.pool_timeout)),
        }
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<Timestamp> {
        ttl.map(|ttl| {
            let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            Timestamp::from_millis(self.clock.now().as_millis().saturating_add(millis))
        })
    }

    fn next_cas(&self) -> u64 {
        self.next_cas.fetch_add(1, Ordering::AcqRel)
    }

    /// Run `f` against the live entry for `key` (expired entries are purged
    /// first and read as absent).
    fn with_entry<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut HashMap<String, Entry>, String, Option<Entry>) -> R,
    ) -> Result<R, MemoryCacheError> {
        let now = self.clock.now();
        let full_key = self.full_key(key);
        let mut entries = self.entries.lock().map_err(|_| MemoryCacheError::Poisoned)?;
        if entries.get(&full_key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(&full_key);
        }
        let current = entries.get(&full_key).cloned();
        Ok(f(&mut entries, full_key, current))
    }

    fn store(
        &self,
        entries: &mut HashMap<String, Entry>,
        full_key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) {
        let entry = Entry {
            value,
            cas: self.next_cas(),
            expires_at: self.expiry(ttl),
        };
        entries.insert(full_key, entry);
    }
}

#[async_trait]
impl CacheClient for MemoryCacheClient {
    async fn get(&self, key: &str) -> StashResult<Option<Vec<u8>>> {
        let _permit = self.checkout().await?;
        Ok(self.with_entry(key, |_, _, current| current.map(|e| e.value))?)
    }

    async fn gets(&self, key: &str) -> StashResult<Option<(Vec<u8>, CasToken)>> {
        let _permit = self.checkout().await?;
        Ok(self.with_entry(key, |_, _, current| {
            current.map(|e| (e.value, CasToken::new(e.cas)))
        })?)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StashResult<()> {
        let _permit = self.checkout().await?;
        self.with_entry(key, |entries, full_key, _| {
            self.store(entries, full_key, value, ttl)
        })?;
        Ok(())
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StashResult<bool> {
        let _permit = self.checkout().await?;
        Ok(self.with_entry(key, |entries, full_key, current| {
            if current.is_some() {
                return false;
            }
            self.store(entries, full_key, value, ttl);
            true
        })?)
    }

    async fn cas(
        &self,
        key: &str,
        value: Vec<u8>,
        token: Option<CasToken>,
        ttl: Option<Duration>,
    ) -> StashResult<bool> {
        let _permit = self.checkout().await?;
        Ok(self.with_entry(key, |entries, full_key, current| {
            let matches = match (&current, token) {
                (None, None) => true,
                (Some(entry), Some(token)) => entry.cas == token.raw(),
                _ => false,
            };
            if matches {
                self.store(entries, full_key, value, ttl);
            }
            matches
        })?)
    }

    async fn delete(&self, key: &str) -> StashResult<bool> {
        let _permit = self.checkout().await?;
        Ok(self.with_entry(key, |entries, full_key, current| {
            entries.remove(&full_key);
            current.is_some()
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncstash_core::ManualClock;

    fn client() -> (Arc<ManualClock>, MemoryCacheClient) {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        let client = MemoryCacheClient::new(clock.clone());
        (clock, client)
    }

    #[tokio::test]
    async fn test_gets_and_cas() {
        let (_, cache) = client();
        assert!(cache.gets("k").await.unwrap().is_none());

        cache.set("k", b"one".to_vec(), None).await.unwrap();
        let (value, token) = cache.gets("k").await.unwrap().unwrap();
        assert_eq!(value, b"one");

        assert!(cache.cas("k", b"two".to_vec(), Some(token), None).await.unwrap());
        // The token is spent once the entry changes.
        assert!(!cache.cas("k", b"three".to_vec(), Some(token), None).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_cas_without_token_is_add() {
        let (_, cache) = client();
        assert!(cache.cas("k", b"a".to_vec(), None, None).await.unwrap());
        assert!(!cache.cas("k", b"b".to_vec(), None, None).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().unwrap(), b"a");
    }

    #[tokio::test]
    async fn test_cas_on_missing_key_with_token_fails() {
        let (_, cache) = client();
        cache.set("k", b"a".to_vec(), None).await.unwrap();
        let (_, token) = cache.gets("k").await.unwrap().unwrap();
        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.cas("k", b"b".to_vec(), Some(token), None).await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_add_and_ttl_expiry() {
        let (clock, cache) = client();
        assert!(cache
            .add("lock", b"1".to_vec(), Some(Duration::from_secs(5)))
            .await
            .unwrap());
        assert!(!cache.add("lock", b"1".to_vec(), None).await.unwrap());
        assert!(cache.contains_key("lock"));

        clock.advance(Duration::from_secs(5));
        assert!(!cache.contains_key("lock"));
        assert!(cache.add("lock", b"1".to_vec(), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_key_prefix_is_applied() {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
        let config = StashConfig::new().with_key_prefix("prod:");
        let cache = MemoryCacheClient::from_config(&config, clock);
        cache.set("u1:metadata", b"{}".to_vec(), None).await.unwrap();

        let entries = cache.entries.lock().unwrap();
        assert!(entries.contains_key("prod:u1:metadata"));
    }

    #[tokio::test]
    async fn test_unavailable_cache_reports_cache_error() {
        let (_, cache) = client();
        cache.set_available(false);
        let err = cache.get("k").await.unwrap_err();
        assert!(matches!(err, StashError::Storage(StorageError::Cache { .. })));
        assert!(err.is_store_error());

        cache.set_available(true);
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pool_checkout_times_out() {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
        let config = StashConfig::new().with_pool(1, Duration::from_millis(20));
        let cache = MemoryCacheClient::from_config(&config, clock);

        let held = cache.pool.acquire().await.unwrap();
        let err = cache.get("k").await.unwrap_err();
        assert!(err.to_string().contains("waiting for a cache connection"));
        drop(held);
        assert!(cache.get("k").await.unwrap().is_none());
    }
}
