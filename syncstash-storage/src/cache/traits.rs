//! Cache client trait and the JSON layer on top of it.
//!
//! The caching layer talks to a shared key-value cache through
//! [`CacheClient`], a byte-level surface with memcached semantics: reads can
//! return a version token, and writes can be made conditional on that token
//! (`cas`) or on the key being absent (`add`).

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use syncstash_core::{StashError, StashResult};

/// Opaque version of a cache entry, as returned by [`CacheClient::gets`].
///
/// Any write to the entry invalidates previously issued tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CasToken(u64);

impl CasToken {
    pub const fn new(raw: u64) -> Self {
        CasToken(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Byte-level cache client.
///
/// Keys are given without the deployment-wide prefix; the client applies it.
/// A `ttl` of `None` means the entry does not expire.
#[async_trait]
pub trait CacheClient: Send + Sync + fmt::Debug {
    /// Read an entry.
    async fn get(&self, key: &str) -> StashResult<Option<Vec<u8>>>;

    /// Read an entry together with its version token.
    async fn gets(&self, key: &str) -> StashResult<Option<(Vec<u8>, CasToken)>>;

    /// Unconditionally write an entry.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StashResult<()>;

    /// Write an entry only if the key is absent. Returns whether it was written.
    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StashResult<bool>;

    /// Write an entry only if it still carries `token`.
    ///
    /// A `None` token means "only if absent", the same as [`CacheClient::add`].
    /// Returns whether the write happened.
    async fn cas(
        &self,
        key: &str,
        value: Vec<u8>,
        token: Option<CasToken>,
        ttl: Option<Duration>,
    ) -> StashResult<bool>;

    /// Remove an entry. Returns whether the key existed.
    async fn delete(&self, key: &str) -> StashResult<bool>;
}

/// JSON view over a [`CacheClient`].
///
/// All cache records are stored as JSON documents; this wrapper does the
/// encoding so the rest of the layer works with typed records.
#[derive(Debug, Clone)]
pub struct JsonCache {
    client: Arc<dyn CacheClient>,
}

impl JsonCache {
    pub fn new(client: Arc<dyn CacheClient>) -> Self {
        Self { client }
    }

    /// The underlying byte-level client.
    pub fn client(&self) -> &Arc<dyn CacheClient> {
        &self.client
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> StashResult<Option<T>> {
        match self.client.get(key).await? {
            Some(bytes) => Ok(Some(decode(key, &bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn gets<T: DeserializeOwned>(&self, key: &str) -> StashResult<Option<(T, CasToken)>> {
        match self.client.gets(key).await? {
            Some((bytes, token)) => Ok(Some((decode(key, &bytes)?, token))),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize + Sync>(&self, key: &str, value: &T) -> StashResult<()> {
        let bytes = encode(key, value)?;
        self.client.set(key, bytes, None).await
    }

    pub async fn add<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> StashResult<bool> {
        let bytes = encode(key, value)?;
        self.client.add(key, bytes, ttl).await
    }

    pub async fn cas<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        token: Option<CasToken>,
    ) -> StashResult<bool> {
        let bytes = encode(key, value)?;
        self.client.cas(key, bytes, token, None).await
    }

    pub async fn delete(&self, key: &str) -> StashResult<bool> {
        self.client.delete(key).await
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> StashResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StashError::serialization(key, e))
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> StashResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StashError::serialization(key, e))
}
