//! syncstash Storage - Backing Store Contract and Caching Layer
//!
//! Defines the [`SyncStorage`] contract for per-user collection stores, an
//! in-memory implementation of it, and the [`cache`] layer that puts a
//! shared key-value cache in front of any such store.

pub mod backend;
pub mod cache;
pub mod memory;

pub use backend::SyncStorage;
pub use memory::MemoryStorage;

// Re-export the caching layer's public surface
pub use cache::{
    CacheClient, CachedStamp, CachedStorage, CachingStrategy, CallContext, CasToken,
    CollectionLock, CollectionRecord, DirtyMark, JsonCache, KeyKind, LockManager,
    MemoryCacheClient, MemoryCacheError, MetadataRecord, MetadataUpdate, UserScopedKey,
};
