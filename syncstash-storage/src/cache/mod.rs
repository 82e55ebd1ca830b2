//! Caching layer over a [`SyncStorage`](crate::backend::SyncStorage) backend.
//!
//! The [`CachedStorage`] facade keeps a per-user metadata record in a shared
//! key-value cache and, for configured collections, the collection contents
//! as well. Consistency rests on three mechanisms:
//!
//! - every multi-step update of a cache entry is a compare-and-swap against
//!   the version token read with it, and a lost race surfaces as a conflict;
//! - writes mark the affected metadata dirty first ([`DirtyMark`]), so a
//!   crash between the store write and the cache update can only force a
//!   recomputation;
//! - collections are locked through the backing store or through
//!   add-if-absent keys in the cache ([`LockManager`]).
//!
//! # Keys
//!
//! All keys are scoped to a user through [`UserScopedKey`]:
//!
//! | Key                      | Contents                    |
//! |--------------------------|-----------------------------|
//! | `<user>:metadata`        | [`MetadataRecord`]          |
//! | `<user>:c:<collection>`  | [`CollectionRecord`]        |
//! | `<user>:lock:<collection>` | lock placeholder          |
//!
//! # Example
//!
//! ```ignore
//! let stash = CachedStorage::new(storage, cache, clock, &config)?;
//! let ctx = CallContext::new();
//!
//! let lock = stash.lock_for_write(&ctx, "u1", "tabs").await?;
//! let outcome = stash.set_item(&ctx, "u1", "tabs", "1", &update).await;
//! lock.release().await?;
//! ```

pub mod context;
pub mod dirty;
pub mod facade;
pub mod locks;
mod managers;
pub mod memory_client;
mod metadata;
pub mod records;
pub mod traits;
pub mod user_key;

pub use context::CallContext;
pub use dirty::{DirtyMark, MetadataUpdate};
pub use facade::CachedStorage;
pub use locks::{CollectionLock, LockManager};
pub use managers::CachingStrategy;
pub use memory_client::{MemoryCacheClient, MemoryCacheError};
pub use records::{CachedStamp, CollectionRecord, MetadataRecord};
pub use traits::{CacheClient, CasToken, JsonCache};
pub use user_key::{KeyKind, UserScopedKey};
