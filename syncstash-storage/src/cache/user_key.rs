//! User-scoped cache keys.
//!
//! Every cache entry this layer owns belongs to exactly one user. A
//! [`UserScopedKey`] can only be built from a user id plus the kind of
//! record, so one user's operations cannot address another user's entries.
//!
//! # Key Format
//!
//! | Record | Key |
//! |---|---|
//! | metadata | `<user>:metadata` |
//! | collection | `<user>:c:<collection>` |
//! | lock | `<user>:lock:<collection>` |
//!
//! The deployment-wide prefix is applied by the cache client, not here.

use std::fmt;

/// The kind of record a key addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Metadata,
    Collection,
    Lock,
}

/// A cache key scoped to a single user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserScopedKey {
    kind: KeyKind,
    rendered: String,
}

impl UserScopedKey {
    /// Key of the user's metadata record.
    pub fn metadata(user: &str) -> Self {
        Self {
            kind: KeyKind::Metadata,
            rendered: format!("{}:metadata", user),
        }
    }

    /// Key of a cached collection record.
    pub fn collection(user: &str, collection: &str) -> Self {
        Self {
            kind: KeyKind::Collection,
            rendered: format!("{}:c:{}", user, collection),
        }
    }

    /// Key of a collection's lock placeholder.
    pub fn lock(user: &str, collection: &str) -> Self {
        Self {
            kind: KeyKind::Lock,
            rendered: format!("{}:lock:{}", user, collection),
        }
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

impl fmt::Display for UserScopedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

impl AsRef<str> for UserScopedKey {
    fn as_ref(&self) -> &str {
        &self.rendered
    }
}
