//! Per-call-chain state.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

/// State belonging to one logical call chain (one inbound request).
///
/// Currently this tracks which `(user, collection)` locks the chain holds, so
/// that read locks are reentrant within the chain. Create one per request and
/// pass it to every facade call the request makes; never share it between
/// concurrent requests.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    held: Arc<Mutex<HashSet<(String, String)>>>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this chain currently holds a lock on the collection.
    pub fn holds(&self, user: &str, collection: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(user.to_string(), collection.to_string()))
    }

    /// Number of locks currently held by this chain.
    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub(crate) fn insert(&self, user: &str, collection: &str) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((user.to_string(), collection.to_string()));
    }

    pub(crate) fn remove(&self, user: &str, collection: &str) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(user.to_string(), collection.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_held_set_is_per_context() {
        let ctx = CallContext::new();
        let other = CallContext::new();
        ctx.insert("u1", "tabs");

        assert!(ctx.holds("u1", "tabs"));
        assert!(!ctx.holds("u1", "bookmarks"));
        assert!(!other.holds("u1", "tabs"));

        // Clones share the chain's state.
        let cloned = ctx.clone();
        cloned.remove("u1", "tabs");
        assert!(!ctx.holds("u1", "tabs"));
        assert_eq!(ctx.held_count(), 0);
    }
}
