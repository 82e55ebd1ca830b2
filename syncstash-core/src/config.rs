//! Configuration types
//!
//! [`StashConfig`] is everything the caching layer reads at construction:
//! where the cache lives, how keys are namespaced, which collections are
//! cached (write-through) or cache-only, and how locking behaves.

use crate::error::{ConfigError, StashError, StashResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Default lock time-to-live: five minutes.
pub const DEFAULT_CACHE_LOCK_TTL: Duration = Duration::from_secs(5 * 60);

/// Recalculate a user's total size at most once per hour.
pub const DEFAULT_SIZE_RECALCULATION_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Caching layer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StashConfig {
    /// Cache server addresses.
    pub cache_servers: Vec<String>,
    /// Prepended to every cache key, for sharing one cache between deployments.
    pub cache_key_prefix: String,
    /// Maximum number of concurrently checked-out cache connections.
    pub cache_pool_size: usize,
    /// How long a cache operation may wait for a pooled connection.
    pub cache_pool_timeout: Duration,
    /// Collections duplicated into the cache (write-through).
    pub cached_collections: Vec<String>,
    /// Collections stored only in the cache, never in the backing store.
    pub cache_only_collections: Vec<String>,
    /// Use cache-based locks for every collection, not just cache-only ones.
    pub cache_lock: bool,
    /// How long a cache-based lock stays exclusive.
    pub cache_lock_ttl: Duration,
    /// Minimum interval between size recalculations for one user.
    pub size_recalculation_period: Duration,
}

impl Default for StashConfig {
    fn default() -> Self {
        Self {
            cache_servers: vec!["127.0.0.1:11211".to_string()],
            cache_key_prefix: String::new(),
            cache_pool_size: 10,
            cache_pool_timeout: Duration::from_secs(60),
            cached_collections: Vec::new(),
            cache_only_collections: Vec::new(),
            cache_lock: false,
            cache_lock_ttl: DEFAULT_CACHE_LOCK_TTL,
            size_recalculation_period: DEFAULT_SIZE_RECALCULATION_PERIOD,
        }
    }
}

impl StashConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cache_servers = servers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cache_key_prefix = prefix.into();
        self
    }

    pub fn with_pool(mut self, size: usize, timeout: Duration) -> Self {
        self.cache_pool_size = size;
        self.cache_pool_timeout = timeout;
        self
    }

    pub fn with_cached_collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cached_collections = collections.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cache_only_collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cache_only_collections = collections.into_iter().map(Into::into).collect();
        self
    }

    /// Force cache-based locking for all collections.
    pub fn with_cache_lock(mut self, enabled: bool) -> Self {
        self.cache_lock = enabled;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.cache_lock_ttl = ttl;
        self
    }

    pub fn with_size_recalculation_period(mut self, period: Duration) -> Self {
        self.size_recalculation_period = period;
        self
    }

    /// Create a config from environment variables.
    ///
    /// Environment variables (unset ones keep their defaults):
    /// - `SYNCSTASH_CACHE_SERVERS`: comma-separated server addresses
    /// - `SYNCSTASH_CACHE_KEY_PREFIX`: key namespace
    /// - `SYNCSTASH_CACHE_POOL_SIZE`: connection pool size
    /// - `SYNCSTASH_CACHE_POOL_TIMEOUT_SECS`: pool checkout timeout
    /// - `SYNCSTASH_CACHED_COLLECTIONS`: comma-separated write-through collections
    /// - `SYNCSTASH_CACHE_ONLY_COLLECTIONS`: comma-separated cache-only collections
    /// - `SYNCSTASH_CACHE_LOCK`: "true" to lock every collection in the cache
    /// - `SYNCSTASH_CACHE_LOCK_TTL_SECS`: lock time-to-live
    /// - `SYNCSTASH_SIZE_RECALC_SECS`: size recalculation period
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cache_servers = env_list("SYNCSTASH_CACHE_SERVERS").unwrap_or(defaults.cache_servers);

        let cache_key_prefix =
            std::env::var("SYNCSTASH_CACHE_KEY_PREFIX").unwrap_or(defaults.cache_key_prefix);

        let cache_pool_size = std::env::var("SYNCSTASH_CACHE_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.cache_pool_size);

        let cache_pool_timeout =
            env_secs("SYNCSTASH_CACHE_POOL_TIMEOUT_SECS").unwrap_or(defaults.cache_pool_timeout);

        let cached_collections =
            env_list("SYNCSTASH_CACHED_COLLECTIONS").unwrap_or(defaults.cached_collections);

        let cache_only_collections = env_list("SYNCSTASH_CACHE_ONLY_COLLECTIONS")
            .unwrap_or(defaults.cache_only_collections);

        let cache_lock = std::env::var("SYNCSTASH_CACHE_LOCK")
            .ok()
            .map(|s| s.to_lowercase() == "true" || s == "1")
            .unwrap_or(defaults.cache_lock);

        let cache_lock_ttl =
            env_secs("SYNCSTASH_CACHE_LOCK_TTL_SECS").unwrap_or(defaults.cache_lock_ttl);

        let size_recalculation_period =
            env_secs("SYNCSTASH_SIZE_RECALC_SECS").unwrap_or(defaults.size_recalculation_period);

        Self {
            cache_servers,
            cache_key_prefix,
            cache_pool_size,
            cache_pool_timeout,
            cached_collections,
            cache_only_collections,
            cache_lock,
            cache_lock_ttl,
            size_recalculation_period,
        }
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - at least one cache server is configured
    /// - pool size, lock TTL and recalculation period are positive
    /// - no collection is both cached and cache-only
    pub fn validate(&self) -> StashResult<()> {
        if self.cache_servers.is_empty() {
            return Err(StashError::Config(ConfigError::MissingRequired {
                field: "cache_servers".to_string(),
            }));
        }

        if self.cache_pool_size == 0 {
            return Err(StashError::Config(ConfigError::InvalidValue {
                field: "cache_pool_size".to_string(),
                value: self.cache_pool_size.to_string(),
                reason: "cache_pool_size must be greater than 0".to_string(),
            }));
        }

        if self.cache_lock_ttl.is_zero() {
            return Err(StashError::Config(ConfigError::InvalidValue {
                field: "cache_lock_ttl".to_string(),
                value: format!("{:?}", self.cache_lock_ttl),
                reason: "cache_lock_ttl must be positive".to_string(),
            }));
        }

        if self.size_recalculation_period.is_zero() {
            return Err(StashError::Config(ConfigError::InvalidValue {
                field: "size_recalculation_period".to_string(),
                value: format!("{:?}", self.size_recalculation_period),
                reason: "size_recalculation_period must be positive".to_string(),
            }));
        }

        let cached: BTreeSet<&str> = self.cached_collections.iter().map(String::as_str).collect();
        if let Some(both) = self
            .cache_only_collections
            .iter()
            .find(|c| cached.contains(c.as_str()))
        {
            return Err(StashError::Config(ConfigError::IncompatibleOptions {
                option_a: format!("cached_collections[{}]", both),
                option_b: format!("cache_only_collections[{}]", both),
            }));
        }

        Ok(())
    }
}

fn env_list(name: &str) -> Option<Vec<String>> {
    std::env::var(name).ok().map(|s| {
        s.split(',')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect()
    })
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
}
