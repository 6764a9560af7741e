//! Configuration
//!
//! Plain structs with sensible defaults. Only the store location is read
//! from the environment; everything else is set in code by the host.

use std::time::Duration;

/// Where the shared store lives and how keys are namespaced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`
    pub url: String,
    /// Prepended to every key and channel by the store adapter
    pub prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            prefix: "callcache:".to_string(),
        }
    }
}

impl StoreConfig {
    /// `REDIS_URL` and `CACHE_KEY_PREFIX`, falling back to the defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("REDIS_URL").unwrap_or(defaults.url),
            prefix: std::env::var("CACHE_KEY_PREFIX").unwrap_or(defaults.prefix),
        }
    }
}

/// Distributed lock behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    /// Lower bound of the jittered sleep between blocking attempts
    pub min_sleep: Duration,
    /// Upper bound of the jittered sleep between blocking attempts
    pub max_sleep: Duration,
    /// Emit a warning every this many consecutive failed attempts
    pub warn_after_attempts: u32,
    /// Ceiling for lock lifetime; the cache TTL can only shorten it
    pub max_ttl: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            min_sleep: Duration::from_millis(50),
            max_sleep: Duration::from_millis(150),
            warn_after_attempts: 20,
            max_ttl: Duration::from_secs(30),
        }
    }
}

/// Cache coordinator behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub lock: LockConfig,
    /// On a contended miss, queue on the lock (`true`) or wait for the holder's entry
    pub blocking_lock: bool,
    /// Pub/sub channel for [`CacheEvent`](crate::CacheEvent)s
    pub events_channel: String,
    /// Start a [`LockWaker`](crate::LockWaker) so blocked waiters retry on events
    pub wake_on_events: bool,
    /// Mirror hit/miss counters into the store (`STATS::hit`, `STATS::miss`)
    pub shared_stats: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lock: LockConfig::default(),
            blocking_lock: true,
            events_channel: "cache:events".to_string(),
            wake_on_events: true,
            shared_stats: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert!(config.blocking_lock);
        assert!(config.lock.min_sleep <= config.lock.max_sleep);
        assert_eq!(config.lock.max_ttl, Duration::from_secs(30));
        assert_eq!(StoreConfig::default().prefix, "callcache:");
    }
}
