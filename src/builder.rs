//! Cache Observer Builder
//!
//! Wires a matcher, a store and configuration into a [`CacheObserver`].
//!
//! # Example: Redis from the environment
//!
//! ```rust,no_run
//! use service_call_cache::{CacheObserverBuilder, MethodRule, RuleMatcher, Selector, TtlConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let matcher = RuleMatcher::new()
//!         .rule(Selector::exact("getUser"), MethodRule::new(TtlConfig::new(60, 10, 30)));
//!
//!     // REDIS_URL / CACHE_KEY_PREFIX
//!     let observer = CacheObserverBuilder::new(matcher).build().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Example: Custom store
//!
//! ```rust
//! use std::sync::Arc;
//! use service_call_cache::backends::MemoryStore;
//! use service_call_cache::{CacheConfig, CacheObserverBuilder, RuleMatcher};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let observer = CacheObserverBuilder::new(RuleMatcher::new())
//!     .with_store(Arc::new(MemoryStore::new("app:")))
//!     .with_config(CacheConfig { blocking_lock: false, ..CacheConfig::default() })
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::config::CacheConfig;
use crate::coordinator::CacheObserver;
use crate::events::LockWaker;
use crate::matcher::RequestMatcher;
use crate::traits::KeyValueStore;

/// Builder for [`CacheObserver`]
///
/// # Default Behavior
///
/// - **Store**: [`RedisStore`](crate::backends::RedisStore) configured from
///   the environment (requires the `redis` feature)
/// - **Config**: [`CacheConfig::default`] (blocking lock, waiters woken by
///   cache events)
pub struct CacheObserverBuilder {
    matcher: Arc<dyn RequestMatcher>,
    store: Option<Arc<dyn KeyValueStore>>,
    config: CacheConfig,
}

impl CacheObserverBuilder {
    pub fn new(matcher: impl RequestMatcher + 'static) -> Self {
        Self::with_matcher(Arc::new(matcher))
    }

    /// Start from a shared matcher
    pub fn with_matcher(matcher: Arc<dyn RequestMatcher>) -> Self {
        Self {
            matcher,
            store: None,
            config: CacheConfig::default(),
        }
    }

    /// Use `store` instead of connecting to Redis
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the observer, connecting the default store if none was given
    ///
    /// # Errors
    ///
    /// Returns an error if the default store cannot connect, or when no
    /// store was provided and the `redis` feature is disabled.
    pub async fn build(self) -> Result<CacheObserver> {
        info!("Building cache observer...");

        let store: Arc<dyn KeyValueStore> = match self.store {
            Some(store) => {
                info!(store = %store.name(), "Using custom store");
                store
            }
            None => default_store().await?,
        };

        let mut observer = CacheObserver::new(self.matcher, Arc::clone(&store), self.config);
        if observer.config().wake_on_events {
            let waker = LockWaker::start(store, observer.config().events_channel.clone());
            observer = observer.with_waker(waker);
        }

        info!("Cache observer built successfully");
        Ok(observer)
    }
}

#[cfg(feature = "redis")]
async fn default_store() -> Result<Arc<dyn KeyValueStore>> {
    info!("Using default store (Redis)");
    Ok(Arc::new(crate::backends::RedisStore::new().await?))
}

#[cfg(not(feature = "redis"))]
async fn default_store() -> Result<Arc<dyn KeyValueStore>> {
    anyhow::bail!("no store configured and the `redis` feature is disabled")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryStore;
    use crate::matcher::RuleMatcher;

    #[tokio::test]
    async fn test_build_with_custom_store_starts_waker() {
        let observer = CacheObserverBuilder::new(RuleMatcher::new())
            .with_store(Arc::new(MemoryStore::new("t:")))
            .build()
            .await
            .unwrap();

        assert_eq!(observer.store().name(), "Memory");
        assert!(observer.stats().waker.is_some());
    }

    #[tokio::test]
    async fn test_waker_disabled_by_config() {
        let observer = CacheObserverBuilder::new(RuleMatcher::new())
            .with_store(Arc::new(MemoryStore::new("t:")))
            .with_config(CacheConfig {
                wake_on_events: false,
                ..CacheConfig::default()
            })
            .build()
            .await
            .unwrap();

        assert!(observer.stats().waker.is_none());
    }
}
