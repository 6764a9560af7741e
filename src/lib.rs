//! Service Call Cache
//!
//! Call interception for remote services with a distributed response cache:
//! - **Observer chain**: hooks run before and after every call, with cancellation
//! - **Request matching**: per-method TTLs, attribute overrides, key attributes
//! - **TTL + grace**: stale entries are served while a refresh is scheduled
//! - **Stampede protection**: token-owned distributed lock, one refresher per key
//! - **Pub/Sub wake-up**: lock waiters retry as soon as the holder is done
//! - **Expunging**: mutating calls purge the entries they invalidate
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::{json, Value};
//! use service_call_cache::backends::MemoryStore;
//! use service_call_cache::{
//!     async_trait, Call, CacheObserverBuilder, MethodRule, ObserverChain, Request,
//!     RuleMatcher, Selector, Service, ServiceError, TtlConfig,
//! };
//!
//! struct Users;
//!
//! #[async_trait]
//! impl Service for Users {
//!     async fn invoke(&self, request: &Request) -> Result<Value, ServiceError> {
//!         Ok(json!({"id": request.params().first().cloned(), "name": "alice"}))
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let matcher = RuleMatcher::new()
//!     .rule(Selector::exact("getUser"), MethodRule::new(TtlConfig::new(60, 10, 30)));
//!
//! let observer = CacheObserverBuilder::new(matcher)
//!     .with_store(Arc::new(MemoryStore::new("app:")))
//!     .build()
//!     .await?;
//! let chain = ObserverChain::new().with(Arc::new(observer));
//!
//! let mut call = Call::new(Request::new("getUser", vec![json!(7)]));
//! chain.execute(&mut call, &Users).await?;
//! assert_eq!(call.response().result().unwrap()["name"], "alice");
//!
//! // shutdown: refresh stale entries, release leftover locks
//! chain.terminate(&Users).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! Call → ObserverChain → CacheObserver.notify_before ─ hit ──→ served from store
//!                              │ miss
//!                              ▼
//!                        DistributedLock (SET NX PX) → Service → notify_after → SET PX + unlock
//! ```

pub mod backends;
pub mod builder;
pub mod call;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod key;
pub mod lock;
pub mod matcher;
pub mod observer;
pub mod path;
pub mod traits;

pub use builder::CacheObserverBuilder;
pub use call::{Call, CallId, Request, Response, ServiceError};
pub use config::{CacheConfig, LockConfig, StoreConfig};
pub use coordinator::{CACHE_CANCELLER, CacheEntry, CacheObserver, CacheStats, STATUS_INFO_KEY};
pub use error::{CallError, ObserverError, StoreError};
pub use events::{CacheEvent, EventPublisher, LockWaker, WakerStats};
pub use key::CacheKeyBuilder;
pub use lock::{DistributedLock, LOCK_PREFIX, LockToken, lock_key};
pub use matcher::{
    CaseSensitivity, Expunger, MethodRule, RequestMatcher, RuleMatcher, Selector, TtlConfig,
};
pub use observer::{CallObserver, ObserverChain, Service};
pub use path::ValuePath;
pub use traits::{KeyValueStore, StoreOp};

// Re-export async_trait for user convenience
pub use async_trait::async_trait;
