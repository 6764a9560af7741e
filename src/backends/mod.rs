//! Store Backend Implementations
//!
//! # Available Backends
//!
//! - **Redis** - Distributed store shared by every process of the host (default, feature: `redis`)
//! - **Memory** - `DashMap`-backed store for tests and single-process hosts
//!
//! # Usage
//!
//! ```rust,no_run
//! use service_call_cache::backends::{MemoryStore, RedisStore};
//! use service_call_cache::StoreConfig;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let memory = MemoryStore::new("app:");
//! let redis = RedisStore::with_config(&StoreConfig::from_env()).await?;
//! # Ok(())
//! # }
//! ```

pub mod memory_store;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use memory_store::MemoryStore;

#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
