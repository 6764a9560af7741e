//! Key-Value Store Trait
//!
//! The cache coordinator talks to its shared store only through
//! [`KeyValueStore`]. Implementations namespace every key and channel with
//! their configured prefix, transparently: callers pass and receive
//! unprefixed keys.
//!
//! # Atomicity
//!
//! Single-key operations are relied on to be linearizable. The only
//! multi-step operation is [`KeyValueStore::compare_and_delete`], which must
//! run server-side as one unit; a client-side get + compare + delete races
//! with lock expiry.
//!
//! # Example: Custom Store
//!
//! ```rust,ignore
//! use service_call_cache::{KeyValueStore, StoreOp, async_trait};
//! use futures_util::stream::BoxStream;
//! use std::time::Duration;
//! use anyhow::Result;
//!
//! struct MyStore { /* ... */ }
//!
//! #[async_trait]
//! impl KeyValueStore for MyStore {
//!     async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> { todo!() }
//!     async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
//!         todo!()
//!     }
//!     // ... implement the remaining operations
//! }
//! ```

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Lua source of the compare-and-delete unlock
///
/// `KEYS[1]` is the lock key and `ARGV[1]` the owner token; returns 1 when
/// the key was deleted, 0 otherwise.
pub const UNLOCK_SCRIPT: &str = r#"if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end"#;

/// Operation inside a [`KeyValueStore::transaction`] block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    SetEx {
        key: String,
        value: Vec<u8>,
        ttl: Duration,
    },
    Del { key: String },
}

/// Shared store used for cache entries, locks and events
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// `GET key`
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// `GET` + `PTTL`: value and its remaining lifetime
    ///
    /// A `None` duration means the key exists without expiry.
    async fn get_with_ttl(&self, key: &str) -> Result<Option<(Vec<u8>, Option<Duration>)>>;

    /// `SET key value NX PX ttl`; `true` when the key was set
    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// `SETEX key ttl value`
    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// `DEL key`; `true` when something was removed
    async fn del(&self, key: &str) -> Result<bool>;

    /// [`UNLOCK_SCRIPT`]: delete `key` only while it still holds `expected`
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// `INCRBY key delta` (negative `delta` is `DECRBY`)
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;

    /// `PUBLISH channel message`
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;

    /// `SUBSCRIBE channel`, yielding message payloads
    ///
    /// The stream ends when the underlying connection is lost; callers
    /// reconnect by subscribing again.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>>;

    /// Keys matching a glob pattern (`*`, `?`), unprefixed
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// `MULTI` ... `EXEC`: apply all operations or none
    async fn transaction(&self, ops: Vec<StoreOp>) -> Result<()>;

    /// Round-trip check against the store
    async fn health_check(&self) -> bool;

    /// Name used in logs
    fn name(&self) -> &'static str {
        "unknown"
    }
}
