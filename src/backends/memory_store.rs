//! Memory Store - In-Process Key-Value Backend
//!
//! A `DashMap`-backed [`KeyValueStore`] for single-process deployments and
//! tests. Expiry uses `tokio::time::Instant`, so a paused test clock drives
//! it deterministically.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use parking_lot::RwLock;
use regex::Regex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::traits::{KeyValueStore, StoreOp};

/// Stored value with expiration tracking
#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Instant::now() >= expires_at)
    }

    fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|expires_at| expires_at.saturating_duration_since(Instant::now()))
    }
}

/// In-process store
///
/// **Use Case**: tests, single-process hosts, local development
///
/// **Limitations**:
/// - no cross-process coordination (locks only exclude tasks of this process)
/// - expired entries are dropped lazily on access or by [`MemoryStore::cleanup_expired`]
///
/// **Example**:
/// ```rust
/// use service_call_cache::backends::MemoryStore;
/// use service_call_cache::KeyValueStore;
/// use std::time::Duration;
///
/// # async fn example() -> anyhow::Result<()> {
/// let store = MemoryStore::new("app:");
/// assert!(store.set_nx_ex("LOCK::k", b"token", Duration::from_secs(5)).await?);
/// assert!(!store.set_nx_ex("LOCK::k", b"other", Duration::from_secs(5)).await?);
/// # Ok(())
/// # }
/// ```
pub struct MemoryStore {
    prefix: String,
    map: Arc<DashMap<String, StoredValue>>,
    /// Single-key operations take this shared; transactions take it exclusively
    txn_gate: RwLock<()>,
    events: broadcast::Sender<(String, String)>,
}

impl MemoryStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        info!(prefix = %prefix, "Initializing Memory Store (DashMap)");

        let (events, _) = broadcast::channel(1024);
        Self {
            prefix,
            map: Arc::new(DashMap::new()),
            txn_gate: RwLock::new(()),
            events,
        }
    }

    /// Remove expired entries
    pub fn cleanup_expired(&self) -> usize {
        let _shared = self.txn_gate.read();
        let mut removed = 0;
        self.map.retain(|_, entry| {
            if entry.is_expired() {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            debug!(count = removed, "[Memory] Cleaned up expired entries");
        }
        removed
    }

    /// Number of live (unexpired) entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.iter().filter(|e| !e.value().is_expired()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    fn live(&self, full_key: &str) -> Option<StoredValue> {
        let entry = self.map.get(full_key)?;
        if entry.is_expired() {
            drop(entry);
            self.map.remove_if(full_key, |_, e| e.is_expired());
            return None;
        }
        Some(entry.clone())
    }

    fn apply(&self, op: StoreOp) {
        match op {
            StoreOp::SetEx { key, value, ttl } => {
                self.map.insert(self.full_key(&key), StoredValue::new(value, Some(ttl)));
            }
            StoreOp::Del { key } => {
                self.map.remove(&self.full_key(&key));
            }
        }
    }
}

/// Translate a Redis-style glob into an anchored regex
pub(crate) fn glob_to_regex(pattern: &str) -> Result<Regex, StoreError> {
    let mut out = String::with_capacity(pattern.len() + 2);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| StoreError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let _shared = self.txn_gate.read();
        Ok(self.live(&self.full_key(key)).map(|e| e.value))
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<(Vec<u8>, Option<Duration>)>> {
        let _shared = self.txn_gate.read();
        Ok(self.live(&self.full_key(key)).map(|e| {
            let remaining = e.remaining();
            (e.value, remaining)
        }))
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let _shared = self.txn_gate.read();
        let stored = StoredValue::new(value.to_vec(), Some(ttl));
        let won = match self.map.entry(self.full_key(key)) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(stored);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(stored);
                true
            }
        };
        Ok(won)
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let _shared = self.txn_gate.read();
        self.apply(StoreOp::SetEx {
            key: key.to_string(),
            value: value.to_vec(),
            ttl,
        });
        debug!(key = %key, ttl_secs = %ttl.as_secs(), "[Memory] Stored key with TTL");
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let _shared = self.txn_gate.read();
        Ok(self
            .map
            .remove(&self.full_key(key))
            .is_some_and(|(_, e)| !e.is_expired()))
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let _shared = self.txn_gate.read();
        Ok(self
            .map
            .remove_if(&self.full_key(key), |_, e| !e.is_expired() && e.value == expected)
            .is_some())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let _shared = self.txn_gate.read();
        match self.map.entry(self.full_key(key)) {
            Entry::Occupied(mut occupied) => {
                let current = if occupied.get().is_expired() {
                    occupied.get_mut().expires_at = None;
                    0
                } else {
                    std::str::from_utf8(&occupied.get().value)
                        .ok()
                        .and_then(|s| s.parse::<i64>().ok())
                        .ok_or_else(|| StoreError::NotAnInteger {
                            key: key.to_string(),
                        })?
                };
                let next = current
                    .checked_add(delta)
                    .ok_or_else(|| StoreError::Overflow {
                        key: key.to_string(),
                    })?;
                occupied.get_mut().value = next.to_string().into_bytes();
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(delta.to_string().into_bytes(), None));
                Ok(delta)
            }
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        // No receivers is not an error, same as PUBLISH returning 0
        let _ = self.events.send((self.full_key(channel), message.to_string()));
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let channel = self.full_key(channel);
        let receiver = self.events.subscribe();

        let stream = stream::unfold(receiver, move |mut receiver| {
            let channel = channel.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok((ch, message)) if ch == channel => return Some((message, receiver)),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped = skipped, "[Memory] Subscriber lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let _shared = self.txn_gate.read();
        let regex = glob_to_regex(pattern)?;
        let keys = self
            .map
            .iter()
            .filter(|e| !e.value().is_expired())
            .filter_map(|e| e.key().strip_prefix(&self.prefix).map(str::to_string))
            .filter(|k| regex.is_match(k))
            .collect();
        Ok(keys)
    }

    async fn transaction(&self, ops: Vec<StoreOp>) -> Result<()> {
        let _exclusive = self.txn_gate.write();
        let count = ops.len();
        for op in ops {
            self.apply(op);
        }
        debug!(ops = count, "[Memory] Applied transaction");
        Ok(())
    }

    async fn health_check(&self) -> bool {
        let test_key = "health_check_memory";
        let test_value = b"health_check_value";

        match self.set_ex(test_key, test_value, Duration::from_secs(60)).await {
            Ok(()) => match self.get(test_key).await {
                Ok(Some(retrieved)) => {
                    let _ = self.del(test_key).await;
                    retrieved == test_value
                }
                _ => false,
            },
            Err(_) => false,
        }
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}
