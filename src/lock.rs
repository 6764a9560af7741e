//! Distributed Lock
//!
//! Mutual exclusion over the shared store. Each acquisition attempt carries
//! a fresh [`LockToken`]; the lock record's value is that token, and release
//! deletes the record only while it still holds the same token
//! ([`UNLOCK_SCRIPT`](crate::traits::UNLOCK_SCRIPT)). A holder whose lock
//! expired therefore never removes the lock of whoever acquired it next.
//!
//! Blocking acquisition retries forever with jittered sleeps; the safety net
//! is the lock's own expiry at the store, never a client-side timeout.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio::sync::futures::Notified;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::StoreError;
use crate::events::{CacheEvent, EventPublisher, LockWaker, Waiter};
use crate::matcher::TtlConfig;
use crate::traits::KeyValueStore;

/// Prefix of lock records, followed by the cache key they guard
pub const LOCK_PREFIX: &str = "LOCK::";

/// Lock key guarding `cache_key`
pub fn lock_key(cache_key: &str) -> String {
    format!("{LOCK_PREFIX}{cache_key}")
}

/// Opaque owner token of one acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Token-owned lock over a [`KeyValueStore`]
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KeyValueStore>,
    config: LockConfig,
    waker: Option<Arc<LockWaker>>,
    publisher: Option<EventPublisher>,
    escalations: Arc<AtomicU64>,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn KeyValueStore>, config: LockConfig) -> Self {
        Self {
            store,
            config,
            waker: None,
            publisher: None,
            escalations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Race blocking sleeps against events for the guarded key
    pub fn with_waker(mut self, waker: Arc<LockWaker>) -> Self {
        self.waker = Some(waker);
        self
    }

    /// Announce releases so other processes' waiters retry immediately
    pub fn with_publisher(mut self, publisher: EventPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Warnings emitted for long waits, shared by clones of this lock
    pub fn escalations(&self) -> u64 {
        self.escalations.load(Ordering::Relaxed)
    }

    /// `min(max_ttl, value + grace)`, never below one second
    pub fn lock_ttl(&self, ttl: &TtlConfig) -> Duration {
        self.config
            .max_ttl
            .min(ttl.value_expiry())
            .max(Duration::from_secs(1))
    }

    /// Try to take `lock_key` for `ttl`
    ///
    /// Non-blocking mode makes one attempt. Blocking mode retries until it
    /// wins, warning every `warn_after_attempts` consecutive failures. Store
    /// errors end the attempt and are returned to the caller.
    pub async fn acquire(
        &self,
        lock_key: &str,
        token: &LockToken,
        ttl: Duration,
        blocking: bool,
    ) -> Result<bool> {
        if ttl < Duration::from_secs(1) {
            return Err(StoreError::InvalidTtl {
                millis: ttl.as_millis(),
            }
            .into());
        }

        let mut attempts: u32 = 0;
        loop {
            // registered before the attempt so a release in between is not missed
            let waiter = if blocking { self.watch(lock_key) } else { None };
            let notified = waiter.as_ref().map(Waiter::notified);

            if self.store.set_nx_ex(lock_key, token.as_bytes(), ttl).await? {
                if attempts > 0 {
                    debug!(
                        lock_key = %lock_key,
                        attempts = attempts,
                        "Lock acquired after waiting"
                    );
                }
                return Ok(true);
            }
            if !blocking {
                return Ok(false);
            }

            attempts += 1;
            let threshold = self.config.warn_after_attempts.max(1);
            if attempts % threshold == 0 {
                self.escalations.fetch_add(1, Ordering::Relaxed);
                warn!(
                    lock_key = %lock_key,
                    attempts = attempts,
                    "Still waiting for lock; holder may be slow or the store unreachable"
                );
            }

            self.pause(notified).await;
        }
    }

    /// Register for events on the key `lock_key` guards, if a waker is attached
    ///
    /// Create the [`Waiter::notified`] future before checking the condition
    /// being waited on, then hand it to [`DistributedLock::pause`].
    pub fn watch(&self, lock_key: &str) -> Option<Waiter<'_>> {
        self.waker
            .as_ref()
            .map(|waker| waker.register(guarded_key(lock_key)))
    }

    /// Sleep one jittered backoff, cut short by `notified` when present
    pub async fn pause(&self, notified: Option<Notified<'_>>) {
        let pause = self.jitter();
        match notified {
            Some(notified) => {
                tokio::select! {
                    () = tokio::time::sleep(pause) => {},
                    () = notified => {},
                }
            }
            None => tokio::time::sleep(pause).await,
        }
    }

    /// Release `lock_key` if `token` still owns it
    ///
    /// `Ok(false)` means the lock expired and possibly passed to another
    /// owner; that is expected under contention and only logged.
    pub async fn release(&self, lock_key: &str, token: &LockToken) -> Result<bool> {
        let released = self.store.compare_and_delete(lock_key, token.as_bytes()).await?;

        if released {
            debug!(lock_key = %lock_key, "Lock released");
            if let Some(publisher) = &self.publisher {
                publisher
                    .publish_best_effort(&CacheEvent::released(guarded_key(lock_key)))
                    .await;
            }
        } else {
            warn!(
                lock_key = %lock_key,
                token = %token,
                "Lock no longer owned at release (expired or taken over)"
            );
        }
        Ok(released)
    }

    fn jitter(&self) -> Duration {
        let min = self.config.min_sleep;
        let max = self.config.max_sleep.max(min);
        if min == max {
            return min;
        }
        rand::thread_rng().gen_range(min..=max)
    }
}

fn guarded_key(lock_key: &str) -> &str {
    lock_key.strip_prefix(LOCK_PREFIX).unwrap_or(lock_key)
}
