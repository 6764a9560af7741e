//! Cache Coordinator
//!
//! [`CacheObserver`] is the observer that puts a distributed cache in front
//! of a service. Each call passes through two phases:
//!
//! ```text
//! notify_before                                   notify_after
//! ─────────────                                   ────────────
//! expunger?      → push Expunge                   Expunge → purge matching keys
//! no rule        → push Ignore                    Ignore  → nothing
//! entry present  → cancel, serve, push Hit        Hit     → nothing
//! entry absent   → lock, re-check, push Miss      Miss    → write entry, release lock
//! ```
//!
//! Decisions are kept on a stack per root call, so nested calls made while
//! handling an outer call unwind in order while unrelated concurrent calls
//! never share state. Store failures are logged and counted, and the call
//! proceeds uncached.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::call::{Call, CallId, Request, ServiceError};
use crate::config::CacheConfig;
use crate::error::ObserverError;
use crate::events::{CacheEvent, EventPublisher, LockWaker, Waiter, WakerStats};
use crate::lock::{DistributedLock, LOCK_PREFIX, LockToken, lock_key};
use crate::matcher::{Expunger, RequestMatcher, TtlConfig};
use crate::observer::CallObserver;
use crate::traits::{KeyValueStore, StoreOp};

/// Canceller name recorded on calls served from the cache
pub const CACHE_CANCELLER: &str = "cache";

/// Info key carrying `hit`, `stale`, `late_hit`, `miss` or `refresh`
pub const STATUS_INFO_KEY: &str = "cache.status";

const SHARED_HITS_KEY: &str = "STATS::hit";
const SHARED_MISSES_KEY: &str = "STATS::miss";

/// Stored form of a cached response
///
/// Exactly one of `value` / `error` is meaningful; `grace` is the grace
/// window in seconds the entry was written with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub grace: u64,
    pub error: Option<ServiceError>,
    pub value: Option<Value>,
}

impl CacheEntry {
    pub fn value(value: Value, grace: u64) -> Self {
        Self {
            grace,
            error: None,
            value: Some(value),
        }
    }

    pub fn error(error: &ServiceError, grace: u64) -> Self {
        Self {
            grace,
            error: Some(error.stripped()),
            value: None,
        }
    }

    /// Inside the grace window: past nominal TTL but still served
    fn is_stale(&self, remaining: Option<Duration>) -> bool {
        self.grace > 0 && remaining.is_some_and(|r| r <= Duration::from_secs(self.grace))
    }
}

/// An entry served stale, to be refreshed when the host drains
#[derive(Debug, Clone)]
struct GraceCheck {
    method: String,
    params: Vec<Value>,
    attributes: BTreeMap<String, Value>,
    service: String,
    ttl: TtlConfig,
}

impl GraceCheck {
    fn to_request(&self) -> Request {
        let request = Request::new(self.method.clone(), self.params.clone());
        self.attributes.iter().fold(request, |request, (name, value)| {
            request.with_attribute(name.clone(), value.clone())
        })
    }
}

#[derive(Debug)]
struct MissState {
    key: String,
    ttl: TtlConfig,
    lock_key: String,
    token: LockToken,
}

#[derive(Debug)]
enum Frame {
    Ignore,
    Hit,
    Miss(MissState),
    Expunge(Expunger),
}

#[derive(Debug)]
struct StackEntry {
    /// Call whose `notify_before` pushed this entry
    call: CallId,
    frame: Frame,
}

struct Cached {
    entry: CacheEntry,
    remaining: Option<Duration>,
}

/// Outcome of trying to take the lock for a miss
enum Claim {
    Won,
    /// Another holder wrote the entry while this call waited
    Filled(Cached),
    Failed,
}

/// Coordinator statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub stale_hits: u64,
    pub late_hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub lock_contention: u64,
    pub stack_corruptions: u64,
    pub store_errors: u64,
    pub expunged_keys: u64,
    pub short_circuits: u64,
    pub leaked_locks: u64,
    pub aborted_calls: u64,
    pub lock_escalations: u64,
    pub pending_refreshes: usize,
    pub active_stacks: usize,
    pub waker: Option<WakerStats>,
}

impl CacheStats {
    /// Share of lookups served from the cache, in percent
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.late_hits;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            (served as f64 / total as f64) * 100.0
        }
    }
}

#[derive(Debug, Default)]
struct AtomicCacheStats {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    late_hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    lock_contention: AtomicU64,
    stack_corruptions: AtomicU64,
    store_errors: AtomicU64,
    expunged_keys: AtomicU64,
    short_circuits: AtomicU64,
    leaked_locks: AtomicU64,
    aborted_calls: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HitKind {
    Direct,
    Late,
}

/// Observer caching a service's responses in a shared [`KeyValueStore`]
pub struct CacheObserver {
    matcher: Arc<dyn RequestMatcher>,
    store: Arc<dyn KeyValueStore>,
    lock: DistributedLock,
    publisher: EventPublisher,
    waker: Option<Arc<LockWaker>>,
    config: CacheConfig,
    stacks: DashMap<CallId, Vec<StackEntry>>,
    grace_checks: DashMap<String, GraceCheck>,
    stats: AtomicCacheStats,
}

impl CacheObserver {
    pub fn new(
        matcher: Arc<dyn RequestMatcher>,
        store: Arc<dyn KeyValueStore>,
        config: CacheConfig,
    ) -> Self {
        let publisher = EventPublisher::new(Arc::clone(&store), config.events_channel.clone());
        let lock = DistributedLock::new(Arc::clone(&store), config.lock)
            .with_publisher(publisher.clone());

        info!(
            store = %store.name(),
            blocking_lock = config.blocking_lock,
            events_channel = %config.events_channel,
            "Cache observer initialized"
        );

        Self {
            matcher,
            store,
            lock,
            publisher,
            waker: None,
            config,
            stacks: DashMap::new(),
            grace_checks: DashMap::new(),
            stats: AtomicCacheStats::default(),
        }
    }

    /// Let blocked lock waiters retry as soon as an event arrives
    pub fn with_waker(mut self, waker: Arc<LockWaker>) -> Self {
        self.lock = self.lock.with_waker(Arc::clone(&waker));
        self.waker = Some(waker);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn stats(&self) -> CacheStats {
        let s = &self.stats;
        CacheStats {
            hits: s.hits.load(Ordering::Relaxed),
            stale_hits: s.stale_hits.load(Ordering::Relaxed),
            late_hits: s.late_hits.load(Ordering::Relaxed),
            misses: s.misses.load(Ordering::Relaxed),
            writes: s.writes.load(Ordering::Relaxed),
            lock_contention: s.lock_contention.load(Ordering::Relaxed),
            stack_corruptions: s.stack_corruptions.load(Ordering::Relaxed),
            store_errors: s.store_errors.load(Ordering::Relaxed),
            expunged_keys: s.expunged_keys.load(Ordering::Relaxed),
            short_circuits: s.short_circuits.load(Ordering::Relaxed),
            leaked_locks: s.leaked_locks.load(Ordering::Relaxed),
            aborted_calls: s.aborted_calls.load(Ordering::Relaxed),
            lock_escalations: self.lock.escalations(),
            pending_refreshes: self.grace_checks.len(),
            active_stacks: self.stacks.len(),
            waker: self.waker.as_ref().map(|w| w.stats()),
        }
    }

    fn push(&self, call: &Call, frame: Frame) {
        self.stacks
            .entry(call.root())
            .or_default()
            .push(StackEntry {
                call: call.id(),
                frame,
            });
    }

    fn pop(&self, root: CallId) -> Option<StackEntry> {
        let mut stack = self.stacks.get_mut(&root)?;
        let entry = stack.pop();
        let empty = stack.is_empty();
        drop(stack);

        if empty {
            self.stacks.remove_if(&root, |_, s| s.is_empty());
        }
        entry
    }

    /// Current entry for `key`; decode and store failures read as absent
    async fn read_entry(&self, key: &str) -> Option<Cached> {
        let (bytes, remaining) = match self.store.get_with_ttl(key).await {
            Ok(found) => found?,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                bump(&self.stats.store_errors);
                return None;
            }
        };

        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) => Some(Cached { entry, remaining }),
            Err(e) => {
                warn!(key = %key, error = %e, "Undecodable cache entry, treating as miss");
                None
            }
        }
    }

    fn serve_hit(
        &self,
        call: &mut Call,
        key: &str,
        ttl: TtlConfig,
        cached: Cached,
        kind: HitKind,
    ) -> Result<(), ObserverError> {
        let stale = cached.entry.is_stale(cached.remaining);

        call.cancel(CACHE_CANCELLER);
        let response = call.response_mut();
        match cached.entry.error {
            Some(error) => response.set_error(error)?,
            None => response.set_result(cached.entry.value.unwrap_or(Value::Null))?,
        }

        let status = match kind {
            HitKind::Late => {
                bump(&self.stats.late_hits);
                "late_hit"
            }
            HitKind::Direct if stale => {
                bump(&self.stats.hits);
                bump(&self.stats.stale_hits);
                self.register_grace_check(call, key, ttl);
                "stale"
            }
            HitKind::Direct => {
                bump(&self.stats.hits);
                "hit"
            }
        };
        call.set_info(STATUS_INFO_KEY, json!(status));
        debug!(
            key = %key,
            status = status,
            remaining_ms = ?cached.remaining.map(|r| r.as_millis()),
            "Cache hit"
        );
        Ok(())
    }

    fn register_grace_check(&self, call: &Call, key: &str, ttl: TtlConfig) {
        let request = call.request();
        self.grace_checks.entry(key.to_string()).or_insert_with(|| GraceCheck {
            method: request.method().to_string(),
            params: request.params().to_vec(),
            attributes: request.attributes().clone(),
            service: call.service().to_string(),
            ttl,
        });
    }

    async fn bump_shared(&self, key: &str) {
        if !self.config.shared_stats {
            return;
        }
        if let Err(e) = self.store.incr_by(key, 1).await {
            warn!(key = %key, error = %e, "Failed to update shared cache counter");
        }
    }

    async fn release_lock(&self, lock_key: &str, token: &LockToken) {
        if let Err(e) = self.lock.release(lock_key, token).await {
            warn!(
                lock_key = %lock_key,
                error = %e,
                "Lock release failed; it will expire on its own"
            );
            bump(&self.stats.store_errors);
        }
    }

    /// Take the lock for a miss on `key`
    ///
    /// Blocking mode queues on the lock. Non-blocking mode never queues: on
    /// contention it waits for the holder's entry, re-trying the lock only
    /// so that a holder that vanished without writing is replaced.
    async fn claim(
        &self,
        key: &str,
        lock_key: &str,
        token: &LockToken,
        lock_ttl: Duration,
    ) -> Claim {
        if self.config.blocking_lock {
            return match self.lock.acquire(lock_key, token, lock_ttl, true).await {
                Ok(true) => Claim::Won,
                Ok(false) => Claim::Failed,
                Err(e) => self.claim_failed(key, &e),
            };
        }

        let mut contended = false;
        loop {
            // registered before the checks so a fill in between is not missed
            let waiter = self.lock.watch(lock_key);
            let notified = waiter.as_ref().map(Waiter::notified);

            match self.lock.acquire(lock_key, token, lock_ttl, false).await {
                Ok(true) => return Claim::Won,
                Ok(false) => {}
                Err(e) => return self.claim_failed(key, &e),
            }
            if !contended {
                contended = true;
                bump(&self.stats.lock_contention);
                debug!(key = %key, "Lock held elsewhere, waiting for the holder's entry");
            }
            if let Some(cached) = self.read_entry(key).await {
                return Claim::Filled(cached);
            }
            self.lock.pause(notified).await;
        }
    }

    fn claim_failed(&self, key: &str, error: &anyhow::Error) -> Claim {
        warn!(key = %key, error = %error, "Lock acquisition failed, calling through uncached");
        bump(&self.stats.store_errors);
        Claim::Failed
    }

    async fn before_terminating(
        &self,
        call: &mut Call,
        key: String,
        ttl: TtlConfig,
    ) -> Result<(), ObserverError> {
        let lock_key = lock_key(&key);
        let token = LockToken::generate();
        let lock_ttl = self.lock.lock_ttl(&ttl);

        let won = match self.lock.acquire(&lock_key, &token, lock_ttl, false).await {
            Ok(won) => won,
            Err(e) => {
                warn!(key = %key, error = %e, "Lock acquisition failed for terminating call");
                bump(&self.stats.store_errors);
                false
            }
        };

        if won {
            let needs_refresh = match self.read_entry(&key).await {
                None => true,
                Some(cached) => cached.entry.is_stale(cached.remaining),
            };
            if needs_refresh {
                debug!(key = %key, "Refreshing entry on terminating call");
                call.set_info(STATUS_INFO_KEY, json!("refresh"));
                self.push(call, Frame::Miss(MissState {
                    key,
                    ttl,
                    lock_key,
                    token,
                }));
                return Ok(());
            }
            self.release_lock(&lock_key, &token).await;
        } else {
            bump(&self.stats.lock_contention);
        }

        bump(&self.stats.short_circuits);
        debug!(key = %key, "Terminating call short-circuited");
        Err(ObserverError::TerminateShortCircuit { key })
    }

    /// Write the call's response under `miss.key`; `true` if written
    ///
    /// `cacheable` gates values only; errors are written whenever the
    /// method has an error TTL.
    async fn write_response(&self, call: &Call, miss: &MissState) -> bool {
        let response = call.response();
        let (entry, expiry) = match response.error() {
            Some(_) if miss.ttl.error == 0 => return false,
            Some(error) => (CacheEntry::error(error, miss.ttl.grace), miss.ttl.error_expiry()),
            None if !response.is_cacheable() => {
                debug!(key = %miss.key, "Response marked uncacheable, not writing");
                return false;
            }
            None if miss.ttl.value == 0 => return false,
            None => {
                let value = response.result().cloned().unwrap_or(Value::Null);
                (CacheEntry::value(value, miss.ttl.grace), miss.ttl.value_expiry())
            }
        };

        let bytes = match serde_json::to_vec(&entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %miss.key, error = %e, "Failed to serialize cache entry");
                return false;
            }
        };

        match self.store.set_ex(&miss.key, &bytes, expiry).await {
            Ok(()) => {
                bump(&self.stats.writes);
                debug!(
                    key = %miss.key,
                    ttl_secs = expiry.as_secs(),
                    error = entry.error.is_some(),
                    "Cache entry written"
                );
                true
            }
            Err(e) => {
                warn!(key = %miss.key, error = %e, "Cache write failed");
                bump(&self.stats.store_errors);
                false
            }
        }
    }

    async fn expunge(&self, call: &mut Call, expunger: &Expunger) {
        if call.response().is_error() {
            debug!(
                method = %call.request().method(),
                "Mutating call failed, keeping cached entries"
            );
            return;
        }

        let keys = match self.store.keys(expunger.pattern()).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(pattern = %expunger.pattern(), error = %e, "Failed to scan keys for expunge");
                bump(&self.stats.store_errors);
                return;
            }
        };

        let doomed: Vec<String> = keys
            .into_iter()
            .filter(|k| !k.starts_with(LOCK_PREFIX) && expunger.accepts(k))
            .collect();
        if doomed.is_empty() {
            return;
        }

        let ops = doomed.iter().map(|key| StoreOp::Del { key: key.clone() }).collect();
        if let Err(e) = self.store.transaction(ops).await {
            warn!(pattern = %expunger.pattern(), error = %e, "Expunge transaction failed");
            bump(&self.stats.store_errors);
            return;
        }

        let count = doomed.len();
        self.stats.expunged_keys.fetch_add(count as u64, Ordering::Relaxed);
        call.set_info("cache.expunged", json!(count));
        debug!(pattern = %expunger.pattern(), count = count, "Expunged cache entries");
        self.publisher.publish_best_effort(&CacheEvent::expunged(doomed)).await;
    }
}

#[async_trait]
impl CallObserver for CacheObserver {
    async fn notify_before(&self, call: &mut Call) -> Result<(), ObserverError> {
        if let Some(expunger) = self.matcher.is_expunger(call.request()) {
            self.push(call, Frame::Expunge(expunger));
            return Ok(());
        }
        if !self.matcher.is_match(call.request()) {
            self.push(call, Frame::Ignore);
            return Ok(());
        }

        let key = self.matcher.get_key(call.request());
        let ttl = self.matcher.get_ttl_config(call.request());

        if call.is_terminating() {
            return self.before_terminating(call, key, ttl).await;
        }

        if let Some(cached) = self.read_entry(&key).await {
            self.serve_hit(call, &key, ttl, cached, HitKind::Direct)?;
            self.push(call, Frame::Hit);
            self.bump_shared(SHARED_HITS_KEY).await;
            return Ok(());
        }

        bump(&self.stats.misses);
        call.set_info(STATUS_INFO_KEY, json!("miss"));
        self.bump_shared(SHARED_MISSES_KEY).await;

        let lock_key = lock_key(&key);
        let token = LockToken::generate();
        let lock_ttl = self.lock.lock_ttl(&ttl);

        match self.claim(&key, &lock_key, &token, lock_ttl).await {
            Claim::Won => {}
            Claim::Filled(cached) => {
                self.serve_hit(call, &key, ttl, cached, HitKind::Late)?;
                self.push(call, Frame::Hit);
                return Ok(());
            }
            Claim::Failed => {
                self.push(call, Frame::Ignore);
                return Ok(());
            }
        }

        // another holder may have filled the entry while we waited
        if let Some(cached) = self.read_entry(&key).await {
            self.release_lock(&lock_key, &token).await;
            self.serve_hit(call, &key, ttl, cached, HitKind::Late)?;
            self.push(call, Frame::Hit);
            return Ok(());
        }

        debug!(key = %key, lock_ttl_ms = lock_ttl.as_millis(), "Cache miss, lock held");
        self.push(call, Frame::Miss(MissState {
            key,
            ttl,
            lock_key,
            token,
        }));
        Ok(())
    }

    async fn notify_after(&self, call: &mut Call) -> Result<(), ObserverError> {
        loop {
            let Some(entry) = self.pop(call.root()) else {
                warn!(
                    call = %call.id(),
                    method = %call.request().method(),
                    "notify_after with no pending cache decision"
                );
                return Ok(());
            };

            match entry.frame {
                Frame::Ignore | Frame::Hit => return Ok(()),
                Frame::Expunge(expunger) => {
                    self.expunge(call, &expunger).await;
                    return Ok(());
                }
                Frame::Miss(miss) => {
                    let current = self.matcher.get_key(call.request());
                    if current != miss.key {
                        warn!(
                            expected = %miss.key,
                            actual = %current,
                            pushed_by = %entry.call,
                            completed = %call.id(),
                            "Cache call stack corrupted; releasing stale lock without writing"
                        );
                        bump(&self.stats.stack_corruptions);
                        self.release_lock(&miss.lock_key, &miss.token).await;
                        continue;
                    }

                    let written = self.write_response(call, &miss).await;
                    self.release_lock(&miss.lock_key, &miss.token).await;
                    if written {
                        let event = CacheEvent::filled(miss.key);
                        self.publisher.publish_best_effort(&event).await;
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn abort(&self, root: CallId, call: CallId) {
        let aborted = {
            let Some(mut stack) = self.stacks.get_mut(&root) else {
                return;
            };
            let Some(from) = stack.iter().position(|entry| entry.call == call) else {
                return;
            };
            // frames above belong to nested calls that can no longer finish either
            let aborted = stack.split_off(from);
            let empty = stack.is_empty();
            drop(stack);
            if empty {
                self.stacks.remove_if(&root, |_, s| s.is_empty());
            }
            aborted
        };

        bump(&self.stats.aborted_calls);
        for entry in aborted.into_iter().rev() {
            if let Frame::Miss(miss) = entry.frame {
                debug!(key = %miss.key, call = %entry.call, "Releasing lock of an aborted call");
                self.release_lock(&miss.lock_key, &miss.token).await;
            }
        }
    }

    async fn pending_refreshes(&self, service: &str) -> Vec<Request> {
        let keys: Vec<String> = self
            .grace_checks
            .iter()
            .filter(|e| e.value().service == service)
            .map(|e| e.key().clone())
            .collect();

        keys.into_iter()
            .filter_map(|key| self.grace_checks.remove(&key))
            .map(|(key, check)| {
                debug!(
                    key = %key,
                    service = %check.service,
                    ttl = ?check.ttl,
                    "Scheduling grace refresh"
                );
                check.to_request()
            })
            .collect()
    }

    async fn terminate(&self) -> Result<(), ObserverError> {
        let roots: Vec<CallId> = self.stacks.iter().map(|e| *e.key()).collect();

        for root in roots {
            let Some((_, stack)) = self.stacks.remove(&root) else {
                continue;
            };
            for entry in stack.into_iter().rev() {
                if let Frame::Miss(miss) = entry.frame {
                    warn!(
                        key = %miss.key,
                        call = %entry.call,
                        "Releasing lock left held by an unfinished call"
                    );
                    bump(&self.stats.leaked_locks);
                    self.release_lock(&miss.lock_key, &miss.token).await;
                }
            }
        }

        if let Some(waker) = &self.waker {
            waker.shutdown();
        }
        info!(stats = ?self.stats(), "Cache observer terminated");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "cache"
    }
}
