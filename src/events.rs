//! Cache events over pub/sub
//!
//! Coordinators publish a [`CacheEvent`] whenever an entry is written, a
//! lock is released, or entries are expunged. A [`LockWaker`] listens on the
//! same channel and wakes tasks blocked on the corresponding lock, so a
//! waiter retries as soon as the holder is done instead of sleeping out its
//! full backoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, error, info, warn};

use crate::traits::KeyValueStore;

/// Message exchanged between coordinators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CacheEvent {
    /// A fresh entry was written for `key`
    Filled { key: String },
    /// The lock guarding `key` was released
    Released { key: String },
    /// Entries were purged by a mutating call
    Expunged { keys: Vec<String> },
}

impl CacheEvent {
    pub fn filled(key: impl Into<String>) -> Self {
        Self::Filled { key: key.into() }
    }

    pub fn released(key: impl Into<String>) -> Self {
        Self::Released { key: key.into() }
    }

    pub fn expunged(keys: Vec<String>) -> Self {
        Self::Expunged { keys }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize cache event")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize cache event")
    }

    /// Cache keys whose waiters should retry
    fn wake_keys(&self) -> &[String] {
        match self {
            Self::Filled { key } | Self::Released { key } => std::slice::from_ref(key),
            Self::Expunged { keys } => keys,
        }
    }
}

/// Publishes [`CacheEvent`]s on the configured channel
#[derive(Clone)]
pub struct EventPublisher {
    store: Arc<dyn KeyValueStore>,
    channel: String,
}

impl EventPublisher {
    pub fn new(store: Arc<dyn KeyValueStore>, channel: impl Into<String>) -> Self {
        Self {
            store,
            channel: channel.into(),
        }
    }

    pub async fn publish(&self, event: &CacheEvent) -> Result<()> {
        let json = event.to_json()?;
        self.store
            .publish(&self.channel, &json)
            .await
            .context("Failed to publish cache event")
    }

    /// Publish, logging instead of failing; events are an optimization
    pub async fn publish_best_effort(&self, event: &CacheEvent) {
        if let Err(e) = self.publish(event).await {
            warn!(error = %e, "Failed to publish cache event");
        }
    }
}

/// Event counters of a [`LockWaker`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WakerStats {
    pub events_received: u64,
    pub wakeups: u64,
    pub processing_errors: u64,
}

#[derive(Debug, Default)]
struct AtomicWakerStats {
    events_received: AtomicU64,
    wakeups: AtomicU64,
    processing_errors: AtomicU64,
}

impl AtomicWakerStats {
    fn snapshot(&self) -> WakerStats {
        WakerStats {
            events_received: self.events_received.load(Ordering::Relaxed),
            wakeups: self.wakeups.load(Ordering::Relaxed),
            processing_errors: self.processing_errors.load(Ordering::Relaxed),
        }
    }
}

/// Registered interest in events for one key
///
/// Wake-ups count from the moment [`Waiter::notified`] is called, polled or
/// not, so a caller can register before checking the condition it waits on.
/// Dropping the last waiter of a key removes the key's slot.
pub struct Waiter<'a> {
    waiters: &'a DashMap<String, Arc<Notify>>,
    key: String,
    notify: Arc<Notify>,
}

impl Waiter<'_> {
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        // the map and this waiter hold one reference each
        self.waiters
            .remove_if(&self.key, |_, n| Arc::strong_count(n) <= 2);
    }
}

/// Wakes lock waiters when the cache key they wait on changes
///
/// Spawns a background task subscribed to the events channel. Waiters
/// register interest with [`LockWaker::wait`]; the task calls
/// `notify_waiters` on the key's [`Notify`] for every matching event.
pub struct LockWaker {
    waiters: DashMap<String, Arc<Notify>>,
    stats: AtomicWakerStats,
    shutdown_tx: broadcast::Sender<()>,
}

impl LockWaker {
    /// Start listening on `channel`
    pub fn start(store: Arc<dyn KeyValueStore>, channel: impl Into<String>) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let waker = Arc::new(Self {
            waiters: DashMap::new(),
            stats: AtomicWakerStats::default(),
            shutdown_tx,
        });

        let channel = channel.into();
        let task_waker = Arc::clone(&waker);
        let mut shutdown_rx = waker.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                match task_waker.run_loop(&store, &channel, &mut shutdown_rx).await {
                    Ok(()) => {
                        info!("Lock waker shutting down...");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Lock waker subscription error. Reconnecting in 5s...");
                        task_waker.stats.processing_errors.fetch_add(1, Ordering::Relaxed);

                        tokio::select! {
                            () = tokio::time::sleep(Duration::from_secs(5)) => {},
                            _ = shutdown_rx.recv() => {
                                info!("Lock waker shutting down...");
                                break;
                            }
                        }
                    }
                }
            }
        });

        waker
    }

    async fn run_loop(
        &self,
        store: &Arc<dyn KeyValueStore>,
        channel: &str,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut stream = store.subscribe(channel).await?;
        info!(channel = %channel, "Subscribed to cache events channel");

        loop {
            tokio::select! {
                payload = stream.next() => {
                    let Some(payload) = payload else {
                        return Err(anyhow::anyhow!("Pub/Sub message stream ended"));
                    };
                    match CacheEvent::from_json(&payload) {
                        Ok(event) => self.dispatch(&event),
                        Err(e) => {
                            warn!(error = %e, "Ignoring malformed cache event");
                            self.stats.processing_errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                _ = shutdown_rx.recv() => return Ok(()),
            }
        }
    }

    fn dispatch(&self, event: &CacheEvent) {
        self.stats.events_received.fetch_add(1, Ordering::Relaxed);
        for key in event.wake_keys() {
            if let Some(notify) = self.waiters.get(key) {
                notify.notify_waiters();
                self.stats.wakeups.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Woke lock waiters");
            }
        }
    }

    /// Register interest in events for `key`
    pub fn register(&self, key: &str) -> Waiter<'_> {
        let notify = Arc::clone(
            self.waiters
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Notify::new()))
                .value(),
        );
        Waiter {
            waiters: &self.waiters,
            key: key.to_string(),
            notify,
        }
    }

    /// Resolve when an event for `key` arrives after this call
    pub async fn wait(&self, key: &str) {
        let waiter = self.register(key);
        waiter.notified().await;
    }

    pub fn stats(&self) -> WakerStats {
        self.stats.snapshot()
    }

    /// Signal the background task to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryStore;

    #[test]
    fn test_event_json_shape() {
        let json = CacheEvent::filled("getUser:{}").to_json().unwrap();
        assert_eq!(json, r#"{"type":"Filled","key":"getUser:{}"}"#);

        let parsed = CacheEvent::from_json(r#"{"type":"Expunged","keys":["a","b"]}"#).unwrap();
        assert_eq!(parsed, CacheEvent::expunged(vec!["a".into(), "b".into()]));
    }

    #[tokio::test]
    async fn test_waker_wakes_on_release() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new("t:"));
        let waker = LockWaker::start(Arc::clone(&store), "events");
        // let the background task subscribe
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiting = {
            let waker = Arc::clone(&waker);
            tokio::spawn(async move { waker.wait("k").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        EventPublisher::new(Arc::clone(&store), "events")
            .publish(&CacheEvent::released("k"))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), waiting)
            .await
            .expect("waiter should be woken")
            .unwrap();
        assert!(waker.stats().wakeups >= 1);
        waker.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_event_is_counted() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new("t:"));
        let waker = LockWaker::start(Arc::clone(&store), "events");
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.publish("events", "not json").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(waker.stats().processing_errors, 1);
        waker.shutdown();
    }
}
