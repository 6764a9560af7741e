//! Common utilities for integration tests
//!
//! - tracing setup (`RUST_LOG` honored)
//! - a counting fake service
//! - observer construction over a shared store

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use service_call_cache::{
    CacheConfig, CacheObserver, KeyValueStore, LockConfig, ObserverChain, Request, RuleMatcher,
    Service, ServiceError, async_trait,
};

/// Install a fmt subscriber once per test binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Get Redis URL from environment or use default
pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// Generate a unique key prefix to avoid conflicts between test runs
pub fn test_key_prefix() -> String {
    format!("test:{}:", rand::random::<u32>())
}

/// Service that counts invocations and echoes its request
pub struct CountingService {
    calls: AtomicU32,
    delay: Duration,
}

impl CountingService {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    /// Sleep `delay` inside every invocation, widening the race window
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            calls: AtomicU32::new(0),
            delay,
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Service for CountingService {
    async fn invoke(&self, request: &Request) -> Result<Value, ServiceError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if request.method().starts_with("fail") {
            return Err(ServiceError::new("E_FAIL", format!("invocation {n} failed")));
        }
        Ok(json!({"method": request.method(), "params": request.params(), "invocation": n}))
    }

    fn name(&self) -> &str {
        "counting"
    }
}

/// Fast lock polling for tests
pub fn test_config() -> CacheConfig {
    CacheConfig {
        lock: LockConfig {
            min_sleep: Duration::from_millis(5),
            max_sleep: Duration::from_millis(20),
            ..LockConfig::default()
        },
        ..CacheConfig::default()
    }
}

/// One observer (one "process") over `store`, wrapped in a chain
pub fn observer_chain(
    store: Arc<dyn KeyValueStore>,
    matcher: RuleMatcher,
    config: CacheConfig,
) -> (Arc<CacheObserver>, ObserverChain) {
    let observer = Arc::new(CacheObserver::new(Arc::new(matcher), store, config));
    let chain = ObserverChain::new().with(observer.clone());
    (observer, chain)
}
