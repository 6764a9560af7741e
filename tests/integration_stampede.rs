//! Integration tests for stampede protection
//!
//! Many coordinators ("processes") share one store and race on the same key

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use serde_json::json;
use service_call_cache::backends::MemoryStore;
use service_call_cache::{
    Call, CacheObserverBuilder, KeyValueStore, MethodRule, ObserverChain, Request, RuleMatcher,
    Selector, TtlConfig,
};
use tokio::task::JoinSet;

fn matcher() -> RuleMatcher {
    RuleMatcher::new().rule(Selector::exact("getReport"), MethodRule::new(TtlConfig::new(60, 0, 0)))
}

/// N concurrent misses on one key: exactly one reaches the service
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_invoke_service_once() {
    init_tracing();
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new(test_key_prefix()));
    let service = Arc::new(CountingService::with_delay(Duration::from_millis(100)));

    let mut tasks = JoinSet::new();
    for _ in 0..16 {
        let (_observer, chain) = observer_chain(Arc::clone(&store), matcher(), test_config());
        let service = Arc::clone(&service);
        tasks.spawn(async move {
            let mut call = Call::new(Request::new("getReport", vec![json!("q3")]));
            let outcome = chain.execute(&mut call, service.as_ref()).await;
            outcome.map(|()| call)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let call = joined
            .unwrap_or_else(|_| panic!("Task panicked"))
            .unwrap_or_else(|e| panic!("Call failed: {e}"));
        results.push(call.response().result().cloned());
    }

    assert_eq!(service.calls(), 1, "Expected exactly 1 service call, got {}", service.calls());
    assert!(results.iter().all(|r| r == &results[0]), "All callers must see the winner's value");
    assert_eq!(results[0].as_ref().unwrap()["invocation"], 1);
}

/// Non-blocking observers wait for the holder's entry instead of calling through
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_non_blocking_misses_invoke_service_once() {
    init_tracing();
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new(test_key_prefix()));
    let service = Arc::new(CountingService::with_delay(Duration::from_millis(100)));
    let mut config = test_config();
    config.blocking_lock = false;

    let mut tasks = JoinSet::new();
    for _ in 0..16 {
        let (_observer, chain) = observer_chain(Arc::clone(&store), matcher(), config.clone());
        let service = Arc::clone(&service);
        tasks.spawn(async move {
            let mut call = Call::new(Request::new("getReport", vec![json!("q3-fast")]));
            let outcome = chain.execute(&mut call, service.as_ref()).await;
            outcome.map(|()| call)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let call = joined.unwrap().unwrap();
        assert_eq!(call.response().result().unwrap()["invocation"], 1);
    }
    assert_eq!(service.calls(), 1);
}

/// Waiters woken by release events do not sleep out their backoff
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_waiters_wake_on_events() {
    init_tracing();
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new(test_key_prefix()));
    let service = Arc::new(CountingService::with_delay(Duration::from_millis(50)));

    // backoff far longer than the whole test budget; only events can wake waiters
    let mut config = test_config();
    config.lock.min_sleep = Duration::from_secs(20);
    config.lock.max_sleep = Duration::from_secs(20);

    let mut chains = Vec::new();
    for _ in 0..4 {
        let observer = CacheObserverBuilder::new(matcher())
            .with_store(Arc::clone(&store))
            .with_config(config.clone())
            .build()
            .await
            .unwrap();
        chains.push(ObserverChain::new().with(Arc::new(observer)));
    }
    // let the wakers subscribe
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut tasks = JoinSet::new();
    for chain in chains {
        let service = Arc::clone(&service);
        tasks.spawn(async move {
            let mut call = Call::new(Request::new("getReport", vec![json!("q4")]));
            chain.execute(&mut call, service.as_ref()).await
        });
    }

    let all = async {
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }
    };
    tokio::time::timeout(Duration::from_secs(5), all)
        .await
        .expect("waiters should be woken by cache events");
    assert_eq!(service.calls(), 1);
}

/// Distinct keys never wait on each other
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_keys_proceed_independently() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new(test_key_prefix()));
    let service = Arc::new(CountingService::with_delay(Duration::from_millis(20)));
    let (observer, chain) = observer_chain(Arc::clone(&store), matcher(), test_config());

    let mut tasks = JoinSet::new();
    for i in 0..8 {
        let chain = chain.clone();
        let service = Arc::clone(&service);
        tasks.spawn(async move {
            let mut call = Call::new(Request::new("getReport", vec![json!(i)]));
            chain.execute(&mut call, service.as_ref()).await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap().unwrap();
    }

    assert_eq!(service.calls(), 8);
    let stats = observer.stats();
    assert_eq!((stats.misses, stats.writes, stats.active_stacks), (8, 8, 0));
}

/// A lock left by a crashed holder expires and the next caller proceeds
#[tokio::test]
async fn test_crashed_holder_lock_expires() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new(test_key_prefix()));
    let service = CountingService::new();
    let (_observer, chain) = observer_chain(Arc::clone(&store), matcher(), test_config());

    let request = Request::new("getReport", vec![json!("crash")]);
    let key = service_call_cache::RequestMatcher::get_key(&matcher(), &request);
    store
        .set_nx_ex(&service_call_cache::lock_key(&key), b"dead-holder", Duration::from_secs(1))
        .await
        .unwrap();

    let mut call = Call::new(request);
    tokio::time::timeout(Duration::from_secs(5), chain.execute(&mut call, &service))
        .await
        .expect("blocked caller should proceed once the stale lock expires")
        .unwrap();
    assert_eq!(service.calls(), 1);
}
