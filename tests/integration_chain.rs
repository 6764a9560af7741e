//! Integration tests for the observer chain around a cached service
//!
//! Covers nested calls, expunging, error replay and shutdown refreshes

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use parking_lot::Mutex;
use serde_json::json;
use service_call_cache::backends::MemoryStore;
use service_call_cache::{
    CACHE_CANCELLER, CacheObserver, Call, CallObserver, Expunger, KeyValueStore, MethodRule,
    ObserverChain, ObserverError, Request, RuleMatcher, STATUS_INFO_KEY, Selector, TtlConfig,
    async_trait,
};

fn matcher() -> RuleMatcher {
    RuleMatcher::new()
        .rule(
            Selector::exact("getUser"),
            MethodRule::new(TtlConfig::new(60, 0, 0)).with_key_attribute("tenant"),
        )
        .rule(Selector::pattern("^list").unwrap(), MethodRule::new(TtlConfig::new(60, 0, 0)))
        .rule(Selector::exact("failHard"), MethodRule::new(TtlConfig::new(60, 30, 0)))
        .expunge(
            Selector::exact("saveUser"),
            Expunger::new("getUser:*").with_predicate(|key| !key.contains("\"pinned\"")),
        )
}

/// Tags requests with a tenant attribute, which is part of the cache key
struct Tenant(&'static str);

#[async_trait]
impl CallObserver for Tenant {
    async fn alter_request(&self, call: &mut Call) -> Result<(), ObserverError> {
        call.request_mut().set_attribute("tenant", json!(self.0))?;
        Ok(())
    }
}

#[tokio::test]
async fn test_repeated_hits_reproduce_stored_value() {
    init_tracing();
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new(test_key_prefix()));
    let (observer, chain) = observer_chain(store, matcher(), test_config());
    let service = CountingService::new();

    let mut first = Call::new(Request::new("getUser", vec![json!(1)]));
    chain.execute(&mut first, &service).await.unwrap();

    for _ in 0..5 {
        let mut again = Call::new(Request::new("getUser", vec![json!(1)]));
        chain.execute(&mut again, &service).await.unwrap();
        assert_eq!(again.response().result(), first.response().result());
        assert!(again.is_cancelled());
        assert!(again.cancellers().contains(CACHE_CANCELLER));
    }

    assert_eq!(service.calls(), 1);
    assert_eq!(observer.stats().hits, 5);
}

#[tokio::test]
async fn test_key_attributes_separate_entries() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new(test_key_prefix()));
    let observer = Arc::new(CacheObserver::new(Arc::new(matcher()), store, test_config()));
    let acme = ObserverChain::new().with(Arc::new(Tenant("acme"))).with(observer.clone());
    let globex = ObserverChain::new().with(Arc::new(Tenant("globex"))).with(observer);
    let service = CountingService::new();

    let get_user = || Call::new(Request::new("getUser", vec![json!(1)]));
    acme.execute(&mut get_user(), &service).await.unwrap();
    globex.execute(&mut get_user(), &service).await.unwrap();
    acme.execute(&mut get_user(), &service).await.unwrap();

    assert_eq!(service.calls(), 2);
}

#[tokio::test]
async fn test_pattern_rule_matches_method_family() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new(test_key_prefix()));
    let (_observer, chain) = observer_chain(store, matcher(), test_config());
    let service = CountingService::new();

    for method in ["listUsers", "listGroups", "listUsers", "listGroups"] {
        chain.execute(&mut Call::new(Request::new(method, vec![])), &service).await.unwrap();
    }

    assert_eq!(service.calls(), 2);
}

#[tokio::test]
async fn test_service_error_replayed_from_cache() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new(test_key_prefix()));
    let (_observer, chain) = observer_chain(store, matcher(), test_config());
    let service = CountingService::new();

    let mut first = Call::new(Request::new("failHard", vec![]));
    chain.execute(&mut first, &service).await.unwrap();
    let mut second = Call::new(Request::new("failHard", vec![]));
    chain.execute(&mut second, &service).await.unwrap();

    assert_eq!(service.calls(), 1);
    assert_eq!(second.response().error(), first.response().error());
    assert_eq!(second.info(STATUS_INFO_KEY), Some(&json!("hit")));
}

/// Observer that makes a nested call through the same chain while the outer call is in flight
struct Enricher {
    chain: Mutex<Option<ObserverChain>>,
}

#[async_trait]
impl CallObserver for Enricher {
    async fn notify_after(&self, call: &mut Call) -> Result<(), ObserverError> {
        if call.request().method() != "getUser" || call.parent().is_some() {
            return Ok(());
        }
        let Some(chain) = self.chain.lock().clone() else {
            return Ok(());
        };

        let mut nested = Call::child_of(call, Request::new("listGroups", vec![json!("for-user")]));
        chain.execute(&mut nested, &CountingService::new()).await?;
        call.set_info("groups", nested.response().result().cloned().unwrap_or_default());
        Ok(())
    }
}

#[tokio::test]
async fn test_nested_call_does_not_corrupt_outer_entry() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new(test_key_prefix()));
    let observer = Arc::new(CacheObserver::new(
        Arc::new(matcher()),
        Arc::clone(&store),
        test_config(),
    ));
    let enricher = Arc::new(Enricher {
        chain: Mutex::new(None),
    });
    // the enricher runs its after-hook once the cache has written the outer entry
    let chain = ObserverChain::new().with(enricher.clone()).with(observer.clone());
    *enricher.chain.lock() = Some(ObserverChain::new().with(observer.clone()));

    let service = CountingService::new();
    let mut outer = Call::new(Request::new("getUser", vec![json!(9)]));
    chain.execute(&mut outer, &service).await.unwrap();

    assert!(outer.info("groups").is_some());
    let stats = observer.stats();
    assert_eq!((stats.writes, stats.stack_corruptions, stats.active_stacks), (2, 0, 0));

    let mut again = Call::new(Request::new("getUser", vec![json!(9)]));
    chain.execute(&mut again, &service).await.unwrap();
    assert_eq!(again.response().result(), outer.response().result());
    assert_eq!(service.calls(), 1);
}

#[tokio::test]
async fn test_save_expunges_cached_reads() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new(test_key_prefix()));
    let (observer, chain) = observer_chain(Arc::clone(&store), matcher(), test_config());
    let service = CountingService::new();

    let get_user = |param| Call::new(Request::new("getUser", vec![param]));
    for param in [json!(1), json!(2), json!("pinned")] {
        chain.execute(&mut get_user(param), &service).await.unwrap();
    }
    assert_eq!(service.calls(), 3);

    let mut save = Call::new(Request::new("saveUser", vec![json!(1)]));
    chain.execute(&mut save, &service).await.unwrap();
    assert_eq!(save.info("cache.expunged"), Some(&json!(2)));
    assert_eq!(observer.stats().expunged_keys, 2);

    // expunged entries are fetched again, the pinned one is still served
    chain.execute(&mut get_user(json!(1)), &service).await.unwrap();
    chain.execute(&mut get_user(json!("pinned")), &service).await.unwrap();
    assert_eq!(service.calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_refreshes_stale_entries_once() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new(test_key_prefix()));
    let matcher = RuleMatcher::new().rule(
        Selector::exact("getPrice"),
        MethodRule::new(TtlConfig::new(5, 0, 60)),
    );
    let (observer, chain) = observer_chain(store, matcher, test_config());
    let service = CountingService::new();

    let get_price = || Call::new(Request::new("getPrice", vec![json!("EUR")]));
    chain.execute(&mut get_price(), &service).await.unwrap();
    tokio::time::advance(Duration::from_secs(10)).await;

    // two stale hits for one key register a single refresh
    for _ in 0..2 {
        let mut stale = Call::new(Request::new("getPrice", vec![json!("EUR")]));
        chain.execute(&mut stale, &service).await.unwrap();
        assert_eq!(stale.info(STATUS_INFO_KEY), Some(&json!("stale")));
        assert_eq!(stale.response().result().unwrap()["invocation"], 1);
    }
    assert_eq!(observer.stats().pending_refreshes, 1);

    chain.terminate(&service).await.unwrap();
    assert_eq!(service.calls(), 2);

    let mut fresh = Call::new(Request::new("getPrice", vec![json!("EUR")]));
    chain.execute(&mut fresh, &service).await.unwrap();
    assert_eq!(fresh.response().result().unwrap()["invocation"], 2);
}
