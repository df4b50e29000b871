// INTEGRATION TESTS: Model Cache
//
// 1. SINGLE-FLIGHT: concurrent misses on one key share one load
// 2. LRU: the least recently touched model goes first
// 3. DEFERRED RELEASE: leases outlive eviction and unload
// 4. FAILURES: not-found, corrupt artifacts and wait timeouts

mod common;

use std::{sync::atomic::Ordering, sync::Arc, time::Duration};

use model_serving_core::{models::ModelCacheConfig, Error};
use serde_json::{json, Map, Value};

use common::counting_cache;

fn row(x: f64) -> Map<String, Value> {
    let mut row = Map::new();
    row.insert("x".to_string(), json!(x));
    row
}

fn capacity(max_models: usize) -> ModelCacheConfig {
    ModelCacheConfig {
        max_models,
        ..ModelCacheConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_share_one_load() {
    let (cache, loads) = counting_cache(1, capacity(4), Duration::from_millis(100));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get_or_load("m0").await })
        })
        .collect();

    let mut leases = Vec::new();
    for handle in handles {
        leases.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert!(leases.iter().all(|lease| lease.same_model(&leases[0])));
    assert_eq!(cache.stats().loads, 1);
}

#[tokio::test]
async fn test_hit_does_not_reload() {
    let (cache, loads) = counting_cache(1, capacity(4), Duration::ZERO);

    let first = cache.get_or_load("m0").await.unwrap();
    let second = cache.get_or_load("m0").await.unwrap();

    assert!(first.same_model(&second));
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().hits, 1);
}

#[tokio::test]
async fn test_least_recently_used_is_evicted() {
    let (cache, loads) = counting_cache(3, capacity(2), Duration::ZERO);

    cache.get_or_load("m0").await.unwrap();
    cache.get_or_load("m1").await.unwrap();
    // Touching m0 leaves m1 as the eviction candidate.
    cache.get_or_load("m0").await.unwrap();
    cache.get_or_load("m2").await.unwrap();

    assert!(cache.is_loaded("m0"));
    assert!(!cache.is_loaded("m1"));
    assert!(cache.is_loaded("m2"));
    assert_eq!(cache.memory_usage(None).loaded_models_count, 2);
    assert_eq!(cache.stats().evictions, 1);

    let one = cache.memory_usage(Some("m0"));
    assert_eq!(one.loaded_models_count, 1);
    assert_eq!(one.models.len(), 1);
    assert_eq!(one.available_slots, 0);
    assert_eq!(cache.memory_usage(Some("m1")).loaded_models_count, 0);
    assert_eq!(loads.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_lease_survives_eviction() {
    let (cache, loads) = counting_cache(2, capacity(1), Duration::ZERO);

    let lease = cache.get_or_load("m0").await.unwrap();
    cache.get_or_load("m1").await.unwrap();
    assert!(!cache.is_loaded("m0"));

    // The evicted predictor is still fully usable through the lease.
    let out = lease.predict(&[row(21.0)]).unwrap();
    assert_eq!(out[0].value, json!(42.0));

    // A new request reloads rather than reviving the evicted instance.
    let fresh = cache.get_or_load("m0").await.unwrap();
    assert!(!fresh.same_model(&lease));
    assert_eq!(loads.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_unload_keeps_leases_working() {
    let (cache, _) = counting_cache(1, capacity(2), Duration::ZERO);

    let lease = cache.get_or_load("m0").await.unwrap();
    let clone = lease.clone();
    assert_eq!(cache.loaded_models()[0].active_leases, 2);

    assert!(cache.unload("m0"));
    assert!(!cache.unload("m0"));
    assert!(cache.loaded_models().is_empty());
    assert!(clone.predict(&[row(1.0)]).is_ok());
}

#[tokio::test]
async fn test_leases_are_counted_and_released() {
    let (cache, _) = counting_cache(1, capacity(2), Duration::ZERO);

    {
        let _a = cache.get_or_load("m0").await.unwrap();
        let _b = cache.get_or_load("m0").await.unwrap();
        assert_eq!(cache.loaded_models()[0].active_leases, 2);
    }
    assert_eq!(cache.loaded_models()[0].active_leases, 0);
}

#[tokio::test]
async fn test_unknown_version_is_not_found() {
    let (cache, loads) = counting_cache(1, capacity(2), Duration::ZERO);

    let err = cache.get_or_load("missing").await.unwrap_err();
    assert!(matches!(err, Error::ModelNotFound(_)));
    assert_eq!(loads.load(Ordering::SeqCst), 0);
    assert!(!cache.is_loaded("missing"));
}

#[tokio::test]
async fn test_failed_load_is_not_cached() {
    use common::{version, CountingLoader, MemoryArtifacts};
    use model_serving_core::{
        catalog::Catalog,
        models::{LoaderRegistry, ModelCache},
    };

    let catalog = Catalog::new(vec![version("bad", "counting", "bad.bin")], vec![]).unwrap();
    let artifacts = MemoryArtifacts::default().with("bad.bin", "corrupt");
    let loader = CountingLoader::new(Duration::ZERO);
    let loads = Arc::clone(&loader.loads);
    let registry = LoaderRegistry::new();
    registry.register(Arc::new(loader));
    let cache = ModelCache::new(
        capacity(2),
        Arc::new(catalog),
        Arc::new(artifacts),
        Arc::new(registry),
    );

    for _ in 0..2 {
        let err = cache.get_or_load("bad").await.unwrap_err();
        assert!(matches!(err, Error::ModelLoad(_)));
    }
    // Every attempt goes back to the loader.
    assert_eq!(loads.load(Ordering::SeqCst), 2);
    assert_eq!(cache.stats().load_failures, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_waiters_share_one_failure() {
    use common::{version, CountingLoader, MemoryArtifacts};
    use model_serving_core::{
        catalog::Catalog,
        models::{LoaderRegistry, ModelCache},
    };

    let catalog = Catalog::new(vec![version("bad", "counting", "bad.bin")], vec![]).unwrap();
    let artifacts = MemoryArtifacts::default().with("bad.bin", "corrupt");
    let loader = CountingLoader::new(Duration::from_millis(100));
    let loads = Arc::clone(&loader.loads);
    let registry = LoaderRegistry::new();
    registry.register(Arc::new(loader));
    let cache = Arc::new(ModelCache::new(
        capacity(2),
        Arc::new(catalog),
        Arc::new(artifacts),
        Arc::new(registry),
    ));

    let handles: Vec<_> = (0..12)
        .map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get_or_load("bad").await })
        })
        .collect();

    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ModelLoad(_)), "unexpected error: {err:?}");
    }
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert!(!cache.is_loaded("bad"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_timeout_does_not_cancel_the_load() {
    let config = ModelCacheConfig {
        load_wait_timeout_ms: Some(20),
        ..capacity(2)
    };
    let (cache, loads) = counting_cache(1, config, Duration::from_millis(300));

    let err = cache.get_or_load("m0").await.unwrap_err();
    assert!(matches!(err, Error::ModelLoadTimeout { .. }));

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(cache.is_loaded("m0"));
    cache.get_or_load("m0").await.unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_models_are_reclaimed() {
    let config = ModelCacheConfig {
        ttl_seconds: 60,
        ..capacity(4)
    };
    let (cache, _) = counting_cache(2, config, Duration::ZERO);

    cache.get_or_load("m0").await.unwrap();
    cache.get_or_load("m1").await.unwrap();

    tokio::time::advance(Duration::from_secs(45)).await;
    cache.get_or_load("m1").await.unwrap();
    tokio::time::advance(Duration::from_secs(30)).await;

    assert_eq!(cache.reclaim_idle(), vec!["m0".to_string()]);
    assert!(cache.is_loaded("m1"));
    assert_eq!(cache.stats().reclaimed, 1);
}

#[tokio::test]
async fn test_reload_swaps_the_instance() {
    let (cache, loads) = counting_cache(1, capacity(2), Duration::ZERO);

    let before = cache.get_or_load("m0").await.unwrap();
    let after = cache.reload("m0").await.unwrap();

    assert!(!before.same_model(&after));
    assert!(cache.check_health("m0"));
    assert_eq!(loads.load(Ordering::SeqCst), 2);
}
