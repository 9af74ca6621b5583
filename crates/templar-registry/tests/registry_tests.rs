mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{CountingLoader, init_tracing};
use serde_json::json;
use templar::VersionToken;
use templar_registry::{
    CachePolicy, ConfigError, MIN_POLL_INTERVAL, RefreshMode, Registry, TemplateLoader,
    TemplateSource,
};
use tokio::sync::Semaphore;

fn lru(capacity: usize, ttl: Duration, refresh: RefreshMode) -> Registry {
    Registry::new(CachePolicy::LruBackground {
        capacity,
        ttl,
        refresh,
    })
}

fn ttl_lazy(capacity: usize, ttl: Duration) -> Registry {
    Registry::new(CachePolicy::TtlLazy { capacity, ttl })
}

/// Wait on the real clock until `condition` holds.
async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_uncached_lookup_always_loads() {
    init_tracing();
    let registry = lru(4, Duration::from_secs(60), RefreshMode::OnAccess);
    let loader = CountingLoader::new("a.yml.j2", "a");

    registry.get_template(loader.clone(), false).await.unwrap();
    assert_eq!(loader.loads(), 1);
    assert!(registry.is_empty());

    registry.get_template(loader.clone(), true).await.unwrap();
    assert_eq!(loader.loads(), 2);
    registry.get_template(loader.clone(), false).await.unwrap();
    assert_eq!(loader.loads(), 3);
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_hit_returns_same_instance() {
    let registry = lru(4, Duration::from_secs(60), RefreshMode::OnAccess);
    let loader = CountingLoader::new("a.yml.j2", "Hello {{ name }}");

    let first = registry.get_template(loader.clone(), true).await.unwrap();
    let second = registry.get_template(loader.clone(), true).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(loader.loads(), 1);
    assert_eq!(first.render(json!({ "name": "Ada" })).unwrap(), "Hello Ada");
}

#[tokio::test]
async fn test_lru_eviction_order() {
    let registry = lru(2, Duration::from_secs(60), RefreshMode::OnAccess);
    let x = CountingLoader::new("x.yml.j2", "x");
    let y = CountingLoader::new("y.yml.j2", "y");
    let z = CountingLoader::new("z.yml.j2", "z");
    let w = CountingLoader::new("w.yml.j2", "w");

    registry.get_template(x.clone(), true).await.unwrap();
    registry.get_template(y.clone(), true).await.unwrap();
    registry.get_template(z.clone(), true).await.unwrap();
    assert!(!registry.contains(x.identity()));
    assert!(registry.contains(y.identity()));
    assert!(registry.contains(z.identity()));

    registry.get_template(y.clone(), true).await.unwrap();
    registry.get_template(w.clone(), true).await.unwrap();
    assert!(registry.contains(y.identity()));
    assert!(!registry.contains(z.identity()));
    assert!(registry.contains(w.identity()));
    assert_eq!(registry.len(), 2);
    assert_eq!(y.loads(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_background_refresh_never_blocks_readers() {
    init_tracing();
    let registry = lru(4, Duration::ZERO, RefreshMode::OnAccess);
    let gate = Arc::new(Semaphore::new(1));
    let loader = CountingLoader::gated("a.yml.j2", "old", gate.clone());

    let original = registry.get_template(loader.clone(), true).await.unwrap();
    loader.update("new", 2);

    // this hit spawns a refresh that stalls on the gate
    let served = registry.get_template(loader.clone(), true).await.unwrap();
    assert!(Arc::ptr_eq(&original, &served));
    eventually(|| loader.loads() == 2).await;
    assert!(registry.is_refreshing(loader.identity()));

    for _ in 0..5 {
        let served = tokio::time::timeout(
            Duration::from_secs(1),
            registry.get_template(loader.clone(), true),
        )
        .await
        .expect("reader blocked behind refresh")
        .unwrap();
        assert!(Arc::ptr_eq(&original, &served));
    }
    // at most one refresh in flight
    assert_eq!(loader.loads(), 2);

    gate.add_permits(1);
    eventually(|| {
        registry
            .entry_info(loader.identity())
            .is_some_and(|info| info.version == Some(VersionToken::Generation(2)))
    })
    .await;

    let refreshed = registry.get_template(loader.clone(), true).await.unwrap();
    assert_eq!(refreshed.render(json!({})).unwrap(), "new");
    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_refresh_keeps_stale_value() {
    init_tracing();
    let registry = lru(4, Duration::ZERO, RefreshMode::OnAccess);
    let loader = CountingLoader::new("a.yml.j2", "stale");

    let original = registry.get_template(loader.clone(), true).await.unwrap();
    assert_eq!(registry.refresh_failures(loader.identity()), 0);

    loader.set_failing(true);
    let served = registry.get_template(loader.clone(), true).await.unwrap();
    assert!(Arc::ptr_eq(&original, &served));
    eventually(|| {
        registry.refresh_failures(loader.identity()) == 1 && !registry.is_refreshing(loader.identity())
    })
    .await;

    // readers keep getting the last good value
    let served = registry.get_template(loader.clone(), true).await.unwrap();
    assert_eq!(served.render(json!({})).unwrap(), "stale");

    eventually(|| !registry.is_refreshing(loader.identity())).await;
    loader.set_failing(false);
    loader.update("fresh", 2);
    registry.get_template(loader.clone(), true).await.unwrap();
    eventually(|| {
        registry.refresh_failures(loader.identity()) == 0
            && registry
                .entry_info(loader.identity())
                .is_some_and(|info| info.version == Some(VersionToken::Generation(2)))
    })
    .await;

    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failure_after_eviction_is_not_counted() {
    init_tracing();
    let registry = lru(1, Duration::ZERO, RefreshMode::OnAccess);
    let gate = Arc::new(Semaphore::new(1));
    let a = CountingLoader::gated("a.yml.j2", "a", gate.clone());
    let b = CountingLoader::new("b.yml.j2", "b");

    registry.get_template(a.clone(), true).await.unwrap();
    a.update("a2", 2);
    a.set_failing_loads(true);

    // the refresh blocks inside its load while `b` pushes `a` out
    registry.get_template(a.clone(), true).await.unwrap();
    eventually(|| a.loads() == 2).await;
    registry.get_template(b.clone(), true).await.unwrap();
    assert!(!registry.contains(a.identity()));

    gate.add_permits(1);
    eventually(|| !registry.is_refreshing(a.identity())).await;
    assert_eq!(registry.refresh_failures(a.identity()), 0);
    assert!(!registry.contains(a.identity()));

    registry.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let never_started = lru(4, Duration::from_secs(1), RefreshMode::OnAccess);
    never_started.shutdown().await;
    never_started.shutdown().await;
    assert!(never_started.is_shut_down());

    let polling = lru(
        4,
        Duration::from_secs(1),
        RefreshMode::Poll {
            interval: Duration::from_secs(3600),
        },
    );
    let loader = CountingLoader::new("a.yml.j2", "a");
    polling.get_template(loader.clone(), true).await.unwrap();
    polling.shutdown().await;
    polling.shutdown().await;

    // a fresh registry is unaffected
    let fresh = lru(4, Duration::from_secs(1), RefreshMode::OnAccess);
    assert!(!fresh.is_shut_down());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_background_work_after_shutdown() {
    let registry = lru(4, Duration::ZERO, RefreshMode::OnAccess);
    let loader = CountingLoader::new("a.yml.j2", "a");
    registry.get_template(loader.clone(), true).await.unwrap();
    registry.shutdown().await;

    loader.update("b", 2);
    let served = registry.get_template(loader.clone(), true).await.unwrap();
    assert_eq!(served.render(json!({})).unwrap(), "a");
    assert!(!registry.is_refreshing(loader.identity()));
    assert!(!registry.start_refresher(Duration::from_secs(1)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(loader.loads(), 1);
    assert_eq!(loader.version_checks(), 0);

    // foreground lookups still work
    let other = CountingLoader::new("b.yml.j2", "b");
    registry.get_template(other.clone(), true).await.unwrap();
    assert_eq!(other.loads(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_poll_refresher_keeps_warm_templates_fresh() {
    init_tracing();
    let registry = lru(
        4,
        Duration::from_secs(5),
        RefreshMode::Poll {
            interval: Duration::from_secs(10),
        },
    );
    let loader = CountingLoader::new("a.yml.j2", "v1");
    registry.get_template(loader.clone(), true).await.unwrap();

    let warmed = CountingLoader::new("b.yml.j2", "b");
    registry.keep_warm(warmed.clone());
    assert!(!registry.contains(warmed.identity()));

    loader.update("v2", 2);
    tokio::time::sleep(Duration::from_secs(11)).await;

    let info = registry.entry_info(loader.identity()).unwrap();
    assert_eq!(info.version, Some(VersionToken::Generation(2)));
    assert!(registry.contains(warmed.identity()));

    // unchanged sources are only revalidated
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(loader.loads(), 2);
    assert!(loader.version_checks() >= 2);

    let served = registry.get_template(loader.clone(), true).await.unwrap();
    assert_eq!(served.render(json!({})).unwrap(), "v2");
    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_zero_poll_interval_still_refreshes() {
    init_tracing();
    let registry = lru(
        4,
        Duration::from_secs(60),
        RefreshMode::Poll {
            interval: Duration::ZERO,
        },
    );
    assert_eq!(
        registry.policy(),
        CachePolicy::LruBackground {
            capacity: 4,
            ttl: Duration::from_secs(60),
            refresh: RefreshMode::Poll {
                interval: MIN_POLL_INTERVAL,
            },
        }
    );

    let loader = CountingLoader::new("a.yml.j2", "v1");
    registry.get_template(loader.clone(), true).await.unwrap();
    loader.update("v2", 2);
    eventually(|| {
        registry
            .entry_info(loader.identity())
            .is_some_and(|info| info.version == Some(VersionToken::Generation(2)))
    })
    .await;
    registry.shutdown().await;

    let on_access = lru(4, Duration::from_secs(60), RefreshMode::OnAccess);
    let warmed = CountingLoader::new("b.yml.j2", "b");
    on_access.keep_warm(warmed.clone());
    assert!(on_access.start_refresher(Duration::ZERO));
    eventually(|| on_access.contains(warmed.identity())).await;
    on_access.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reset_discards_poll_in_flight() {
    init_tracing();
    let registry = lru(
        4,
        Duration::from_secs(60),
        RefreshMode::Poll {
            interval: Duration::from_millis(20),
        },
    );
    let gate = Arc::new(Semaphore::new(0));
    let loader = CountingLoader::gated("a.yml.j2", "a", gate.clone());
    registry.keep_warm(loader.clone());
    assert!(registry.start_refresher(Duration::from_millis(20)));

    eventually(|| loader.loads() == 1 && registry.is_refreshing(loader.identity())).await;
    registry.reset();
    gate.add_permits(1);

    eventually(|| !registry.is_refreshing(loader.identity())).await;
    assert_eq!(registry.len(), 0);
    assert!(!registry.contains(loader.identity()));

    // the warm set went away with the reset
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(loader.loads(), 1);
    assert!(registry.is_empty());
    registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_ttl_lazy_revalidates_before_reloading() {
    let registry = ttl_lazy(4, Duration::from_secs(30));
    let loader = CountingLoader::new("a.yml.j2", "one");

    let first = registry.get_template(loader.clone(), true).await.unwrap();
    let hit = registry.get_template(loader.clone(), true).await.unwrap();
    assert!(Arc::ptr_eq(&first, &hit));
    assert_eq!(loader.version_checks(), 0);

    tokio::time::advance(Duration::from_secs(31)).await;
    let revalidated = registry.get_template(loader.clone(), true).await.unwrap();
    assert!(Arc::ptr_eq(&first, &revalidated));
    assert_eq!(loader.version_checks(), 1);
    assert_eq!(loader.loads(), 1);

    loader.update("two", 2);
    tokio::time::advance(Duration::from_secs(31)).await;
    let reloaded = registry.get_template(loader.clone(), true).await.unwrap();
    assert_eq!(loader.loads(), 2);
    assert_eq!(reloaded.render(json!({})).unwrap(), "two");
}

#[tokio::test(start_paused = true)]
async fn test_ttl_lazy_propagates_errors() {
    let registry = ttl_lazy(4, Duration::from_secs(30));
    let loader = CountingLoader::new("a.yml.j2", "one");
    registry.get_template(loader.clone(), true).await.unwrap();

    loader.set_failing(true);
    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(registry.get_template(loader.clone(), true).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_ttl_entries_lapse() {
    let registry = ttl_lazy(10, Duration::from_secs(30));
    let a = CountingLoader::new("a.yml.j2", "a");
    let b = CountingLoader::new("b.yml.j2", "b");

    registry.get_template(a.clone(), true).await.unwrap();
    tokio::time::advance(Duration::from_secs(31)).await;
    registry.get_template(b.clone(), true).await.unwrap();

    assert!(!registry.contains(a.identity()));
    assert!(registry.contains(b.identity()));
}

#[tokio::test(start_paused = true)]
async fn test_lapsed_entries_are_not_reported() {
    let registry = ttl_lazy(10, Duration::from_secs(30));
    let a = CountingLoader::new("a.yml.j2", "a");

    registry.get_template(a.clone(), true).await.unwrap();
    assert!(registry.entry_info(a.identity()).is_some());

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(!registry.contains(a.identity()));
    assert_eq!(registry.len(), 0);
    assert!(registry.entry_info(a.identity()).is_none());

    registry.get_template(a.clone(), true).await.unwrap();
    assert_eq!(a.loads(), 2);
}

#[tokio::test]
async fn test_zero_capacity_policy() {
    let policy = CachePolicy::TtlLazy {
        capacity: 0,
        ttl: Duration::from_secs(30),
    };
    let err = Registry::try_new(policy).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { .. }));
    assert!(
        Registry::try_new(CachePolicy::LruBackground {
            capacity: 4,
            ttl: Duration::from_secs(30),
            refresh: RefreshMode::Poll {
                interval: Duration::ZERO,
            },
        })
        .is_err()
    );
    assert!(Registry::try_new(CachePolicy::NoCache).is_ok());

    // the infallible constructor keeps room for one entry
    let registry = Registry::new(policy);
    assert_eq!(registry.policy().capacity(), 1);
    let a = CountingLoader::new("a.yml.j2", "a");
    let b = CountingLoader::new("b.yml.j2", "b");
    registry.get_template(a.clone(), true).await.unwrap();
    registry.get_template(b.clone(), true).await.unwrap();
    assert_eq!(registry.len(), 1);
    assert!(registry.contains(b.identity()));
}

#[tokio::test]
async fn test_invalidate_and_reset() {
    let registry = ttl_lazy(4, Duration::from_secs(30));
    let a = CountingLoader::new("a.yml.j2", "a");
    let b = CountingLoader::new("b.yml.j2", "b");

    registry.get_template(a.clone(), true).await.unwrap();
    registry.get_template(b.clone(), true).await.unwrap();
    assert_eq!(registry.len(), 2);

    assert!(registry.invalidate(a.identity()));
    assert!(!registry.invalidate(a.identity()));
    assert!(!registry.contains(a.identity()));
    assert!(registry.entry_info(a.identity()).is_none());

    registry.get_template(a.clone(), true).await.unwrap();
    assert_eq!(a.loads(), 2);

    registry.reset();
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_clones_share_state() {
    let registry = ttl_lazy(4, Duration::from_secs(30));
    let handle = registry.clone();
    let loader = CountingLoader::new("a.yml.j2", "a");

    registry.get_template(loader.clone(), true).await.unwrap();
    handle.get_template(loader.clone(), true).await.unwrap();
    assert_eq!(loader.loads(), 1);
    assert!(handle.contains(loader.identity()));
}

#[tokio::test]
async fn test_open_facade() {
    let registry = lru(4, Duration::from_secs(60), RefreshMode::OnAccess);
    let loader = CountingLoader::new("greeting.yml.j2", "Hello {{ name }}");

    let mut template = registry
        .open(TemplateSource::Loader(loader.clone()), true)
        .await
        .unwrap();
    assert_eq!(
        template.id().map(|id| id.to_string()),
        Some("test://suite/templates/greeting.yml.j2".to_string())
    );
    assert_eq!(template.render(json!({ "name": "Ada" })).unwrap(), "Hello Ada");
    assert_eq!(template.rendered(), Some("Hello Ada"));

    let raw = registry
        .open(TemplateSource::Raw("{{ 1 + 1 }}".into()), true)
        .await
        .unwrap();
    assert!(raw.rendered().is_none());
    assert_eq!(registry.len(), 1);
    assert_eq!(loader.loads(), 1);
}

#[tokio::test]
async fn test_load_errors_reach_the_caller() {
    let registry = lru(4, Duration::from_secs(60), RefreshMode::OnAccess);
    let broken = CountingLoader::new("broken.yml.j2", "{{ oops ");
    let err = registry.get_template(broken.clone(), true).await.unwrap_err();
    assert!(err.is_syntax(), "unexpected error: {err}");
    assert!(!registry.contains(broken.identity()));
}
