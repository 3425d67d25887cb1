//! Integration tests against a real Redis instance.
//!
//! A single container is started on first use and shared by every test;
//! each test writes under its own namespace so they can run concurrently.

use serde_json::json;
use std::time::Duration;
use suitedash_cache::{
    CacheContext, CacheSettings, EntityKind, EntryOptions, HealthStatus, KeyTtl, ListQuery,
    RedisConfig, create_store_client,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

async fn settings(namespace: &str) -> CacheSettings {
    CacheSettings {
        redis: RedisConfig {
            enabled: true,
            url: get_redis_url().await,
            pool_size: 5,
            timeout_ms: 5000,
        },
        namespace: namespace.to_string(),
        ..CacheSettings::default()
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_store_connection() {
    let store = create_store_client(&settings("it-conn").await).await;

    assert!(store.is_redis());
    assert_eq!(store.backend_name(), "redis");
    assert!(store.ping().await);
    assert!(store.memory_usage().await.is_some());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_get_set_and_ttl() {
    let store = create_store_client(&settings("it-getset").await).await;
    let suite = json!({"id": 42, "name": "Login Tests"});

    assert!(store.set("suite:42", &suite, Some(120)).await);
    assert_eq!(store.get::<serde_json::Value>("suite:42").await, Some(suite));

    match store.ttl("suite:42").await {
        KeyTtl::Expires(left) => assert!(left <= Duration::from_secs(120)),
        other => panic!("unexpected ttl: {other:?}"),
    }
    assert_eq!(store.delete("suite:42").await, 1);
    assert_eq!(store.delete("suite:42").await, 0);
    assert!(store.get::<serde_json::Value>("suite:42").await.is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_undecodable_entry_is_evicted() {
    let store = create_store_client(&settings("it-decode").await).await;

    assert!(store.set("suite:7", "not a number", None).await);
    assert!(store.get::<u64>("suite:7").await.is_none());
    assert!(!store.exists("suite:7").await);
    assert_eq!(store.stats().errors, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_huge_ttl_keeps_index_sets() {
    let ctx = CacheContext::start(&settings("it-hugettl").await).await;

    assert!(
        ctx.tagged
            .set("suite", 1, &1u8, &EntryOptions::new().ttl(u64::MAX).tag("project:1"))
            .await
    );
    assert_eq!(ctx.tagged.tag_members("project:1").await.len(), 1);
    assert_eq!(ctx.tagged.invalidate_by_tag("project:1").await, 1);
    ctx.shutdown();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_pattern_delete_stays_in_namespace() {
    let mine = create_store_client(&settings("it-pattern-a").await).await;
    let other = create_store_client(&settings("it-pattern-b").await).await;

    for skip in 0..5 {
        let key = format!("suites:list:skip:{skip}:limit:10");
        mine.set(&key, &skip, None).await;
        other.set(&key, &skip, None).await;
    }

    assert_eq!(mine.delete_by_pattern("suites:list:*").await, 5);
    assert!(
        other
            .exists("suites:list:skip:0:limit:10")
            .await
    );
    assert_eq!(other.flush().await, 5);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_manager_invalidate_entity() {
    let ctx = CacheContext::start(&settings("it-manager").await).await;
    let query = ListQuery::new(0, 25).filter("project_id", 1);

    ctx.manager.set_entity(EntityKind::Suite, 42, &"suite").await;
    ctx.manager.set_list(EntityKind::Suite, &query, &vec![42]).await;

    assert_eq!(ctx.manager.invalidate_entity(EntityKind::Suite, 42).await, 2);
    assert!(
        ctx.manager
            .get_list::<Vec<u32>>(EntityKind::Suite, &query)
            .await
            .is_none()
    );
    ctx.shutdown();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_tags_and_dependencies() {
    let ctx = CacheContext::start(&settings("it-tagged").await).await;
    let cache = &ctx.tagged;

    let suite_key = suitedash_cache::TaggedCache::key("suite", 42);
    cache
        .set(
            "suite",
            42,
            &json!({"name": "Login Tests"}),
            &EntryOptions::new().tag("project:1"),
        )
        .await;
    cache
        .set(
            "test_case",
            7,
            &json!({"suite_id": 42}),
            &EntryOptions::new().tag("project:1").depends_on(suite_key.clone()),
        )
        .await;

    assert_eq!(cache.dependents_of(&suite_key).await.len(), 1);
    assert_eq!(cache.invalidate_dependent("suite", 42).await, 1);
    assert!(cache.get::<serde_json::Value>("test_case", 7).await.is_none());

    assert_eq!(cache.invalidate_by_tag("project:1").await, 1);
    assert!(cache.get::<serde_json::Value>("suite", 42).await.is_none());
    assert!(cache.tag_members("project:1").await.is_empty());
    ctx.shutdown();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_blocking_client_shares_state() {
    let store = create_store_client(&settings("it-blocking").await).await;
    store.set("dashboard:stats", &json!({"runs": 12}), None).await;

    let blocking = store.blocking();
    let value = tokio::task::spawn_blocking(move || {
        let value = blocking.get::<serde_json::Value>("dashboard:stats");
        blocking.set("dashboard:recent_runs", &vec![1, 2, 3], Some(60));
        value
    })
    .await
    .unwrap();

    assert_eq!(value, Some(json!({"runs": 12})));
    assert_eq!(
        store.get::<Vec<u32>>("dashboard:recent_runs").await,
        Some(vec![1, 2, 3])
    );
    assert_eq!(store.stats().hits, 2);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_health_check() {
    let ctx = CacheContext::start(&settings("it-health").await).await;
    let report = ctx.tagged.health_check().await;

    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.backend, "redis");
    assert!(report.store_reachable);
    assert!(report.stats.memory.is_some());
}
