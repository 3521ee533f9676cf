//! Live tests against a running Redis.
//!
//! - Marked `#[ignore]`; run with `STUDIO_CACHE_TEST_REDIS_URL` set.
//! - Every key lives under a per-run prefix and is removed at the end.
#![cfg(feature = "redis")]

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use studio_cache::cache::{Cache, CacheConfig, CachePurpose, KvStore, WrapOptions};
use studio_cache::config::RedisSettings;
use studio_cache::infra::redis::RedisStore;
use uuid::Uuid;

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

fn live_store() -> TestResult<Arc<RedisStore>> {
    let url = std::env::var("STUDIO_CACHE_TEST_REDIS_URL")?;
    let settings = RedisSettings {
        url: Some(url),
        pool_size: NonZeroU32::new(8).ok_or("pool size")?,
        timeout: Duration::from_secs(2),
    };
    Ok(Arc::new(RedisStore::connect(&settings)?))
}

fn run_prefix() -> String {
    format!("studio-test-{}", Uuid::new_v4().simple())
}

#[tokio::test]
#[ignore]
async fn live_set_nx_is_exclusive() -> TestResult<()> {
    let store = live_store()?;
    let key = format!("{}:lock:exclusive", run_prefix());

    assert!(store.set_nx(&key, "a", Duration::from_secs(5)).await?);
    assert!(!store.set_nx(&key, "b", Duration::from_secs(5)).await?);
    assert_eq!(store.get(&key).await?.as_deref(), Some("a"));
    assert!(store.delete(&key).await?);
    assert!(!store.delete(&key).await?);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn live_delete_if_value_checks_the_token() -> TestResult<()> {
    let store = live_store()?;
    let key = format!("{}:lock:token", run_prefix());

    assert!(store.set_nx(&key, "owner", Duration::from_secs(5)).await?);
    assert!(!store.delete_if_value(&key, "intruder").await?);
    assert_eq!(store.get(&key).await?.as_deref(), Some("owner"));
    assert!(store.delete_if_value(&key, "owner").await?);
    assert!(!store.delete_if_value(&key, "owner").await?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn live_stampede_and_pattern_invalidation() -> TestResult<()> {
    let store = live_store()?;
    let prefix = run_prefix();
    let cache = Cache::new(
        store.clone(),
        CacheConfig {
            prefix: prefix.clone(),
            lock_retry_delay_ms: 20,
            ..Default::default()
        },
    );
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        let calls = calls.clone();
        handles.push(tokio::spawn(async move {
            cache
                .wrap(
                    "salons:list:global:{}",
                    move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(150)).await;
                        Ok::<_, String>(42u32)
                    },
                    Duration::from_secs(30),
                    WrapOptions::default(),
                )
                .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await??, 42);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    cache
        .set("salons:list:global:page-2", &7u32, Duration::from_secs(30))
        .await;
    cache
        .set("salon:detail:global:keep", &1u32, Duration::from_secs(30))
        .await;
    let removed = cache
        .del_by_pattern(&CachePurpose::SalonsList.pattern())
        .await;
    assert_eq!(removed, 2);
    assert_eq!(cache.get::<u32>("salon:detail:global:keep").await, Some(1));

    cache.del_by_pattern("*").await;
    cache.shutdown().await;
    Ok(())
}
