//! Integration tests for the Redis provider.
//!
//! Tests use testcontainers to spin up a real Redis instance.

mod support;

use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::redis;
use support::{
    ApiClient, FixedTtls, PrefixedNames, User, raw_connection, redis_provider, unique_prefix,
};
use tiercache::key::is_tombstone;
use tiercache::{
    CacheError, CacheableItem, Key, Manager, Provider, RateLimitKey, RateLimitableItem,
    RedisProvider, SentinelType, SetOutcome,
};
use tokio_util::sync::CancellationToken;

const TTL: Duration = Duration::from_secs(60);

fn key(prefix: &str, name: &str) -> Key {
    Key::new(format!("{prefix}{name}"))
}

async fn store(cache: &RedisProvider, k: &Key, value: &str, ttl: Duration) {
    let sentinel = cache
        .write_sentinel(SentinelType::Create, std::slice::from_ref(k))
        .await
        .unwrap();
    let outcome = cache
        .set_value(k, std::slice::from_ref(k), value, &sentinel, ttl)
        .await
        .unwrap();
    assert!(outcome.set);
}

async fn pttl(k: &str) -> i64 {
    let mut conn = raw_connection().await;
    redis::cmd("PTTL").arg(k).query_async(&mut conn).await.unwrap()
}

/// Slots held by `buckets`, without taking one.
async fn slots(cache: &RedisProvider, buckets: &[RateLimitKey]) -> i64 {
    cache
        .reserve_rate_limit_slot(buckets, i64::MAX, TTL, false)
        .await
        .unwrap()
        .total_slots
}

#[tokio::test]
async fn test_lock_set_and_read() {
    let prefix = unique_prefix();
    let cache = redis_provider(&prefix, false).await;
    let primary = key(&prefix, "item_1");
    let secondary = key(&prefix, "item_name_one");

    let sentinel = cache
        .write_sentinel(SentinelType::Create, &[primary.clone(), secondary.clone()])
        .await
        .unwrap();
    assert!(!sentinel.is_no_lock());

    let outcome = cache
        .set_value(&primary, &[primary.clone(), secondary.clone()], "v1", &sentinel, TTL)
        .await
        .unwrap();
    assert_eq!(outcome, SetOutcome::SET);

    for k in [&primary, &secondary] {
        let lookup = cache.get_value(k, false).await.unwrap();
        assert_eq!(lookup.value.as_deref(), Some("v1"));
    }

    // The sentinel was consumed, a second write with it is not accepted.
    let again = cache
        .set_value(&primary, std::slice::from_ref(&primary), "v2", &sentinel, TTL)
        .await
        .unwrap();
    assert!(!again.set);
    let lookup = cache.get_value(&primary, false).await.unwrap();
    assert_eq!(lookup.value.as_deref(), Some("v1"));
}

#[tokio::test]
async fn test_read_lock_granted_once() {
    let prefix = unique_prefix();
    let cache = redis_provider(&prefix, false).await;
    let k = key(&prefix, "item_1");

    let first = cache.get_value(&k, true).await.unwrap();
    assert!(!first.is_hit());
    assert!(!first.sentinel.is_no_lock());

    let second = cache.get_value(&k, true).await.unwrap();
    assert!(second.sentinel.is_no_lock());
    assert_eq!(second.conflict.as_deref(), Some(first.sentinel.as_str()));

    let outcome = cache
        .set_value(&k, std::slice::from_ref(&k), "loaded", &first.sentinel, TTL)
        .await
        .unwrap();
    assert!(outcome.set);
}

#[tokio::test]
async fn test_multi_get_duplicates_and_locks() {
    let prefix = unique_prefix();
    let cache = redis_provider(&prefix, false).await;
    let a = key(&prefix, "a");
    let b = key(&prefix, "b");

    let lookups = cache
        .get_values(&[a.clone(), b.clone(), a.clone()], &[true, true, true])
        .await
        .unwrap();
    assert_eq!(lookups.len(), 3);
    assert_eq!(lookups[0], lookups[2]);
    assert!(!lookups[0].sentinel.is_no_lock());
    assert_eq!(lookups[0].sentinel, lookups[1].sentinel);

    let err = cache.get_values(&[a, b], &[true]).await.unwrap_err();
    assert!(matches!(err, CacheError::InvalidArgument { .. }));
}

#[tokio::test]
async fn test_release_requires_exact_sentinel() {
    let prefix = unique_prefix();
    let cache = redis_provider(&prefix, false).await;
    let k = key(&prefix, "item_1");

    let sentinel = cache
        .write_sentinel(SentinelType::Update, std::slice::from_ref(&k))
        .await
        .unwrap();
    let other = cache.get_value(&key(&prefix, "other"), true).await.unwrap();
    cache
        .release_sentinel(std::slice::from_ref(&k), &other.sentinel)
        .await;
    let held = cache.get_value(&k, false).await.unwrap();
    assert_eq!(held.conflict.as_deref(), Some(sentinel.as_str()));

    cache.release_sentinel(std::slice::from_ref(&k), &sentinel).await;
    assert_eq!(cache.get_value(&k, false).await.unwrap(), Default::default());
}

#[tokio::test]
async fn test_delete_respects_sentinels_unless_forced() {
    let prefix = unique_prefix();
    let cache = redis_provider(&prefix, false).await;
    let k = key(&prefix, "item_1");

    let lock = cache.get_value(&k, true).await.unwrap();
    cache
        .delete_value(std::slice::from_ref(&k), false, false)
        .await
        .unwrap();
    let held = cache.get_value(&k, false).await.unwrap();
    assert_eq!(held.conflict.as_deref(), Some(lock.sentinel.as_str()));

    cache
        .delete_value(std::slice::from_ref(&k), true, true)
        .await
        .unwrap();
    let tombstoned = cache.get_value(&k, true).await.unwrap();
    assert!(is_tombstone(tombstoned.conflict.as_deref().unwrap()));
    assert!(tombstoned.sentinel.is_no_lock());
}

#[tokio::test]
async fn test_dependencies() {
    let prefix = unique_prefix();
    let cache = redis_provider(&prefix, false).await;
    let deps = key(&prefix, "user_deps_1");
    let collection = key(&prefix, "user_col_1");

    let lock = cache.get_value(&collection, true).await.unwrap();
    cache
        .add_dependency(
            std::slice::from_ref(&deps),
            &[collection.clone(), collection.clone()],
            TTL,
        )
        .await
        .unwrap();
    cache
        .set_value(&collection, std::slice::from_ref(&collection), "[]", &lock.sentinel, TTL)
        .await
        .unwrap();
    assert!(cache.get_value(&collection, false).await.unwrap().is_hit());

    cache.clear_dependencies(&deps, true).await.unwrap();
    assert!(!cache.get_value(&collection, false).await.unwrap().is_hit());

    let err = cache
        .add_dependency(std::slice::from_ref(&deps), std::slice::from_ref(&collection), TTL)
        .await
        .unwrap_err();
    assert!(err.is_tombstoned_dependency());

    // Clearing a tombstoned key is a no-op either way.
    cache.clear_dependencies(&deps, false).await.unwrap();
    cache.clear_dependencies(&deps, true).await.unwrap();
    let still = cache.get_value(&deps, false).await.unwrap();
    assert!(is_tombstone(still.conflict.as_deref().unwrap()));
}

#[tokio::test]
async fn test_zero_ttl_uses_default() {
    let prefix = unique_prefix();
    let cache = redis_provider(&prefix, false).await;
    let deps = key(&prefix, "user_deps_zero");
    let member = key(&prefix, "user_zero");

    store(&cache, &member, "v", Duration::ZERO).await;
    cache
        .add_dependency(
            std::slice::from_ref(&deps),
            std::slice::from_ref(&member),
            Duration::ZERO,
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let lookup = cache.get_value(&member, false).await.unwrap();
    assert_eq!(lookup.value.as_deref(), Some("v"));
    assert!(pttl(deps.as_str()).await > 1_000);

    cache.clear_dependencies(&deps, false).await.unwrap();
    assert_eq!(cache.get_value(&member, false).await.unwrap(), Default::default());
}

#[tokio::test]
async fn test_dependency_replaces_plain_value() {
    let prefix = unique_prefix();
    let cache = redis_provider(&prefix, false).await;
    let deps = key(&prefix, "user_deps_stray");
    let member = key(&prefix, "user_stray");
    store(&cache, &deps, "stray", TTL).await;
    store(&cache, &member, "m", TTL).await;

    cache
        .add_dependency(std::slice::from_ref(&deps), std::slice::from_ref(&member), TTL)
        .await
        .unwrap();
    cache.clear_dependencies(&deps, false).await.unwrap();
    assert_eq!(cache.get_value(&member, false).await.unwrap(), Default::default());
}

#[tokio::test]
async fn test_delete_sentinel_overwrites_tombstoned_secondary() {
    let prefix = unique_prefix();
    let cache = redis_provider(&prefix, false).await;
    let primary = key(&prefix, "user_3");
    let secondary = key(&prefix, "user_email_3");
    cache
        .delete_value(std::slice::from_ref(&secondary), true, true)
        .await
        .unwrap();

    let write = cache
        .write_sentinel(SentinelType::Update, &[primary.clone(), secondary.clone()])
        .await
        .unwrap();
    assert!(!write.is_no_lock());
    let lookup = cache.get_value(&secondary, false).await.unwrap();
    assert!(is_tombstone(lookup.conflict.as_deref().unwrap()));

    let delete = cache
        .write_sentinel(SentinelType::Delete, &[primary.clone(), secondary.clone()])
        .await
        .unwrap();
    for k in [&primary, &secondary] {
        let lookup = cache.get_value(k, false).await.unwrap();
        assert_eq!(lookup.conflict.as_deref(), Some(delete.as_str()));
    }
}

#[tokio::test]
async fn test_flush_keeps_tombstones() {
    let prefix = unique_prefix();
    let cache = redis_provider(&prefix, false).await;
    let live = key(&prefix, "live");
    let dead = key(&prefix, "dead");

    let sentinel = cache
        .write_sentinel(SentinelType::Create, std::slice::from_ref(&live))
        .await
        .unwrap();
    cache
        .set_value(&live, std::slice::from_ref(&live), "v", &sentinel, TTL)
        .await
        .unwrap();
    cache
        .delete_value(std::slice::from_ref(&dead), true, true)
        .await
        .unwrap();

    cache.flush(&prefix, false).await.unwrap();
    assert_eq!(cache.get_value(&live, false).await.unwrap(), Default::default());
    let tombstone = cache.get_value(&dead, false).await.unwrap();
    assert!(is_tombstone(tombstone.conflict.as_deref().unwrap()));

    cache.flush(&prefix, true).await.unwrap();
    assert_eq!(cache.get_value(&dead, false).await.unwrap(), Default::default());
}

#[tokio::test]
async fn test_key_prefix_enforced() {
    let prefix = unique_prefix();
    let cache = redis_provider(&prefix, false).await;
    let err = cache
        .get_value(&Key::from("foreign_key"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::KeyPrefix { .. }));
}

#[tokio::test]
async fn test_read_only_never_modifies() {
    let prefix = unique_prefix();
    let writer = redis_provider(&prefix, false).await;
    let reader = redis_provider(&prefix, true).await;
    let k = key(&prefix, "item_1");
    let missing = key(&prefix, "item_2");

    let sentinel = writer
        .write_sentinel(SentinelType::Create, std::slice::from_ref(&k))
        .await
        .unwrap();
    writer
        .set_value(&k, std::slice::from_ref(&k), "v", &sentinel, TTL)
        .await
        .unwrap();

    assert_eq!(
        reader.get_value(&k, false).await.unwrap().value.as_deref(),
        Some("v")
    );
    assert!(reader.get_value(&missing, true).await.unwrap().sentinel.is_no_lock());
    assert!(
        reader
            .write_sentinel(SentinelType::Update, std::slice::from_ref(&k))
            .await
            .unwrap()
            .is_no_lock()
    );
    reader
        .delete_value(std::slice::from_ref(&k), true, true)
        .await
        .unwrap();
    reader.flush(&prefix, true).await.unwrap();

    assert_eq!(
        writer.get_value(&k, false).await.unwrap().value.as_deref(),
        Some("v")
    );
    assert_eq!(writer.get_value(&missing, false).await.unwrap(), Default::default());
}

fn manager(prefix: &str, provider: Arc<dyn Provider>) -> Manager {
    Manager::new(
        provider,
        Arc::new(PrefixedNames(prefix.to_string())),
        Arc::new(FixedTtls(TTL)),
    )
}

#[tokio::test]
async fn test_manager_item_lifecycle() {
    let prefix = unique_prefix();
    let manager = manager(&prefix, redis_provider(&prefix, false).await);
    let user = User::new("ada@example.com");
    let names = manager.names();

    let lock = manager
        .take_item_lock(SentinelType::Create, &user)
        .await
        .unwrap();
    manager.save_item_to_cache(&user, &lock, true, &[]).await;

    let by_email = manager
        .get_item_from_cache::<User>(&user.secondary_keys(names)[0], false)
        .await
        .unwrap();
    assert_eq!(by_email.item.as_ref(), Some(&user));

    let lock = manager
        .take_item_lock(SentinelType::Delete, &user)
        .await
        .unwrap();
    manager.delete_item_from_cache(&user, &lock).await;

    let gone = manager
        .get_item_from_cache::<User>(&user.primary_key(names), true)
        .await
        .unwrap();
    assert!(gone.item.is_none());
    assert!(gone.sentinel.is_no_lock());
    assert!(is_tombstone(gone.conflict.as_deref().unwrap()));
}

#[tokio::test]
async fn test_rate_limit_buckets() {
    let prefix = unique_prefix();
    let manager = manager(&prefix, redis_provider(&prefix, false).await);
    let client = ApiClient {
        id: "c1".into(),
        limit: 2,
    };

    let first = manager.reserve_rate_limit_slot(&client, true).await.unwrap();
    assert!(first.reserved);
    assert_eq!(first.total_slots, 1);
    let second = manager.reserve_rate_limit_slot(&client, true).await.unwrap();
    assert!(second.reserved);
    assert_eq!(second.total_slots, 2);

    let full = manager.reserve_rate_limit_slot(&client, true).await.unwrap();
    assert!(!full.reserved);
    assert_eq!(full.total_slots, 2);

    // Evaluating never takes a slot.
    let evaluated = manager.reserve_rate_limit_slot(&client, false).await.unwrap();
    assert!(!evaluated.reserved);

    assert_eq!(manager.release_rate_limit_slot(&client).await.unwrap(), 1);
    let evaluated = manager.reserve_rate_limit_slot(&client, false).await.unwrap();
    assert!(evaluated.reserved);
    assert_eq!(evaluated.total_slots, 1);
}

#[tokio::test]
async fn test_rate_limit_release_drains_oldest_bucket() {
    let prefix = unique_prefix();
    let cache = redis_provider(&prefix, false).await;
    let manager = manager(&prefix, cache.clone());
    let client = ApiClient {
        id: "c2".into(),
        limit: 3,
    };
    let buckets = client.rate_limit_keys(manager.names());
    let (prev, curr) = (&buckets[..1], &buckets[1..]);

    // One slot left over from the previous window.
    assert!(cache.reserve_rate_limit_slot(prev, 3, TTL, true).await.unwrap().reserved);

    let reserved = manager.reserve_rate_limit_slot(&client, true).await.unwrap();
    assert!(reserved.reserved);
    assert_eq!(reserved.total_slots, 2);
    assert_eq!(slots(&cache, prev).await, 1);
    assert_eq!(slots(&cache, curr).await, 1);

    assert_eq!(manager.release_rate_limit_slot(&client).await.unwrap(), 1);
    assert_eq!(slots(&cache, prev).await, 0);
    assert_eq!(slots(&cache, curr).await, 1);

    assert_eq!(manager.release_rate_limit_slot(&client).await.unwrap(), 0);
    assert_eq!(slots(&cache, curr).await, 0);
    assert_eq!(manager.release_rate_limit_slot(&client).await.unwrap(), 0);
}

#[tokio::test]
async fn test_rate_limit_bucket_ttl_set_once() {
    let prefix = unique_prefix();
    let cache = redis_provider(&prefix, false).await;
    let bucket = [RateLimitKey::new(format!("{prefix}rl_bucket"))];

    for ttl in [Duration::from_secs(60), Duration::from_secs(5)] {
        let reservation = cache
            .reserve_rate_limit_slot(&bucket, 10, ttl, true)
            .await
            .unwrap();
        assert!(reservation.reserved);
    }
    assert_eq!(slots(&cache, &bucket).await, 2);
    let remaining = pttl(bucket[0].as_str()).await;
    assert!(remaining > 5_000, "bucket TTL was reset to {remaining}ms");
}

#[tokio::test]
async fn test_rate_limit_key_prefix_enforced() {
    let prefix = unique_prefix();
    let cache = redis_provider(&prefix, false).await;
    let foreign = [RateLimitKey::from("foreign_bucket")];
    assert!(matches!(
        cache.reserve_rate_limit_slot(&foreign, 1, TTL, true).await,
        Err(CacheError::KeyPrefix { .. })
    ));
    assert!(matches!(
        cache.release_rate_limit_slot(&foreign).await,
        Err(CacheError::KeyPrefix { .. })
    ));
}

#[tokio::test]
async fn test_wait_for_rate_limit_slot() {
    let prefix = unique_prefix();
    let manager = manager(&prefix, redis_provider(&prefix, false).await);
    let client = ApiClient {
        id: "c1".into(),
        limit: 1,
    };
    assert!(manager.reserve_rate_limit_slot(&client, true).await.unwrap().reserved);

    let cancel = CancellationToken::new();
    let releaser = {
        let manager = manager.clone();
        let client = ApiClient {
            id: "c1".into(),
            limit: 1,
        };
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            manager.release_rate_limit_slot(&client).await.unwrap()
        })
    };

    let total = manager
        .wait_for_rate_limit_slot(&client, |_| Duration::from_millis(50), &cancel)
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(releaser.await.unwrap(), 0);

    // Full again, cancellation ends the wait.
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });
    let err = manager
        .wait_for_rate_limit_slot(&client, |_| Duration::from_secs(5), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Cancelled));
}
