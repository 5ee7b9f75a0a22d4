//! Shared fixtures for the Redis integration tests.
//!
//! Tests share one Redis container and isolate themselves through a unique
//! key prefix (see [`unique_prefix`]).

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tiercache::config::RegionalRedisConfig;
use tiercache::provider::redis::RedisProviderOptions;
use tiercache::{
    CacheConfig, CacheableItem, ConnectionPools, Key, KeyNameProvider, RateLimitKey,
    RateLimitableItem, RedisProvider, TtlProvider, Validateable, WriteThroughSentinelManager,
};
use tokio::sync::OnceCell;
use uuid::Uuid;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, u16)> = OnceCell::const_new();

/// Starts a fresh Redis container, returning it with its mapped port.
pub async fn start_redis() -> (ContainerAsync<Redis>, u16) {
    let container = Redis::default()
        .start()
        .await
        .expect("start redis container");
    let port = container.get_host_port_ipv4(6379).await.expect("get port");
    (container, port)
}

/// Port of the shared Redis container.
pub async fn shared_redis_port() -> u16 {
    let (_, port) = SHARED_REDIS.get_or_init(start_redis).await;
    *port
}

pub fn regional_redis(region: &str, port: u16) -> RegionalRedisConfig {
    RegionalRedisConfig {
        host: "127.0.0.1".into(),
        port,
        region: region.into(),
        pool_size: 4,
        ..RegionalRedisConfig::default()
    }
}

/// Config for `region` with the given `(region, port)` Redis instances.
pub fn config_for(region: &str, redis: &[(&str, u16)]) -> CacheConfig {
    CacheConfig {
        region: region.into(),
        redis: redis
            .iter()
            .map(|(region, port)| regional_redis(region, *port))
            .collect(),
        ..CacheConfig::default()
    }
}

/// Single-region config pointing at the shared container.
pub async fn shared_config() -> CacheConfig {
    config_for("local", &[("local", shared_redis_port().await)])
}

pub fn unique_prefix() -> String {
    format!("t{}_", Uuid::new_v4().simple())
}

pub async fn redis_provider(prefix: &str, read_only: bool) -> Arc<RedisProvider> {
    let config = shared_config().await;
    let pools = ConnectionPools::new();
    let pool = pools
        .get(config.local_redis().expect("local redis"))
        .expect("create pool");
    Arc::new(RedisProvider::new(
        "redis-test",
        pool,
        Arc::new(WriteThroughSentinelManager::new()),
        RedisProviderOptions {
            key_prefix: prefix.to_string(),
            read_only,
            ..RedisProviderOptions::default()
        },
    ))
}

/// A plain connection to the shared container, for inspecting raw state.
pub async fn raw_connection() -> deadpool_redis::Connection {
    let config = shared_config().await;
    ConnectionPools::new()
        .get(config.local_redis().expect("local redis"))
        .expect("create pool")
        .get()
        .await
        .expect("get connection")
}

/// Polls `check` until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub struct PrefixedNames(pub String);

impl KeyNameProvider for PrefixedNames {
    fn key_name(&self, id: &str, components: &[&str]) -> Key {
        let mut name = format!("{}{id}", self.0);
        for component in components {
            name.push('_');
            name.push_str(component);
        }
        Key::new(name)
    }

    fn prefix(&self) -> &str {
        &self.0
    }

    fn rate_limit_key_name(&self, id: &str, suffix: &str) -> RateLimitKey {
        RateLimitKey::new(format!("{}rl_{id}_{suffix}", self.0))
    }

    fn all_key_ids(&self) -> Vec<String> {
        vec!["user".into(), "user_email".into(), "users".into()]
    }
}

pub struct FixedTtls(pub Duration);

impl TtlProvider for FixedTtls {
    fn ttl(&self, _id: &str) -> Duration {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
}

impl User {
    pub fn new(email: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.to_string(),
        }
    }
}

impl Validateable for User {
    fn validate(&self) -> Result<(), String> {
        if self.email.contains('@') {
            Ok(())
        } else {
            Err(format!("invalid email {}", self.email))
        }
    }
}

impl CacheableItem for User {
    fn primary_key(&self, names: &dyn KeyNameProvider) -> Key {
        names.key_name_with_id("user", self.id)
    }

    fn secondary_keys(&self, names: &dyn KeyNameProvider) -> Vec<Key> {
        vec![names.key_name_with_string("user_email", &self.email)]
    }

    fn global_collection_key(&self, names: &dyn KeyNameProvider) -> Option<Key> {
        Some(names.key_name_static("users"))
    }

    fn dependencies_key(&self, names: &dyn KeyNameProvider) -> Option<Key> {
        Some(names.key_name_with_id("user_deps", self.id))
    }

    fn ttl(ttls: &dyn TtlProvider) -> Duration {
        ttls.ttl("user")
    }
}

/// Rate-limited API client with two one-minute buckets.
pub struct ApiClient {
    pub id: String,
    pub limit: i64,
}

impl Validateable for ApiClient {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl RateLimitableItem for ApiClient {
    fn rate_limit_keys(&self, names: &dyn KeyNameProvider) -> Vec<RateLimitKey> {
        vec![
            names.rate_limit_key_name(&self.id, "prev"),
            names.rate_limit_key_name(&self.id, "curr"),
        ]
    }

    fn rate_limit(&self) -> i64 {
        self.limit
    }

    fn ttl(&self, ttls: &dyn TtlProvider) -> Duration {
        ttls.ttl("client")
    }
}
