//! Redis connection pool registry.
//!
//! Pools are keyed by their full connection parameters, so every provider
//! and communication channel pointing at the same Redis shares one pool.

use std::collections::HashMap;
use std::sync::Arc;

use deadpool_redis::{Pool, PoolConfig, Runtime};
use parking_lot::Mutex;
use tracing::info;

use crate::config::RegionalRedisConfig;
use crate::error::{CacheError, Result};

/// Creates a pool for one Redis endpoint.
pub fn create_pool(config: &RegionalRedisConfig) -> Result<Pool> {
    let timeout = Some(config.timeout());
    let mut pool_config = PoolConfig::new(config.pool_size);
    pool_config.timeouts.wait = timeout;
    pool_config.timeouts.create = timeout;
    pool_config.timeouts.recycle = timeout;

    let mut redis_config = deadpool_redis::Config::from_url(config.url());
    redis_config.pool = Some(pool_config);
    redis_config
        .create_pool(Some(Runtime::Tokio1))
        .map_err(CacheError::pool)
}

/// Shared registry of Redis pools. Cloning is cheap.
#[derive(Clone, Default)]
pub struct ConnectionPools {
    pools: Arc<Mutex<HashMap<RegionalRedisConfig, Pool>>>,
}

impl ConnectionPools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pool for `config`, creating it on first use.
    pub fn get(&self, config: &RegionalRedisConfig) -> Result<Pool> {
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(config) {
            return Ok(pool.clone());
        }
        let pool = create_pool(config)?;
        info!(region = %config.region, host = %config.host, port = config.port, "created Redis pool");
        pools.insert(config.clone(), pool.clone());
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes and forgets every pool.
    pub fn close_all(&self) {
        let mut pools = self.pools.lock();
        for (config, pool) in pools.drain() {
            pool.close();
            info!(region = %config.region, "closed Redis pool");
        }
    }
}
