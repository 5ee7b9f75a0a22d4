//! Building invalidating caches from configuration.

use std::sync::Arc;

use tracing::{debug, error};

use super::{InvalidationOptions, InvalidationWrapper};
use crate::comms::RedisCommunicationProvider;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::layering::LayeringWrapper;
use crate::pool::ConnectionPools;
use crate::provider::Provider;
use crate::provider::memory::{InMemoryOptions, InMemoryProvider};
use crate::provider::redis::{RedisProvider, RedisProviderOptions};
use crate::sentinel::WriteThroughSentinelManager;

/// What kind of cache [`initialize_invalidating_cache_from_config`] builds.
#[derive(Clone, Default)]
pub struct CacheOptions {
    /// In-memory tier on top of Redis. Excludes `invalidation.on_machine`.
    pub layered: bool,
    /// Channel of the Redis tier of a layered cache. Defaults to the
    /// configured regional channel.
    pub regional_channel: Option<String>,
    /// Options of the wrapper. The region is always taken from the config.
    pub invalidation: InvalidationOptions,
}

impl CacheOptions {
    pub fn on_machine() -> Self {
        Self {
            invalidation: InvalidationOptions {
                on_machine: true,
                ..InvalidationOptions::default()
            },
            ..Self::default()
        }
    }

    pub fn layered() -> Self {
        Self {
            layered: true,
            ..Self::default()
        }
    }
}

/// Builds the cache named `cache_name`.
///
/// - on machine: in-memory provider following the writes of other machines
/// - off machine: Redis provider broadcasting its writes
/// - layered: both, the in-memory tier on top
///
/// Returns `None` when no Redis is configured.
pub async fn initialize_invalidating_cache_from_config(
    config: &CacheConfig,
    pools: &ConnectionPools,
    cache_name: &str,
    key_prefix: &str,
    options: CacheOptions,
) -> Result<Option<Arc<dyn Provider>>> {
    if config.redis.is_empty() {
        return Ok(None);
    }

    let mut invalidation = options.invalidation;
    invalidation.region = config.region.clone();

    if options.layered && invalidation.on_machine {
        return Err(CacheError::invalid_argument(
            "Can't specify Layered cache and On machine at the same time",
        ));
    }

    if options.layered {
        let regional_channel = options
            .regional_channel
            .unwrap_or_else(|| config.invalidation.regional_channel.clone());

        let inner = build_wrapper(
            config,
            pools,
            cache_name,
            key_prefix,
            InvalidationOptions {
                on_machine: true,
                invalidation_delay: Some(
                    invalidation
                        .invalidation_delay
                        .unwrap_or_else(|| config.invalidation.delay()),
                ),
                region: config.region.clone(),
                ..InvalidationOptions::default()
            },
        )
        .await?;
        let outer = build_wrapper(
            config,
            pools,
            &regional_channel,
            key_prefix,
            InvalidationOptions {
                sub_cache_name: cache_name.to_string(),
                region: config.region.clone(),
                ..InvalidationOptions::default()
            },
        )
        .await?;
        debug!(cache = %cache_name, regional_channel = %regional_channel, "built layered invalidating cache");
        return Ok(Some(Arc::new(LayeringWrapper::new(inner, outer))));
    }

    if invalidation.on_machine && invalidation.invalidation_delay.is_none() {
        invalidation.invalidation_delay = Some(config.invalidation.delay());
    }
    let cache = build_wrapper(config, pools, cache_name, key_prefix, invalidation).await?;
    Ok(Some(cache))
}

/// On-machine wrappers get an in-memory provider, the others Redis.
async fn build_wrapper(
    config: &CacheConfig,
    pools: &ConnectionPools,
    cache_name: &str,
    key_prefix: &str,
    options: InvalidationOptions,
) -> Result<Arc<dyn Provider>> {
    let comms = RedisCommunicationProvider::new(config, pools, options.on_machine, true, cache_name)
        .inspect_err(|e| error!(cache = %cache_name, error = %e, "failed to create redis communication provider"))?;

    let provider: Arc<dyn Provider> = if options.on_machine {
        Arc::new(InMemoryProvider::new(
            cache_name,
            Arc::new(WriteThroughSentinelManager::new()),
            InMemoryOptions::from(&config.provider),
        ))
    } else {
        let local = config.local_redis().ok_or_else(|| {
            CacheError::Config(format!("no redis configured for region {}", config.region))
        })?;
        Arc::new(RedisProvider::new(
            cache_name,
            pools.get(local)?,
            Arc::new(WriteThroughSentinelManager::new()),
            RedisProviderOptions {
                key_prefix: key_prefix.to_string(),
                ..RedisProviderOptions::from(&config.provider)
            },
        ))
    };

    let wrapper = InvalidationWrapper::new(provider, Arc::new(comms), options).await?;
    debug!(cache = %cache_name, id = %wrapper.id(), "invalidating cache ready");
    Ok(wrapper)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_redis_configured() {
        let config = CacheConfig::default();
        let cache = initialize_invalidating_cache_from_config(
            &config,
            &ConnectionPools::new(),
            "cache",
            "",
            CacheOptions::on_machine(),
        )
        .await
        .unwrap();
        assert!(cache.is_none());
    }

    #[tokio::test]
    async fn test_layered_and_on_machine_rejected() {
        let config = CacheConfig {
            redis: vec![crate::config::RegionalRedisConfig {
                region: "local".into(),
                ..Default::default()
            }],
            ..CacheConfig::default()
        };
        let options = CacheOptions {
            layered: true,
            ..CacheOptions::on_machine()
        };
        let err = initialize_invalidating_cache_from_config(
            &config,
            &ConnectionPools::new(),
            "cache",
            "",
            options,
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, CacheError::InvalidArgument { .. }));
    }
}
