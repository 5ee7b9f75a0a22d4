//! Cross-region relay.
//!
//! One relay runs per region. It bridges two channels:
//!
//! ```text
//!  region A                                   region B
//!  ────────                                   ────────
//!  regional ch ──propagator──▶ global ch ──▶ applier ──▶ Redis B
//!                                                │
//!                                                └──▶ regional ch / route
//! ```
//!
//! The propagator forwards messages originating in its region to the global
//! channel of every other region. The applier receives those, replays them on
//! its region's Redis, then republishes them locally so on-machine caches
//! follow.

use std::sync::Arc;

use futures_util::FutureExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{InvalidationOptions, InvalidationWrapper, PostInvalidationHandler};
use crate::comms::{
    CommunicationProvider, InvalidateMessage, MessageCode, MessageHandler,
    RedisCommunicationProvider, filter_keys,
};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::pool::ConnectionPools;
use crate::provider::Provider;
use crate::provider::redis::{RedisProvider, RedisProviderOptions};
use crate::sentinel::WriteThroughSentinelManager;

/// Running relay. Dropping it does not stop the subscribers, call
/// [`shutdown`](CrossRegionRelay::shutdown).
pub struct CrossRegionRelay {
    applier: Arc<InvalidationWrapper>,
    regional: Arc<dyn CommunicationProvider>,
}

impl CrossRegionRelay {
    /// Wrapper applying global messages to this region's Redis.
    pub fn applier(&self) -> &Arc<InvalidationWrapper> {
        &self.applier
    }

    pub fn applier_id(&self) -> Uuid {
        self.applier.id()
    }

    pub async fn shutdown(&self) {
        self.regional.shutdown().await;
        self.applier.shutdown().await;
        info!(cache = %self.applier.cache_name(), "cross-region relay stopped");
    }
}

fn regional_provider(
    config: &CacheConfig,
    pools: &ConnectionPools,
    name: &str,
) -> Result<Arc<dyn Provider>> {
    let local = config.local_redis().ok_or_else(|| {
        CacheError::Config(format!("no redis configured for region {}", config.region))
    })?;
    Ok(Arc::new(RedisProvider::new(
        name,
        pools.get(local)?,
        Arc::new(WriteThroughSentinelManager::new()),
        RedisProviderOptions::from(&config.provider),
    )))
}

/// Republishes an applied global message on this region's channels.
fn republisher(regional: Arc<dyn CommunicationProvider>, regional_name: String) -> PostInvalidationHandler {
    Arc::new(move |applier_id, mut message: InvalidateMessage| {
        let regional = Arc::clone(&regional);
        let regional_name = regional_name.clone();
        async move {
            // Our own id lets the propagator skip the echo.
            message.sender_id = applier_id;
            if message.code == MessageCode::GlobalHandlersOnly {
                message.code = MessageCode::HandlersOnly;
            }

            let channel = if message.route.is_empty() {
                regional_name
            } else {
                if !filter_keys(&message.keys, &message.filters) {
                    debug!(channel = %message.route, keys = ?message.keys, "filters didn't match, not routing message");
                    return Ok(());
                }
                message.route.clone()
            };

            debug!(channel = %channel, keys = ?message.keys, "republishing message in region");
            regional
                .publish(std::slice::from_ref(&channel), &message, Some(&message))
                .await
        }
        .boxed()
    })
}

/// Forwards messages from this region to the global channel of the others.
fn propagator(
    applier_id: Uuid,
    region: String,
    global: Arc<dyn CommunicationProvider>,
    global_name: String,
) -> MessageHandler {
    Arc::new(move |mut message: InvalidateMessage| {
        let region = region.clone();
        let global = Arc::clone(&global);
        let global_name = global_name.clone();
        async move {
            if message.sender_id == applier_id || message.keys.is_empty() {
                return;
            }
            if message.region != region {
                warn!(
                    region = %region,
                    message_region = %message.region,
                    keys = ?message.keys,
                    "ignoring message from another region, are two relays running?"
                );
                return;
            }

            // The remote applier turns it back into HandlersOnly.
            if message.code == MessageCode::HandlersOnly {
                message.code = MessageCode::GlobalHandlersOnly;
            }
            message.sender_id = applier_id;

            debug!(channel = %global_name, keys = ?message.keys, "propagating message to other regions");
            if let Err(e) = global
                .publish(std::slice::from_ref(&global_name), &message, None)
                .await
            {
                error!(channel = %global_name, error = %e, "failed to propagate invalidation to other regions");
            }
        }
        .boxed()
    })
}

/// Starts the relay between `regional_name` and `global_name`.
pub async fn run_cross_region_invalidations(
    config: &CacheConfig,
    pools: &ConnectionPools,
    regional_name: &str,
    global_name: &str,
) -> Result<CrossRegionRelay> {
    let regional: Arc<dyn CommunicationProvider> = Arc::new(RedisCommunicationProvider::new(
        config,
        pools,
        true,
        true,
        regional_name,
    )?);
    let global: Arc<dyn CommunicationProvider> = Arc::new(RedisCommunicationProvider::new(
        config,
        pools,
        true,
        false,
        global_name,
    )?);

    let applier = InvalidationWrapper::new(
        regional_provider(config, pools, regional_name)?,
        Arc::clone(&global),
        InvalidationOptions {
            on_machine: true,
            post_invalidation_handler: Some(republisher(
                Arc::clone(&regional),
                regional_name.to_string(),
            )),
            region: config.region.clone(),
            ..InvalidationOptions::default()
        },
    )
    .await?;
    info!(channel = %global_name, id = %applier.id(), region = %config.region, "cross-region applier started");

    let handler = propagator(
        applier.id(),
        config.region.clone(),
        global,
        global_name.to_string(),
    );
    if let Err(e) = regional.subscribe(handler).await {
        applier.shutdown().await;
        return Err(e);
    }
    info!(channel = %regional_name, region = %config.region, "cross-region propagator started");

    Ok(CrossRegionRelay { applier, regional })
}

/// Subscribes a handlers-only wrapper to `channel`.
///
/// Used by machines that keep their own derived state and only need the
/// invalidation handlers to run. The regional Redis is never modified.
pub async fn run_in_region_local_handlers_subscriber(
    config: &CacheConfig,
    pools: &ConnectionPools,
    channel: &str,
) -> Result<Arc<InvalidationWrapper>> {
    let comms = Arc::new(RedisCommunicationProvider::new(
        config, pools, true, true, channel,
    )?);
    InvalidationWrapper::new(
        regional_provider(config, pools, channel)?,
        comms,
        InvalidationOptions {
            on_machine: true,
            handlers_only_subscriber: true,
            region: config.region.clone(),
            ..InvalidationOptions::default()
        },
    )
    .await
}
