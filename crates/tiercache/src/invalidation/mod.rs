//! Invalidation broadcasting.
//!
//! [`InvalidationWrapper`] decorates a [`Provider`]: every local mutation is
//! followed by an [`InvalidateMessage`] on the cache's channel, and every
//! message received from another cache is replayed on the wrapped provider.
//!
//! ```text
//!   writer ──set/delete──▶ InvalidationWrapper ──▶ Provider
//!                                 │
//!                                 ▼ publish
//!                       CommunicationProvider ──▶ other wrappers
//!                                                    │
//!                                                    ▼ replay + handlers
//! ```
//!
//! Delivery is best effort. Publish failures are logged and the local write
//! stays authoritative.

pub mod cross_region;
pub mod factory;

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::comms::message::{
    CLEAR_DEPENDENCIES_SUFFIX, CLEAR_DEPENDENCIES_TOMBSTONE_SUFFIX, FLUSH_SUFFIX, LOG_SUFFIX,
};
use crate::comms::{
    CommunicationProvider, InvalidateMessage, MessageCode, MessageHandler, filter_keys,
    strip_suffix,
};
use crate::error::Result;
use crate::key::{Key, RateLimitKey, Sentinel, SentinelType, is_invalidating_sentinel};
use crate::metrics;
use crate::provider::{
    CacheLookup, InvalidationHandler, Provider, RateLimitReservation, SetOutcome,
};

pub use cross_region::{CrossRegionRelay, run_cross_region_invalidations, run_in_region_local_handlers_subscriber};
pub use factory::{CacheOptions, initialize_invalidating_cache_from_config};

/// Delay applied after each broadcast by on-machine caches unless overridden.
pub const DEFAULT_INVALIDATION_DELAY: Duration = Duration::from_millis(100);

/// Callback run after a received message has been fully handled.
///
/// Receives the id of the wrapper that handled the message.
pub type PostInvalidationHandler =
    Arc<dyn Fn(Uuid, InvalidateMessage) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Publishing of handlers-only copies to machines running invalidation
/// handlers for an off-machine cache.
#[derive(Debug, Clone, Default)]
pub struct LocalPublish {
    /// Channel the handlers-only subscribers listen on.
    pub channel: String,
    /// Only keys containing one of these reach the channel. Empty means all.
    pub filters: Vec<String>,
}

/// Construction options of an [`InvalidationWrapper`].
#[derive(Clone)]
pub struct InvalidationOptions {
    /// The wrapped provider lives in this process and must follow the
    /// writes of other processes.
    pub on_machine: bool,
    /// Only run handlers for received messages, never touch the provider.
    pub handlers_only_subscriber: bool,
    pub local_publish: Option<LocalPublish>,
    pub post_invalidation_handler: Option<PostInvalidationHandler>,
    /// Pause after each broadcast. Defaults to
    /// [`DEFAULT_INVALIDATION_DELAY`] for on-machine caches, none otherwise.
    pub invalidation_delay: Option<Duration>,
    /// Channel of the cache layered on top of this one. Carried as the
    /// message route. Overridden by `local_publish`.
    pub sub_cache_name: String,
    /// Region stamped on outgoing messages.
    pub region: String,
}

impl Default for InvalidationOptions {
    fn default() -> Self {
        Self {
            on_machine: false,
            handlers_only_subscriber: false,
            local_publish: None,
            post_invalidation_handler: None,
            invalidation_delay: None,
            sub_cache_name: String::new(),
            region: "local".to_string(),
        }
    }
}

impl InvalidationOptions {
    fn effective_delay(&self) -> Duration {
        match self.invalidation_delay {
            Some(delay) => delay,
            None if self.on_machine => DEFAULT_INVALIDATION_DELAY,
            None => Duration::ZERO,
        }
    }
}

/// Provider decorator broadcasting and applying invalidations.
pub struct InvalidationWrapper {
    id: Uuid,
    provider: Arc<dyn Provider>,
    comms: Arc<dyn CommunicationProvider>,
    handlers: DashMap<Key, Vec<InvalidationHandler>>,
    on_machine: bool,
    handlers_only: bool,
    local_publish: Option<LocalPublish>,
    post_handler: Option<PostInvalidationHandler>,
    delay: Duration,
    sub_cache_name: String,
    region: String,
}

impl InvalidationWrapper {
    /// Wraps `provider`. On-machine wrappers subscribe to the comms channel
    /// before this returns.
    pub async fn new(
        provider: Arc<dyn Provider>,
        comms: Arc<dyn CommunicationProvider>,
        options: InvalidationOptions,
    ) -> Result<Arc<Self>> {
        let delay = options.effective_delay();
        let sub_cache_name = match &options.local_publish {
            Some(publish) => publish.channel.clone(),
            None => options.sub_cache_name,
        };

        let wrapper = Arc::new(Self {
            id: Uuid::new_v4(),
            provider,
            comms,
            handlers: DashMap::new(),
            on_machine: options.on_machine,
            handlers_only: options.handlers_only_subscriber,
            local_publish: options.local_publish,
            post_handler: options.post_invalidation_handler,
            delay,
            sub_cache_name,
            region: options.region,
        });

        if wrapper.on_machine {
            let weak = Arc::downgrade(&wrapper);
            if let Err(e) = wrapper.comms.subscribe(receiver(weak)).await {
                error!(
                    cache = %wrapper.cache_name(),
                    channel = %wrapper.comms.channel(),
                    error = %e,
                    "failed to subscribe to invalidation channel"
                );
                return Err(e);
            }
        }

        debug!(cache = %wrapper.cache_name(), id = %wrapper.id, on_machine = wrapper.on_machine, "invalidation wrapper created");
        Ok(wrapper)
    }

    /// Sender id stamped on this wrapper's messages.
    pub fn id(&self) -> Uuid {
        self.id
    }

    async fn receive(&self, message: InvalidateMessage) {
        let latency = message.latency();
        debug!(
            cache = %self.cache_name(),
            id = %self.id,
            keys = ?message.keys,
            code = ?message.code,
            sender = %message.sender_id,
            region = %message.region,
            latency_ms = latency.as_millis() as u64,
            "received invalidation message"
        );

        if message.sender_id == self.id || message.keys.is_empty() {
            return;
        }
        if message.code == MessageCode::HandlersOnly && !self.handlers_only {
            debug!(cache = %self.cache_name(), id = %self.id, "discarding handlers-only message");
            return;
        }

        metrics::record_invalidation(
            self.cache_name(),
            &message.region,
            message.keys.len(),
            latency,
        );

        if let Err(e) = self.handle_invalidation(message).await {
            error!(cache = %self.cache_name(), id = %self.id, error = %e, "failed to handle invalidation message");
        }
    }

    async fn handle_invalidation(&self, message: InvalidateMessage) -> Result<()> {
        if !self.handlers_only {
            let first = message.keys[0].as_str();
            let single = message.keys.len() == 1;

            if single && first.ends_with(FLUSH_SUFFIX) {
                self.provider.flush(strip_suffix(first), false).await?;
            } else if single
                && (first.ends_with(CLEAR_DEPENDENCIES_TOMBSTONE_SUFFIX)
                    || first.ends_with(CLEAR_DEPENDENCIES_SUFFIX))
            {
                let set_tombstone = first.ends_with(CLEAR_DEPENDENCIES_TOMBSTONE_SUFFIX);
                self.provider
                    .clear_dependencies(&Key::from(strip_suffix(first)), set_tombstone)
                    .await?;
            } else if single && first.ends_with(LOG_SUFFIX) {
                self.provider.log_key_values(strip_suffix(first)).await?;
                return Ok(());
            } else {
                self.provider.delete_value(&message.keys, true, true).await?;
            }
        }

        // Handlers run outside of the registry lock.
        let mut calls = Vec::new();
        for entry in self.handlers.iter() {
            for key in &message.keys {
                if entry.key().as_str().starts_with(strip_suffix(key.as_str())) {
                    let flush = key.as_str().ends_with(FLUSH_SUFFIX);
                    for handler in entry.value() {
                        calls.push((Arc::clone(handler), key.clone(), flush));
                    }
                }
            }
        }
        for (handler, key, flush) in calls {
            if let Err(e) = handler(key.clone(), flush).await {
                error!(cache = %self.cache_name(), key = %key, error = %e, "invalidation handler failed");
            }
        }

        if let Some(post) = &self.post_handler
            && let Err(e) = post(self.id, message).await
        {
            error!(cache = %self.cache_name(), id = %self.id, error = %e, "post invalidation handler failed");
        }
        Ok(())
    }

    /// Broadcasts `keys`. Never fails: the local write already happened.
    async fn invalidate(&self, keys: Vec<Key>) {
        let mut channels = vec![self.cache_name().to_string()];
        let mut message = InvalidateMessage::new(self.id, keys, self.region.clone());
        message.route = self.sub_cache_name.clone();

        let local_message = match &self.local_publish {
            Some(publish) => {
                let mut local = message.clone();
                local.code = MessageCode::HandlersOnly;
                local.filters = publish.filters.clone();
                if !self.sub_cache_name.is_empty() && filter_keys(&message.keys, &publish.filters) {
                    channels.insert(0, self.sub_cache_name.clone());
                }
                local
            }
            None => message.clone(),
        };

        let send_local =
            self.on_machine || self.local_publish.is_some() || !self.sub_cache_name.is_empty();

        debug!(
            cache = %self.cache_name(),
            id = %self.id,
            keys = ?message.keys,
            channels = ?channels,
            send_local,
            "sending invalidation message"
        );

        let result = self
            .comms
            .publish(&channels, &message, send_local.then_some(&local_message))
            .await;
        if let Err(e) = result {
            warn!(cache = %self.cache_name(), keys = ?message.keys, error = %e, "failed to publish invalidation");
            return;
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

/// Routes subscription messages to the wrapper while it is alive.
fn receiver(wrapper: Weak<InvalidationWrapper>) -> MessageHandler {
    Arc::new(move |message| {
        let wrapper = wrapper.clone();
        async move {
            if let Some(wrapper) = wrapper.upgrade() {
                wrapper.receive(message).await;
            }
        }
        .boxed()
    })
}

#[async_trait]
impl Provider for InvalidationWrapper {
    async fn get_value(&self, key: &Key, lock_on_miss: bool) -> Result<CacheLookup> {
        self.provider.get_value(key, lock_on_miss).await
    }

    async fn get_values(&self, keys: &[Key], lock_on_miss: &[bool]) -> Result<Vec<CacheLookup>> {
        self.provider.get_values(keys, lock_on_miss).await
    }

    async fn set_value(
        &self,
        lock_key: &Key,
        keys: &[Key],
        value: &str,
        sentinel: &Sentinel,
        ttl: Duration,
    ) -> Result<SetOutcome> {
        let outcome = self
            .provider
            .set_value(lock_key, keys, value, sentinel, ttl)
            .await?;

        // A conflict still has to reach on-machine caches holding the old value.
        if (outcome.set || outcome.conflict) && is_invalidating_sentinel(sentinel.as_str()) {
            self.invalidate(keys.to_vec()).await;
        }
        Ok(outcome)
    }

    async fn delete_value(&self, keys: &[Key], set_tombstone: bool, force: bool) -> Result<()> {
        self.provider.delete_value(keys, set_tombstone, force).await?;
        self.invalidate(keys.to_vec()).await;
        Ok(())
    }

    async fn write_sentinel(&self, stype: SentinelType, keys: &[Key]) -> Result<Sentinel> {
        self.provider.write_sentinel(stype, keys).await
    }

    async fn release_sentinel(&self, keys: &[Key], sentinel: &Sentinel) {
        self.provider.release_sentinel(keys, sentinel).await;
    }

    async fn add_dependency(&self, keys: &[Key], values: &[Key], ttl: Duration) -> Result<()> {
        self.provider.add_dependency(keys, values, ttl).await
    }

    async fn clear_dependencies(&self, key: &Key, set_tombstone: bool) -> Result<()> {
        self.provider.clear_dependencies(key, set_tombstone).await?;
        let suffix = if set_tombstone {
            CLEAR_DEPENDENCIES_TOMBSTONE_SUFFIX
        } else {
            CLEAR_DEPENDENCIES_SUFFIX
        };
        self.invalidate(vec![key.with_suffix(suffix)]).await;
        Ok(())
    }

    async fn flush(&self, prefix: &str, flush_tombstones: bool) -> Result<()> {
        self.provider.flush(prefix, flush_tombstones).await?;
        self.invalidate(vec![Key::new(format!("{prefix}{FLUSH_SUFFIX}"))])
            .await;
        Ok(())
    }

    fn cache_name(&self) -> &str {
        self.provider.cache_name()
    }

    /// Handlers only run for invalidations coming from other caches.
    async fn register_invalidation_handler(
        &self,
        handler: InvalidationHandler,
        key: Key,
    ) -> Result<()> {
        self.handlers.entry(key).or_default().push(handler);
        Ok(())
    }

    async fn log_key_values(&self, prefix: &str) -> Result<()> {
        self.provider.log_key_values(prefix).await?;
        self.invalidate(vec![Key::new(format!("{prefix}{LOG_SUFFIX}"))])
            .await;
        Ok(())
    }

    fn layered(&self) -> bool {
        self.provider.layered()
    }

    fn supports_rate_limits(&self) -> bool {
        self.provider.supports_rate_limits()
    }

    async fn reserve_rate_limit_slot(
        &self,
        keys: &[RateLimitKey],
        limit: i64,
        ttl: Duration,
        take_slot: bool,
    ) -> Result<RateLimitReservation> {
        self.provider
            .reserve_rate_limit_slot(keys, limit, ttl, take_slot)
            .await
    }

    async fn release_rate_limit_slot(&self, keys: &[RateLimitKey]) -> Result<i64> {
        self.provider.release_rate_limit_slot(keys).await
    }

    async fn shutdown(&self) {
        self.comms.shutdown().await;
        self.provider.shutdown().await;
    }
}
