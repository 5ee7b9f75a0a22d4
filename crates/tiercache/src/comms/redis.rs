//! Redis pub/sub transport.
//!
//! Subscriptions use a dedicated connection to the local region's Redis
//! (pooled connections can't SUBSCRIBE). Publishes go through the pools:
//! local ones are awaited, remote ones are spawned and only logged on failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{
    Pool,
    redis::{self, AsyncCommands, aio::PubSub},
};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{CommunicationProvider, InvalidateMessage, MessageHandler};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::pool::ConnectionPools;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

struct RemoteRegion {
    region: String,
    pool: Pool,
}

pub struct RedisCommunicationProvider {
    channel: String,
    local_url: String,
    local_pool: Pool,
    remote: Vec<RemoteRegion>,
    can_subscribe: bool,
    cancel: CancellationToken,
}

impl RedisCommunicationProvider {
    /// Builds a provider bound to `channel`.
    ///
    /// `subscribe` allows [`CommunicationProvider::subscribe`] to be called.
    /// `local_only` keeps every publish inside the current region.
    pub fn new(
        config: &CacheConfig,
        pools: &ConnectionPools,
        subscribe: bool,
        local_only: bool,
        channel: impl Into<String>,
    ) -> Result<Self> {
        let local = config.local_redis().ok_or_else(|| {
            CacheError::Config(format!("no redis configured for region {}", config.region))
        })?;

        let mut remote = Vec::new();
        if !local_only {
            for cfg in config.remote_redis() {
                remote.push(RemoteRegion {
                    region: cfg.region.clone(),
                    pool: pools.get(cfg)?,
                });
            }
        }

        Ok(Self {
            channel: channel.into(),
            local_url: local.url(),
            local_pool: pools.get(local)?,
            remote,
            can_subscribe: subscribe,
            cancel: CancellationToken::new(),
        })
    }
}

async fn open_subscription(url: &str, channel: &str) -> Result<PubSub> {
    let client = redis::Client::open(url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    info!(channel = %channel, "subscribed to invalidation channel");
    Ok(pubsub)
}

/// Delivers messages until the connection drops.
async fn pump(mut pubsub: PubSub, channel: &str, handler: &MessageHandler) -> Result<()> {
    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel = %channel, error = %e, "failed to read invalidation payload");
                continue;
            }
        };
        match InvalidateMessage::from_json(&payload) {
            Ok(message) => handler(message).await,
            Err(e) => warn!(channel = %channel, error = %e, payload = %payload, "failed to decode invalidation message"),
        }
    }
    Err(CacheError::comms("pub/sub stream ended"))
}

async fn run_subscriber(
    url: String,
    channel: String,
    first: PubSub,
    handler: MessageHandler,
    cancel: CancellationToken,
) {
    let mut session = Some(first);
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = async {
                let pubsub = match session.take() {
                    Some(pubsub) => pubsub,
                    None => open_subscription(&url, &channel).await?,
                };
                pump(pubsub, &channel, &handler).await
            } => result,
        };

        if let Err(e) = result {
            error!(
                channel = %channel,
                error = %e,
                backoff_secs = backoff.as_secs(),
                "invalidation subscriber error, reconnecting..."
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        } else {
            backoff = INITIAL_BACKOFF;
        }
    }
    debug!(channel = %channel, "invalidation subscriber stopped");
}

#[async_trait]
impl CommunicationProvider for RedisCommunicationProvider {
    async fn subscribe(&self, handler: MessageHandler) -> Result<()> {
        if !self.can_subscribe {
            return Err(CacheError::comms(format!(
                "channel {} was opened without subscriptions",
                self.channel
            )));
        }
        let first = open_subscription(&self.local_url, &self.channel).await?;
        tokio::spawn(run_subscriber(
            self.local_url.clone(),
            self.channel.clone(),
            first,
            handler,
            self.cancel.clone(),
        ));
        Ok(())
    }

    async fn publish(
        &self,
        channels: &[String],
        message: &InvalidateMessage,
        local_message: Option<&InvalidateMessage>,
    ) -> Result<()> {
        if let Some(local) = local_message {
            let payload = local.to_json()?;
            let mut conn = self.local_pool.get().await.map_err(CacheError::pool)?;
            for channel in channels {
                conn.publish::<_, _, ()>(channel, &payload).await?;
            }
            debug!(channels = ?channels, keys = ?local.keys, "published local invalidation");
        }

        if self.remote.is_empty() {
            return Ok(());
        }
        let payload = Arc::new(message.to_json()?);
        for remote in &self.remote {
            let pool = remote.pool.clone();
            let region = remote.region.clone();
            let channels = channels.to_vec();
            let payload = Arc::clone(&payload);
            tokio::spawn(async move {
                let mut conn = match pool.get().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(region = %region, error = %e, "failed to get Redis connection for remote invalidation");
                        return;
                    }
                };
                for channel in &channels {
                    if let Err(e) = conn.publish::<_, _, ()>(channel, payload.as_str()).await {
                        warn!(region = %region, channel = %channel, error = %e, "remote invalidation publish failed");
                    }
                }
                debug!(region = %region, channels = ?channels, "published remote invalidation");
            });
        }
        Ok(())
    }

    fn channel(&self) -> &str {
        &self.channel
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
    }
}
