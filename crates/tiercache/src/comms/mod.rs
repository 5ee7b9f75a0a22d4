//! Pub/sub transport for invalidation messages.
//!
//! A [`CommunicationProvider`] is bound to one channel for subscriptions and
//! publishes to any channel. Messages published "locally" reach the
//! subscribers in the current region. Remote publishes fan out to the other
//! regions in the background and are best effort.

pub mod local;
pub mod message;
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::error::Result;

pub use local::{LocalBus, LocalCommunicationProvider};
pub use message::{InvalidateMessage, MessageCode, filter_keys, strip_suffix};
pub use redis::RedisCommunicationProvider;

/// Callback run for every message received on the subscribed channel.
pub type MessageHandler = Arc<dyn Fn(InvalidateMessage) -> BoxFuture<'static, ()> + Send + Sync>;

#[async_trait]
pub trait CommunicationProvider: Send + Sync {
    /// Subscribes `handler` to the provider's channel.
    ///
    /// The subscription is live once this returns. Delivery continues on a
    /// background task until [`shutdown`](CommunicationProvider::shutdown).
    async fn subscribe(&self, handler: MessageHandler) -> Result<()>;

    /// Publishes `message` to other regions and, when given, `local_message`
    /// to every channel in this region.
    async fn publish(
        &self,
        channels: &[String],
        message: &InvalidateMessage,
        local_message: Option<&InvalidateMessage>,
    ) -> Result<()>;

    /// Name of the channel subscriptions listen on.
    fn channel(&self) -> &str;

    /// Stops the subscriber task.
    async fn shutdown(&self);
}
