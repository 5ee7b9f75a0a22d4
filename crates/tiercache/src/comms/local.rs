//! In-process message bus.
//!
//! Every [`LocalCommunicationProvider`] built from the same [`LocalBus`]
//! behaves like a separate machine in one region. There are no remote
//! regions, so only local publishes are delivered.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CommunicationProvider, InvalidateMessage, MessageHandler};
use crate::error::Result;

const CHANNEL_CAPACITY: usize = 1024;

/// Shared set of in-process channels.
#[derive(Clone, Default)]
pub struct LocalBus {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<InvalidateMessage>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<InvalidateMessage> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

pub struct LocalCommunicationProvider {
    bus: LocalBus,
    channel: String,
    cancel: CancellationToken,
}

impl LocalCommunicationProvider {
    pub fn new(bus: LocalBus, channel: impl Into<String>) -> Self {
        Self {
            bus,
            channel: channel.into(),
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl CommunicationProvider for LocalCommunicationProvider {
    async fn subscribe(&self, handler: MessageHandler) -> Result<()> {
        let mut rx = self.bus.sender(&self.channel).subscribe();
        let cancel = self.cancel.clone();
        let channel = self.channel.clone();
        info!(channel = %channel, "subscribed to local invalidation channel");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(message) => handler(message).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(channel = %channel, skipped, "local subscriber lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!(channel = %channel, "local subscriber stopped");
        });
        Ok(())
    }

    async fn publish(
        &self,
        channels: &[String],
        _message: &InvalidateMessage,
        local_message: Option<&InvalidateMessage>,
    ) -> Result<()> {
        let Some(local) = local_message else {
            return Ok(());
        };
        for channel in channels {
            // No subscribers is not an error.
            let receivers = self.bus.sender(channel).send(local.clone()).unwrap_or(0);
            debug!(channel = %channel, receivers, keys = ?local.keys, "published local invalidation");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;
    use futures_util::FutureExt;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn forwarder(tx: mpsc::UnboundedSender<InvalidateMessage>) -> MessageHandler {
        Arc::new(move |m| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(m);
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_local_delivery_and_shutdown() {
        let bus = LocalBus::new();
        let subscriber = LocalCommunicationProvider::new(bus.clone(), "cache");
        let publisher = LocalCommunicationProvider::new(bus, "cache");

        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriber.subscribe(forwarder(tx)).await.unwrap();

        let msg = InvalidateMessage::new(Uuid::new_v4(), vec![Key::from("k")], "local");
        publisher
            .publish(&["cache".to_string()], &msg, Some(&msg))
            .await
            .unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.keys, msg.keys);

        // Remote-only publishes never reach in-process subscribers.
        publisher
            .publish(&["cache".to_string()], &msg, None)
            .await
            .unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );

        subscriber.shutdown().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        publisher
            .publish(&["cache".to_string()], &msg, Some(&msg))
            .await
            .unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .map(|m| m.is_none())
                .unwrap_or(true)
        );
    }
}
