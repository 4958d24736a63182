//! Topic Bus capability interface.
//!
//! The bus is the sole mechanism for cross-instance event propagation: an
//! external at-least-once pub/sub channel shared by every service instance.
//! The trait makes no assumption beyond at-least-once, in-order-per-publisher
//! delivery, so any equivalent broker can stand in. The production adapter
//! (redis pub/sub) lives in the server crate; `InMemoryBus` backs tests and
//! single-instance deployments.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

/// Capacity of the per-subscriber delivery channel.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 1024;

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// Publishing to the bus failed.
    #[error("Bus publish failed: {0}")]
    Publish(String),

    /// Subscribing to the bus channel failed.
    #[error("Bus subscribe failed: {0}")]
    Subscribe(String),
}

/// Cross-instance publish/subscribe channel.
#[async_trait]
pub trait TopicBus: Send + Sync {
    /// Publish a serialized event to a bus channel.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError>;

    /// Subscribe to a bus channel.
    ///
    /// Returns a receiver yielding serialized events in publish order per
    /// publisher. The stream ending signals a lost bus connection; callers
    /// resubscribe with backoff.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Bytes>, BusError>;
}

/// In-process bus that fans out to all subscribers of a channel.
pub struct InMemoryBus {
    channels: DashMap<String, broadcast::Sender<Bytes>>,
}

impl InMemoryBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TopicBus for InMemoryBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError> {
        // No subscribers is fine; the event simply stays instance-local.
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Bytes>, BusError> {
        let mut rx = self.sender(channel).subscribe();
        let (tx, out) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break; // Subscriber dropped
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "In-memory bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(out)
    }
}
