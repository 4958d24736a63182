//! Redis adapters for the Topic Bus and the Recovery Store.
//!
//! Redis pub/sub satisfies the bus contract: at-least-once toward connected
//! subscribers, in publish order per publisher. A dropped pub/sub stream
//! surfaces as the receiver ending, which the dispatcher answers by
//! resubscribing with backoff.

use async_trait::async_trait;
use beacon_core::{BusError, RecoveryError, RecoveryStore, TopicBus};
use bytes::Bytes;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Capacity of the bridge channel between redis pub/sub and the dispatcher.
const BUS_CHANNEL_CAPACITY: usize = 1024;

/// Topic Bus over redis pub/sub.
pub struct RedisBus {
    client: redis::Client,
}

impl RedisBus {
    /// Create a bus from a redis URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid; connections are established
    /// lazily per operation.
    pub fn new(url: &str) -> Result<Self, BusError> {
        let client =
            redis::Client::open(url).map_err(|e| BusError::Subscribe(e.to_string()))?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, BusError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::Publish(format!("Redis connection failed: {e}")))
    }
}

#[async_trait]
impl TopicBus for RedisBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError> {
        let mut conn = self.connection().await?;

        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload.as_ref())
            .query_async::<i64>(&mut conn)
            .await
            .map_err(|e| BusError::Publish(format!("Redis PUBLISH failed: {e}")))?;

        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Bytes>, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Subscribe(format!("Redis connection failed: {e}")))?;

        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| BusError::Subscribe(format!("Redis SUBSCRIBE failed: {e}")))?;

        debug!(channel, "Subscribed to redis channel");

        let (tx, rx) = mpsc::channel(BUS_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload = Bytes::from(msg.get_payload_bytes().to_vec());
                if tx.send(payload).await.is_err() {
                    break; // Dispatcher dropped the subscription
                }
            }
            // Stream ended: the closing of `tx` tells the dispatcher to
            // resubscribe with backoff.
            warn!("Redis pub/sub stream ended");
        });

        Ok(rx)
    }
}

/// Recovery Record store over redis string keys with TTL.
pub struct RedisRecoveryStore {
    client: redis::Client,
}

impl RedisRecoveryStore {
    /// Create a store from a redis URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn new(url: &str) -> Result<Self, RecoveryError> {
        let client =
            redis::Client::open(url).map_err(|e| RecoveryError::Unavailable(e.to_string()))?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, RecoveryError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RecoveryError::Unavailable(format!("Redis connection failed: {e}")))
    }
}

#[async_trait]
impl RecoveryStore for RedisRecoveryStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), RecoveryError> {
        let mut conn = self.connection().await?;

        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .arg(value)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| RecoveryError::Unavailable(format!("Redis SETEX failed: {e}")))?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RecoveryError> {
        let mut conn = self.connection().await?;

        redis::cmd("DEL")
            .arg(key)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(|e| RecoveryError::Unavailable(format!("Redis DEL failed: {e}")))?;

        Ok(())
    }
}
