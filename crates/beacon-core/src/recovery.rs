//! Session recovery: liveness records and the post-restart reconnect signal.
//!
//! Recovery Records are diagnostic only. They let operators and tests see
//! which connection ids were recently live; they are never read back to
//! reconstruct subscription state. After an abnormal restart the coordinator
//! broadcasts a single reconnect request and clients resubscribe themselves.

use crate::dispatcher::Dispatcher;
use async_trait::async_trait;
use beacon_protocol::{event::now_millis, Event};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Recovery store errors.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The store is unreachable or rejected the operation.
    #[error("Recovery store unavailable: {0}")]
    Unavailable(String),
}

/// Key-value store with TTL used for Recovery Records.
///
/// Implementations must be safe to call concurrently. Failures are
/// observability losses, not correctness problems: callers log and move on.
#[async_trait]
pub trait RecoveryStore: Send + Sync {
    /// Store a value under a key with a time-to-live.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), RecoveryError>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), RecoveryError>;
}

/// In-memory recovery store for tests and single-instance deployments.
#[derive(Default)]
pub struct InMemoryRecoveryStore {
    entries: DashMap<String, (String, u64)>,
}

impl InMemoryRecoveryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live (unexpired) value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        let (value, expires_at) = entry.value();
        if *expires_at <= now_millis() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(value.clone())
    }

    /// Number of stored records, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RecoveryStore for InMemoryRecoveryStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), RecoveryError> {
        let expires_at = now_millis() + ttl.as_millis() as u64;
        self.entries
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RecoveryError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Publishes the reconnect-requested broadcast after an abnormal restart.
///
/// The crash marker itself is an external signal (environment flag or a
/// marker file written by the process supervisor); the server crate decides
/// whether the previous shutdown was clean and passes the verdict here.
pub struct RecoveryCoordinator {
    dispatcher: Arc<Dispatcher>,
}

impl RecoveryCoordinator {
    /// Create a coordinator bound to the instance's dispatcher.
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Announce the restart to all clients on all instances if the prior
    /// shutdown was abnormal.
    pub async fn announce_restart(&self, crashed: bool) {
        if !crashed {
            debug!("Clean prior shutdown, no reconnect broadcast");
            return;
        }
        info!("Abnormal restart detected, broadcasting reconnect request");
        self.dispatcher.publish(Event::reconnect_requested()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_set_get_delete() {
        let store = InMemoryRecoveryStore::new();
        store
            .set("beacon:conn:a", "123", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(store.get("beacon:conn:a").as_deref(), Some("123"));

        store.delete("beacon:conn:a").await.unwrap();
        assert!(store.get("beacon:conn:a").is_none());

        // Deleting again is fine.
        store.delete("beacon:conn:a").await.unwrap();
    }

    #[tokio::test]
    async fn test_in_memory_ttl_expiry() {
        let store = InMemoryRecoveryStore::new();
        store
            .set("beacon:conn:b", "456", Duration::from_millis(0))
            .await
            .unwrap();

        assert!(store.get("beacon:conn:b").is_none());
    }
}
