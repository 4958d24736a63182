//! Per-instance connection registry and subscription table.
//!
//! The registry owns every live connection admitted by this instance:
//! its outbound queue, its subscription set, and the inverse topic index
//! used for O(1) dispatch. Entries exist from `admit` to `remove` and are
//! torn down exactly once, atomically with the subscription table.

use crate::outbound::{OutboundQueue, PushOutcome};
use crate::recovery::RecoveryStore;
use beacon_protocol::{event::now_millis, Event};
use dashmap::{DashMap, DashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Counter folded into generated ids so two admissions in the same
/// nanosecond still differ.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection, generated at admission.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh connection ID.
    #[must_use]
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}", timestamp.wrapping_add(counter)))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Id of this service instance, stamped onto locally created events.
    pub instance_id: String,
    /// Capacity of each connection's outbound queue.
    pub queue_capacity: usize,
    /// Time-to-live of Recovery Records.
    pub recovery_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("inst_{:x}", now_millis()),
            queue_capacity: crate::outbound::DEFAULT_QUEUE_CAPACITY,
            recovery_ttl: Duration::from_secs(3600),
        }
    }
}

/// A live connection owned by the registry.
pub struct ConnectionEntry {
    queue: Arc<OutboundQueue>,
    admitted_at: u64,
    last_activity: AtomicU64,
}

impl ConnectionEntry {
    /// The connection's outbound queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    /// When the connection was admitted, epoch milliseconds.
    #[must_use]
    pub fn admitted_at(&self) -> u64 {
        self.admitted_at
    }

    /// Last inbound activity, epoch milliseconds.
    #[must_use]
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub(crate) fn push(&self, event: Arc<Event>) -> PushOutcome {
        self.queue.push(event)
    }
}

/// Health snapshot of the registry.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    /// Number of live connections.
    pub active_connections: usize,
    /// Topics with at least one subscriber.
    pub topics: Vec<String>,
}

/// Per-instance table of live connections and their subscriptions.
pub struct Registry {
    connections: DashMap<ConnectionId, Arc<ConnectionEntry>>,
    /// connection-id -> set of subscribed topics.
    subscriptions: DashMap<ConnectionId, DashSet<String>>,
    /// Inverse index: topic -> set of subscribed connection ids.
    topics: DashMap<String, DashSet<ConnectionId>>,
    recovery: Arc<dyn RecoveryStore>,
    config: RegistryConfig,
}

impl Registry {
    /// Create a registry backed by the given recovery store.
    #[must_use]
    pub fn new(config: RegistryConfig, recovery: Arc<dyn RecoveryStore>) -> Self {
        Self {
            connections: DashMap::new(),
            subscriptions: DashMap::new(),
            topics: DashMap::new(),
            recovery,
            config,
        }
    }

    /// Id of this service instance.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// Admit a new connection.
    ///
    /// Registers the connection with an empty topic set, queues the
    /// acknowledgement event carrying its id, and records a Recovery Record
    /// (best effort; a store failure is logged, never surfaced — the only
    /// fatal admission error is the transport handshake, which happens
    /// before the registry is involved).
    pub async fn admit(&self) -> (ConnectionId, Arc<OutboundQueue>) {
        let id = ConnectionId::generate();
        let now = now_millis();
        let queue = Arc::new(OutboundQueue::new(self.config.queue_capacity));

        let entry = Arc::new(ConnectionEntry {
            queue: queue.clone(),
            admitted_at: now,
            last_activity: AtomicU64::new(now),
        });
        self.connections.insert(id.clone(), entry);
        self.subscriptions.insert(id.clone(), DashSet::new());

        let mut ack = Event::connection_ack(id.as_str());
        ack.stamp(&self.config.instance_id);
        queue.push(Arc::new(ack));

        if let Err(e) = self
            .recovery
            .set(&recovery_key(&id), &now.to_string(), self.config.recovery_ttl)
            .await
        {
            warn!(connection = %id, error = %e, "Failed to write recovery record");
        }

        debug!(connection = %id, "Connection admitted");
        (id, queue)
    }

    /// Remove a connection and its subscription entry.
    ///
    /// Idempotent: safe to call multiple times or after the connection is
    /// already gone. Closes the outbound queue, which wakes the connection
    /// task so it can exit.
    pub async fn remove(&self, id: &ConnectionId) {
        let Some((_, entry)) = self.connections.remove(id) else {
            return;
        };
        entry.queue.close();

        if let Some((_, topics)) = self.subscriptions.remove(id) {
            for topic in topics.iter() {
                self.drop_membership(topic.key(), id);
            }
        }

        if let Err(e) = self.recovery.delete(&recovery_key(id)).await {
            warn!(connection = %id, error = %e, "Failed to delete recovery record");
        }

        debug!(connection = %id, "Connection removed");
    }

    fn drop_membership(&self, topic: &str, id: &ConnectionId) {
        if let Some(members) = self.topics.get(topic) {
            members.remove(id);
            let empty = members.is_empty();
            drop(members);
            if empty {
                self.topics.remove_if(topic, |_, m| m.is_empty());
            }
        }
    }

    /// Subscribe a connection to a topic.
    ///
    /// Idempotent; a no-op if the connection is unknown (it may have
    /// disconnected between the client's request and its processing).
    pub fn subscribe(&self, id: &ConnectionId, topic: &str) {
        let Some(subs) = self.subscriptions.get(id) else {
            debug!(connection = %id, topic, "Subscribe for unknown connection ignored");
            return;
        };
        subs.insert(topic.to_string());
        drop(subs);

        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(id.clone());

        // The connection may have been removed while we updated the inverse
        // index; undo the membership so the index never outlives the entry.
        if !self.connections.contains_key(id) {
            self.drop_membership(topic, id);
            return;
        }

        debug!(connection = %id, topic, "Subscribed");
    }

    /// Unsubscribe a connection from a topic.
    ///
    /// Idempotent; a no-op for unknown connections or topics.
    pub fn unsubscribe(&self, id: &ConnectionId, topic: &str) {
        if let Some(subs) = self.subscriptions.get(id) {
            subs.remove(topic);
        }
        self.drop_membership(topic, id);
        debug!(connection = %id, topic, "Unsubscribed");
    }

    /// Refresh a connection's last-activity timestamp.
    pub fn touch(&self, id: &ConnectionId) {
        if let Some(entry) = self.connections.get(id) {
            entry.last_activity.store(now_millis(), Ordering::Relaxed);
        }
    }

    /// Connections whose last activity is older than the threshold.
    #[must_use]
    pub fn stale(&self, threshold: Duration) -> Vec<ConnectionId> {
        let cutoff = now_millis().saturating_sub(threshold.as_millis() as u64);
        self.connections
            .iter()
            .filter(|e| e.value().last_activity() < cutoff)
            .map(|e| e.key().clone())
            .collect()
    }

    /// The local delivery targets for an event.
    ///
    /// All connections when `topic` is absent, else the topic's members.
    #[must_use]
    pub(crate) fn targets(&self, topic: Option<&str>) -> Vec<(ConnectionId, Arc<ConnectionEntry>)> {
        match topic {
            None => self
                .connections
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            Some(topic) => {
                let Some(members) = self.topics.get(topic) else {
                    return Vec::new();
                };
                members
                    .iter()
                    .filter_map(|id| {
                        self.connections
                            .get(id.key())
                            .map(|e| (id.key().clone(), e.value().clone()))
                    })
                    .collect()
            }
        }
    }

    /// Whether a connection is live.
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the registry has no connections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Health snapshot: live connection count and topics with members.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            active_connections: self.connections.len(),
            topics: self.topics.iter().map(|e| e.key().clone()).collect(),
        }
    }

    /// Close every connection's queue, waking their tasks for shutdown.
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.value().queue.close();
        }
    }
}

fn recovery_key(id: &ConnectionId) -> String {
    format!("beacon:conn:{id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::InMemoryRecoveryStore;
    use beacon_protocol::event::kinds;

    fn registry_with_store() -> (Registry, Arc<InMemoryRecoveryStore>) {
        let store = Arc::new(InMemoryRecoveryStore::new());
        let config = RegistryConfig {
            instance_id: "inst-test".to_string(),
            queue_capacity: 16,
            recovery_ttl: Duration::from_secs(60),
        };
        (Registry::new(config, store.clone()), store)
    }

    #[tokio::test]
    async fn test_admit_sends_ack_and_records_liveness() {
        let (registry, store) = registry_with_store();

        let (id, queue) = registry.admit().await;
        assert!(registry.contains(&id));
        assert_eq!(registry.len(), 1);

        let ack = queue.try_pop().unwrap();
        assert_eq!(ack.kind, kinds::CONNECTION_ACK);
        assert_eq!(ack.payload["connection_id"], id.as_str());

        assert!(store.get(&format!("beacon:conn:{id}")).is_some());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (registry, store) = registry_with_store();
        let (id, queue) = registry.admit().await;

        registry.remove(&id).await;
        assert!(!registry.contains(&id));
        assert!(queue.is_closed());
        assert!(store.get(&format!("beacon:conn:{id}")).is_none());

        // Second removal leaves state identical.
        registry.remove(&id).await;
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_unsubscribe_idempotent() {
        let (registry, _) = registry_with_store();
        let (id, _queue) = registry.admit().await;

        registry.subscribe(&id, "proj-1");
        registry.subscribe(&id, "proj-1");
        assert_eq!(registry.targets(Some("proj-1")).len(), 1);

        registry.unsubscribe(&id, "proj-1");
        registry.unsubscribe(&id, "proj-1");
        assert!(registry.targets(Some("proj-1")).is_empty());

        // Unknown connections never raise.
        registry.subscribe(&ConnectionId::from("conn_gone"), "proj-1");
        registry.unsubscribe(&ConnectionId::from("conn_gone"), "proj-1");
        assert!(registry.targets(Some("proj-1")).is_empty());
    }

    #[tokio::test]
    async fn test_remove_clears_topic_index() {
        let (registry, _) = registry_with_store();
        let (id, _queue) = registry.admit().await;

        registry.subscribe(&id, "proj-1");
        registry.subscribe(&id, "proj-2");
        registry.remove(&id).await;

        assert!(registry.targets(Some("proj-1")).is_empty());
        assert!(registry.targets(Some("proj-2")).is_empty());
        assert!(registry.snapshot().topics.is_empty());
    }

    #[tokio::test]
    async fn test_targets_without_topic_hit_everyone() {
        let (registry, _) = registry_with_store();
        let (a, _qa) = registry.admit().await;
        let (_b, _qb) = registry.admit().await;

        registry.subscribe(&a, "proj-1");

        assert_eq!(registry.targets(None).len(), 2);
        assert_eq!(registry.targets(Some("proj-1")).len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_lists_topics_with_members() {
        let (registry, _) = registry_with_store();
        let (a, _qa) = registry.admit().await;
        registry.subscribe(&a, "proj-1");

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.topics, vec!["proj-1".to_string()]);
    }

    #[tokio::test]
    async fn test_stale_detection() {
        let (registry, _) = registry_with_store();
        let (a, _qa) = registry.admit().await;

        assert!(registry.stale(Duration::from_secs(60)).is_empty());
        // A zero threshold makes any connection stale on the next scan.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(registry.stale(Duration::from_millis(1)), vec![a]);
    }
}
