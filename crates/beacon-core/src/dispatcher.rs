//! Event dispatch: local fan-out plus cross-instance propagation.
//!
//! `publish` is the single entry point for all producers. Locally originated
//! events are republished to the Topic Bus (best effort) so peer instances
//! can deliver them to their own clients; events arriving from the bus are
//! delivered locally after echo suppression. Delivery to each connection is
//! independent: one broken or saturated connection is evicted without
//! affecting the others, and nothing propagates back to producers.

use crate::bus::TopicBus;
use crate::outbound::PushOutcome;
use crate::registry::{ConnectionId, Registry};
use beacon_protocol::{codec, Event};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Well-known bus channel carrying all cross-instance traffic.
    pub bus_channel: String,
    /// Capacity of the producer intake queue.
    pub intake_capacity: usize,
    /// Initial delay before resubscribing to a lost bus connection.
    pub reconnect_backoff: Duration,
    /// Upper bound on the reconnect backoff.
    pub reconnect_backoff_max: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            bus_channel: "beacon:events".to_string(),
            intake_capacity: 1024,
            reconnect_backoff: Duration::from_millis(500),
            reconnect_backoff_max: Duration::from_secs(30),
        }
    }
}

/// Routes events to matching local connections and to the Topic Bus.
pub struct Dispatcher {
    registry: Arc<Registry>,
    bus: Arc<dyn TopicBus>,
    config: DispatcherConfig,
    bus_connected: AtomicBool,
}

impl Dispatcher {
    /// Create a dispatcher over the instance's registry and bus.
    #[must_use]
    pub fn new(registry: Arc<Registry>, bus: Arc<dyn TopicBus>, config: DispatcherConfig) -> Self {
        Self {
            registry,
            bus,
            config,
            bus_connected: AtomicBool::new(false),
        }
    }

    /// Whether the bus subscription is currently live.
    #[must_use]
    pub fn bus_connected(&self) -> bool {
        self.bus_connected.load(Ordering::Relaxed)
    }

    /// Publish an event.
    ///
    /// Fire and forget from the producer's perspective: timestamp and origin
    /// are stamped if absent, a locally originated event is republished to
    /// the bus (a bus failure is logged and does not block local delivery),
    /// and the event is fanned out to matching local connections.
    pub async fn publish(&self, mut event: Event) {
        event.stamp(self.registry.instance_id());

        if event.originated_at(self.registry.instance_id()) {
            self.republish(&event).await;
        }

        self.dispatch_local(Arc::new(event)).await;
    }

    async fn republish(&self, event: &Event) {
        let payload = match codec::encode_bytes(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(kind = %event.kind, error = %e, "Failed to encode event for bus");
                return;
            }
        };
        if let Err(e) = self.bus.publish(&self.config.bus_channel, payload).await {
            warn!(kind = %event.kind, error = %e, "Bus publish failed, event stays instance-local");
            self.bus_connected.store(false, Ordering::Relaxed);
        }
    }

    /// Deliver an event to the matching local connections.
    ///
    /// A connection whose queue overflows is evicted; the rest of the
    /// target set is unaffected.
    pub(crate) async fn dispatch_local(&self, event: Arc<Event>) {
        let targets = self.registry.targets(event.topic.as_deref());
        let mut evict: Vec<ConnectionId> = Vec::new();

        for (id, entry) in targets {
            match entry.push(event.clone()) {
                PushOutcome::Queued => {}
                PushOutcome::Shed => {
                    debug!(connection = %id, kind = %event.kind, "Shed older event under backpressure");
                }
                PushOutcome::Overflow => evict.push(id),
                PushOutcome::Closed => {}
            }
        }

        trace!(kind = %event.kind, topic = ?event.topic, "Dispatched event");

        for id in evict {
            warn!(connection = %id, "Outbound queue overflow, evicting connection");
            self.registry.remove(&id).await;
        }
    }

    /// Run the bus receive loop until shutdown.
    ///
    /// The sole reader of the instance's bus subscription. Resubscribes with
    /// exponential backoff when the bus drops; while disconnected the
    /// instance runs degraded (events stay instance-local) and the condition
    /// is visible only through the health surface.
    pub async fn run_bus_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.config.reconnect_backoff;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.bus.subscribe(&self.config.bus_channel).await {
                Ok(mut rx) => {
                    info!(channel = %self.config.bus_channel, "Subscribed to topic bus");
                    self.bus_connected.store(true, Ordering::Relaxed);
                    backoff = self.config.reconnect_backoff;

                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    self.bus_connected.store(false, Ordering::Relaxed);
                                    return;
                                }
                            }
                            received = rx.recv() => match received {
                                Some(payload) => self.handle_bus_payload(&payload).await,
                                None => {
                                    warn!("Topic bus stream ended");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Topic bus subscribe failed");
                }
            }

            self.bus_connected.store(false, Ordering::Relaxed);
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.reconnect_backoff_max);
        }

        self.bus_connected.store(false, Ordering::Relaxed);
    }

    async fn handle_bus_payload(&self, payload: &[u8]) {
        match codec::decode_bytes(payload) {
            Ok(event) => {
                // Echo suppression: our own events already went out locally.
                if event.originated_at(self.registry.instance_id()) {
                    trace!(kind = %event.kind, "Suppressed bus echo");
                    return;
                }
                self.dispatch_local(Arc::new(event)).await;
            }
            Err(e) => {
                warn!(error = %e, "Ignoring malformed bus payload");
            }
        }
    }

    /// Create a bounded hand-off queue into the dispatcher's domain.
    ///
    /// Spawns the intake task draining the queue in FIFO order; the handle
    /// is the publish surface for producers outside the async domain.
    #[must_use]
    pub fn intake(self: &Arc<Self>) -> PublishHandle {
        let (tx, mut rx) = mpsc::channel::<Event>(self.config.intake_capacity);
        let dispatcher = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatcher.publish(event).await;
            }
            debug!("Dispatcher intake closed");
        });
        PublishHandle { tx }
    }
}

/// Cloneable fire-and-forget publish handle for producers.
#[derive(Clone)]
pub struct PublishHandle {
    tx: mpsc::Sender<Event>,
}

impl PublishHandle {
    /// Publish an event, waiting for intake capacity.
    pub async fn send(&self, event: Event) {
        if self.tx.send(event).await.is_err() {
            warn!("Dispatcher intake gone, dropping event");
        }
    }

    /// Publish from synchronous code; drops the event if intake is full.
    pub fn try_send(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(kind = %event.kind, "Dispatcher intake full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Dispatcher intake gone, dropping event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusError, InMemoryBus};
    use crate::recovery::InMemoryRecoveryStore;
    use crate::registry::RegistryConfig;
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;
    use tokio::time::timeout;

    fn make_registry(instance_id: &str, queue_capacity: usize) -> Arc<Registry> {
        Arc::new(Registry::new(
            RegistryConfig {
                instance_id: instance_id.to_string(),
                queue_capacity,
                recovery_ttl: Duration::from_secs(60),
            },
            Arc::new(InMemoryRecoveryStore::new()),
        ))
    }

    fn make_dispatcher(registry: Arc<Registry>, bus: Arc<dyn TopicBus>) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(registry, bus, DispatcherConfig::default()))
    }

    async fn next_kind(queue: &Arc<crate::outbound::OutboundQueue>) -> String {
        timeout(Duration::from_secs(1), queue.pop())
            .await
            .expect("timed out waiting for event")
            .expect("queue closed")
            .kind
            .clone()
    }

    /// Drain the admission ack so tests see only published events.
    async fn admit_clean(registry: &Registry) -> (ConnectionId, Arc<crate::outbound::OutboundQueue>) {
        let (id, queue) = registry.admit().await;
        let ack = queue.try_pop().unwrap();
        assert_eq!(ack.kind, beacon_protocol::event::kinds::CONNECTION_ACK);
        (id, queue)
    }

    #[tokio::test]
    async fn test_topic_fan_out_is_exact() {
        let registry = make_registry("inst-a", 16);
        let dispatcher = make_dispatcher(registry.clone(), Arc::new(InMemoryBus::new()));

        let (x, x_queue) = admit_clean(&registry).await;
        let (y, y_queue) = admit_clean(&registry).await;
        registry.subscribe(&x, "proj-1");
        registry.subscribe(&y, "proj-2");

        dispatcher
            .publish(
                Event::new("file.uploaded")
                    .with_topic("proj-1")
                    .with_payload(json!({"name": "a.png"})),
            )
            .await;

        let event = timeout(Duration::from_secs(1), x_queue.pop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, "file.uploaded");
        assert_eq!(event.payload["name"], "a.png");
        assert!(event.timestamp.is_some());

        assert!(y_queue.is_empty());
    }

    #[tokio::test]
    async fn test_absent_topic_reaches_all_connections() {
        let registry = make_registry("inst-a", 16);
        let dispatcher = make_dispatcher(registry.clone(), Arc::new(InMemoryBus::new()));

        let (x, x_queue) = admit_clean(&registry).await;
        let (_y, y_queue) = admit_clean(&registry).await;
        registry.subscribe(&x, "proj-1");

        dispatcher.publish(Event::heartbeat()).await;

        assert_eq!(next_kind(&x_queue).await, "system.heartbeat");
        assert_eq!(next_kind(&y_queue).await, "system.heartbeat");
    }

    #[tokio::test]
    async fn test_per_connection_fifo() {
        let registry = make_registry("inst-a", 64);
        let dispatcher = make_dispatcher(registry.clone(), Arc::new(InMemoryBus::new()));

        let (x, x_queue) = admit_clean(&registry).await;
        registry.subscribe(&x, "proj-1");

        for n in 0..10 {
            dispatcher
                .publish(
                    Event::new("task.progress")
                        .with_topic("proj-1")
                        .with_payload(json!({ "seq": n })),
                )
                .await;
        }

        for n in 0..10 {
            let event = x_queue.pop().await.unwrap();
            assert_eq!(event.payload["seq"], n);
        }
    }

    #[tokio::test]
    async fn test_cross_instance_delivery_without_echo() {
        let bus: Arc<dyn TopicBus> = Arc::new(InMemoryBus::new());
        let registry_a = make_registry("inst-a", 16);
        let registry_b = make_registry("inst-b", 16);
        let dispatcher_a = make_dispatcher(registry_a.clone(), bus.clone());
        let dispatcher_b = make_dispatcher(registry_b.clone(), bus.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let loop_a = tokio::spawn(dispatcher_a.clone().run_bus_loop(shutdown_rx.clone()));
        let loop_b = tokio::spawn(dispatcher_b.clone().run_bus_loop(shutdown_rx.clone()));
        // Let both instances establish their bus subscriptions.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dispatcher_a.bus_connected());
        assert!(dispatcher_b.bus_connected());

        let (a_conn, a_queue) = admit_clean(&registry_a).await;
        let (b_conn, b_queue) = admit_clean(&registry_b).await;
        registry_a.subscribe(&a_conn, "proj-1");
        registry_b.subscribe(&b_conn, "proj-1");

        dispatcher_a
            .publish(Event::new("task.completed").with_topic("proj-1"))
            .await;

        assert_eq!(next_kind(&a_queue).await, "task.completed");
        assert_eq!(next_kind(&b_queue).await, "task.completed");

        // Exactly once each: A's own bus subscription must not echo.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a_queue.is_empty());
        assert!(b_queue.is_empty());

        shutdown_tx.send(true).unwrap();
        let _ = loop_a.await;
        let _ = loop_b.await;
    }

    #[tokio::test]
    async fn test_backpressure_evicts_only_the_slow_connection() {
        let registry = make_registry("inst-a", 4);
        let dispatcher = make_dispatcher(registry.clone(), Arc::new(InMemoryBus::new()));

        let (slow, slow_queue) = admit_clean(&registry).await;
        let (fast, fast_queue) = admit_clean(&registry).await;
        registry.subscribe(&slow, "proj-1");
        registry.subscribe(&fast, "proj-1");

        // The slow consumer never pops. The shed policy absorbs
        // informational overflow, so fill its queue with control events to
        // force a hard overflow on the first publish.
        for _ in 0..4 {
            slow_queue.push(Arc::new(Event::connection_ack(slow.as_str())));
        }

        for n in 0..4 {
            dispatcher
                .publish(
                    Event::new("file.uploaded")
                        .with_topic("proj-1")
                        .with_payload(json!({ "seq": n })),
                )
                .await;
        }

        assert!(!registry.contains(&slow));
        assert!(registry.contains(&fast));

        // The fast connection saw its entire stream.
        for n in 0..4 {
            let event = fast_queue.pop().await.unwrap();
            assert_eq!(event.payload["seq"], n);
        }
    }

    struct FailingBus;

    #[async_trait]
    impl TopicBus for FailingBus {
        async fn publish(&self, _channel: &str, _payload: Bytes) -> Result<(), BusError> {
            Err(BusError::Publish("connection refused".to_string()))
        }

        async fn subscribe(&self, _channel: &str) -> Result<mpsc::Receiver<Bytes>, BusError> {
            Err(BusError::Subscribe("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_bus_failure_does_not_block_local_delivery() {
        let registry = make_registry("inst-a", 16);
        let dispatcher = make_dispatcher(registry.clone(), Arc::new(FailingBus));

        let (x, x_queue) = admit_clean(&registry).await;
        registry.subscribe(&x, "proj-1");

        dispatcher
            .publish(Event::new("file.uploaded").with_topic("proj-1"))
            .await;

        assert_eq!(next_kind(&x_queue).await, "file.uploaded");
        assert!(!dispatcher.bus_connected());
    }

    struct CountingBus {
        publishes: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl TopicBus for CountingBus {
        async fn publish(&self, _channel: &str, _payload: Bytes) -> Result<(), BusError> {
            self.publishes
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(())
        }

        async fn subscribe(&self, _channel: &str) -> Result<mpsc::Receiver<Bytes>, BusError> {
            Err(BusError::Subscribe("unused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_remote_origin_events_are_not_republished() {
        let registry = make_registry("inst-a", 16);
        let bus = Arc::new(CountingBus {
            publishes: std::sync::atomic::AtomicUsize::new(0),
        });
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            bus.clone(),
            DispatcherConfig::default(),
        ));
        let (_x, x_queue) = admit_clean(&registry).await;

        let mut remote = Event::new("task.completed");
        remote.stamp("inst-b");
        dispatcher.publish(remote).await;

        assert_eq!(next_kind(&x_queue).await, "task.completed");
        assert_eq!(
            bus.publishes.load(std::sync::atomic::Ordering::Relaxed),
            0
        );

        // A locally originated event does go out to the bus.
        dispatcher.publish(Event::new("file.uploaded")).await;
        assert_eq!(
            bus.publishes.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_intake_handle_preserves_order() {
        let registry = make_registry("inst-a", 64);
        let dispatcher = make_dispatcher(registry.clone(), Arc::new(InMemoryBus::new()));
        let handle = dispatcher.intake();

        let (_x, x_queue) = admit_clean(&registry).await;

        for n in 0..5 {
            handle
                .send(Event::new("process.started").with_payload(json!({ "seq": n })))
                .await;
        }

        for n in 0..5 {
            let event = timeout(Duration::from_secs(1), x_queue.pop())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.payload["seq"], n);
        }
    }
}
