//! The broadcast event record.
//!
//! Events are immutable once published and are shared by `Arc` for zero-copy
//! fan-out across connections. A missing `topic` means global broadcast to
//! every connected client regardless of subscription.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Well-known event kinds emitted by the service itself.
pub mod kinds {
    /// Periodic liveness event, broadcast to all connections.
    pub const HEARTBEAT: &str = "system.heartbeat";
    /// First event a connection receives; payload carries its id.
    pub const CONNECTION_ACK: &str = "connection.ack";
    /// Instructs all clients (on every instance) to reconnect and
    /// re-issue their subscriptions after an abnormal restart.
    pub const RECONNECT_REQUESTED: &str = "session.reconnect";
}

/// Maximum topic name length.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Validate a topic name.
///
/// # Errors
///
/// Returns an error message if the topic name is invalid.
pub fn validate_topic(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Topic cannot be empty");
    }
    if name.len() > MAX_TOPIC_LENGTH {
        return Err("Topic too long");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Topic contains invalid characters");
    }
    Ok(())
}

/// Delivery class used by the backpressure drop policy.
///
/// When a connection's outbound queue overflows, the oldest `Heartbeat` is
/// dropped first, then the oldest `Info`. `Control` events are never dropped;
/// if the queue is still full the connection is evicted instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeliveryClass {
    Heartbeat,
    Info,
    Control,
}

/// A broadcast event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event kind, e.g. `file.uploaded` or `system.heartbeat`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Filtering key; absent means fan-out to every local connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    /// Arbitrary structured payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,

    /// Epoch milliseconds, stamped by the dispatcher at publish time
    /// when the producer left it absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,

    /// Id of the instance that created the event. Used for echo
    /// suppression on the bus, stamped at publish time when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl Event {
    /// Create a new event with the given kind.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            topic: None,
            payload: Value::Null,
            timestamp: None,
            origin: None,
        }
    }

    /// Set the topic.
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the origin instance id.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// The periodic liveness event.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self::new(kinds::HEARTBEAT)
    }

    /// The admission acknowledgement carrying the connection's id.
    #[must_use]
    pub fn connection_ack(connection_id: &str) -> Self {
        Self::new(kinds::CONNECTION_ACK)
            .with_payload(serde_json::json!({ "connection_id": connection_id }))
    }

    /// The reconnect-requested broadcast sent after an abnormal restart.
    #[must_use]
    pub fn reconnect_requested() -> Self {
        Self::new(kinds::RECONNECT_REQUESTED)
    }

    /// The delivery class of this event.
    #[must_use]
    pub fn class(&self) -> DeliveryClass {
        match self.kind.as_str() {
            kinds::HEARTBEAT => DeliveryClass::Heartbeat,
            kinds::CONNECTION_ACK | kinds::RECONNECT_REQUESTED => DeliveryClass::Control,
            _ => DeliveryClass::Info,
        }
    }

    /// Stamp the timestamp and origin if the producer left them absent.
    pub fn stamp(&mut self, origin: &str) {
        if self.timestamp.is_none() {
            self.timestamp = Some(now_millis());
        }
        if self.origin.is_none() {
            self.origin = Some(origin.to_string());
        }
    }

    /// Whether this event originated at the given instance.
    #[must_use]
    pub fn originated_at(&self, instance_id: &str) -> bool {
        self.origin.as_deref() == Some(instance_id)
    }
}

/// Current time as epoch milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
