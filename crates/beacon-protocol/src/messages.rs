//! Inbound client control messages.
//!
//! Clients drive their subscriptions with small JSON records. A message
//! with an unrecognized `type` is not a protocol error: the connection
//! handler logs it and leaves the connection open.

use serde::{Deserialize, Serialize};

/// A control message sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Subscribe to a topic.
    Subscribe {
        /// Topic to subscribe to.
        topic: String,
    },

    /// Unsubscribe from a topic.
    Unsubscribe {
        /// Topic to unsubscribe from.
        topic: String,
    },

    /// Liveness probe; refreshes the connection's activity timestamp.
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscribe() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","topic":"proj-1"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                topic: "proj-1".to_string()
            }
        );
    }

    #[test]
    fn test_parse_ping() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        // The handler treats this as ignorable, not as a closed connection.
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"frobnicate"}"#).is_err());
    }

    #[test]
    fn test_roundtrip_unsubscribe() {
        let msg = ClientMessage::Unsubscribe {
            topic: "proj-2".to_string(),
        };
        let text = serde_json::to_string(&msg).unwrap();
        assert_eq!(serde_json::from_str::<ClientMessage>(&text).unwrap(), msg);
    }
}
