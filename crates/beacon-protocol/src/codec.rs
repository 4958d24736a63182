//! Encoding and decoding of wire records.
//!
//! Everything on the wire is a single JSON object per transport message;
//! the transport's own framing delimits records, so no length prefix is
//! needed. The same encoding is used on the cross-instance bus channel.

use bytes::Bytes;
use thiserror::Error;

use crate::event::Event;
use crate::messages::ClientMessage;

/// Maximum accepted record size (64 KiB).
pub const MAX_RECORD_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Record exceeds maximum size.
    #[error("Record size {0} exceeds maximum {MAX_RECORD_SIZE}")]
    RecordTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Record is not valid UTF-8.
    #[error("Record is not valid UTF-8")]
    NotUtf8,
}

/// Encode an event as a JSON text record.
///
/// # Errors
///
/// Returns an error if the event is too large or serialization fails.
pub fn encode(event: &Event) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(event)?;
    if text.len() > MAX_RECORD_SIZE {
        return Err(ProtocolError::RecordTooLarge(text.len()));
    }
    Ok(text)
}

/// Encode an event for the bus channel.
///
/// # Errors
///
/// Returns an error if the event is too large or serialization fails.
pub fn encode_bytes(event: &Event) -> Result<Bytes, ProtocolError> {
    encode(event).map(Bytes::from)
}

/// Decode an event from a JSON text record.
///
/// # Errors
///
/// Returns an error if the record is oversized or not a valid event.
pub fn decode(text: &str) -> Result<Event, ProtocolError> {
    if text.len() > MAX_RECORD_SIZE {
        return Err(ProtocolError::RecordTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

/// Decode an event from raw bus bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not UTF-8 or not a valid event.
pub fn decode_bytes(bytes: &[u8]) -> Result<Event, ProtocolError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::NotUtf8)?;
    decode(text)
}

/// Decode an inbound client control message.
///
/// # Errors
///
/// Returns an error for malformed records or unrecognized message types;
/// callers log and ignore these without closing the connection.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    if text.len() > MAX_RECORD_SIZE {
        return Err(ProtocolError::RecordTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_roundtrip() {
        let mut event = Event::new("file.uploaded")
            .with_topic("proj-1")
            .with_payload(json!({"name": "a.png"}));
        event.stamp("inst-a");

        let text = encode(&event).unwrap();
        let decoded = decode(&text).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn test_absent_fields_are_omitted() {
        let event = Event::new("system.heartbeat");
        let text = encode(&event).unwrap();
        assert!(!text.contains("topic"));
        assert!(!text.contains("origin"));
    }

    #[test]
    fn test_oversized_record_rejected() {
        let event = Event::new("blob").with_payload(json!({
            "data": "x".repeat(MAX_RECORD_SIZE)
        }));
        assert!(matches!(
            encode(&event),
            Err(ProtocolError::RecordTooLarge(_))
        ));
    }

    #[test]
    fn test_decode_bytes_rejects_non_utf8() {
        assert!(matches!(
            decode_bytes(&[0xff, 0xfe, 0x00]),
            Err(ProtocolError::NotUtf8)
        ));
    }

    #[test]
    fn test_decode_client_message() {
        let msg = decode_client_message(r#"{"type":"subscribe","topic":"proj-1"}"#).unwrap();
        assert!(matches!(msg, crate::ClientMessage::Subscribe { .. }));
        assert!(decode_client_message("not json").is_err());
    }
}
