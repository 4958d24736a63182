//! # beacon-protocol
//!
//! Wire-message contract for the Beacon event broadcast service.
//!
//! All traffic is text: JSON records on the client transport and the same
//! encoding on the cross-instance bus channel. This crate defines:
//!
//! - `Event` - the outbound broadcast record (`type`, optional `topic`,
//!   `payload`, `timestamp`, `origin`)
//! - `ClientMessage` - the inbound control messages (`subscribe`,
//!   `unsubscribe`, `ping`)
//! - `codec` - encode/decode helpers and protocol errors
//!
//! ## Example
//!
//! ```rust
//! use beacon_protocol::{codec, Event};
//!
//! let event = Event::new("file.uploaded")
//!     .with_topic("proj-1")
//!     .with_payload(serde_json::json!({"name": "a.png"}));
//!
//! let encoded = codec::encode(&event).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(event.kind, decoded.kind);
//! ```

pub mod codec;
pub mod event;
pub mod messages;

pub use codec::ProtocolError;
pub use event::{DeliveryClass, Event};
pub use messages::ClientMessage;
