//! # beacon-core
//!
//! Connection registry, event dispatch, and cross-instance fan-out for the
//! Beacon event broadcast service.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Registry** - per-instance table of live connections and subscriptions
//! - **Dispatcher** - routes events to local connections and the Topic Bus
//! - **TopicBus** - capability interface for the cross-instance channel
//! - **HeartbeatMonitor** - liveness events and stale-connection eviction
//! - **RecoveryStore** / **RecoveryCoordinator** - restart signalling
//! - **EventProducers** - typed publish wrappers for the surrounding system
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Producers  │────▶│ Dispatcher  │────▶│  Registry   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐
//!                     │  Topic Bus  │──▶ peer instances
//!                     └─────────────┘
//! ```

pub mod bus;
pub mod dispatcher;
pub mod heartbeat;
pub mod outbound;
pub mod producers;
pub mod recovery;
pub mod registry;

pub use bus::{BusError, InMemoryBus, TopicBus};
pub use dispatcher::{Dispatcher, DispatcherConfig, PublishHandle};
pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor};
pub use outbound::{OutboundQueue, PushOutcome};
pub use producers::EventProducers;
pub use recovery::{InMemoryRecoveryStore, RecoveryCoordinator, RecoveryError, RecoveryStore};
pub use registry::{ConnectionId, Registry, RegistryConfig, RegistrySnapshot};
