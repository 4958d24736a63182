//! Heartbeat monitor: periodic liveness events and stale-connection eviction.
//!
//! Each cycle broadcasts `system.heartbeat` to every connection (topic
//! absent) and evicts connections with no inbound activity past the
//! staleness threshold. The liveness event is informational; eviction is
//! this component's own enforcement and never waits on a client ack.

use crate::dispatcher::Dispatcher;
use crate::registry::Registry;
use beacon_protocol::Event;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Heartbeat configuration.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between cycles.
    pub interval: Duration,
    /// Inactivity threshold after which a connection is evicted.
    /// Conventionally twice the interval.
    pub staleness: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            staleness: Duration::from_secs(60),
        }
    }
}

/// Background task driving the heartbeat cycle.
pub struct HeartbeatMonitor {
    dispatcher: Arc<Dispatcher>,
    registry: Arc<Registry>,
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    /// Create a monitor over the instance's dispatcher and registry.
    #[must_use]
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        registry: Arc<Registry>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            dispatcher,
            registry,
            config,
        }
    }

    /// Run cycles until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately; the first cycle belongs one interval out
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Heartbeat monitor stopping");
                        return;
                    }
                }
                _ = ticker.tick() => self.cycle().await,
            }
        }
    }

    /// One cycle: broadcast liveness, then evict stale connections.
    pub async fn cycle(&self) {
        self.dispatcher.publish(Event::heartbeat()).await;

        for id in self.registry.stale(self.config.staleness) {
            warn!(connection = %id, "No inbound activity past staleness threshold, evicting");
            self.registry.remove(&id).await;
        }
    }
}
