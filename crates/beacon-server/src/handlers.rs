//! Connection handlers for the Beacon server.
//!
//! One task per WebSocket connection: the select loop pumps the connection's
//! outbound queue to the socket and parses inbound control messages. The
//! registry, dispatcher, heartbeat monitor, and bus loop are wired up here
//! with an explicit lifecycle: created at startup, torn down cooperatively
//! at shutdown.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::redis_bus::{RedisBus, RedisRecoveryStore};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use beacon_core::{
    ConnectionId, Dispatcher, DispatcherConfig, HeartbeatConfig, HeartbeatMonitor, InMemoryBus,
    InMemoryRecoveryStore, RecoveryCoordinator, RecoveryStore, Registry, RegistryConfig, TopicBus,
};
use beacon_protocol::{
    codec,
    event::{now_millis, validate_topic},
    ClientMessage,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The connection registry.
    pub registry: Arc<Registry>,
    /// The event dispatcher.
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    /// Wire up the registry and dispatcher from configuration.
    #[must_use]
    pub fn new(config: &Config, bus: Arc<dyn TopicBus>, recovery: Arc<dyn RecoveryStore>) -> Self {
        let registry = Arc::new(Registry::new(
            RegistryConfig {
                instance_id: config.instance_id.clone(),
                queue_capacity: config.delivery.queue_capacity,
                recovery_ttl: config.recovery_ttl(),
            },
            recovery,
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            bus,
            DispatcherConfig {
                bus_channel: config.bus.channel.clone(),
                intake_capacity: config.delivery.intake_capacity,
                ..DispatcherConfig::default()
            },
        ));

        Self {
            registry,
            dispatcher,
        }
    }
}

/// Run the server until shutdown.
///
/// `crashed` is the external restart verdict (crash marker / supervisor
/// flag); when set, a reconnect request is broadcast before serving.
///
/// # Errors
///
/// Returns an error if the bus or recovery store URLs are invalid or the
/// listener cannot bind.
pub async fn run_server(config: Config, crashed: bool) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let (bus, recovery): (Arc<dyn TopicBus>, Arc<dyn RecoveryStore>) = if config.bus.enabled {
        (
            Arc::new(RedisBus::new(&config.bus.url)?),
            Arc::new(RedisRecoveryStore::new(&config.bus.url)?),
        )
    } else {
        info!("Topic bus disabled, events stay instance-local");
        (
            Arc::new(InMemoryBus::new()),
            Arc::new(InMemoryRecoveryStore::new()),
        )
    };

    let state = Arc::new(AppState::new(&config, bus, recovery));

    // Background tasks share one cooperative shutdown signal.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bus_task = tokio::spawn(
        state
            .dispatcher
            .clone()
            .run_bus_loop(shutdown_rx.clone()),
    );
    let heartbeat = HeartbeatMonitor::new(
        state.dispatcher.clone(),
        state.registry.clone(),
        HeartbeatConfig {
            interval: config.heartbeat_interval(),
            staleness: config.heartbeat_staleness(),
        },
    );
    let heartbeat_task = tokio::spawn(heartbeat.run(shutdown_rx));

    RecoveryCoordinator::new(state.dispatcher.clone())
        .announce_restart(crashed)
        .await;

    let app = Router::new()
        .route(&config.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state.clone());

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Beacon instance {} listening on {}", config.instance_id, addr);
    info!("WebSocket endpoint: ws://{}{}", addr, config.websocket_path);

    let server = async move { axum::serve(listener, app).await };
    tokio::select! {
        result = server => result?,
        () = shutdown_signal() => info!("Shutdown signal received"),
    }

    // Cooperative teardown: stop the background tasks and close every
    // outbound queue so connection tasks send their close frames and exit.
    let _ = shutdown_tx.send(true);
    state.registry.close_all();

    let drained = tokio::time::timeout(config.shutdown_grace(), async {
        let _ = bus_task.await;
        let _ = heartbeat_task.await;
        while !state.registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!("Grace period elapsed with connections still open, forcing shutdown");
    }

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot();
    Json(serde_json::json!({
        "active_connections": snapshot.active_connections,
        "bus_connected": state.dispatcher.bus_connected(),
        "timestamp": now_millis(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection from admission to removal.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (connection_id, queue) = state.registry.admit().await;
    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            biased;

            // Deliver queued events to the client
            event = queue.pop() => match event {
                Some(event) => {
                    match codec::encode(&event) {
                        Ok(text) => {
                            metrics::record_event("outbound");
                            if sender.send(Message::Text(text)).await.is_err() {
                                // Transient delivery failure: isolated to
                                // this connection, evicted below.
                                break;
                            }
                        }
                        Err(e) => {
                            // An event is atomic: fully serialized or not sent.
                            error!(connection = %connection_id, error = %e, "Dropping unserializable event");
                            metrics::record_error("encode");
                        }
                    }
                }
                None => {
                    // Evicted or shutting down: best-effort close frame.
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },

            // Receive from the client
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    state.registry.touch(&connection_id);
                    metrics::record_event("inbound");
                    handle_client_message(&text, &connection_id, &state);
                }
                Some(Ok(Message::Binary(data))) => {
                    state.registry.touch(&connection_id);
                    metrics::record_event("inbound");
                    match std::str::from_utf8(&data) {
                        Ok(text) => handle_client_message(text, &connection_id, &state),
                        Err(_) => {
                            warn!(connection = %connection_id, "Ignoring non-UTF-8 message");
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    state.registry.touch(&connection_id);
                    if sender.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    state.registry.touch(&connection_id);
                }
                Some(Ok(Message::Close(_))) => {
                    debug!(connection = %connection_id, "Received close frame");
                    break;
                }
                Some(Err(e)) => {
                    warn!(connection = %connection_id, error = %e, "WebSocket error");
                    metrics::record_error("websocket");
                    break;
                }
                None => {
                    debug!(connection = %connection_id, "WebSocket stream ended");
                    break;
                }
            }
        }
    }

    state.registry.remove(&connection_id).await;
    metrics::set_active_topics(state.registry.snapshot().topics.len());

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Handle one inbound control message.
///
/// Malformed records and unrecognized message types are logged and ignored;
/// the connection stays open.
fn handle_client_message(text: &str, connection_id: &ConnectionId, state: &Arc<AppState>) {
    match codec::decode_client_message(text) {
        Ok(ClientMessage::Subscribe { topic }) => {
            if let Err(reason) = validate_topic(&topic) {
                warn!(connection = %connection_id, topic = %topic, reason, "Ignoring subscribe to invalid topic");
                return;
            }
            state.registry.subscribe(connection_id, &topic);
            metrics::set_active_topics(state.registry.snapshot().topics.len());
        }
        Ok(ClientMessage::Unsubscribe { topic }) => {
            state.registry.unsubscribe(connection_id, &topic);
            metrics::set_active_topics(state.registry.snapshot().topics.len());
        }
        Ok(ClientMessage::Ping) => {
            // Activity timestamp already refreshed by the caller.
        }
        Err(e) => {
            debug!(connection = %connection_id, error = %e, "Ignoring unrecognized client message");
            metrics::record_error("client_message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> Arc<AppState> {
        let config = Config {
            instance_id: "inst-test".to_string(),
            ..Config::default()
        };
        Arc::new(AppState::new(
            &config,
            Arc::new(InMemoryBus::new()),
            Arc::new(InMemoryRecoveryStore::new()),
        ))
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe_messages() {
        let state = test_state();
        let (id, _queue) = state.registry.admit().await;

        handle_client_message(r#"{"type":"subscribe","topic":"proj-1"}"#, &id, &state);
        assert_eq!(state.registry.snapshot().topics, vec!["proj-1".to_string()]);

        handle_client_message(r#"{"type":"unsubscribe","topic":"proj-1"}"#, &id, &state);
        assert!(state.registry.snapshot().topics.is_empty());
    }

    #[tokio::test]
    async fn test_unrecognized_messages_are_ignored() {
        let state = test_state();
        let (id, _queue) = state.registry.admit().await;

        handle_client_message(r#"{"type":"frobnicate"}"#, &id, &state);
        handle_client_message("not json at all", &id, &state);
        handle_client_message(r#"{"type":"subscribe","topic":""}"#, &id, &state);

        // Connection untouched, nothing subscribed.
        assert!(state.registry.contains(&id));
        assert!(state.registry.snapshot().topics.is_empty());
    }
}
