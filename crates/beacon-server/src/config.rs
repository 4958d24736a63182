//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (BEACON_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Id of this service instance; generated when unset.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Topic Bus configuration.
    #[serde(default)]
    pub bus: BusConfig,

    /// Per-connection delivery limits.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,

    /// Session recovery configuration.
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Topic Bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Use the external bus; when disabled events stay instance-local.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Redis connection URL.
    #[serde(default = "default_bus_url")]
    pub url: String,

    /// Well-known channel carrying all cross-instance traffic.
    #[serde(default = "default_bus_channel")]
    pub channel: String,
}

/// Per-connection delivery limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Capacity of each connection's outbound queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Capacity of the producer intake queue.
    #[serde(default = "default_intake_capacity")]
    pub intake_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Inactivity threshold in milliseconds before eviction.
    #[serde(default = "default_heartbeat_staleness")]
    pub staleness_ms: u64,
}

/// Session recovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Recovery Record time-to-live in seconds.
    #[serde(default = "default_recovery_ttl")]
    pub ttl_secs: u64,

    /// Crash marker file; present at startup means the prior shutdown
    /// was abnormal.
    #[serde(default = "default_marker_path")]
    pub marker_path: String,

    /// Grace period in milliseconds for connection teardown at shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("BEACON_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("BEACON_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_instance_id() -> String {
    std::env::var("BEACON_INSTANCE_ID").unwrap_or_else(|_| {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        format!("inst_{nanos:x}")
    })
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_bus_url() -> String {
    std::env::var("BEACON_BUS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn default_bus_channel() -> String {
    "beacon:events".to_string()
}

fn default_queue_capacity() -> usize {
    256
}

fn default_intake_capacity() -> usize {
    1024
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_staleness() -> u64 {
    60_000 // 2x the interval
}

fn default_recovery_ttl() -> u64 {
    3600 // one hour
}

fn default_marker_path() -> String {
    "beacon.crash".to_string()
}

fn default_shutdown_grace() -> u64 {
    5_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            instance_id: default_instance_id(),
            websocket_path: default_ws_path(),
            bus: BusConfig::default(),
            delivery: DeliveryConfig::default(),
            heartbeat: HeartbeatSettings::default(),
            recovery: RecoveryConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_bus_url(),
            channel: default_bus_channel(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            intake_capacity: default_intake_capacity(),
        }
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            staleness_ms: default_heartbeat_staleness(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_recovery_ttl(),
            marker_path: default_marker_path(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "beacon.toml",
            "/etc/beacon/beacon.toml",
            "~/.config/beacon/beacon.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error for an unparseable host:port pair.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Heartbeat interval as a duration.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.interval_ms)
    }

    /// Staleness threshold as a duration.
    #[must_use]
    pub fn heartbeat_staleness(&self) -> Duration {
        Duration::from_millis(self.heartbeat.staleness_ms)
    }

    /// Recovery Record TTL as a duration.
    #[must_use]
    pub fn recovery_ttl(&self) -> Duration {
        Duration::from_secs(self.recovery.ttl_secs)
    }

    /// Shutdown grace period as a duration.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.recovery.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert!(config.bus.enabled);
        assert_eq!(config.bus.channel, "beacon:events");
        assert_eq!(config.heartbeat_staleness(), 2 * config.heartbeat_interval());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [bus]
            enabled = false

            [delivery]
            queue_capacity = 64
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert!(!config.bus.enabled);
        assert_eq!(config.delivery.queue_capacity, 64);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 9000,
            ..Config::default()
        };
        assert_eq!(config.bind_addr().unwrap().port(), 9000);

        let bad = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }
}
