//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and implement
//! [`Default`] with production values. Every section is `#[serde(default)]`
//! so a settings file only needs the keys it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// # JSON Format
///
/// ```json
/// {
///   "server": { "port": 9090 },
///   "connections": { "bufferSize": 8192, "disconnectTimeoutMs": 5000 }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Listener settings.
    pub server: ServerSettings,
    /// Per-connection limits and the reaper interval.
    pub connections: ConnectionSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl TetherSettings {
    /// Reject values that would make the server unusable.
    pub fn validate(&self) -> Result<()> {
        if self.connections.buffer_size == 0 {
            return Err(SettingsError::InvalidValue(
                "connections.bufferSize must be greater than zero".into(),
            ));
        }
        if self.connections.disconnect_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "connections.disconnectTimeoutMs must be greater than zero".into(),
            ));
        }
        if self.connections.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "connections.heartbeatIntervalMs must be greater than zero".into(),
            ));
        }
        if self.connections.heartbeat_timeout_ms < self.connections.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(
                "connections.heartbeatTimeoutMs must not be shorter than heartbeatIntervalMs"
                    .into(),
            ));
        }
        if !self.server.path.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "server.path must start with '/': {}",
                self.server.path
            )));
        }
        Ok(())
    }
}

/// Network listener settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` picks a free port).
    pub port: u16,
    /// HTTP path that accepts WebSocket upgrades.
    pub path: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            path: "/ws".into(),
        }
    }
}

/// Connection-level settings shared by every connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Receive buffer size in bytes.
    pub buffer_size: usize,
    /// Reaper sweep interval in milliseconds.
    pub disconnect_timeout_ms: u64,
    /// Interval between server pings on WebSocket transports.
    pub heartbeat_interval_ms: u64,
    /// A peer silent for this long is marked dead.
    pub heartbeat_timeout_ms: u64,
}

impl ConnectionSettings {
    /// Reaper sweep interval as a [`Duration`].
    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    /// Ping interval as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat timeout as a [`Duration`].
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            buffer_size: 4 * 1024,
            disconnect_timeout_ms: 10_000,
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 15_000,
        }
    }
}

/// Logging output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`RUST_LOG` wins when set).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}
