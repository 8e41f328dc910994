//! Settings types. All structs use camelCase JSON and fill missing fields
//! from their `Default`.

use flowcast_core::BackoffPolicy;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Upper bound on `client.bufferCapacity`.
pub const MAX_BUFFER_CAPACITY: usize = 100;

/// Root settings object (`~/.flowcast/settings.json`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowcastSettings {
    /// Server network and liveness settings.
    pub server: ServerSettings,
    /// Subscriber (client) settings.
    pub client: ClientSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl FlowcastSettings {
    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.server.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatIntervalMs must be positive".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxConnections must be positive".into(),
            ));
        }
        if self.server.send_queue_capacity == 0 || self.server.publish_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server queue capacities must be positive".into(),
            ));
        }
        if self.client.buffer_capacity == 0 || self.client.buffer_capacity > MAX_BUFFER_CAPACITY {
            return Err(SettingsError::InvalidValue(format!(
                "client.bufferCapacity must be between 1 and {MAX_BUFFER_CAPACITY}"
            )));
        }
        Ok(())
    }
}

/// Server network and liveness settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Liveness sweep period in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Per-connection outbound queue length.
    pub send_queue_capacity: usize,
    /// Queue length between the producer and the broadcaster.
    pub publish_queue_capacity: usize,
    /// Largest inbound WebSocket message accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            heartbeat_interval_ms: 30_000,
            max_connections: 1000,
            send_queue_capacity: 256,
            publish_queue_capacity: 1024,
            max_message_size: 64 * 1024,
        }
    }
}

/// Subscriber settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// WebSocket endpoint of the flow server.
    pub server_url: String,
    /// Reconnect schedule.
    pub reconnect: BackoffPolicy,
    /// Maximum number of events kept in the subscriber buffer.
    pub buffer_capacity: usize,
    /// Time allowed for a single connect attempt, in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080/ws".to_string(),
            reconnect: BackoffPolicy::default(),
            buffer_capacity: 100,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable compact lines.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
