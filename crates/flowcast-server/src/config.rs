//! Server configuration.

use std::time::Duration;

use flowcast_settings::ServerSettings;
use serde::{Deserialize, Serialize};

/// Runtime configuration for [`FlowServer`](crate::server::FlowServer).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Liveness sweep period in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Per-connection outbound queue length.
    pub send_queue_capacity: usize,
    /// Queue length between the producer and the broadcaster.
    pub publish_queue_capacity: usize,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1000,
            heartbeat_interval_ms: 30_000,
            send_queue_capacity: 256,
            publish_queue_capacity: 1024,
            max_message_size: 64 * 1024,
        }
    }
}

impl ServerConfig {
    /// Build a config from loaded settings.
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            max_connections: settings.max_connections,
            heartbeat_interval_ms: settings.heartbeat_interval_ms,
            send_queue_capacity: settings.send_queue_capacity,
            publish_queue_capacity: settings.publish_queue_capacity,
            max_message_size: settings.max_message_size,
        }
    }

    /// Liveness sweep period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// `host:port` bind string.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
