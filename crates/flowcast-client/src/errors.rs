//! Subscriber error types.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the subscriber.
///
/// Transport failures never reach callers directly; they drive reconnects
/// and show up as [`ConnectionState`](crate::state::ConnectionState).
#[derive(Debug, Error)]
pub enum ClientError {
    /// The configured server URL is not a usable `WebSocket` URL.
    #[error("invalid server URL {url}: {reason}")]
    InvalidUrl {
        /// URL as configured.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
    /// The `WebSocket` handshake failed.
    #[error("connect failed: {0}")]
    Connect(String),
    /// The handshake did not finish in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    /// The subscriber task has stopped.
    #[error("subscriber task has stopped")]
    Closed,
}

/// Result type for subscriber operations.
pub type Result<T> = std::result::Result<T, ClientError>;
