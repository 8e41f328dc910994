//! Protocol error types.

use thiserror::Error;

/// Errors raised while decoding an inbound client frame.
///
/// The `Display` text is sent verbatim to the peer in an `error` message,
/// so it stays short and free of internal detail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The frame was not valid JSON, or its fields had the wrong shape.
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
    /// The frame had no string `type` field.
    #[error("Missing message type")]
    MissingType,
    /// The `type` field named a message this server does not understand.
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    /// The subscription named a channel other than `flow`.
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),
}
