//! JSON wire messages exchanged over the flow WebSocket.
//!
//! Every frame is a JSON object with a `type` discriminator:
//!
//! | Direction | `type` | Fields |
//! |---|---|---|
//! | C→S | `subscribe` / `unsubscribe` | `channel`, `coin?` |
//! | C→S | `ping` | |
//! | S→C | `connected` | `message`, `timestamp` |
//! | S→C | `subscribed` / `unsubscribed` | `channel`, `coin` |
//! | S→C | `flow` | `data` |
//! | S→C | `pong` | `timestamp` |
//! | S→C | `error` | `message` |

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;
use crate::events::FlowEvent;
use crate::subscription::{Channel, Subscription};

/// Messages sent by a subscriber to the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Add a subscription.
    Subscribe(Subscription),
    /// Remove a subscription.
    Unsubscribe(Subscription),
    /// Application-level keepalive.
    Ping,
}

#[derive(Deserialize)]
struct RawSubscription {
    channel: String,
    #[serde(default)]
    coin: Option<String>,
}

impl ClientMessage {
    /// Decode an inbound text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;

        match kind {
            "subscribe" => Ok(Self::Subscribe(subscription_from(value)?)),
            "unsubscribe" => Ok(Self::Unsubscribe(subscription_from(value)?)),
            "ping" => Ok(Self::Ping),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    /// Message type as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
            Self::Ping => "ping",
        }
    }
}

fn subscription_from(value: Value) -> Result<Subscription, ProtocolError> {
    let raw: RawSubscription =
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    let channel: Channel = raw.channel.parse()?;
    match channel {
        Channel::Flow => Ok(Subscription::flow(raw.coin)),
    }
}

/// Messages sent by the server to a subscriber.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Sent once, right after the handshake is accepted.
    Connected {
        /// Human-readable greeting.
        message: String,
        /// Server time in epoch milliseconds.
        timestamp: i64,
    },
    /// Acknowledges a `subscribe`.
    Subscribed {
        /// Subscribed channel.
        channel: Channel,
        /// Instrument filter; `null` for the wildcard.
        coin: Option<String>,
    },
    /// Acknowledges an `unsubscribe`.
    Unsubscribed {
        /// Unsubscribed channel.
        channel: Channel,
        /// Instrument filter; `null` for the wildcard.
        coin: Option<String>,
    },
    /// A trade-flow event.
    Flow {
        /// The event payload.
        data: FlowEvent,
    },
    /// Reply to an application-level `ping`.
    Pong {
        /// Server time in epoch milliseconds.
        timestamp: i64,
    },
    /// A non-fatal protocol error.
    Error {
        /// Description of what went wrong.
        message: String,
    },
}

impl ServerMessage {
    /// Greeting sent on accept.
    pub fn connected() -> Self {
        Self::Connected {
            message: "Connected to flow stream".to_string(),
            timestamp: now_ms(),
        }
    }

    /// Acknowledgement for a subscribe request.
    pub fn subscribed(subscription: &Subscription) -> Self {
        Self::Subscribed {
            channel: subscription.channel,
            coin: subscription.coin.clone(),
        }
    }

    /// Acknowledgement for an unsubscribe request.
    pub fn unsubscribed(subscription: &Subscription) -> Self {
        Self::Unsubscribed {
            channel: subscription.channel,
            coin: subscription.coin.clone(),
        }
    }

    /// Keepalive reply.
    pub fn pong() -> Self {
        Self::Pong {
            timestamp: now_ms(),
        }
    }

    /// Error reply for a rejected frame.
    pub fn error(err: &ProtocolError) -> Self {
        Self::Error {
            message: err.to_string(),
        }
    }

    /// Message type as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Subscribed { .. } => "subscribed",
            Self::Unsubscribed { .. } => "unsubscribed",
            Self::Flow { .. } => "flow",
            Self::Pong { .. } => "pong",
            Self::Error { .. } => "error",
        }
    }
}

#[derive(Serialize)]
struct FlowFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a FlowEvent,
}

/// Serialize a `flow` frame without cloning the event.
///
/// Produces the same JSON as `ServerMessage::Flow { data: event.clone() }`.
pub fn encode_flow(event: &FlowEvent) -> serde_json::Result<String> {
    serde_json::to_string(&FlowFrame {
        kind: "flow",
        data: event,
    })
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
