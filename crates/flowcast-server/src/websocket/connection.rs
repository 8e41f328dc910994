//! WebSocket client connection state.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use flowcast_core::{FlowEvent, ServerMessage, Subscription};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A frame queued for the connection's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// JSON text frame. Shared so one serialized event can go to many peers.
    Text(Arc<str>),
    /// WebSocket Ping control frame.
    Ping,
}

/// Why a frame could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The outbound queue is full; the peer is not keeping up.
    #[error("outbound queue full")]
    Full,
    /// The writer task is gone; the transport is closed.
    #[error("connection closed")]
    Closed,
}

/// Represents a connected WebSocket subscriber.
pub struct FlowConnection {
    /// Unique connection ID.
    pub id: String,
    /// Send channel to the connection's WebSocket write task.
    tx: mpsc::Sender<Outbound>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the peer has shown signs of life since the last sweep.
    is_alive: AtomicBool,
    /// When the last pong (or any activity) was received.
    last_pong: Mutex<Instant>,
    /// Count of messages dropped due to a full queue.
    dropped_messages: AtomicU64,
    /// Active subscriptions. Never holds two equal `(channel, coin)` pairs.
    subscriptions: Mutex<HashSet<Subscription>>,
    /// Cancelled to force the transport shut.
    close: CancellationToken,
}

impl FlowConnection {
    /// Create a new connection with no subscriptions, marked alive.
    pub fn new(id: String, tx: mpsc::Sender<Outbound>) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
            subscriptions: Mutex::new(HashSet::new()),
            close: CancellationToken::new(),
        }
    }

    /// Generate a fresh connection ID.
    pub fn generate_id() -> String {
        format!("conn_{}", uuid::Uuid::now_v7())
    }

    /// Queue a frame without waiting.
    ///
    /// A full queue increments the dropped message counter.
    pub fn send(&self, frame: Outbound) -> Result<(), SendError> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(SendError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Queue a pre-serialized text frame.
    pub fn send_text(&self, text: Arc<str>) -> Result<(), SendError> {
        self.send(Outbound::Text(text))
    }

    /// Serialize a server message and queue it.
    pub fn send_message(&self, message: &ServerMessage) -> Result<(), SendError> {
        match serde_json::to_string(message) {
            Ok(json) => self.send_text(Arc::from(json)),
            Err(e) => {
                tracing::error!(conn_id = %self.id, error = %e, "failed to serialize server message");
                Ok(())
            }
        }
    }

    /// Queue a Ping control frame.
    pub fn send_ping(&self) -> Result<(), SendError> {
        self.send(Outbound::Ping)
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Mark the connection as alive (pong or other traffic received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Whether the alive flag is currently set.
    pub fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Relaxed)
    }

    /// Check and reset the alive flag in one step.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Duration since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Add a subscription. Returns `false` if it was already present.
    pub fn subscribe(&self, subscription: Subscription) -> bool {
        self.subscriptions.lock().insert(subscription)
    }

    /// Remove exactly this `(channel, coin)` pair. Returns `false` if absent.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.subscriptions.lock().remove(subscription)
    }

    /// Current subscriptions, in no particular order.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    /// Drop every subscription.
    pub fn clear_subscriptions(&self) {
        self.subscriptions.lock().clear();
    }

    /// Whether any subscription matches `event`.
    pub fn wants(&self, event: &FlowEvent) -> bool {
        self.subscriptions.lock().iter().any(|s| s.matches(event))
    }

    /// Ask the session to tear the transport down.
    pub fn close(&self) {
        self.close.cancel();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Token the session selects on to notice a forced close.
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }
}

impl std::fmt::Debug for FlowConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowConnection")
            .field("id", &self.id)
            .field("is_alive", &self.is_alive())
            .field("subscriptions", &self.subscriptions.lock().len())
            .field("dropped_messages", &self.drop_count())
            .finish_non_exhaustive()
    }
}
