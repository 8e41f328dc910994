//! Registry of live connections and their subscription sets.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use flowcast_core::{ServerMessage, Subscription};
use metrics::{counter, gauge};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::connection::FlowConnection;
use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_EVICTIONS_TOTAL};

/// Why a connection was forcibly removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Did not answer the previous liveness probe.
    Unresponsive,
    /// A ping could not be queued.
    PingFailed,
    /// A broadcast send found the transport closed.
    SendFailed,
    /// Server is shutting down.
    Shutdown,
}

impl EvictionReason {
    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unresponsive => "unresponsive",
            Self::PingFailed => "ping_failed",
            Self::SendFailed => "send_failed",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Owns the set of live connections.
///
/// Membership changes go through the write lock; per-connection state
/// (subscriptions, alive flag) is guarded inside [`FlowConnection`].
pub struct ConnectionRegistry {
    /// Connected clients indexed by connection ID.
    connections: RwLock<HashMap<String, Arc<FlowConnection>>>,
    /// Upper bound on registered connections.
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            max_connections,
        }
    }

    /// Connection limit.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Register a new connection and send it the `connected` greeting.
    ///
    /// Returns `false` (and registers nothing) when the registry is full or
    /// the id is already registered.
    pub async fn accept(&self, connection: Arc<FlowConnection>) -> bool {
        {
            let mut conns = self.connections.write().await;
            if conns.len() >= self.max_connections {
                warn!(
                    conn_id = %connection.id,
                    max_connections = self.max_connections,
                    "connection limit reached, refusing"
                );
                return false;
            }
            match conns.entry(connection.id.clone()) {
                Entry::Occupied(_) => {
                    warn!(conn_id = %connection.id, "duplicate connection id, refusing");
                    return false;
                }
                Entry::Vacant(slot) => {
                    let _ = slot.insert(connection.clone());
                }
            }
        }
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        if connection.send_message(&ServerMessage::connected()).is_err() {
            debug!(conn_id = %connection.id, "failed to queue connected greeting");
        }
        true
    }

    /// Deregister a connection and release its subscriptions.
    pub async fn remove(&self, connection_id: &str) -> Option<Arc<FlowConnection>> {
        let removed = self.connections.write().await.remove(connection_id);
        if let Some(conn) = &removed {
            conn.clear_subscriptions();
            gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        }
        removed
    }

    /// Deregister a connection and force its transport shut.
    ///
    /// Returns `false` if it was already gone.
    pub async fn evict(&self, connection_id: &str, reason: EvictionReason) -> bool {
        let Some(conn) = self.remove(connection_id).await else {
            return false;
        };
        conn.close();
        counter!(WS_EVICTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
        info!(
            conn_id = %conn.id,
            reason = reason.as_str(),
            age_secs = conn.age().as_secs(),
            "connection evicted"
        );
        true
    }

    /// Evict every connection. Used on shutdown.
    pub async fn close_all(&self) -> usize {
        let ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        let mut closed = 0;
        for id in ids {
            if self.evict(&id, EvictionReason::Shutdown).await {
                closed += 1;
            }
        }
        closed
    }

    /// Add a subscription to a connection.
    ///
    /// Returns `Some(true)` if added, `Some(false)` if the identical pair was
    /// already present, `None` if the connection is not registered.
    pub async fn subscribe(&self, connection_id: &str, subscription: Subscription) -> Option<bool> {
        let conn = self.get(connection_id).await?;
        let added = conn.subscribe(subscription.clone());
        debug!(conn_id = connection_id, %subscription, added, "subscribe");
        Some(added)
    }

    /// Remove the exactly matching subscription from a connection.
    ///
    /// Same return convention as [`subscribe`](Self::subscribe).
    pub async fn unsubscribe(
        &self,
        connection_id: &str,
        subscription: &Subscription,
    ) -> Option<bool> {
        let conn = self.get(connection_id).await?;
        let removed = conn.unsubscribe(subscription);
        debug!(conn_id = connection_id, %subscription, removed, "unsubscribe");
        Some(removed)
    }

    /// Subscriptions held by a connection.
    pub async fn subscriptions(&self, connection_id: &str) -> Option<Vec<Subscription>> {
        Some(self.get(connection_id).await?.subscriptions())
    }

    /// Look up a connection.
    pub async fn get(&self, connection_id: &str) -> Option<Arc<FlowConnection>> {
        self.connections.read().await.get(connection_id).cloned()
    }

    /// Point-in-time copy of every registered connection.
    ///
    /// The lock is released before the caller iterates, so sends and
    /// evictions during iteration never contend with it.
    pub async fn snapshot(&self) -> Vec<Arc<FlowConnection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Number of active connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::Outbound;
    use tokio::sync::mpsc;

    fn make_connection(id: &str) -> (Arc<FlowConnection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(32);
        (Arc::new(FlowConnection::new(id.into(), tx)), rx)
    }

    #[tokio::test]
    async fn accept_registers_and_greets() {
        let registry = ConnectionRegistry::default();
        let (conn, mut rx) = make_connection("c1");
        assert!(registry.accept(conn).await);
        assert_eq!(registry.connection_count().await, 1);

        let Some(Outbound::Text(text)) = rx.recv().await else {
            panic!("expected greeting");
        };
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["type"], "connected");
        assert!(parsed["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn accept_starts_alive_with_no_subscriptions() {
        let registry = ConnectionRegistry::default();
        let (conn, _rx) = make_connection("c1");
        assert!(registry.accept(conn).await);
        let conn = registry.get("c1").await.unwrap();
        assert!(conn.is_alive());
        assert_eq!(registry.subscriptions("c1").await, Some(vec![]));
    }

    #[tokio::test]
    async fn accept_refuses_beyond_limit() {
        let registry = ConnectionRegistry::new(1);
        let (c1, _rx1) = make_connection("c1");
        let (c2, _rx2) = make_connection("c2");
        assert!(registry.accept(c1).await);
        assert!(!registry.accept(c2).await);
        assert_eq!(registry.connection_count().await, 1);
        assert!(registry.get("c2").await.is_none());
    }

    #[tokio::test]
    async fn remove_connection_releases_subscriptions() {
        let registry = ConnectionRegistry::default();
        let (conn, _rx) = make_connection("c1");
        assert!(registry.accept(conn.clone()).await);
        let _ = registry.subscribe("c1", Subscription::all()).await;

        let removed = registry.remove("c1").await.unwrap();
        assert_eq!(registry.connection_count().await, 0);
        assert!(removed.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn remove_nonexistent_connection() {
        let registry = ConnectionRegistry::default();
        assert!(registry.remove("no_such").await.is_none());
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn evict_closes_transport() {
        let registry = ConnectionRegistry::default();
        let (conn, _rx) = make_connection("c1");
        assert!(registry.accept(conn.clone()).await);
        assert!(registry.evict("c1", EvictionReason::Unresponsive).await);
        assert!(conn.is_closed());
        assert_eq!(registry.connection_count().await, 0);
        assert!(!registry.evict("c1", EvictionReason::Unresponsive).await);
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let registry = ConnectionRegistry::default();
        let (conn, _rx) = make_connection("c1");
        assert!(registry.accept(conn).await);
        assert_eq!(registry.subscribe("c1", Subscription::coin("BTC")).await, Some(true));
        assert_eq!(registry.subscribe("c1", Subscription::coin("BTC")).await, Some(false));
        assert_eq!(registry.subscriptions("c1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_is_exact() {
        let registry = ConnectionRegistry::default();
        let (conn, _rx) = make_connection("c1");
        assert!(registry.accept(conn).await);
        let _ = registry.subscribe("c1", Subscription::all()).await;
        let _ = registry.subscribe("c1", Subscription::coin("ETH")).await;

        assert_eq!(registry.unsubscribe("c1", &Subscription::all()).await, Some(true));
        assert_eq!(
            registry.subscriptions("c1").await,
            Some(vec![Subscription::coin("ETH")])
        );
        assert_eq!(registry.unsubscribe("c1", &Subscription::coin("BTC")).await, Some(false));
    }

    #[tokio::test]
    async fn subscribe_unknown_connection() {
        let registry = ConnectionRegistry::default();
        assert_eq!(registry.subscribe("ghost", Subscription::all()).await, None);
        assert_eq!(registry.unsubscribe("ghost", &Subscription::all()).await, None);
    }

    #[tokio::test]
    async fn close_all_evicts_everything() {
        let registry = ConnectionRegistry::default();
        let (c1, _rx1) = make_connection("c1");
        let (c2, _rx2) = make_connection("c2");
        assert!(registry.accept(c1.clone()).await);
        assert!(registry.accept(c2.clone()).await);
        assert_eq!(registry.close_all().await, 2);
        assert_eq!(registry.connection_count().await, 0);
        assert!(c1.is_closed() && c2.is_closed());
    }

    #[tokio::test]
    async fn snapshot_is_detached_from_registry() {
        let registry = ConnectionRegistry::default();
        let (c1, _rx1) = make_connection("c1");
        assert!(registry.accept(c1).await);
        let snapshot = registry.snapshot().await;
        let _ = registry.remove("c1").await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn duplicate_id_is_refused() {
        let registry = ConnectionRegistry::default();
        let (c1, _rx1) = make_connection("same_id");
        let (c2, mut rx2) = make_connection("same_id");
        assert!(registry.accept(c1.clone()).await);
        assert!(!registry.accept(c2).await);
        assert_eq!(registry.connection_count().await, 1);
        assert!(Arc::ptr_eq(&registry.get("same_id").await.unwrap(), &c1));
        assert!(rx2.try_recv().is_err());
    }
}
