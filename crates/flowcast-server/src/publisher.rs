//! Producer-facing publish channel and the bridge task that drains it into
//! the [`Broadcaster`].

use std::sync::Arc;

use flowcast_core::FlowEvent;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::websocket::broadcast::Broadcaster;

/// Why an event could not be handed to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PublishError {
    /// The server side of the channel is gone.
    #[error("flow publisher closed")]
    Closed,
    /// The publish queue is full (only from [`FlowPublisher::try_publish`]).
    #[error("flow publish queue full")]
    Full,
}

/// Cloneable handle the upstream producer uses to submit events.
#[derive(Clone, Debug)]
pub struct FlowPublisher {
    tx: mpsc::Sender<FlowEvent>,
}

impl FlowPublisher {
    /// Submit an event, waiting for queue room.
    pub async fn publish(&self, event: FlowEvent) -> Result<(), PublishError> {
        self.tx.send(event).await.map_err(|_| PublishError::Closed)
    }

    /// Submit an event without waiting.
    pub fn try_publish(&self, event: FlowEvent) -> Result<(), PublishError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PublishError::Full,
            mpsc::error::TrySendError::Closed(_) => PublishError::Closed,
        })
    }

    /// Whether the receiving side has shut down.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create a publish channel holding up to `capacity` pending events.
pub fn flow_channel(capacity: usize) -> (FlowPublisher, mpsc::Receiver<FlowEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (FlowPublisher { tx }, rx)
}

/// Drains the publish channel into the broadcaster.
pub struct EventBridge {
    rx: mpsc::Receiver<FlowEvent>,
    broadcaster: Arc<Broadcaster>,
}

impl EventBridge {
    /// Create a bridge over a channel receiver.
    pub fn new(rx: mpsc::Receiver<FlowEvent>, broadcaster: Arc<Broadcaster>) -> Self {
        Self { rx, broadcaster }
    }

    /// Run until every publisher is dropped or `cancel` fires.
    #[tracing::instrument(skip_all, name = "event_bridge")]
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                event = self.rx.recv() => event,
                () = cancel.cancelled() => {
                    tracing::debug!("event bridge cancelled");
                    break;
                }
            };
            let Some(event) = event else {
                tracing::info!("all publishers dropped, event bridge exiting");
                break;
            };
            let report = self.broadcaster.publish(&event).await;
            tracing::trace!(
                event_id = %event.id,
                recipients = report.recipients,
                dropped = report.dropped,
                "bridged flow event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::{FlowConnection, Outbound};
    use crate::websocket::registry::ConnectionRegistry;
    use flowcast_core::Subscription;
    use flowcast_core::test_utils::flow_event;

    #[tokio::test]
    async fn try_publish_reports_full() {
        let (publisher, _rx) = flow_channel(1);
        assert_eq!(publisher.try_publish(flow_event("a", "BTC")), Ok(()));
        assert_eq!(
            publisher.try_publish(flow_event("b", "BTC")),
            Err(PublishError::Full)
        );
    }

    #[tokio::test]
    async fn publish_after_receiver_dropped_is_closed() {
        let (publisher, rx) = flow_channel(4);
        drop(rx);
        assert!(publisher.is_closed());
        assert_eq!(
            publisher.publish(flow_event("a", "BTC")).await,
            Err(PublishError::Closed)
        );
        assert_eq!(
            publisher.try_publish(flow_event("b", "BTC")),
            Err(PublishError::Closed)
        );
    }

    #[tokio::test]
    async fn bridge_delivers_to_subscribers() {
        let registry = Arc::new(ConnectionRegistry::default());
        let (tx, mut conn_rx) = mpsc::channel(8);
        let conn = Arc::new(FlowConnection::new("c1".into(), tx));
        assert!(registry.accept(conn).await);
        let _ = conn_rx.recv().await;
        let _ = registry.subscribe("c1", Subscription::coin("BTC")).await;

        let (publisher, rx) = flow_channel(8);
        let bridge = EventBridge::new(rx, Arc::new(Broadcaster::new(registry)));
        let handle = tokio::spawn(bridge.run(CancellationToken::new()));

        publisher.publish(flow_event("e1", "BTC")).await.unwrap();
        publisher.publish(flow_event("e2", "ETH")).await.unwrap();
        publisher.publish(flow_event("e3", "BTC")).await.unwrap();
        drop(publisher);
        handle.await.unwrap();

        let mut ids = Vec::new();
        while let Ok(Outbound::Text(text)) = conn_rx.try_recv() {
            let v: serde_json::Value = serde_json::from_str(&text).unwrap();
            ids.push(v["data"]["id"].as_str().unwrap().to_string());
        }
        assert_eq!(ids, vec!["e1", "e3"]);
    }

    #[tokio::test]
    async fn bridge_stops_on_cancel() {
        let registry = Arc::new(ConnectionRegistry::default());
        let (_publisher, rx) = flow_channel(8);
        let bridge = EventBridge::new(rx, Arc::new(Broadcaster::new(registry)));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(bridge.run(cancel.clone()));
        cancel.cancel();
        handle.await.unwrap();
    }
}
