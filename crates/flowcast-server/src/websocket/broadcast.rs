//! Flow event fan-out to subscribed connections.

use std::sync::Arc;

use flowcast_core::FlowEvent;
use flowcast_core::protocol::encode_flow;
use metrics::counter;
use tracing::{debug, warn};

use super::connection::SendError;
use super::registry::{ConnectionRegistry, EvictionReason};
use crate::metrics::{FLOW_BROADCAST_DROPS_TOTAL, FLOW_DELIVERIES_TOTAL, FLOW_EVENTS_PUBLISHED_TOTAL};

/// What happened to one published event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Connections the event was queued for.
    pub recipients: usize,
    /// Matching connections whose queue was full.
    pub dropped: usize,
    /// Matching connections found closed and evicted.
    pub evicted: usize,
}

/// Delivers each event at most once to every connection with a matching
/// subscription.
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    /// Create a broadcaster over `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Publish one event.
    ///
    /// The event is serialized once and the same frame is queued for every
    /// match. A connection holding both `flow:*` and `flow:<symbol>` still
    /// gets exactly one copy. A slow peer never blocks the others: a full
    /// queue drops the frame for that peer only.
    pub async fn publish(&self, event: &FlowEvent) -> PublishReport {
        let mut report = PublishReport::default();
        let frame: Arc<str> = match encode_flow(event) {
            Ok(json) => Arc::from(json),
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "failed to serialize flow event");
                return report;
            }
        };
        counter!(FLOW_EVENTS_PUBLISHED_TOTAL).increment(1);

        let mut closed = Vec::new();
        for conn in self.registry.snapshot().await {
            if !conn.wants(event) {
                continue;
            }
            match conn.send_text(frame.clone()) {
                Ok(()) => report.recipients += 1,
                Err(SendError::Full) => {
                    report.dropped += 1;
                    counter!(FLOW_BROADCAST_DROPS_TOTAL).increment(1);
                    warn!(
                        conn_id = %conn.id,
                        dropped_total = conn.drop_count(),
                        "outbound queue full, dropping flow event"
                    );
                }
                Err(SendError::Closed) => closed.push(conn.id.clone()),
            }
        }

        for id in closed {
            if self.registry.evict(&id, EvictionReason::SendFailed).await {
                report.evicted += 1;
            }
        }

        counter!(FLOW_DELIVERIES_TOTAL).increment(report.recipients as u64);
        debug!(
            event_id = %event.id,
            symbol = %event.symbol,
            recipients = report.recipients,
            dropped = report.dropped,
            evicted = report.evicted,
            "flow event broadcast"
        );
        report
    }

    /// Registry this broadcaster reads from.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}
