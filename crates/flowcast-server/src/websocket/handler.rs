//! Inbound message dispatch: parses a text frame and applies it to the
//! connection's subscription set.

use flowcast_core::{ClientMessage, ServerMessage};
use metrics::counter;
use tracing::{debug, instrument, warn};

use super::connection::FlowConnection;
use super::registry::ConnectionRegistry;
use crate::metrics::WS_PROTOCOL_ERRORS_TOTAL;

/// Handle one inbound text frame and return the reply to send.
///
/// Protocol errors are answered with an `error` frame; the connection stays
/// open.
#[instrument(skip_all, fields(conn_id = %connection.id, kind))]
pub async fn handle_message(
    text: &str,
    connection: &FlowConnection,
    registry: &ConnectionRegistry,
) -> ServerMessage {
    let message = match ClientMessage::parse(text) {
        Ok(m) => m,
        Err(e) => {
            counter!(WS_PROTOCOL_ERRORS_TOTAL).increment(1);
            warn!(error = %e, "rejected inbound frame");
            return ServerMessage::error(&e);
        }
    };
    let _ = tracing::Span::current().record("kind", message.kind());

    match message {
        ClientMessage::Subscribe(subscription) => {
            let reply = ServerMessage::subscribed(&subscription);
            if registry.subscribe(&connection.id, subscription).await.is_none() {
                debug!("subscribe from unregistered connection");
            }
            reply
        }
        ClientMessage::Unsubscribe(subscription) => {
            if registry.unsubscribe(&connection.id, &subscription).await.is_none() {
                debug!("unsubscribe from unregistered connection");
            }
            ServerMessage::unsubscribed(&subscription)
        }
        ClientMessage::Ping => {
            connection.mark_alive();
            ServerMessage::pong()
        }
    }
}
