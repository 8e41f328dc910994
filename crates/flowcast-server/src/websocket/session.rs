//! WebSocket session lifecycle: handles a single connected subscriber from
//! upgrade through disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::connection::{FlowConnection, Outbound};
use super::handler::handle_message;
use super::registry::ConnectionRegistry;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_REJECTED_TOTAL, WS_DISCONNECTIONS_TOTAL,
};

/// How long an evicted session's writer may spend flushing the Close frame.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Run a WebSocket session for a connected subscriber.
///
/// 1. Registers the connection (the registry sends the `connected` greeting)
/// 2. Forwards queued frames and Pings through a writer task
/// 3. Dispatches inbound text frames; any inbound frame marks the peer alive
/// 4. Ends on peer close, transport error, or eviction, then deregisters
#[instrument(skip_all, fields(conn_id))]
pub async fn run_ws_session(ws: WebSocket, registry: Arc<ConnectionRegistry>, queue_capacity: usize) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Outbound>(queue_capacity.max(1));
    let connection = Arc::new(FlowConnection::new(FlowConnection::generate_id(), send_tx));
    let conn_id = connection.id.clone();
    let _ = tracing::Span::current().record("conn_id", conn_id.as_str());

    if !registry.accept(connection.clone()).await {
        counter!(WS_CONNECTIONS_REJECTED_TOTAL).increment(1);
        let _ = ws_tx.send(Message::Close(None)).await;
        return;
    }
    info!("subscriber connected");

    let close = connection.close_token();
    let writer_close = close.clone();
    let outbound = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = send_rx.recv() => {
                    let msg = match frame {
                        Some(Outbound::Text(text)) => Message::Text(text.as_ref().into()),
                        Some(Outbound::Ping) => Message::Ping(vec![].into()),
                        None => break,
                    };
                    if ws_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                () = writer_close.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        // Dropping the receiver makes later sends fail with `Closed`.
        drop(send_rx);
    });

    loop {
        let msg = tokio::select! {
            msg = ws_rx.next() => msg,
            () = close.cancelled() => {
                debug!("session closed by server");
                break;
            }
        };
        let msg = match msg {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                debug!(error = %e, "transport error");
                break;
            }
            None => break,
        };

        connection.mark_alive();
        let text = match msg {
            Message::Text(ref t) => t.as_str().to_owned(),
            Message::Binary(ref data) => match std::str::from_utf8(data) {
                Ok(s) => s.to_owned(),
                Err(_) => {
                    debug!(len = data.len(), "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => {
                debug!("subscriber sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        let reply = handle_message(&text, &connection, &registry).await;
        if let Err(e) = connection.send_message(&reply) {
            warn!(error = %e, reply = reply.kind(), "failed to queue reply");
        }
    }

    // Give the writer a chance to flush a Close frame after an eviction.
    let flush = close.is_cancelled().then_some(CLOSE_FLUSH_TIMEOUT);
    stop_writer(outbound, flush).await;
    let _ = registry.remove(&conn_id).await;
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
    info!(dropped = connection.drop_count(), "subscriber disconnected");
}

/// Stop the writer task, first waiting up to `flush` for it to finish.
///
/// A writer stuck on a peer that stopped reading is aborted, which drops the
/// sink and closes the socket.
async fn stop_writer(mut writer: JoinHandle<()>, flush: Option<Duration>) {
    if let Some(flush) = flush {
        if tokio::time::timeout(flush, &mut writer).await.is_ok() {
            return;
        }
        debug!("writer did not flush in time, aborting");
    }
    writer.abort();
    let _ = writer.await;
}
