//! WebSocket handling
//!
//! Observers are receive-only. Each connection gets its own bounded outbound queue
//! and send task; a forwarder drains the observer's [`Subscription`] into that queue.
//! A slow socket fills its own queue, its subscription lags, and the connection is
//! closed with a `lagged` error without touching any other observer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use chatwatch_protocol::ServerMessage;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broadcaster::{Broadcaster, Subscription};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const OUTBOUND_QUEUE: usize = 100;
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Messages that can be sent through the WebSocket
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
enum OutboundMessage {
    /// JSON-serialized ServerMessage
    Json(ServerMessage),
    /// Raw pong response
    Pong(Bytes),
    Close,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(broadcaster): State<Arc<Broadcaster>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, broadcaster))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, broadcaster: Arc<Broadcaster>) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let subscription = broadcaster.subscribe();
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        revision = subscription.snapshot_revision(),
        observers = broadcaster.observer_count(),
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(OUTBOUND_QUEUE);

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
                OutboundMessage::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    let mut forward_task = spawn_forwarder(subscription, outbound_tx.clone(), conn_id);

    loop {
        tokio::select! {
            _ = &mut forward_task => break,
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    debug!(
                        component = "websocket",
                        event = "ws.message.ignored",
                        connection_id = conn_id,
                        payload_bytes = text.as_str().len(),
                        "Ignoring inbound message from receive-only observer"
                    );
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = outbound_tx.send(OutboundMessage::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    info!(
                        component = "websocket",
                        event = "ws.connection.close_frame",
                        connection_id = conn_id,
                        "Client sent close frame"
                    );
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(
                        component = "websocket",
                        event = "ws.connection.error",
                        connection_id = conn_id,
                        error = %e,
                        "WebSocket error"
                    );
                    break;
                }
                None => break,
            },
        }
    }

    forward_task.abort();
    drop(outbound_tx);
    if tokio::time::timeout(CLOSE_GRACE, &mut send_task).await.is_err() {
        send_task.abort();
    }

    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        observers = broadcaster.observer_count(),
        "WebSocket connection closed"
    );
}

/// Drain a subscription into the outbound queue: the snapshot first, then increments.
///
/// Ends when the subscription closes (lag included) or the queue is gone. A closed
/// subscription also closes the socket so the observer reconnects for a fresh snapshot.
fn spawn_forwarder(
    mut subscription: Subscription,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    conn_id: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = subscription.next().await {
            if outbound_tx.send(OutboundMessage::Json(msg)).await.is_err() {
                return;
            }
        }
        debug!(
            component = "websocket",
            event = "ws.forwarder.closed",
            connection_id = conn_id,
            "Subscription closed, closing connection"
        );
        let _ = outbound_tx.send(OutboundMessage::Close).await;
    })
}
