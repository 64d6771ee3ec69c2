use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, Stream, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, timeout};

use crate::gateway::PersistenceGateway;
use crate::state::AppState;
use crate::ws::ConnectionSender;
use crate::ws::protocol::OutboundEvent;
use crate::ws::registry::{ConnectionHandle, ConnectionRegistry};
use crate::ws::router::{self, ConnState};

/// Ping interval: server sends WebSocket ping every 30 seconds.
/// Prevents connection leaks from abrupt disconnects.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Pong timeout: if pong not received within 10 seconds after ping, close.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the actor-per-connection pattern for a freshly upgraded WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards frames from an mpsc channel
/// - Reader task: decodes incoming frames and dispatches through the router
///
/// The connection starts unauthenticated; identity arrives in-band as an
/// `authenticate` frame. The registry only ever holds a non-owning handle
/// clone, and every exit path unregisters it.
pub async fn run_connection(socket: WebSocket, state: AppState) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    let handle = ConnectionHandle::new(tx.clone());
    let mut conn_state = ConnState::Unauthenticated;

    tracing::info!(connection_id = handle.id(), "WebSocket actor started");

    // Spawn writer task: forwards mpsc messages to WebSocket sink
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Track pong reception
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    // Shutdown signal from the watchdog to the reader. Without it a silently
    // dead peer would keep the reader parked in the socket until TCP gives
    // up, long after the pong timeout fired.
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    // Spawn ping task: sends periodic pings and monitors pong responses
    let ping_tx = tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(PING_INTERVAL);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if ping_tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
                // Writer task has died — connection is gone. Dropping
                // shutdown_tx wakes the reader.
                break;
            }

            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {
                    // Pong received, continue
                }
                _ => {
                    // Pong timeout or channel closed — close connection
                    tracing::warn!("Pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    })));
                    let _ = shutdown_tx.send(());
                    break;
                }
            }
        }
    });

    reader_loop(
        &mut ws_receiver,
        shutdown_rx,
        &tx,
        &pong_tx,
        &handle,
        &mut conn_state,
        &state.connections,
        &state.gateway,
    )
    .await;

    // Cleanup: abort writer and ping tasks, then free the identity
    writer_handle.abort();
    ping_handle.abort();

    match state.connections.unregister(&handle) {
        Some(user_id) => {
            tracing::info!(
                user_id = %user_id,
                connection_id = handle.id(),
                connections = state.connections.len(),
                "Connection unregistered"
            );
        }
        None => {
            // Never authenticated — nothing to free
            tracing::debug!(
                connection_id = handle.id(),
                "Unauthenticated connection closed"
            );
        }
    }
}

/// Reader loop: frames from one socket are processed strictly in arrival
/// order. Exits on close, transport error, or the watchdog's shutdown
/// signal (the watchdog going away counts as a signal too).
#[allow(clippy::too_many_arguments)]
async fn reader_loop<S>(
    ws_receiver: &mut S,
    mut shutdown_rx: oneshot::Receiver<()>,
    tx: &ConnectionSender,
    pong_tx: &mpsc::UnboundedSender<()>,
    handle: &ConnectionHandle,
    conn_state: &mut ConnState,
    registry: &Arc<ConnectionRegistry>,
    gateway: &Arc<dyn PersistenceGateway>,
) where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let next = tokio::select! {
            next = ws_receiver.next() => next,
            _ = &mut shutdown_rx => {
                tracing::info!(connection_id = handle.id(), "Watchdog closed connection");
                break;
            }
        };

        match next {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    router::handle_frame(text.as_str(), handle, conn_state, registry, gateway)
                        .await;
                }
                Message::Binary(_) => {
                    // The wire contract is JSON text frames
                    tracing::debug!(
                        connection_id = handle.id(),
                        "Ignoring unexpected binary frame"
                    );
                }
                Message::Pong(_) => {
                    // Pong received — notify the ping task
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    // Respond to client pings with pong
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(
                        connection_id = handle.id(),
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    connection_id = handle.id(),
                    error = %e,
                    "WebSocket receive error"
                );
                // Best effort: tell the client what happened. The transport
                // is likely already gone, so a failed send is discarded.
                router::send_event(
                    handle,
                    &OutboundEvent::Error {
                        error: "connection error".to_string(),
                        details: Some(e.to_string()),
                        received_type: None,
                    },
                );
                break;
            }
            None => {
                // Stream ended — client disconnected
                tracing::info!(connection_id = handle.id(), "WebSocket stream ended");
                break;
            }
        }
    }
}

/// Writer task: receives messages from mpsc channel and forwards them to the WebSocket sink.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            // WebSocket send failed — connection is broken
            break;
        }
    }
}
