use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::app_state::AppState;
use crate::models::job::OwnerId;
use crate::routes::auth::CurrentOwner;

/// Keepalive ping cadence for idle connections.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// GET /api/v1/progress/ws: live progress of the caller's jobs.
///
/// The owner is resolved before the upgrade, so an unauthenticated client
/// gets a plain 401 instead of a socket.
pub async fn progress_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    CurrentOwner(owner): CurrentOwner,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, owner))
}

/// Manage a single observer connection after upgrade.
///
/// A sender task forwards hub events as JSON text frames and pings the
/// client every [`PING_INTERVAL`]. The current task reads inbound frames and
/// answers a text `ping` with `pong`. When either side ends, the observer is
/// unregistered. If the hub drops the observer for falling behind, the socket
/// is closed and the client is expected to reconnect and re-read the queue.
async fn handle_socket(socket: WebSocket, state: AppState, owner: OwnerId) {
    let mut subscription = state.orchestrator.subscribe(&owner);
    let observer_id = subscription.id;
    tracing::info!(observer_id = %observer_id, owner_id = %owner, "Progress observer connected");

    let (mut sink, mut stream) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<Message>(8);

    let mut send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;

        loop {
            let msg = tokio::select! {
                event = subscription.recv() => match event {
                    Some(event) => match serde_json::to_string(&event) {
                        Ok(text) => Message::Text(text.into()),
                        Err(e) => {
                            tracing::warn!(observer_id = %observer_id, error = %e, "Failed to encode progress event");
                            continue;
                        }
                    },
                    None => {
                        tracing::debug!(observer_id = %observer_id, "Observer dropped by hub");
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                },
                Some(reply) = reply_rx.recv() => reply,
                _ = ping.tick() => Message::Ping(Bytes::new()),
            };

            if sink.send(msg).await.is_err() {
                tracing::debug!(observer_id = %observer_id, "WebSocket sink closed");
                break;
            }
        }
    });

    let recv_loop = async {
        while let Some(result) = stream.next().await {
            match result {
                Ok(Message::Close(_)) => break,
                Ok(Message::Text(text)) if text.as_str().trim() == "ping" => {
                    let _ = reply_tx.try_send(Message::Text("pong".into()));
                }
                Ok(Message::Pong(_)) => {
                    tracing::trace!(observer_id = %observer_id, "Pong received");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(observer_id = %observer_id, error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = recv_loop => {}
        _ = &mut send_task => {}
    }

    state.orchestrator.unsubscribe(observer_id);
    send_task.abort();
    tracing::info!(observer_id = %observer_id, "Progress observer disconnected");
}
