// ============================
// roomcast-backend-lib/src/session.rs
// ============================
//! Per-connection session loop.
//!
//! One admitted websocket runs through Admitting -> Active -> Closing ->
//! Closed. Entering Active performs, in order: registry registration,
//! presence add, bridge acquire. The receive loop and the room's bridge
//! listener run concurrently; the sender hears its own messages back through
//! the bridge + registry path, the same path every other recipient uses.
//! Closing reverses each side effect independently so one failure cannot
//! leak the others.

use crate::error::AppError;
use crate::AppState;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use roomcast_common::{RoomId, SendMessage, ServerFrame, UserRef};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Capacity of a connection's forwarding channel; a consumer that falls this
/// far behind starts losing frames rather than stalling the room.
const FORWARD_BUFFER: usize = 32;

pub async fn run_session(socket: WebSocket, room_id: RoomId, user: UserRef, state: Arc<AppState>) {
    let conn_id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(FORWARD_BUFFER);

    // Forward task: payloads fanned out by the registry (and error frames
    // addressed to this client) become outbound text frames.
    let forward = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if sink.send(WsMessage::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    state.registry.register(room_id, conn_id, tx.clone());
    if let Err(err) = state.presence.add_active(room_id, user.id).await {
        // presence is best-effort; the connection still serves
        tracing::warn!(room_id, user_id = user.id, %err, "failed to record presence");
    }

    let listener_ready = match state.bridge.acquire(room_id, state.registry.clone()).await {
        Ok(()) => true,
        Err(err) => {
            // without a listener this process would never deliver broadcasts
            tracing::error!(room_id, %err, "failed to start broadcast listener");
            send_error_frame(&tx, &AppError::Upstream("broadcast transport".to_string()));
            false
        },
    };

    if listener_ready {
        counter!(crate::metrics::WS_CONNECTIONS).increment(1);
        gauge!(crate::metrics::WS_ACTIVE).increment(1.0);
        tracing::info!(room_id, user_id = user.id, %conn_id, "connection active");

        while let Some(Ok(frame)) = stream.next().await {
            match frame {
                WsMessage::Text(text) => {
                    handle_text(text.as_str(), room_id, &user, &tx, &state).await;
                },
                WsMessage::Close(_) => break,
                // pings are answered by axum; binary frames are not part of
                // the protocol
                _ => {},
            }
        }

        gauge!(crate::metrics::WS_ACTIVE).decrement(1.0);
    }

    // Closing: every step runs even if an earlier one fails.
    state.registry.unregister(room_id, conn_id);
    if let Err(err) = state.presence.remove_active(room_id, user.id).await {
        tracing::warn!(room_id, user_id = user.id, %err, "failed to clear presence");
    }
    if listener_ready {
        state.bridge.release(room_id).await;
    }
    forward.abort();

    tracing::info!(room_id, user_id = user.id, %conn_id, "connection closed");
}

/// Handle one inbound text frame: parse, persist, then publish. A malformed
/// frame is dropped and the connection stays open; a failed persist is
/// reported to this client only and nothing is published.
async fn handle_text(
    text: &str,
    room_id: RoomId,
    user: &UserRef,
    tx: &mpsc::Sender<String>,
    state: &AppState,
) {
    let request: SendMessage = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(err) => {
            let err = AppError::MalformedInput(err.to_string());
            tracing::debug!(room_id, user_id = user.id, %err, "dropping frame");
            return;
        },
    };

    let message = match state.messages.append(room_id, user, &request.content).await {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!(room_id, user_id = user.id, %err, "persist failed; not publishing");
            send_error_frame(tx, &err);
            return;
        },
    };
    counter!(crate::metrics::MESSAGES_PERSISTED).increment(1);

    let encoded = match serde_json::to_string(&ServerFrame::Message { message }) {
        Ok(encoded) => encoded,
        Err(err) => {
            tracing::error!(room_id, %err, "failed to encode persisted message");
            return;
        },
    };

    // The message is already durable; a publish failure only affects live
    // delivery, so report it to the sender and move on.
    if let Err(err) = state.bridge.publish(room_id, &encoded).await {
        tracing::warn!(room_id, %err, "publish failed after persist");
        send_error_frame(tx, &err);
        return;
    }
    counter!(crate::metrics::MESSAGES_PUBLISHED).increment(1);
}

fn send_error_frame(tx: &mpsc::Sender<String>, err: &AppError) {
    let frame = ServerFrame::Error {
        code: err.error_code().to_string(),
        message: err.sanitized_message(),
    };
    match serde_json::to_string(&frame) {
        Ok(encoded) => {
            let _ = tx.try_send(encoded);
        },
        Err(err) => tracing::error!(%err, "failed to encode error frame"),
    }
}
