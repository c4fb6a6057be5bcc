// ============================
// roomcast-backend-lib/src/ws_router.rs
// ============================
//! WebSocket router and connection admission.
use crate::session;
use crate::AppState;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, HeaderMap},
    response::IntoResponse,
    routing::get,
    Router,
};
use roomcast_common::RoomId;
use std::sync::Arc;

pub const SESSION_COOKIE: &str = "session_id";

/// Create the WebSocket router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/{room_id}", get(ws_handler))
        .with_state(state)
}

/// Handler for WebSocket connections. The gate runs before any side effect;
/// a rejected connection is upgraded only to be closed with a policy
/// violation code, matching the session-cookie handshake contract.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<RoomId>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let token = session_cookie(&headers);
    let admitted = state.gate.admit(token.as_deref(), room_id).await;

    ws.on_upgrade(move |socket| async move {
        match admitted {
            Ok(user) => session::run_session(socket, room_id, user, state).await,
            Err(err) => {
                tracing::info!(room_id, %err, "rejecting connection");
                close_policy_violation(socket).await;
            },
        }
    })
}

async fn close_policy_violation(mut socket: WebSocket) {
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: Utf8Bytes::from_static("policy violation"),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Extract the opaque session token from the `Cookie` header.
pub(crate) fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_owned())
    })
}
