// ===========================
// crates/backend-lib/tests/ws_flow.rs
// ===========================
//! End-to-end websocket flow over a real server: admission, fan-out,
//! presence, and the persist-before-publish guarantee.

use futures_util::{SinkExt, StreamExt};
use roomcast_backend_lib::{config::Settings, router, AppState};
use roomcast_common::{Message as ChatMessage, RoomId, ServerFrame, UserRef};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::frame::coding::CloseCode, Message},
    MaybeTlsStream, WebSocketStream,
};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    state: Arc<AppState>,
    addr: SocketAddr,
    _data_dir: tempfile::TempDir, // keeps the message logs alive
}

async fn spawn_server() -> TestServer {
    let data_dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.data_dir = data_dir.path().to_path_buf();

    let state = Arc::new(AppState::in_process(settings).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        state,
        addr,
        _data_dir: data_dir,
    }
}

/// Create a room whose id is exactly `room_id` (room ids are sequential).
async fn room_with_id(server: &TestServer, room_id: RoomId) -> RoomId {
    let (owner, _) = server.state.directory.start_session("room-owner").await;
    loop {
        let room = server
            .state
            .directory
            .create_room("general", true, owner.id)
            .await;
        if room.id >= room_id {
            assert_eq!(room.id, room_id, "room ids are expected to be sequential");
            return room.id;
        }
    }
}

async fn member(server: &TestServer, name: &str, room_id: RoomId) -> (UserRef, String) {
    let (user, token) = server.state.directory.start_session(name).await;
    server.state.directory.join(room_id, user.id).await.unwrap();
    (user, token)
}

async fn connect(addr: SocketAddr, room_id: RoomId, token: Option<&str>) -> WsClient {
    let mut request = format!("ws://{addr}/ws/{room_id}")
        .into_client_request()
        .unwrap();
    if let Some(token) = token {
        request
            .headers_mut()
            .insert("Cookie", format!("session_id={token}").parse().unwrap());
    }
    let (client, _) = connect_async(request).await.unwrap();
    client
}

/// Wait until the server has `connections` registered for the room and its
/// bridge listener is running, so a send cannot race admission.
async fn wait_until_active(server: &TestServer, room_id: RoomId, connections: usize) {
    for _ in 0..200 {
        if server.state.registry.local_connections(room_id) == connections
            && (connections == 0 || server.state.bridge.listener_count().await >= 1)
        {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("server never reached {connections} active connections for room {room_id}");
}

async fn wait_for_presence(server: &TestServer, room_id: RoomId, expected: u64) {
    for _ in 0..200 {
        if server.state.presence.count_active(room_id).await.unwrap() == expected {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("presence for room {room_id} never reached {expected}");
}

async fn send_content(client: &mut WsClient, content: &str) {
    let frame = serde_json::json!({ "content": content }).to_string();
    client.send(Message::text(frame)).await.unwrap();
}

async fn next_message(client: &mut WsClient) -> ChatMessage {
    loop {
        let msg = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = msg {
            match serde_json::from_str::<ServerFrame>(&text).unwrap() {
                ServerFrame::Message { message } => return message,
                ServerFrame::Error { code, message } => {
                    panic!("unexpected error frame {code}: {message}")
                },
            }
        }
    }
}

#[tokio::test]
async fn message_reaches_both_members_including_sender() {
    let server = spawn_server().await;
    let room_id = room_with_id(&server, 7).await;
    let (alice, alice_token) = member(&server, "alice", room_id).await;
    let (_bob, bob_token) = member(&server, "bob", room_id).await;

    let mut alice_ws = connect(server.addr, room_id, Some(&alice_token)).await;
    let mut bob_ws = connect(server.addr, room_id, Some(&bob_token)).await;
    wait_until_active(&server, room_id, 2).await;

    send_content(&mut alice_ws, "hello").await;

    let at_alice = next_message(&mut alice_ws).await;
    let at_bob = next_message(&mut bob_ws).await;

    for message in [&at_alice, &at_bob] {
        assert_eq!(message.content, "hello");
        assert_eq!(message.room_id, 7);
        assert_eq!(message.author.id, alice.id);
    }
    assert_eq!(at_alice.id, at_bob.id);

    // a second message arrives later than the first
    sleep(Duration::from_millis(5)).await;
    send_content(&mut alice_ws, "hello again").await;
    let second = next_message(&mut bob_ws).await;
    assert_eq!(second.content, "hello again");
    assert!(second.created_at > at_bob.created_at);
}

#[tokio::test]
async fn unauthenticated_connection_is_closed_with_policy_violation() {
    let server = spawn_server().await;
    let room_id = room_with_id(&server, 1).await;

    let mut ws = connect(server.addr, room_id, None).await;
    let msg = timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(
        matches!(msg, Message::Close(Some(ref frame)) if frame.code == CloseCode::Policy),
        "expected a 1008 close, got {msg:?}"
    );

    // no state was touched
    assert_eq!(server.state.registry.local_connections(room_id), 0);
    assert_eq!(server.state.presence.count_active(room_id).await.unwrap(), 0);
}

#[tokio::test]
async fn non_member_connection_is_closed_with_policy_violation() {
    let server = spawn_server().await;
    let room_id = room_with_id(&server, 1).await;
    // authenticated, but never joined the room
    let (_, token) = server.state.directory.start_session("mallory").await;

    let mut ws = connect(server.addr, room_id, Some(&token)).await;
    let msg = timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(msg, Message::Close(Some(ref frame)) if frame.code == CloseCode::Policy));
    assert_eq!(server.state.presence.count_active(room_id).await.unwrap(), 0);
}

#[tokio::test]
async fn garbage_frame_is_dropped_and_connection_survives() {
    let server = spawn_server().await;
    let room_id = room_with_id(&server, 1).await;
    let (_, token) = member(&server, "alice", room_id).await;

    let mut ws = connect(server.addr, room_id, Some(&token)).await;
    wait_until_active(&server, room_id, 1).await;

    ws.send(Message::text("this is not json")).await.unwrap();

    // the connection is still healthy: a valid message goes through
    send_content(&mut ws, "still here").await;
    let message = next_message(&mut ws).await;
    assert_eq!(message.content, "still here");
}

#[tokio::test]
async fn disconnect_clears_presence_and_stops_delivery() {
    let server = spawn_server().await;
    let room_id = room_with_id(&server, 1).await;
    let (_, alice_token) = member(&server, "alice", room_id).await;
    let (_, bob_token) = member(&server, "bob", room_id).await;

    let mut alice_ws = connect(server.addr, room_id, Some(&alice_token)).await;
    let mut bob_ws = connect(server.addr, room_id, Some(&bob_token)).await;
    wait_until_active(&server, room_id, 2).await;
    wait_for_presence(&server, room_id, 2).await;

    alice_ws.close(None).await.unwrap();
    wait_for_presence(&server, room_id, 1).await;
    assert_eq!(server.state.registry.local_connections(room_id), 1);

    // delivery still works for the remaining member
    send_content(&mut bob_ws, "anyone there?").await;
    let message = next_message(&mut bob_ws).await;
    assert_eq!(message.content, "anyone there?");
}

#[tokio::test]
async fn live_broadcast_implies_message_is_already_persisted() {
    let server = spawn_server().await;
    let room_id = room_with_id(&server, 1).await;
    let (_, token) = member(&server, "alice", room_id).await;

    let mut ws = connect(server.addr, room_id, Some(&token)).await;
    wait_until_active(&server, room_id, 1).await;

    send_content(&mut ws, "durable").await;
    let live = next_message(&mut ws).await;

    // persist happened before publish, so history must already contain it
    let history = server.state.messages.recent(room_id, 0, 10).await.unwrap();
    assert!(history.iter().any(|m| m.id == live.id));
}
