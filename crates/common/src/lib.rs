// ================
// crates/common/src/lib.rs
// ================
//! Wire types shared between the roomcast server and its clients.
//!
//! A websocket client sends [`SendMessage`] frames and receives
//! [`ServerFrame`] frames. The HTTP API reuses [`Message`] and [`UserRef`]
//! in its JSON responses so that history reads and live broadcasts encode
//! messages identically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque room identifier; rooms themselves are owned by the directory.
pub type RoomId = i64;

/// User identifier.
pub type UserId = i64;

/// A user as embedded in message payloads and API responses.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UserRef {
    pub id: UserId,
    pub name: String,
}

/// A persisted chat message in its canonical encoded form.
///
/// Immutable once created. `id` is a time-ordered UUID (v7), so sorting by
/// `id` and sorting by `created_at` agree.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Message {
    pub id: Uuid,
    pub room_id: RoomId,
    pub author: UserRef,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Client -> server: request to create one message in the connection's room.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SendMessage {
    pub content: String,
}

/// Server -> client frames.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "frameType")]
pub enum ServerFrame {
    /// A message broadcast to every connection in the room, the sender's
    /// own connection included.
    Message { message: Message },
    /// An error addressed to a single connection, e.g. a failed persist.
    Error { code: String, message: String },
}
