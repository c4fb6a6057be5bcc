// ============================
// roomcast-backend-lib/src/presence.rs
// ============================
//! Distributed presence counters.
//!
//! Presence is tracked as two sets per the backing store: the room-scoped
//! active set and the global active set. Set semantics are deliberate and
//! carry a known limitation: a user's second simultaneous connection does
//! not stack, and closing either connection removes the presence entry.

use crate::error::AppError;
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use roomcast_common::{RoomId, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const GLOBAL_KEY: &str = "global:active_users";

fn room_key(room_id: RoomId) -> String {
    format!("room:{room_id}:active_users")
}

/// Shared store of active users, reachable by every server process.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Add a user to the room-scoped and global active sets. Idempotent.
    async fn add_active(&self, room_id: RoomId, user_id: UserId) -> Result<(), AppError>;
    /// Remove a user from both sets. Removing an absent member is a no-op.
    async fn remove_active(&self, room_id: RoomId, user_id: UserId) -> Result<(), AppError>;
    /// Cardinality of the room-scoped set.
    async fn count_active(&self, room_id: RoomId) -> Result<u64, AppError>;
    /// Cardinality of the global set.
    async fn count_global_active(&self) -> Result<u64, AppError>;
}

/// Redis-backed presence store shared across processes.
pub struct RedisPresenceStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisPresenceStore {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn add_active(&self, room_id: RoomId, user_id: UserId) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(room_key(room_id), user_id).await?;
        let _: () = conn.sadd(GLOBAL_KEY, user_id).await?;
        Ok(())
    }

    async fn remove_active(&self, room_id: RoomId, user_id: UserId) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(room_key(room_id), user_id).await?;
        let _: () = conn.srem(GLOBAL_KEY, user_id).await?;
        Ok(())
    }

    async fn count_active(&self, room_id: RoomId) -> Result<u64, AppError> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(room_key(room_id)).await?)
    }

    async fn count_global_active(&self) -> Result<u64, AppError> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(GLOBAL_KEY).await?)
    }
}

/// In-memory presence store for single-process deployments and tests.
/// Mirrors the Redis semantics exactly, including the unconditional removal
/// from the global set.
#[derive(Default)]
pub struct InMemoryPresenceStore {
    rooms: Mutex<HashMap<RoomId, HashSet<UserId>>>,
    global: Mutex<HashSet<UserId>>,
}

impl InMemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for InMemoryPresenceStore {
    async fn add_active(&self, room_id: RoomId, user_id: UserId) -> Result<(), AppError> {
        self.rooms.lock().entry(room_id).or_default().insert(user_id);
        self.global.lock().insert(user_id);
        Ok(())
    }

    async fn remove_active(&self, room_id: RoomId, user_id: UserId) -> Result<(), AppError> {
        if let Some(room) = self.rooms.lock().get_mut(&room_id) {
            room.remove(&user_id);
        }
        self.global.lock().remove(&user_id);
        Ok(())
    }

    async fn count_active(&self, room_id: RoomId) -> Result<u64, AppError> {
        Ok(self
            .rooms
            .lock()
            .get(&room_id)
            .map_or(0, |room| room.len() as u64))
    }

    async fn count_global_active(&self) -> Result<u64, AppError> {
        Ok(self.global.lock().len() as u64)
    }
}

/// Front for the presence store held by the application state. One
/// `add_active` per connection open is matched by exactly one
/// `remove_active` per connection close (enforced by the session loop).
pub struct PresenceTracker {
    store: Arc<dyn PresenceStore>,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn PresenceStore>) -> Self {
        Self { store }
    }

    pub async fn add_active(&self, room_id: RoomId, user_id: UserId) -> Result<(), AppError> {
        self.store.add_active(room_id, user_id).await
    }

    pub async fn remove_active(&self, room_id: RoomId, user_id: UserId) -> Result<(), AppError> {
        self.store.remove_active(room_id, user_id).await
    }

    pub async fn count_active(&self, room_id: RoomId) -> Result<u64, AppError> {
        self.store.count_active(room_id).await
    }

    pub async fn count_global_active(&self) -> Result<u64, AppError> {
        self.store.count_global_active().await
    }
}
