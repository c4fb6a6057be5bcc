// ============================
// roomcast-backend-lib/src/stores/directory.rs
// ============================
//! In-memory directory of users, rooms, memberships and sessions.
//!
//! This is the ordinary request/response bookkeeping side of the system;
//! the realtime core consumes it only through the [`SessionStore`] and
//! [`MembershipStore`] contracts.

use super::{MembershipStore, SessionStore};
use crate::error::AppError;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use roomcast_common::{RoomId, UserId, UserRef};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub is_public: bool,
    pub owner_id: UserId,
}

struct SessionRecord {
    user_id: UserId,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, UserRef>,
    users_by_name: HashMap<String, UserId>,
    rooms: HashMap<RoomId, Room>,
    members: HashMap<RoomId, HashSet<UserId>>,
    sessions: HashMap<String, SessionRecord>,
    next_user_id: UserId,
    next_room_id: RoomId,
}

#[derive(Clone)]
pub struct Directory {
    inner: Arc<RwLock<Inner>>,
    session_ttl: ChronoDuration,
}

impl Directory {
    /// Create a directory and spawn its periodic session sweep. Must be
    /// called from within a tokio runtime.
    pub fn new(session_ttl: Duration) -> Self {
        let directory = Directory {
            inner: Arc::new(RwLock::new(Inner::default())),
            session_ttl: ChronoDuration::from_std(session_ttl)
                .unwrap_or_else(|_| ChronoDuration::days(7)),
        };

        let sweeper = directory.clone();
        tokio::spawn(async move {
            sweeper.sweep_task().await;
        });

        directory
    }

    /// Get-or-create a user by name and issue a fresh session for them.
    pub async fn start_session(&self, name: &str) -> (UserRef, String) {
        let mut inner = self.inner.write().await;

        let user_id = match inner.users_by_name.get(name) {
            Some(id) => *id,
            None => {
                inner.next_user_id += 1;
                let id = inner.next_user_id;
                inner.users.insert(
                    id,
                    UserRef {
                        id,
                        name: name.to_owned(),
                    },
                );
                inner.users_by_name.insert(name.to_owned(), id);
                id
            },
        };

        let token = Uuid::new_v4().to_string();
        let expires_at = Utc::now() + self.session_ttl;
        inner
            .sessions
            .insert(token.clone(), SessionRecord { user_id, expires_at });

        let user = inner.users[&user_id].clone();
        (user, token)
    }

    pub async fn create_room(&self, name: &str, is_public: bool, owner_id: UserId) -> Room {
        let mut inner = self.inner.write().await;
        inner.next_room_id += 1;
        let room = Room {
            id: inner.next_room_id,
            name: name.to_owned(),
            is_public,
            owner_id,
        };
        inner.rooms.insert(room.id, room.clone());
        // the owner is a member from the start
        inner.members.entry(room.id).or_default().insert(owner_id);
        room
    }

    pub async fn room(&self, room_id: RoomId) -> Option<Room> {
        self.inner.read().await.rooms.get(&room_id).cloned()
    }

    pub async fn public_rooms(&self) -> Vec<Room> {
        let inner = self.inner.read().await;
        let mut rooms: Vec<Room> = inner
            .rooms
            .values()
            .filter(|room| room.is_public)
            .cloned()
            .collect();
        rooms.sort_by_key(|room| room.id);
        rooms
    }

    /// Rooms the user is a member of, including rooms they own.
    pub async fn rooms_for_user(&self, user_id: UserId) -> Vec<Room> {
        let inner = self.inner.read().await;
        let mut rooms: Vec<Room> = inner
            .rooms
            .values()
            .filter(|room| {
                inner
                    .members
                    .get(&room.id)
                    .is_some_and(|members| members.contains(&user_id))
            })
            .cloned()
            .collect();
        rooms.sort_by_key(|room| room.id);
        rooms
    }

    /// Current members of a room, by id.
    pub async fn members(&self, room_id: RoomId) -> Result<Vec<UserRef>, AppError> {
        let inner = self.inner.read().await;
        if !inner.rooms.contains_key(&room_id) {
            return Err(AppError::NotFound(format!("room {room_id}")));
        }
        let mut members: Vec<UserRef> = inner
            .members
            .get(&room_id)
            .into_iter()
            .flatten()
            .filter_map(|user_id| inner.users.get(user_id).cloned())
            .collect();
        members.sort_by_key(|user| user.id);
        Ok(members)
    }

    /// Delete a room and its membership set. Only the owner may delete.
    pub async fn delete_room(&self, room_id: RoomId, requester: UserId) -> Result<(), AppError> {
        let mut inner = self.inner.write().await;
        let Some(room) = inner.rooms.get(&room_id) else {
            return Err(AppError::NotFound(format!("room {room_id}")));
        };
        if room.owner_id != requester {
            return Err(AppError::Forbidden(
                "only the owner can delete a room".to_string(),
            ));
        }
        inner.rooms.remove(&room_id);
        inner.members.remove(&room_id);
        Ok(())
    }

    /// Returns false when the user was already a member.
    pub async fn join(&self, room_id: RoomId, user_id: UserId) -> Result<bool, AppError> {
        let mut inner = self.inner.write().await;
        if !inner.rooms.contains_key(&room_id) {
            return Err(AppError::NotFound(format!("room {room_id}")));
        }
        Ok(inner.members.entry(room_id).or_default().insert(user_id))
    }

    /// Returns false when the user was not a member.
    pub async fn leave(&self, room_id: RoomId, user_id: UserId) -> Result<bool, AppError> {
        let mut inner = self.inner.write().await;
        if !inner.rooms.contains_key(&room_id) {
            return Err(AppError::NotFound(format!("room {room_id}")));
        }
        Ok(inner
            .members
            .get_mut(&room_id)
            .is_some_and(|members| members.remove(&user_id)))
    }

    async fn sweep_task(&self) {
        let sweep_interval = Duration::from_secs(60 * 60);

        loop {
            tokio::time::sleep(sweep_interval).await;

            let mut inner = self.inner.write().await;
            let now = Utc::now();
            let before = inner.sessions.len();
            inner.sessions.retain(|_, record| record.expires_at > now);
            let removed = before - inner.sessions.len();
            if removed > 0 {
                tracing::debug!(removed, "swept expired sessions");
            }
        }
    }
}

#[async_trait]
impl SessionStore for Directory {
    async fn resolve(&self, token: &str) -> Result<Option<UserRef>, AppError> {
        let inner = self.inner.read().await;
        let Some(record) = inner.sessions.get(token) else {
            return Ok(None);
        };
        if record.expires_at <= Utc::now() {
            return Ok(None);
        }
        Ok(inner.users.get(&record.user_id).cloned())
    }
}

#[async_trait]
impl MembershipStore for Directory {
    async fn is_member(&self, room_id: RoomId, user_id: UserId) -> Result<bool, AppError> {
        let inner = self.inner.read().await;
        Ok(inner
            .members
            .get(&room_id)
            .is_some_and(|members| members.contains(&user_id)))
    }
}
