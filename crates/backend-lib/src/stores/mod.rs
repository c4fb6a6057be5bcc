// ============================
// roomcast-backend-lib/src/stores/mod.rs
// ============================
//! External collaborators consumed by the realtime core, behind narrow
//! contracts. The session loop and gate only ever see these traits; the
//! concrete backends live in the submodules.

pub mod directory;
pub mod flatfile;

pub use directory::{Directory, Room};
pub use flatfile::FlatFileMessageStore;

use crate::error::AppError;
use async_trait::async_trait;
use roomcast_common::{Message, RoomId, UserId, UserRef};

/// Maps an opaque session token to the user who owns it, if current.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<Option<UserRef>, AppError>;
}

/// Answers room membership questions.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn is_member(&self, room_id: RoomId, user_id: UserId) -> Result<bool, AppError>;
}

/// Durable message log.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message. The store assigns the id and timestamp and embeds
    /// the author's display identity, returning the canonical form that is
    /// broadcast and served from history.
    async fn append(
        &self,
        room_id: RoomId,
        author: &UserRef,
        content: &str,
    ) -> Result<Message, AppError>;

    /// Newest-first page of persisted messages.
    async fn recent(
        &self,
        room_id: RoomId,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Message>, AppError>;
}
