// ============================
// roomcast-backend-lib/src/gate.rs
// ============================
//! Admission gate for realtime connections.

use crate::error::AppError;
use crate::stores::{MembershipStore, SessionStore};
use roomcast_common::{RoomId, UserRef};
use std::sync::Arc;

/// Validates an inbound connection's credentials and room membership before
/// admission. Pure: runs once per connection and mutates nothing.
pub struct SessionGate {
    sessions: Arc<dyn SessionStore>,
    memberships: Arc<dyn MembershipStore>,
}

impl SessionGate {
    pub fn new(sessions: Arc<dyn SessionStore>, memberships: Arc<dyn MembershipStore>) -> Self {
        Self {
            sessions,
            memberships,
        }
    }

    /// Resolve the session token to a user and require room membership.
    /// Membership is always enforced; there is no authenticated-only mode.
    pub async fn admit(
        &self,
        token: Option<&str>,
        room_id: RoomId,
    ) -> Result<UserRef, AppError> {
        let token = token.ok_or(AppError::Unauthenticated)?;
        let user = self
            .sessions
            .resolve(token)
            .await?
            .ok_or(AppError::Unauthenticated)?;

        if !self.memberships.is_member(room_id, user.id).await? {
            return Err(AppError::Forbidden(format!(
                "user {} is not a member of room {room_id}",
                user.id
            )));
        }

        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use roomcast_common::UserId;

    struct StubSessions {
        token: &'static str,
        user: UserRef,
    }

    #[async_trait]
    impl SessionStore for StubSessions {
        async fn resolve(&self, token: &str) -> Result<Option<UserRef>, AppError> {
            Ok((token == self.token).then(|| self.user.clone()))
        }
    }

    struct StubMemberships {
        room_id: RoomId,
        user_id: UserId,
    }

    #[async_trait]
    impl MembershipStore for StubMemberships {
        async fn is_member(&self, room_id: RoomId, user_id: UserId) -> Result<bool, AppError> {
            Ok(room_id == self.room_id && user_id == self.user_id)
        }
    }

    fn gate() -> SessionGate {
        SessionGate::new(
            Arc::new(StubSessions {
                token: "good-token",
                user: UserRef {
                    id: 1,
                    name: "alice".to_string(),
                },
            }),
            Arc::new(StubMemberships {
                room_id: 7,
                user_id: 1,
            }),
        )
    }

    #[tokio::test]
    async fn admits_member_with_valid_token() {
        let user = gate().admit(Some("good-token"), 7).await.unwrap();
        assert_eq!(user.id, 1);
    }

    #[tokio::test]
    async fn missing_token_is_unauthenticated() {
        assert!(matches!(
            gate().admit(None, 7).await,
            Err(AppError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn unknown_token_is_unauthenticated() {
        assert!(matches!(
            gate().admit(Some("stale"), 7).await,
            Err(AppError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn non_member_is_forbidden() {
        assert!(matches!(
            gate().admit(Some("good-token"), 8).await,
            Err(AppError::Forbidden(_))
        ));
    }
}
