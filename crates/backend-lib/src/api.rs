// ============================
// roomcast-backend-lib/src/api.rs
// ============================
//! HTTP bookkeeping API: sessions, rooms, history and presence stats.
//! Everything here is ordinary request/response work; the realtime path
//! lives in `ws_router` and `session`.

use crate::error::AppError;
use crate::stores::SessionStore;
use crate::ws_router::{session_cookie, SESSION_COOKIE};
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{AppendHeaders, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use roomcast_common::{RoomId, UserRef};
use serde::Deserialize;
use std::sync::Arc;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/session/start", post(start_session))
        .route("/session/me", get(me))
        .route("/rooms", post(create_room))
        .route("/rooms/public", get(list_public_rooms))
        .route("/rooms/my", get(list_my_rooms))
        .route("/rooms/{room_id}", get(room_details).delete(delete_room))
        .route("/rooms/{room_id}/join", post(join_room))
        .route("/rooms/{room_id}/leave", post(leave_room))
        .route("/rooms/{room_id}/members", get(room_members))
        .route("/rooms/{room_id}/messages", get(room_messages))
        .route("/rooms/{room_id}/stats", get(room_stats))
        .route("/feed/public", get(public_feed))
        .route("/stats/public", get(public_stats))
        .with_state(state)
}

async fn current_user(state: &AppState, headers: &HeaderMap) -> Result<UserRef, AppError> {
    let token = session_cookie(headers).ok_or(AppError::Unauthenticated)?;
    state
        .directory
        .resolve(&token)
        .await?
        .ok_or(AppError::Unauthenticated)
}

#[derive(Deserialize)]
struct StartSession {
    name: String,
}

async fn start_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartSession>,
) -> Result<impl IntoResponse, AppError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(AppError::InvalidInput("name must not be empty".to_string()));
    }

    let (user, token) = state.directory.start_session(name).await;
    let cookie = format!("{SESSION_COOKIE}={token}; HttpOnly; SameSite=Lax; Path=/");
    Ok((
        AppendHeaders([(header::SET_COOKIE, cookie)]),
        Json(user),
    ))
}

async fn me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let user = current_user(&state, &headers).await?;
    Ok(Json(user))
}

fn default_public() -> bool {
    true
}

#[derive(Deserialize)]
struct CreateRoom {
    name: String,
    #[serde(default = "default_public")]
    is_public: bool,
}

async fn create_room(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateRoom>,
) -> Result<impl IntoResponse, AppError> {
    let user = current_user(&state, &headers).await?;
    let name = req.name.trim();
    if name.is_empty() {
        return Err(AppError::InvalidInput("name must not be empty".to_string()));
    }

    let room = state.directory.create_room(name, req.is_public, user.id).await;
    Ok((StatusCode::CREATED, Json(room)))
}

async fn list_public_rooms(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.directory.public_rooms().await))
}

async fn list_my_rooms(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let user = current_user(&state, &headers).await?;
    Ok(Json(state.directory.rooms_for_user(user.id).await))
}

/// The room record together with its current members.
async fn room_details(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<RoomId>,
) -> Result<impl IntoResponse, AppError> {
    let room = state
        .directory
        .room(room_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("room {room_id}")))?;
    let members = state.directory.members(room_id).await?;
    Ok(Json(serde_json::json!({
        "id": room.id,
        "name": room.name,
        "is_public": room.is_public,
        "owner_id": room.owner_id,
        "members": members,
    })))
}

async fn delete_room(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<RoomId>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let user = current_user(&state, &headers).await?;
    state.directory.delete_room(room_id, user.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn room_members(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<RoomId>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.directory.members(room_id).await?))
}

async fn join_room(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<RoomId>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let user = current_user(&state, &headers).await?;
    if !state.directory.join(room_id, user.id).await? {
        return Err(AppError::InvalidInput(
            "already a member of this room".to_string(),
        ));
    }
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"status": "joined"})),
    ))
}

async fn leave_room(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<RoomId>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let user = current_user(&state, &headers).await?;
    if !state.directory.leave(room_id, user.id).await? {
        return Err(AppError::NotFound("not a member of this room".to_string()));
    }
    Ok(Json(serde_json::json!({"status": "left"})))
}

fn default_limit() -> usize {
    50
}

#[derive(Deserialize)]
struct HistoryPage {
    #[serde(default)]
    skip: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

/// Persisted history, newest-first. A message observed live is guaranteed to
/// be here: persistence always precedes the broadcast.
async fn room_messages(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<RoomId>,
    Query(page): Query<HistoryPage>,
) -> Result<impl IntoResponse, AppError> {
    if state.directory.room(room_id).await.is_none() {
        return Err(AppError::NotFound(format!("room {room_id}")));
    }
    let limit = page.limit.min(state.settings.history_page_limit);
    let messages = state.messages.recent(room_id, page.skip, limit).await?;
    Ok(Json(messages))
}

async fn room_stats(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<RoomId>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    current_user(&state, &headers).await?;
    if state.directory.room(room_id).await.is_none() {
        return Err(AppError::NotFound(format!("room {room_id}")));
    }
    let active_users = state.presence.count_active(room_id).await?;
    Ok(Json(serde_json::json!({ "active_users": active_users })))
}

/// The public room listing annotated with each room's live presence count.
async fn public_feed(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let rooms = state.directory.public_rooms().await;
    let mut feed = Vec::with_capacity(rooms.len());
    for room in rooms {
        let active_users = state.presence.count_active(room.id).await?;
        feed.push(serde_json::json!({
            "id": room.id,
            "name": room.name,
            "is_public": room.is_public,
            "owner_id": room.owner_id,
            "active_users": active_users,
        }));
    }
    Ok(Json(feed))
}

async fn public_stats(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let total = state.presence.count_global_active().await?;
    Ok(Json(serde_json::json!({ "total_online_users": total })))
}
