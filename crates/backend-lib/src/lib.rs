// ============================
// roomcast-backend-lib/src/lib.rs
// ============================
//! Core functionality for the roomcast chat relay server.
//!
//! The realtime subsystem is `gate` -> `session` -> (`stores` persist) ->
//! `bridge` publish -> every process's bridge listener -> `registry`
//! deliver. `api` carries the surrounding request/response bookkeeping.

pub mod api;
pub mod bridge;
pub mod config;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod presence;
pub mod registry;
pub mod session;
pub mod stores;
pub mod ws_router;

use crate::bridge::{BroadcastBridge, BroadcastTransport, InProcessTransport, RedisTransport};
use crate::config::Settings;
use crate::gate::SessionGate;
use crate::presence::{
    InMemoryPresenceStore, PresenceStore, PresenceTracker, RedisPresenceStore,
};
use crate::registry::ConnectionRegistry;
use crate::stores::{
    Directory, FlatFileMessageStore, MembershipStore, MessageStore, SessionStore,
};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Application state shared across all handlers. Created once at process
/// start, torn down at process shutdown, never reset.
pub struct AppState {
    /// Settings
    pub settings: Arc<Settings>,
    /// Users, rooms, memberships and sessions
    pub directory: Arc<Directory>,
    /// Durable message log
    pub messages: Arc<dyn MessageStore>,
    /// Distributed presence counters
    pub presence: Arc<PresenceTracker>,
    /// Process-local connection registry
    pub registry: Arc<ConnectionRegistry>,
    /// Cross-process broadcast bridge
    pub bridge: Arc<BroadcastBridge>,
    /// Admission gate
    pub gate: Arc<SessionGate>,
}

impl AppState {
    /// Assemble the state from explicit collaborators.
    pub fn new(
        settings: Settings,
        messages: Arc<dyn MessageStore>,
        presence_store: Arc<dyn PresenceStore>,
        transport: Arc<dyn BroadcastTransport>,
    ) -> Self {
        let settings = Arc::new(settings);
        let directory = Arc::new(Directory::new(Duration::from_secs(
            settings.session_ttl_secs,
        )));
        let gate = Arc::new(SessionGate::new(
            directory.clone() as Arc<dyn SessionStore>,
            directory.clone() as Arc<dyn MembershipStore>,
        ));

        Self {
            settings,
            directory,
            messages,
            presence: Arc::new(PresenceTracker::new(presence_store)),
            registry: Arc::new(ConnectionRegistry::new()),
            bridge: Arc::new(BroadcastBridge::new(transport)),
            gate,
        }
    }

    /// Single-process state: flat-file messages, in-memory presence and an
    /// in-process broadcast transport. Cross-process delivery requires
    /// [`AppState::with_redis`].
    pub fn in_process(settings: Settings) -> anyhow::Result<Self> {
        let messages = Arc::new(FlatFileMessageStore::new(&settings.data_dir)?);
        Ok(Self::new(
            settings,
            messages,
            Arc::new(InMemoryPresenceStore::new()),
            Arc::new(InProcessTransport::new()),
        ))
    }

    /// Multi-process state: presence and broadcasts go through Redis so
    /// every server process sees them.
    pub async fn with_redis(settings: Settings, redis_url: &str) -> anyhow::Result<Self> {
        let messages = Arc::new(FlatFileMessageStore::new(&settings.data_dir)?);
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        let presence = Arc::new(RedisPresenceStore::new(manager.clone()));
        let transport = Arc::new(RedisTransport::new(client, manager));
        Ok(Self::new(settings, messages, presence, transport))
    }
}

/// The full application router: bookkeeping API plus the realtime endpoint.
pub fn router(state: Arc<AppState>) -> Router {
    api::create_router(state.clone())
        .merge(ws_router::create_router(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
