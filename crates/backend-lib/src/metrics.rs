// ==============
// crates/backend-lib/src/metrics.rs

//! Central place for metric keys
pub const WS_CONNECTIONS: &str = "ws.connections";
pub const WS_ACTIVE: &str = "ws.active";
pub const MESSAGES_PERSISTED: &str = "messages.persisted";
pub const MESSAGES_PUBLISHED: &str = "messages.published";
pub const DELIVERIES_LOCAL: &str = "deliveries.local";
pub const BRIDGE_LISTENERS: &str = "bridge.listeners";
