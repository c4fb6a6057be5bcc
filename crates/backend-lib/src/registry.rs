// ============================
// roomcast-backend-lib/src/registry.rs
// ============================
//! Process-local connection registry.
//!
//! Tracks which live websocket connections belong to which room *on this
//! process* and fans a payload out to all of them. Connections are addressed
//! by the sending half of their forwarding channel; the actual socket write
//! happens in each connection's own forward task, so no registry operation
//! ever suspends on network I/O.

use dashmap::DashMap;
use metrics::counter;
use roomcast_common::RoomId;
use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identifies one live connection within this process.
pub type ConnectionId = Uuid;

/// Sending half of a connection's forwarding channel. Payloads are
/// already-encoded JSON frames.
pub type PayloadSender = mpsc::Sender<String>;

#[derive(Default)]
pub struct ConnectionRegistry {
    rooms: DashMap<RoomId, HashMap<ConnectionId, PayloadSender>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    /// Add a connection to a room's set, creating the set on first use.
    /// Callers must not register the same connection twice.
    pub fn register(&self, room_id: RoomId, conn_id: ConnectionId, tx: PayloadSender) {
        self.rooms.entry(room_id).or_default().insert(conn_id, tx);
    }

    /// Remove a connection from its room; the room bucket is dropped once
    /// empty. Unregistering an unknown connection is a no-op so that
    /// disconnect cleanup can run after partial failures.
    pub fn unregister(&self, room_id: RoomId, conn_id: ConnectionId) {
        let mut drop_room = false;
        if let Some(mut conns) = self.rooms.get_mut(&room_id) {
            conns.remove(&conn_id);
            drop_room = conns.is_empty();
        }
        if drop_room {
            self.rooms.remove_if(&room_id, |_, conns| conns.is_empty());
        }
    }

    /// Send `payload` to every connection registered for `room_id` on this
    /// process. Each send is attempted independently: a closed or saturated
    /// forwarding channel is skipped, never propagated. Returns the number
    /// of connections the payload was handed to.
    pub fn deliver_local(&self, room_id: RoomId, payload: &str) -> usize {
        // Snapshot the senders so a slow connection cannot hold the shard
        // lock against register/unregister.
        let targets: Vec<(ConnectionId, PayloadSender)> = match self.rooms.get(&room_id) {
            Some(conns) => conns.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for (conn_id, tx) in targets {
            match tx.try_send(payload.to_owned()) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::debug!(room_id, %conn_id, %err, "skipping undeliverable connection");
                },
            }
        }
        counter!(crate::metrics::DELIVERIES_LOCAL).increment(delivered as u64);
        delivered
    }

    /// Number of connections currently registered for a room on this process.
    pub fn local_connections(&self, room_id: RoomId) -> usize {
        self.rooms.get(&room_id).map_or(0, |conns| conns.len())
    }
}
