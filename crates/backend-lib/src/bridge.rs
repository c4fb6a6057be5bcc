// ============================
// roomcast-backend-lib/src/bridge.rs
// ============================
//! Cross-process broadcast bridge.
//!
//! Every room has a pub/sub channel (`room:{id}`) on a transport shared by
//! all server processes. Publishing is fire-and-forget: a process that is
//! not subscribed at publish time never sees the announcement, which is fine
//! because the message was persisted before it was published and late
//! joiners read history instead.
//!
//! Each process runs at most ONE listener task per room, reference-counted
//! by the number of local connections in that room. The first connection in
//! starts the listener, the last one out stops it, and every local client
//! therefore receives exactly one copy of each broadcast.

use crate::error::AppError;
use crate::registry::ConnectionRegistry;
use async_trait::async_trait;
use futures_util::StreamExt;
use metrics::gauge;
use redis::AsyncCommands;
use roomcast_common::RoomId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, Mutex};

fn channel_name(room_id: RoomId) -> String {
    format!("room:{room_id}")
}

/// A live subscription to one channel.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next announcement. `None` means the transport side is
    /// gone and the listener should stop.
    async fn next_payload(&mut self) -> Option<String>;
    /// Best-effort teardown, called before the listener exits.
    async fn unsubscribe(&mut self);
}

/// Pub/sub transport shared by all server processes.
#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    /// Fire-and-forget announcement to all current subscribers of `channel`.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), AppError>;
    /// Open a subscription to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, AppError>;
}

/// Redis pub/sub transport. Publishes over a multiplexed connection and
/// opens a dedicated pub/sub connection per subscription.
pub struct RedisTransport {
    client: redis::Client,
    publisher: redis::aio::ConnectionManager,
}

impl RedisTransport {
    pub fn new(client: redis::Client, publisher: redis::aio::ConnectionManager) -> Self {
        Self { client, publisher }
    }
}

#[async_trait]
impl BroadcastTransport for RedisTransport {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), AppError> {
        let mut conn = self.publisher.clone();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, AppError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        Ok(Box::new(RedisSubscription {
            pubsub,
            channel: channel.to_owned(),
        }))
    }
}

struct RedisSubscription {
    pubsub: redis::aio::PubSub,
    channel: String,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_payload(&mut self) -> Option<String> {
        loop {
            let msg = self.pubsub.on_message().next().await?;
            match msg.get_payload::<String>() {
                Ok(payload) => return Some(payload),
                Err(err) => {
                    tracing::warn!(channel = %self.channel, %err, "dropping undecodable announcement");
                },
            }
        }
    }

    async fn unsubscribe(&mut self) {
        if let Err(err) = self.pubsub.unsubscribe(&self.channel).await {
            tracing::debug!(channel = %self.channel, %err, "unsubscribe failed during teardown");
        }
    }
}

/// In-process transport over tokio broadcast channels. Used by tests and by
/// redis-less single-process deployments; semantics match pub/sub (no
/// subscriber at publish time means the announcement is lost).
#[derive(Default)]
pub struct InProcessTransport {
    topics: parking_lot::Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.topics
            .lock()
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }
}

#[async_trait]
impl BroadcastTransport for InProcessTransport {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), AppError> {
        // send only errors when nobody is subscribed, which pub/sub permits
        let _ = self.sender(channel).send(payload.to_owned());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, AppError> {
        Ok(Box::new(InProcessSubscription {
            rx: self.sender(channel).subscribe(),
        }))
    }
}

struct InProcessSubscription {
    rx: broadcast::Receiver<String>,
}

#[async_trait]
impl Subscription for InProcessSubscription {
    async fn next_payload(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "listener lagged behind the broadcast channel");
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn unsubscribe(&mut self) {}
}

struct RoomListener {
    connections: usize,
    // distinguishes this listener from any successor for the same room
    generation: u64,
    shutdown: Option<oneshot::Sender<()>>,
}

/// Publishes announcements and manages the per-room listener tasks that
/// forward arriving announcements into the local [`ConnectionRegistry`].
pub struct BroadcastBridge {
    transport: Arc<dyn BroadcastTransport>,
    listeners: Arc<Mutex<HashMap<RoomId, RoomListener>>>,
    generations: AtomicU64,
}

impl BroadcastBridge {
    pub fn new(transport: Arc<dyn BroadcastTransport>) -> Self {
        Self {
            transport,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
        }
    }

    /// Announce an encoded message to all subscribers of the room's channel,
    /// on any process.
    pub async fn publish(&self, room_id: RoomId, payload: &str) -> Result<(), AppError> {
        self.transport.publish(&channel_name(room_id), payload).await
    }

    /// Register one local connection's interest in a room. The first
    /// connection subscribes and spawns the forwarding listener; later ones
    /// only bump the refcount. A room whose listener died because its
    /// subscription closed upstream has no entry here, so the next acquire
    /// resubscribes.
    pub async fn acquire(
        &self,
        room_id: RoomId,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<(), AppError> {
        let mut listeners = self.listeners.lock().await;
        if let Some(entry) = listeners.get_mut(&room_id) {
            entry.connections += 1;
            return Ok(());
        }

        let mut subscription = self.transport.subscribe(&channel_name(room_id)).await?;
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let table = self.listeners.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        subscription.unsubscribe().await;
                        break;
                    },
                    payload = subscription.next_payload() => match payload {
                        Some(payload) => {
                            registry.deliver_local(room_id, &payload);
                        },
                        None => {
                            // the transport side is gone; clear this
                            // listener's entry (and only this one's) so a
                            // later acquire opens a fresh subscription
                            tracing::warn!(room_id, "broadcast subscription closed upstream");
                            let mut table = table.lock().await;
                            if table
                                .get(&room_id)
                                .is_some_and(|entry| entry.generation == generation)
                            {
                                table.remove(&room_id);
                                gauge!(crate::metrics::BRIDGE_LISTENERS).decrement(1.0);
                            }
                            break;
                        },
                    },
                }
            }
        });

        listeners.insert(
            room_id,
            RoomListener {
                connections: 1,
                generation,
                shutdown: Some(shutdown_tx),
            },
        );
        gauge!(crate::metrics::BRIDGE_LISTENERS).increment(1.0);
        Ok(())
    }

    /// Drop one local connection's interest in a room. The last connection
    /// out signals the listener to unsubscribe and exit. Releasing a room
    /// with no listener is a no-op.
    pub async fn release(&self, room_id: RoomId) {
        let mut listeners = self.listeners.lock().await;
        let last = match listeners.get_mut(&room_id) {
            Some(entry) => {
                entry.connections = entry.connections.saturating_sub(1);
                entry.connections == 0
            },
            None => return,
        };
        if !last {
            return;
        }
        if let Some(mut entry) = listeners.remove(&room_id) {
            if let Some(shutdown) = entry.shutdown.take() {
                // a failed send means the listener already exited
                let _ = shutdown.send(());
            }
            gauge!(crate::metrics::BRIDGE_LISTENERS).decrement(1.0);
        }
    }

    /// Number of listener tasks currently running on this process.
    pub async fn listener_count(&self) -> usize {
        self.listeners.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout, Duration};
    use uuid::Uuid;

    async fn recv(rx: &mut mpsc::Receiver<String>) -> String {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("channel closed")
    }

    /// A subscription whose transport side is already gone.
    struct ClosedSubscription;

    #[async_trait]
    impl Subscription for ClosedSubscription {
        async fn next_payload(&mut self) -> Option<String> {
            None
        }

        async fn unsubscribe(&mut self) {}
    }

    /// Hands out closed subscriptions for the first `dead_subscriptions`
    /// subscribe calls, then behaves like a healthy in-process transport.
    struct RecoveringTransport {
        inner: InProcessTransport,
        dead_subscriptions: AtomicUsize,
    }

    impl RecoveringTransport {
        fn new(dead_subscriptions: usize) -> Self {
            Self {
                inner: InProcessTransport::new(),
                dead_subscriptions: AtomicUsize::new(dead_subscriptions),
            }
        }
    }

    #[async_trait]
    impl BroadcastTransport for RecoveringTransport {
        async fn publish(&self, channel: &str, payload: &str) -> Result<(), AppError> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, AppError> {
            let remaining = self.dead_subscriptions.load(Ordering::Relaxed);
            if remaining > 0 {
                self.dead_subscriptions.store(remaining - 1, Ordering::Relaxed);
                return Ok(Box::new(ClosedSubscription));
            }
            self.inner.subscribe(channel).await
        }
    }

    async fn wait_for_listener_count(bridge: &BroadcastBridge, expected: usize) {
        for _ in 0..100 {
            if bridge.listener_count().await == expected {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("listener count never reached {expected}");
    }

    #[tokio::test]
    async fn two_local_connections_single_copy() {
        let transport = Arc::new(InProcessTransport::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = BroadcastBridge::new(transport);

        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        registry.register(7, Uuid::new_v4(), tx_a);
        registry.register(7, Uuid::new_v4(), tx_b);

        bridge.acquire(7, registry.clone()).await.unwrap();
        bridge.acquire(7, registry.clone()).await.unwrap();
        assert_eq!(bridge.listener_count().await, 1);

        bridge.publish(7, "one and only").await.unwrap();

        assert_eq!(recv(&mut rx_a).await, "one and only");
        assert_eq!(recv(&mut rx_b).await, "one and only");
        // exactly one copy each, even with two connections acquired
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn listener_stops_when_last_connection_releases() {
        let transport = Arc::new(InProcessTransport::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = BroadcastBridge::new(transport);

        bridge.acquire(7, registry.clone()).await.unwrap();
        bridge.acquire(7, registry.clone()).await.unwrap();

        bridge.release(7).await;
        assert_eq!(bridge.listener_count().await, 1);

        bridge.release(7).await;
        assert_eq!(bridge.listener_count().await, 0);

        // releasing with no listener must not panic
        bridge.release(7).await;
    }

    #[tokio::test]
    async fn bridges_sharing_a_transport_both_deliver() {
        // Two bridges + registries stand in for two server processes.
        let transport = Arc::new(InProcessTransport::new());
        let registry_one = Arc::new(ConnectionRegistry::new());
        let registry_two = Arc::new(ConnectionRegistry::new());
        let bridge_one = BroadcastBridge::new(transport.clone());
        let bridge_two = BroadcastBridge::new(transport);

        let (tx_one, mut rx_one) = mpsc::channel(8);
        let (tx_two, mut rx_two) = mpsc::channel(8);
        registry_one.register(3, Uuid::new_v4(), tx_one);
        registry_two.register(3, Uuid::new_v4(), tx_two);

        bridge_one.acquire(3, registry_one).await.unwrap();
        bridge_two.acquire(3, registry_two).await.unwrap();

        bridge_one.publish(3, "hello, other process").await.unwrap();

        assert_eq!(recv(&mut rx_one).await, "hello, other process");
        assert_eq!(recv(&mut rx_two).await, "hello, other process");
    }

    #[tokio::test]
    async fn upstream_close_clears_the_listener_so_acquire_resubscribes() {
        let transport = Arc::new(RecoveringTransport::new(1));
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = BroadcastBridge::new(transport);

        let (tx, mut rx) = mpsc::channel(8);
        registry.register(7, Uuid::new_v4(), tx);

        // the first subscription is dead on arrival; its listener must exit
        // AND drop out of the table, not linger with a live refcount
        bridge.acquire(7, registry.clone()).await.unwrap();
        wait_for_listener_count(&bridge, 0).await;

        // the next connection in opens a fresh subscription
        bridge.acquire(7, registry.clone()).await.unwrap();
        assert_eq!(bridge.listener_count().await, 1);

        bridge.publish(7, "back on the air").await.unwrap();
        assert_eq!(recv(&mut rx).await, "back on the air");

        // the refcount of the replacement listener is 1, not a stale 2
        bridge.release(7).await;
        assert_eq!(bridge.listener_count().await, 0);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_lost_not_an_error() {
        let transport = InProcessTransport::new();
        transport.publish("room:9", "into the void").await.unwrap();
    }
}
