use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// Pub/sub channel every server process subscribes to.
pub const FANOUT_CHANNEL: &str = "matchwire:events";

/// A domain event addressed to one user, independent of which process holds
/// that user's live connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub user_id: String,
    pub message: ServerMessage,
}

/// Delivery boundary for domain events. The core publishes here and never
/// touches sockets directly.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, user_id: &str, message: ServerMessage) -> Result<()>;
}

/// Live WebSocket senders owned by this process: user id -> connection id ->
/// outbound channel. A user may hold several connections (tabs, devices).
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<String, DashMap<Uuid, mpsc::UnboundedSender<ServerMessage>>>>,
}

impl ConnectionRegistry {
    pub fn register(
        &self,
        user_id: &str,
        connection_id: Uuid,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) {
        self.connections
            .entry(user_id.to_string())
            .or_default()
            .insert(connection_id, tx);
    }

    pub fn deregister(&self, user_id: &str, connection_id: &Uuid) {
        let mut remove_user = false;
        if let Some(conns) = self.connections.get(user_id) {
            conns.remove(connection_id);
            // decide outside the guard, as with any DashMap removal
            remove_user = conns.is_empty();
        }
        if remove_user {
            self.connections.remove(user_id);
        }
    }

    /// Push a message to every local connection of `user_id`. Returns how
    /// many connections received it; zero when the user is connected to a
    /// different process (or not at all).
    pub fn send_local(&self, user_id: &str, message: ServerMessage) -> usize {
        let Some(conns) = self.connections.get(user_id) else {
            return 0;
        };
        let mut delivered = 0;
        for conn in conns.iter() {
            if conn.value().send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

/// Publishes envelopes to Redis pub/sub so whichever process holds the
/// target user's connections can deliver them.
#[derive(Clone)]
pub struct RedisFanout {
    redis: ConnectionManager,
}

impl RedisFanout {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl EventSink for RedisFanout {
    async fn deliver(&self, user_id: &str, message: ServerMessage) -> Result<()> {
        let payload = serde_json::to_string(&Envelope {
            user_id: user_id.to_string(),
            message,
        })?;
        let mut conn = self.redis.clone();
        let _: i64 = conn.publish(FANOUT_CHANNEL, payload).await?;
        Ok(())
    }
}

/// Subscribe to the fanout channel and push each envelope to the locally
/// connected target, if any. Returns when the pub/sub stream ends; the
/// caller is expected to reconnect.
pub async fn run_fanout_listener(
    client: redis::Client,
    registry: ConnectionRegistry,
) -> Result<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(FANOUT_CHANNEL).await?;
    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "unreadable fanout payload");
                continue;
            }
        };
        match serde_json::from_str::<Envelope>(&payload) {
            Ok(envelope) => {
                let delivered = registry.send_local(&envelope.user_id, envelope.message);
                debug!(user_id = %envelope.user_id, delivered, "fanout delivery");
            }
            Err(err) => warn!(error = %err, "malformed fanout envelope"),
        }
    }
    Ok(())
}
