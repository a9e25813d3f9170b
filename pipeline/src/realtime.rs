//! Real-time fan-out of rule matches to connected WebSocket clients.
//!
//! Every connection can join one or more user channels. Publishing to a user
//! reaches only the connections currently joined to that channel; there is no
//! buffering for clients that are offline. A connection whose outbox is full
//! loses the event.

use crate::errors::Result;
use crate::metrics::{REALTIME_CONNECTIONS, REALTIME_EVENTS_DELIVERED, REALTIME_EVENTS_DROPPED};
use crate::model::RealtimeEvent;
use async_trait::async_trait;
use axum::extract::ws::Message;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Frames queued per connection before new events are dropped.
pub const OUTBOX_CAPACITY: usize = 64;

pub type WsSender = mpsc::Sender<Message>;

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Delivers the event to every connection joined to `user_id`'s channel
    /// and returns how many received it.
    async fn publish(&self, user_id: Uuid, event: &RealtimeEvent) -> Result<usize>;
}

struct Connection {
    channels: HashSet<Uuid>,
    sender: WsSender,
}

/// Outbound frame shape.
#[derive(Serialize)]
struct Envelope<'a> {
    event: &'static str,
    data: &'a RealtimeEvent,
}

/// Live connection registry. Created once at startup and handed to both the
/// socket handler and the rule engine.
#[derive(Default)]
pub struct ChannelRegistry {
    connections: RwLock<HashMap<Uuid, Connection>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection and returns the receiver its socket task drains.
    pub async fn connect(&self, conn_id: Uuid) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        self.connections.write().await.insert(
            conn_id,
            Connection {
                channels: HashSet::new(),
                sender: tx,
            },
        );
        REALTIME_CONNECTIONS.inc();
        rx
    }

    /// Drops the connection along with all of its channel memberships.
    pub async fn disconnect(&self, conn_id: Uuid) {
        if self.connections.write().await.remove(&conn_id).is_some() {
            REALTIME_CONNECTIONS.dec();
        }
    }

    pub async fn join(&self, conn_id: Uuid, user_id: Uuid) -> bool {
        match self.connections.write().await.get_mut(&conn_id) {
            Some(conn) => {
                conn.channels.insert(user_id);
                true
            }
            None => false,
        }
    }

    pub async fn leave(&self, conn_id: Uuid, user_id: Uuid) {
        if let Some(conn) = self.connections.write().await.get_mut(&conn_id) {
            conn.channels.remove(&user_id);
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

#[async_trait]
impl Publisher for ChannelRegistry {
    async fn publish(&self, user_id: Uuid, event: &RealtimeEvent) -> Result<usize> {
        let text = serde_json::to_string(&Envelope {
            event: "notification",
            data: event,
        })?;

        let conns = self.connections.read().await;
        let mut delivered = 0;
        for (conn_id, conn) in conns.iter().filter(|(_, c)| c.channels.contains(&user_id)) {
            match conn.sender.try_send(Message::Text(text.clone())) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    REALTIME_EVENTS_DROPPED.inc();
                    warn!(conn_id = %conn_id, user_id = %user_id, "Outbox full, dropping event");
                }
                // The socket is going away; cleanup happens there.
                Err(TrySendError::Closed(_)) => {}
            }
        }

        REALTIME_EVENTS_DELIVERED.inc_by(delivered as f64);
        debug!(user_id = %user_id, delivered, "Published real-time event");
        Ok(delivered)
    }
}
