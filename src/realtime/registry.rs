use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use log::{debug, error, info};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};

use super::protocol::ServerEvent;

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// What the socket writer task should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Handle to one live realtime connection. Cloning shares the same socket.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Outbound>,
    mobile: bool,
}

impl Connection {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>, mobile: bool) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            mobile,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_mobile(&self) -> bool {
        self.mobile
    }

    /// False once the writer side has gone away.
    pub fn is_live(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn send(&self, event: &ServerEvent) -> bool {
        match event.encode() {
            Ok(text) => self.send_text(text),
            Err(e) => {
                error!("failed to encode outbound event: {e}");
                false
            }
        }
    }

    pub fn send_text(&self, text: String) -> bool {
        self.tx.send(Outbound::Text(text)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    /// Resolves when the writer side of this connection is gone.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// At most one live connection per identity; the newest one wins.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Connection>,
    lifecycles: DashMap<String, Arc<Mutex<()>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `connection` for `identity`. A previously registered
    /// connection receives one "logged in elsewhere" notice and is closed.
    /// Returns the id of the evicted connection, if any.
    pub fn add(&self, identity: &str, connection: Connection) -> Option<ConnectionId> {
        let previous = self.connections.insert(identity.to_string(), connection);
        let previous = previous?;
        info!(
            "identity {identity} reconnected; evicting connection #{}",
            previous.id()
        );
        previous.send(&ServerEvent::superseded());
        previous.close();
        Some(previous.id())
    }

    /// Idempotent; unknown identities are a no-op.
    pub fn remove(&self, identity: &str) -> Option<Connection> {
        self.connections.remove(identity).map(|(_, conn)| conn)
    }

    /// Remove `identity` only while it still maps to connection `id`. A
    /// superseded connection tearing down must not unregister its successor.
    pub fn release(&self, identity: &str, id: ConnectionId) -> bool {
        self.connections
            .remove_if(identity, |_, conn| conn.id() == id)
            .is_some()
    }

    /// Hold while opening or tearing down a session for `identity`, so a
    /// reconnect never interleaves with the previous session's teardown.
    pub async fn lock_identity(&self, identity: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .lifecycles
            .entry(identity.to_string())
            .or_default()
            .value()
            .clone();
        lock.lock_owned().await
    }

    /// Drop the lifecycle lock of `identity` once nobody holds or awaits it.
    pub fn forget_identity(&self, identity: &str) {
        self.lifecycles
            .remove_if(identity, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn get(&self, identity: &str) -> Option<Connection> {
        self.connections.get(identity).map(|c| c.value().clone())
    }

    pub fn all(&self) -> Vec<(String, Connection)> {
        self.connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Send to one identity. Returns false when it has no live connection.
    pub fn send_to(&self, identity: &str, event: &ServerEvent) -> bool {
        match self.get(identity) {
            Some(conn) => conn.send(event),
            None => {
                debug!("no connection for {identity}; dropping {event:?}");
                false
            }
        }
    }

    /// Send to every registered connection except `except`. Returns how many
    /// connections accepted the message.
    pub fn send_all(&self, event: &ServerEvent, except: Option<&str>) -> usize {
        let text = match event.encode() {
            Ok(text) => text,
            Err(e) => {
                error!("failed to encode outbound event: {e}");
                return 0;
            }
        };
        self.all()
            .into_iter()
            .filter(|(identity, _)| Some(identity.as_str()) != except)
            .filter(|(_, conn)| conn.send_text(text.clone()))
            .count()
    }
}
