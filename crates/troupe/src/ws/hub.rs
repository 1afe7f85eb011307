//! Connection hub for client WebSocket connections.
//!
//! The hub is the transport-side registry: connection id to event sender.
//! Which session a connection is bound to is orchestration state and lives
//! in the orchestrator actor, not here.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use log::debug;
use tokio::sync::mpsc;
use troupe_protocol::client::ClientEvent;

/// Identifies one client connection for the lifetime of the process.
pub type ConnectionId = u64;

/// Size of the per-connection send buffer.
const CONNECTION_BUFFER_SIZE: usize = 64;

/// Registry of live client connections.
pub struct WsHub {
    connections: DashMap<ConnectionId, mpsc::Sender<ClientEvent>>,
    next_id: AtomicU64,
}

impl WsHub {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new connection, returning its id and the receiver to pump
    /// events from.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<ClientEvent>) {
        let conn = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        self.connections.insert(conn, tx);
        debug!("registered connection {}", conn);
        (conn, rx)
    }

    /// Drop a connection from the registry.
    pub fn unregister(&self, conn: ConnectionId) {
        self.connections.remove(&conn);
        debug!("unregistered connection {}", conn);
    }

    /// Send an event to one connection. Returns false when the connection is
    /// gone or its buffer closed; the event is dropped either way.
    pub async fn send(&self, conn: ConnectionId, event: ClientEvent) -> bool {
        // Clone the sender out so no map guard is held across the await.
        let Some(tx) = self.connections.get(&conn).map(|entry| entry.value().clone()) else {
            return false;
        };
        tx.send(event).await.is_ok()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for WsHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_send_unregister() {
        let hub = WsHub::new();
        let (conn, mut rx) = hub.register();
        assert_eq!(hub.connection_count(), 1);

        assert!(hub.send(conn, ClientEvent::Ping).await);
        assert!(matches!(rx.recv().await, Some(ClientEvent::Ping)));

        hub.unregister(conn);
        assert_eq!(hub.connection_count(), 0);
        assert!(!hub.send(conn, ClientEvent::Ping).await);
    }

    #[tokio::test]
    async fn test_connection_ids_are_unique() {
        let hub = WsHub::new();
        let (a, _rx_a) = hub.register();
        let (b, _rx_b) = hub.register();
        assert_ne!(a, b);
    }
}
