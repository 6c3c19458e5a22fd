//! Locally connected clients
//!
//! Maps client ids to the connection currently bound to them. This is the
//! write-back sink of the delivery engine: sending to a client that is not
//! connected here is a no-op.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::auth::Authentication;
use crate::metrics::Metrics;
use crate::protocol::Packet;
use crate::session::Session;

/// Frames the broker hands back to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Packet(Packet),
    /// Close the transport connection
    Close,
}

/// Outbound half of a connection
pub struct Outlet {
    tx: mpsc::Sender<Outbound>,
    last_sent: Mutex<Instant>,
    metrics: Arc<Metrics>,
}

impl Outlet {
    pub fn new(tx: mpsc::Sender<Outbound>, metrics: Arc<Metrics>) -> Self {
        Self {
            tx,
            last_sent: Mutex::new(Instant::now()),
            metrics,
        }
    }

    /// Send a reply on the connection's own worker, waiting for room
    pub async fn send(&self, packet: Packet) -> bool {
        let name = packet.name();
        if self.tx.send(Outbound::Packet(packet)).await.is_err() {
            return false;
        }
        self.sent(name);
        true
    }

    /// Send from another connection's worker without waiting.
    ///
    /// Returns false if the transport is gone or its queue is full.
    pub fn try_send(&self, packet: Packet) -> bool {
        let name = packet.name();
        match self.tx.try_send(Outbound::Packet(packet)) {
            Ok(()) => {
                self.sent(name);
                true
            }
            Err(e) => {
                trace!("Outbound queue rejected {}: {}", name, e);
                false
            }
        }
    }

    /// Ask the transport to close the connection
    pub fn close(&self) {
        let _ = self.tx.try_send(Outbound::Close);
    }

    pub fn last_sent(&self) -> Instant {
        *self.last_sent.lock()
    }

    fn sent(&self, name: &'static str) {
        *self.last_sent.lock() = Instant::now();
        self.metrics.packet_sent(name);
    }
}

/// A connection bound to a client id
pub struct ConnectionHandle {
    pub conn_id: u64,
    pub outlet: Arc<Outlet>,
    pub session: Arc<Session>,
    pub auth: Authentication,
    takeover: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn new(
        conn_id: u64,
        outlet: Arc<Outlet>,
        session: Arc<Session>,
        auth: Authentication,
        takeover: Arc<Notify>,
    ) -> Self {
        Self {
            conn_id,
            outlet,
            session,
            auth,
            takeover,
        }
    }

    /// Tell the connection's worker it was replaced
    pub fn kick(&self) {
        self.takeover.notify_one();
    }
}

/// Client id -> local connection
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<Arc<str>, Arc<ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a client id to a connection, returning the one it replaces
    pub fn register(
        &self,
        client_id: Arc<str>,
        handle: Arc<ConnectionHandle>,
    ) -> Option<Arc<ConnectionHandle>> {
        debug!("Registered connection {} for {}", handle.conn_id, client_id);
        self.connections.insert(client_id, handle)
    }

    /// Unbind a client id if it is still bound to this connection
    pub fn unregister(&self, client_id: &str, conn_id: u64) -> bool {
        self.connections
            .remove_if(client_id, |_, handle| handle.conn_id == conn_id)
            .is_some()
    }

    /// Unbind a client id whatever connection holds it
    pub fn remove(&self, client_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(client_id).map(|(_, handle)| handle)
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(client_id).map(|h| h.clone())
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.connections.contains_key(client_id)
    }

    /// Send to a client if it is connected here
    pub fn send_to(&self, client_id: &str, packet: Packet) -> bool {
        match self.get(client_id) {
            Some(handle) => handle.outlet.try_send(packet),
            None => false,
        }
    }

    /// Close every connection
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.value().outlet.close();
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use crate::session::SessionManager;
    use crate::topic::SubscriptionRegistry;

    async fn handle(conn_id: u64) -> (Arc<ConnectionHandle>, mpsc::Receiver<Outbound>) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(SubscriptionRegistry::new(store.clone(), true));
        let sessions = SessionManager::new(store, registry);
        let (session, _) = sessions.open("c1", true).await.unwrap();

        let (tx, rx) = mpsc::channel(1);
        let outlet = Arc::new(Outlet::new(tx, Arc::new(Metrics::new().unwrap())));
        let handle = ConnectionHandle::new(
            conn_id,
            outlet,
            session,
            Authentication::anonymous(),
            Arc::new(Notify::new()),
        );
        (Arc::new(handle), rx)
    }

    #[tokio::test]
    async fn test_send_to_absent_client_is_noop() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.send_to("nobody", Packet::PingResp));
    }

    #[tokio::test]
    async fn test_register_returns_replaced_connection() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = handle(1).await;
        let (second, _rx2) = handle(2).await;

        assert!(registry.register("c1".into(), first).is_none());
        let replaced = registry.register("c1".into(), second).unwrap();
        assert_eq!(replaced.conn_id, 1);

        // The replaced connection must not unbind its successor
        assert!(!registry.unregister("c1", 1));
        assert!(registry.is_connected("c1"));
        assert!(registry.unregister("c1", 2));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_try_send_reports_full_queue() {
        let registry = ConnectionRegistry::new();
        let (h, mut rx) = handle(1).await;
        registry.register("c1".into(), h);

        assert!(registry.send_to("c1", Packet::PingResp));
        assert!(!registry.send_to("c1", Packet::PingResp));
        assert_eq!(rx.recv().await, Some(Outbound::Packet(Packet::PingResp)));
    }

    #[tokio::test]
    async fn test_send_waits_for_room() {
        let (h, mut rx) = handle(1).await;
        assert!(h.outlet.try_send(Packet::PingResp));

        let mut send = tokio_test::task::spawn(h.outlet.send(Packet::PubAck(1)));
        tokio_test::assert_pending!(send.poll());

        assert_eq!(rx.recv().await, Some(Outbound::Packet(Packet::PingResp)));
        assert!(send.is_woken());
        assert!(tokio_test::assert_ready!(send.poll()));
        assert_eq!(rx.recv().await, Some(Outbound::Packet(Packet::PubAck(1))));
    }
}
