//! MQTT Broker Core
//!
//! The broker context wires every component together: durable store,
//! subscription registry, retained store, session manager, delivery engine,
//! cluster bus and the packet dispatcher. A transport attaches a connection
//! with [`Broker::attach`] and exchanges decoded packets with its worker.

mod connection;
mod connections;
mod delivery;
mod dispatcher;
mod retained;
mod watchers;

pub use connection::{ConnectionContext, ConnectionError, Inbound};
pub use connections::{ConnectionHandle, ConnectionRegistry, Outbound, Outlet};
pub use delivery::DeliveryEngine;
pub use dispatcher::{bind, DispatchError, Dispatcher, Handler};
pub use retained::RetainedStore;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bincode::Encode;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::acl::{AclProvider, Authorizer, Permissions};
use crate::auth::{AuthProvider, Authentication, Authenticator};
use crate::cluster::{AuthorizationEvent, ClusterBus, EventKind, UnsubscribeEvent};
use crate::config::Config;
use crate::metrics::Metrics;
use crate::persistence::{keys, DurableStore, StoreError};
use crate::protocol::Packet;
use crate::session::{SessionError, SessionManager};
use crate::topic::{SharedSelector, SubscriptionRegistry};

/// Broker startup errors
#[derive(Debug)]
pub enum BrokerError {
    Store(StoreError),
    Dispatch(DispatchError),
    Metrics(prometheus::Error),
    Session(SessionError),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::Store(e) => write!(f, "Store error: {}", e),
            BrokerError::Dispatch(e) => write!(f, "Dispatcher error: {}", e),
            BrokerError::Metrics(e) => write!(f, "Metrics error: {}", e),
            BrokerError::Session(e) => write!(f, "Session error: {}", e),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<StoreError> for BrokerError {
    fn from(e: StoreError) -> Self {
        BrokerError::Store(e)
    }
}

impl From<DispatchError> for BrokerError {
    fn from(e: DispatchError) -> Self {
        BrokerError::Dispatch(e)
    }
}

impl From<prometheus::Error> for BrokerError {
    fn from(e: prometheus::Error) -> Self {
        BrokerError::Metrics(e)
    }
}

impl From<SessionError> for BrokerError {
    fn from(e: SessionError) -> Self {
        BrokerError::Session(e)
    }
}

/// Transport side of an attached connection
pub struct TransportLink {
    inbound: mpsc::Sender<Inbound>,
    outbound: mpsc::Receiver<Outbound>,
}

impl TransportLink {
    /// Hand a decoded packet to the worker; false once the worker is gone
    pub async fn send(&self, packet: Packet) -> bool {
        self.inbound.send(Inbound::Packet(packet)).await.is_ok()
    }

    /// Report a read or decode failure
    pub async fn fail(&self, reason: impl Into<String>) -> bool {
        self.inbound
            .send(Inbound::TransportError(reason.into()))
            .await
            .is_ok()
    }

    /// Next frame to write to the client
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    pub fn into_parts(self) -> (mpsc::Sender<Inbound>, mpsc::Receiver<Outbound>) {
        (self.inbound, self.outbound)
    }
}

/// The MQTT Broker
pub struct Broker {
    node_id: Arc<str>,
    store: Arc<dyn DurableStore>,
    registry: Arc<SubscriptionRegistry>,
    retained: Arc<RetainedStore>,
    sessions: Arc<SessionManager>,
    connections: Arc<ConnectionRegistry>,
    engine: DeliveryEngine,
    cluster: Option<Arc<ClusterBus>>,
    authenticator: Arc<dyn Authenticator>,
    authorizer: Arc<dyn Authorizer>,
    dispatcher: Dispatcher,
    metrics: Arc<Metrics>,
    /// Per-connection channel capacity
    channel_capacity: usize,
    /// Upper bound for client keep-alive, 0 = none
    max_keep_alive: u16,
    generated_id_prefix: String,
    next_connection_id: AtomicU64,
    cluster_task: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    /// Start a broker with the auth and ACL providers of the config
    pub async fn start(
        config: &Config,
        store: Arc<dyn DurableStore>,
    ) -> Result<Arc<Self>, BrokerError> {
        let authenticator = Arc::new(AuthProvider::new(&config.auth));
        let authorizer = Arc::new(AclProvider::new(&config.acl));
        Self::start_with(config, store, authenticator, authorizer).await
    }

    /// Start a broker with custom auth and ACL providers.
    ///
    /// Reloads persistent subscriptions and retained messages from the
    /// store and, when clustering is enabled, joins the cluster bus.
    pub async fn start_with(
        config: &Config,
        store: Arc<dyn DurableStore>,
        authenticator: Arc<dyn Authenticator>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Arc<Self>, BrokerError> {
        let metrics = Arc::new(Metrics::new()?);
        let node_id: Arc<str> = config.cluster.get_node_id().into();
        let dispatcher = Dispatcher::standard()?;

        let registry = Arc::new(SubscriptionRegistry::new(
            store.clone(),
            config.subscription.cache_enabled,
        ));
        let retained = Arc::new(RetainedStore::new(store.clone(), metrics.clone()));
        let sessions = Arc::new(SessionManager::new(store.clone(), registry.clone()));
        let connections = Arc::new(ConnectionRegistry::new());

        let cluster = config.cluster.enabled.then(|| {
            Arc::new(ClusterBus::new(
                node_id.clone(),
                config.cluster.channel.clone(),
                store.clone(),
                metrics.clone(),
            ))
        });

        let engine = DeliveryEngine::new(
            node_id.clone(),
            store.clone(),
            registry.clone(),
            retained.clone(),
            sessions.clone(),
            connections.clone(),
            SharedSelector::new(config.shared.strategy),
            cluster.clone(),
            config.retain.enabled,
            metrics.clone(),
        );

        let subscriptions = registry.load_persistent().await?;
        let retained_count = if config.retain.enabled {
            retained.load().await?
        } else {
            0
        };
        info!(
            "Loaded {} persistent subscriptions and {} retained messages",
            subscriptions, retained_count
        );

        let broker = Arc::new(Self {
            node_id,
            store,
            registry,
            retained,
            sessions,
            connections,
            engine,
            cluster,
            authenticator,
            authorizer,
            dispatcher,
            metrics,
            channel_capacity: config.broker.outbound_channel_capacity.max(1),
            max_keep_alive: config.broker.max_keep_alive,
            generated_id_prefix: config.session.generated_id_prefix.clone(),
            next_connection_id: AtomicU64::new(1),
            cluster_task: Mutex::new(None),
        });

        if let Some(bus) = &broker.cluster {
            watchers::register(bus, &broker);
            *broker.cluster_task.lock() = Some(bus.start());
        }

        let orphaned = broker.publish_orphaned_wills().await?;
        if orphaned > 0 {
            info!("Published {} wills left by an unclean shutdown", orphaned);
        }

        info!("Broker {} started", broker.node_id);
        Ok(broker)
    }

    /// Attach a new transport connection.
    ///
    /// Spawns the connection's worker; the returned link carries decoded
    /// packets in and frames to write out. Dropping the link without a
    /// DISCONNECT counts as an abnormal close.
    pub fn attach(self: &Arc<Self>) -> TransportLink {
        let conn_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.channel_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.channel_capacity);

        let outlet = Arc::new(Outlet::new(outbound_tx, self.metrics.clone()));
        let ctx = ConnectionContext::new(conn_id, outlet);
        debug!("Attached connection {}", conn_id);
        tokio::spawn(connection::run(self.clone(), ctx, inbound_rx));

        TransportLink {
            inbound: inbound_tx,
            outbound: outbound_rx,
        }
    }

    /// Replace a client's permissions at runtime.
    ///
    /// Subscriptions the new permissions no longer cover are removed and
    /// the change is broadcast to the other brokers.
    pub async fn update_authorization(
        &self,
        client_id: &str,
        permissions: Permissions,
    ) -> Result<Vec<String>, StoreError> {
        self.authorizer
            .set_permissions(client_id, permissions.clone());
        let event = AuthorizationEvent {
            client_id: client_id.to_string(),
            publish: permissions.publish,
            subscribe: permissions.subscribe,
        };
        self.broadcast(EventKind::AuthorizationChanged, &event).await;
        self.revoke_unauthorized(client_id).await
    }

    /// Stop the cluster bus, close every connection and flush the store
    pub async fn shutdown(&self) {
        if let Some(task) = self.cluster_task.lock().take() {
            task.abort();
        }
        self.connections.close_all();
        if let Err(e) = self.store.flush().await {
            error!("Failed to flush store on shutdown: {}", e);
        }
        info!("Broker {} stopped", self.node_id);
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn retained(&self) -> &Arc<RetainedStore> {
        &self.retained
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn engine(&self) -> &DeliveryEngine {
        &self.engine
    }

    pub fn cluster(&self) -> Option<&Arc<ClusterBus>> {
        self.cluster.as_ref()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn authenticator(&self) -> &dyn Authenticator {
        self.authenticator.as_ref()
    }

    pub fn authorizer(&self) -> &dyn Authorizer {
        self.authorizer.as_ref()
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn generated_id_prefix(&self) -> &str {
        &self.generated_id_prefix
    }

    /// Clamp a requested keep-alive to the configured maximum
    pub(crate) fn negotiate_keep_alive(&self, requested: u16) -> u16 {
        if self.max_keep_alive > 0 && requested > self.max_keep_alive {
            self.max_keep_alive
        } else {
            requested
        }
    }

    /// Broadcast to the other brokers; no-op without clustering
    pub(crate) async fn broadcast<T: Encode + Sync>(&self, kind: EventKind, body: &T) {
        if let Some(cluster) = &self.cluster {
            cluster.broadcast(kind, body).await;
        }
    }

    /// Record that a client is connected to this broker
    pub(crate) async fn mark_online(&self, client_id: &str) -> Result<(), StoreError> {
        if self.cluster.is_some() {
            self.store
                .hset(
                    keys::ONLINE,
                    client_id,
                    Bytes::copy_from_slice(self.node_id.as_bytes()),
                )
                .await?;
        }
        Ok(())
    }

    /// Drop a client's presence record if it still points at this broker
    pub(crate) async fn clear_presence(&self, client_id: &str) -> Result<(), StoreError> {
        if self.cluster.is_none() {
            return Ok(());
        }
        if let Some(node) = self.store.hget(keys::ONLINE, client_id).await? {
            if node.as_ref() == self.node_id.as_bytes() {
                self.store.hdel(keys::ONLINE, client_id).await?;
            }
        }
        Ok(())
    }

    /// Remove subscriptions the client's current permissions do not cover.
    ///
    /// Revoked filters are broadcast as an unsubscribe so every broker
    /// drops its in-memory copy.
    /// Publish the wills of persistent sessions whose connection was lost
    /// with a previous run of this broker, before any teardown ran.
    ///
    /// In a cluster only sessions still marked online at this node are
    /// considered; the others belong to connections elsewhere.
    async fn publish_orphaned_wills(&self) -> Result<usize, BrokerError> {
        let mut published = 0;
        for client_id in self.sessions.clients_with_will().await? {
            if self.cluster.is_some() {
                match self.store.hget(keys::ONLINE, &client_id).await? {
                    Some(node) if node.as_ref() == self.node_id.as_bytes() => {}
                    _ => continue,
                }
                self.store.hdel(keys::ONLINE, &client_id).await?;
            }
            if let Some(will) = self.sessions.take_will(&client_id).await? {
                warn!("Connection of {} was lost without teardown", client_id);
                self.engine.publish_will(&client_id, &will).await?;
                published += 1;
            }
        }
        Ok(published)
    }

    async fn revoke_unauthorized(&self, client_id: &str) -> Result<Vec<String>, StoreError> {
        if !self.authorizer.is_enabled() {
            return Ok(Vec::new());
        }

        let auth = self
            .connections
            .get(client_id)
            .map(|handle| handle.auth.clone())
            .unwrap_or_else(Authentication::anonymous);
        let allowed = self.authorizer.permissions(client_id, &auth).subscribe;
        let revoked = self
            .registry
            .clear_unauthorized(client_id, &allowed)
            .await?;

        if !revoked.is_empty() {
            for _ in &revoked {
                self.metrics.subscription_removed();
            }
            let event = UnsubscribeEvent {
                client_id: client_id.to_string(),
                filters: revoked.clone(),
            };
            self.broadcast(EventKind::Unsubscribe, &event).await;
        }
        Ok(revoked)
    }
}
