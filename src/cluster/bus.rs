//! Cluster Bus
//!
//! Broadcasts events to every broker sharing the durable store and hands
//! received events to the watchers registered for their kind. Events this
//! broker sent itself are dropped before dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bincode::Encode;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::protocol::{ClusterEvent, EventKind};
use super::ClusterError;
use crate::metrics::Metrics;
use crate::persistence::DurableStore;

/// Receives cluster events of the kinds it was registered for
#[async_trait]
pub trait Watcher: Send + Sync {
    async fn on_event(&self, event: &ClusterEvent);
}

/// Cross-broker event fan-out over the store's pub/sub channel
pub struct ClusterBus {
    /// Our broker ID
    node_id: Arc<str>,
    channel: String,
    store: Arc<dyn DurableStore>,
    watchers: RwLock<HashMap<EventKind, Vec<Arc<dyn Watcher>>>>,
    metrics: Arc<Metrics>,
}

impl ClusterBus {
    pub fn new(
        node_id: Arc<str>,
        channel: impl Into<String>,
        store: Arc<dyn DurableStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            node_id,
            channel: channel.into(),
            store,
            watchers: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Get our broker ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Register a watcher for one event kind
    pub fn register(&self, kind: EventKind, watcher: Arc<dyn Watcher>) {
        self.watchers.write().entry(kind).or_default().push(watcher);
    }

    /// Broadcast an event to the other brokers.
    ///
    /// Failures are logged and swallowed; clustering never fails the
    /// operation that triggered it.
    pub async fn broadcast<T: Encode + Sync>(&self, kind: EventKind, body: &T) {
        if let Err(e) = self.try_broadcast(kind, body).await {
            warn!("Cluster: failed to broadcast {} event: {}", kind.name(), e);
        }
    }

    async fn try_broadcast<T: Encode + Sync>(
        &self,
        kind: EventKind,
        body: &T,
    ) -> Result<(), ClusterError> {
        let event = ClusterEvent::new(kind, body, &self.node_id)?;
        let bytes = Bytes::from(event.encode()?);
        self.store.publish(&self.channel, bytes).await?;
        self.metrics.cluster_event_sent(kind.name());
        trace!("Cluster: sent {} event", kind.name());
        Ok(())
    }

    /// Subscribe to the channel and spawn the receive loop.
    ///
    /// The subscription is taken before this returns, so no event broadcast
    /// afterwards is missed.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.store.subscribe(&self.channel);
        let bus = self.clone();
        info!(
            "Cluster: broker {} listening on channel '{}'",
            bus.node_id, bus.channel
        );

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(bytes) => match ClusterEvent::decode(&bytes) {
                        Ok(event) => {
                            bus.dispatch(event).await;
                        }
                        Err(e) => warn!("Cluster: dropping undecodable event: {}", e),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Cluster: receiver lagged, {} events lost", skipped);
                    }
                    Err(RecvError::Closed) => {
                        debug!("Cluster: channel closed");
                        break;
                    }
                }
            }
        })
    }

    /// Hand an event to its watchers.
    ///
    /// Returns false when the event originated here and was suppressed.
    pub async fn dispatch(&self, event: ClusterEvent) -> bool {
        if event.origin_broker_id == *self.node_id {
            self.metrics.cluster_events_suppressed.inc();
            return false;
        }

        // Clone the list so no lock is held while watchers run
        let watchers = self
            .watchers
            .read()
            .get(&event.kind)
            .cloned()
            .unwrap_or_default();

        trace!(
            "Cluster: {} event from {} to {} watchers",
            event.kind.name(),
            event.origin_broker_id,
            watchers.len()
        );
        self.metrics.cluster_event_received(event.kind.name());
        for watcher in watchers {
            watcher.on_event(&event).await;
        }
        true
    }
}
