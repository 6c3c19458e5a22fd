//! Cluster event watchers
//!
//! Apply events received from other brokers to this broker's in-memory
//! state and local connections. The store was already written by the
//! broker that sent the event.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::Broker;
use crate::acl::Permissions;
use crate::cluster::{
    AuthorizationEvent, ClientEvent, ClusterBus, ClusterError, ClusterEvent, EventKind,
    PublishEvent, SubscriptionEvent, UnsubscribeEvent, Watcher,
};
use crate::protocol::QoS;
use crate::topic::Subscription;

/// Register the broker's watcher for every event kind
pub(super) fn register(bus: &ClusterBus, broker: &Arc<Broker>) {
    let watcher: Arc<dyn Watcher> = Arc::new(BrokerWatcher {
        broker: Arc::downgrade(broker),
    });
    for kind in EventKind::ALL {
        bus.register(kind, watcher.clone());
    }
}

/// Holds the broker weakly so the bus task never keeps it alive
struct BrokerWatcher {
    broker: Weak<Broker>,
}

#[async_trait]
impl Watcher for BrokerWatcher {
    async fn on_event(&self, event: &ClusterEvent) {
        let Some(broker) = self.broker.upgrade() else {
            return;
        };
        if let Err(e) = apply(&broker, event).await {
            warn!(
                "Cluster: failed to apply {} event from {}: {}",
                event.kind.name(),
                event.origin_broker_id,
                e
            );
        }
    }
}

/// Failure while applying a remote event
#[derive(Debug)]
enum ApplyError {
    Cluster(ClusterError),
    Other(String),
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyError::Cluster(e) => write!(f, "{}", e),
            ApplyError::Other(e) => write!(f, "{}", e),
        }
    }
}

impl From<ClusterError> for ApplyError {
    fn from(e: ClusterError) -> Self {
        ApplyError::Cluster(e)
    }
}

fn other(e: impl std::fmt::Display) -> ApplyError {
    ApplyError::Other(e.to_string())
}

async fn apply(broker: &Broker, event: &ClusterEvent) -> Result<(), ApplyError> {
    match event.kind {
        EventKind::Publish => {
            let body: PublishEvent = event.body()?;
            broker
                .engine()
                .publish_remote(body)
                .await
                .map_err(other)?;
        }
        EventKind::Subscribe => {
            let body: SubscriptionEvent = event.body()?;
            let qos = QoS::from_u8(body.qos).ok_or_else(|| other("invalid QoS"))?;
            broker.registry().apply_remote_subscribe(Subscription::new(
                &body.client_id,
                &body.filter,
                qos,
                true,
            ));
        }
        EventKind::Unsubscribe => {
            let body: UnsubscribeEvent = event.body()?;
            broker
                .registry()
                .apply_remote_unsubscribe(&body.client_id, &body.filters);
        }
        EventKind::ClientConnected => {
            let body: ClientEvent = event.body()?;
            if let Some(previous) = broker.connections().remove(&body.client_id) {
                info!(
                    "Cluster: {} connected to {}, closing local connection {}",
                    body.client_id, event.origin_broker_id, previous.conn_id
                );
                previous.kick();
                broker.metrics().session_takeovers_total.inc();
            }
            broker
                .sessions()
                .evict(&body.client_id)
                .await
                .map_err(other)?;
        }
        EventKind::ClearSubscriptions => {
            let body: ClientEvent = event.body()?;
            debug!("Cluster: clearing subscriptions of {}", body.client_id);
            broker.registry().apply_remote_clear(&body.client_id);
        }
        EventKind::AuthorizationChanged => {
            let body: AuthorizationEvent = event.body()?;
            broker
                .authorizer()
                .set_permissions(&body.client_id, Permissions::new(body.publish, body.subscribe));
            // The broker holding the connection knows its username
            if broker.connections().is_connected(&body.client_id) {
                broker
                    .revoke_unauthorized(&body.client_id)
                    .await
                    .map_err(other)?;
            }
        }
    }
    Ok(())
}
