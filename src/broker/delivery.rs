//! QoS delivery engine
//!
//! Fans a published message out to every matching subscriber:
//! - applies the retained-message policy of the publish
//! - picks one member per shared subscription group
//! - delivers at min(publisher QoS, subscriber QoS) with RETAIN cleared
//! - records QoS 1/2 copies in the subscriber's pending store before sending
//! - queues copies for offline persistent sessions
//! - broadcasts the publish to the other brokers

use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use bytes::Bytes;
use smallvec::SmallVec;
use tracing::{debug, error, trace};

use super::connections::{ConnectionRegistry, Outlet};
use super::retained::RetainedStore;
use crate::cluster::{ClusterBus, EventKind, PublishEvent};
use crate::metrics::Metrics;
use crate::persistence::{keys, now_millis, DurableStore, StoredMessage, StoredRetainedMessage};
use crate::protocol::{Packet, Publish, QoS, Will};
use crate::session::{Result, Session, SessionManager};
use crate::topic::{Selection, SharedSelector, Subscription, SubscriptionRegistry};

/// Most messages reach a handful of subscribers
type Targets = SmallVec<[Target; 8]>;

/// One subscriber that receives a copy
#[derive(Debug, Clone)]
struct Target {
    client_id: Arc<str>,
    qos: QoS,
    persistent: bool,
}

impl From<&Subscription> for Target {
    fn from(sub: &Subscription) -> Self {
        Self {
            client_id: sub.client_id.clone(),
            qos: sub.qos,
            persistent: sub.persistent,
        }
    }
}

/// Where a fan-out is coming from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Local,
    Remote,
}

pub struct DeliveryEngine {
    node_id: Arc<str>,
    store: Arc<dyn DurableStore>,
    registry: Arc<SubscriptionRegistry>,
    retained: Arc<RetainedStore>,
    sessions: Arc<SessionManager>,
    connections: Arc<ConnectionRegistry>,
    selector: SharedSelector,
    cluster: Option<Arc<ClusterBus>>,
    retain_enabled: bool,
    metrics: Arc<Metrics>,
}

impl DeliveryEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: Arc<str>,
        store: Arc<dyn DurableStore>,
        registry: Arc<SubscriptionRegistry>,
        retained: Arc<RetainedStore>,
        sessions: Arc<SessionManager>,
        connections: Arc<ConnectionRegistry>,
        selector: SharedSelector,
        cluster: Option<Arc<ClusterBus>>,
        retain_enabled: bool,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            node_id,
            store,
            registry,
            retained,
            sessions,
            connections,
            selector,
            cluster,
            retain_enabled,
            metrics,
        }
    }

    /// Publish a message from a local client.
    ///
    /// Returns the number of subscribers that received or queued a copy.
    pub async fn publish(&self, publisher: &str, publish: &Publish) -> Result<usize> {
        let start = Instant::now();

        if publish.retain {
            self.apply_retain(publish).await?;
        }

        let subs = self.registry.match_subscribers(&publish.topic).await?;
        let selection = Selection::partition(subs);

        let mut targets = dedup_direct(&selection.direct);
        let mut choices = Vec::with_capacity(selection.groups.len());
        for (group, members) in &selection.groups {
            if let Some(chosen) = self.selector.choose(publisher, &publish.topic, group, members) {
                trace!("Share group {} -> {}", group, chosen.client_id);
                choices.push((group.to_string(), chosen.client_id.to_string()));
                targets.push(Target::from(chosen));
            }
        }

        let delivered = self.route_all(&targets, publish, Origin::Local).await;

        if let Some(cluster) = &self.cluster {
            let event = PublishEvent {
                publisher: publisher.to_string(),
                topic: publish.topic.to_string(),
                payload: publish.payload.to_vec(),
                qos: publish.qos as u8,
                retain: publish.retain,
                choices,
            };
            cluster.broadcast(EventKind::Publish, &event).await;
        }

        self.metrics
            .fanout_duration
            .observe(start.elapsed().as_secs_f64());
        trace!(
            "Published '{}' from {} to {} subscribers",
            publish.topic,
            publisher,
            delivered
        );
        Ok(delivered)
    }

    /// Deliver a message published on another broker to local connections.
    ///
    /// Share groups follow the origin's choice; a group the origin did not
    /// know about is resolved among the members connected here.
    pub async fn publish_remote(&self, event: PublishEvent) -> Result<usize> {
        let qos = QoS::from_u8(event.qos).unwrap_or(QoS::AtMostOnce);
        let publish = Publish::new(event.topic.as_str(), Bytes::from(event.payload), qos)
            .with_retain(event.retain);

        if publish.retain && self.retain_enabled {
            if publish.payload.is_empty() {
                self.retained.forget(&publish.topic);
                self.registry.remove_topic(&publish.topic).await?;
            } else if qos.needs_ack() {
                self.retained
                    .remember(&publish.topic, retained_copy(&publish));
            }
        }

        let subs = self.registry.match_subscribers(&publish.topic).await?;
        let selection = Selection::partition(subs);

        let mut targets = dedup_direct(&selection.direct);
        let choices: AHashMap<&str, &str> = event
            .choices
            .iter()
            .map(|(group, client)| (group.as_str(), client.as_str()))
            .collect();
        for (group, members) in &selection.groups {
            match choices.get(&**group) {
                Some(chosen) => {
                    if let Some(member) = members.iter().find(|m| &*m.client_id == *chosen) {
                        targets.push(Target::from(member));
                    }
                }
                None => {
                    let local: Vec<Subscription> = members
                        .iter()
                        .filter(|m| self.connections.is_connected(&m.client_id))
                        .cloned()
                        .collect();
                    if let Some(chosen) =
                        self.selector
                            .choose(&event.publisher, &publish.topic, group, &local)
                    {
                        targets.push(Target::from(chosen));
                    }
                }
            }
        }

        Ok(self.route_all(&targets, &publish, Origin::Remote).await)
    }

    /// Send the retained messages matching a new subscription.
    ///
    /// The retain flag is kept and every copy gets a fresh packet id.
    pub async fn deliver_retained(
        &self,
        session: &Session,
        outlet: &Outlet,
        filter: &str,
        granted: QoS,
    ) -> Result<usize> {
        if !self.retain_enabled {
            return Ok(0);
        }

        let mut sent = 0;
        for message in self.retained.search_by_filter(filter) {
            let qos = message.qos()?.min(granted);
            let publish = Publish::new(message.topic.as_str(), message.payload, qos);
            let copy = self.stage(session, &publish, qos, true).await?;
            // Runs on the subscriber's own worker, so wait for queue room
            if !outlet.send(Packet::Publish(copy)).await {
                debug!(
                    "Connection of {} closed during retained replay",
                    session.client_id()
                );
                break;
            }
            self.metrics.publish_messages_delivered.inc();
            sent += 1;
        }
        if sent > 0 {
            debug!("Sent {} retained messages for '{}'", sent, filter);
        }
        Ok(sent)
    }

    /// Publish a client's will message
    pub async fn publish_will(&self, client_id: &str, will: &Will) -> Result<usize> {
        debug!("Publishing will of {} to '{}'", client_id, will.topic);
        let publish = Publish::new(will.topic.as_str(), will.payload.clone(), will.qos)
            .with_retain(will.retain);
        self.publish(client_id, &publish).await
    }

    /// Hand one copy to a subscriber connected to another worker.
    ///
    /// Never waits for queue room: a slow subscriber must not stall the
    /// publisher's worker. QoS 1/2 copies are recorded as pending before
    /// they are sent, so a copy that did not fit is replayed on reconnect.
    pub async fn deliver_to(
        &self,
        session: &Session,
        outlet: &Outlet,
        publish: &Publish,
        qos: QoS,
        retain: bool,
    ) -> Result<bool> {
        let copy = self.stage(session, publish, qos, retain).await?;

        if outlet.try_send(Packet::Publish(copy)) {
            self.metrics.publish_messages_delivered.inc();
            Ok(true)
        } else {
            self.metrics.publish_messages_dropped.inc();
            debug!(
                "Outbound queue of {} unavailable, copy of '{}' left pending",
                session.client_id(),
                publish.topic
            );
            Ok(false)
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Build the outbound copy, allocating its packet id and recording it
    /// as pending when it needs an acknowledgement
    async fn stage(
        &self,
        session: &Session,
        publish: &Publish,
        qos: QoS,
        retain: bool,
    ) -> Result<Publish> {
        let mut copy = publish.clone();
        copy.dup = false;
        copy.qos = qos;
        copy.retain = retain;
        copy.packet_id = None;

        if qos.needs_ack() {
            let packet_id = session.next_message_id().await?;
            copy.packet_id = Some(packet_id);
            session
                .pending()
                .save_pub(StoredMessage::from_publish(packet_id, &copy))
                .await?;
        }
        Ok(copy)
    }

    async fn apply_retain(&self, publish: &Publish) -> Result<()> {
        if !self.retain_enabled {
            return Ok(());
        }

        if publish.payload.is_empty() {
            // Tombstone
            self.retained.remove(&publish.topic).await?;
            self.registry.remove_topic(&publish.topic).await?;
            debug!("Cleared retained message of '{}'", publish.topic);
        } else if publish.qos == QoS::AtMostOnce {
            trace!("Not retaining QoS 0 message on '{}'", publish.topic);
        } else {
            self.retained
                .save(&publish.topic, retained_copy(publish))
                .await?;
        }
        Ok(())
    }

    async fn route_all(&self, targets: &[Target], publish: &Publish, origin: Origin) -> usize {
        let mut delivered = 0;
        for target in targets {
            // One failing subscriber never stops delivery to the others
            match self.route(target, publish, origin).await {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(e) => {
                    self.metrics.publish_messages_dropped.inc();
                    error!(
                        "Failed to deliver '{}' to {}: {}",
                        publish.topic, target.client_id, e
                    );
                }
            }
        }
        delivered
    }

    async fn route(&self, target: &Target, publish: &Publish, origin: Origin) -> Result<bool> {
        let qos = publish.qos.min(target.qos);

        if let Some(handle) = self.connections.get(&target.client_id) {
            return self
                .deliver_to(&handle.session, &handle.outlet, publish, qos, false)
                .await;
        }

        // The origin broker queues for offline clients; the broker holding
        // the connection delivers from the cluster event
        if origin == Origin::Remote || self.online_elsewhere(&target.client_id).await? {
            return Ok(false);
        }

        if target.persistent && qos.needs_ack() {
            if let Some(session) = self.sessions.persistent_session(&target.client_id).await? {
                let queued = queue_offline(&session, publish, qos).await;
                self.sessions.release(session).await?;
                queued?;
                self.metrics.publish_messages_queued.inc();
                trace!("Queued '{}' for offline {}", publish.topic, target.client_id);
                return Ok(true);
            }
        }

        self.metrics.publish_messages_dropped.inc();
        Ok(false)
    }

    async fn online_elsewhere(&self, client_id: &str) -> Result<bool> {
        if self.cluster.is_none() {
            return Ok(false);
        }
        Ok(match self.store.hget(keys::ONLINE, client_id).await? {
            Some(node) => node.as_ref() != self.node_id.as_bytes(),
            None => false,
        })
    }
}

/// Store a copy in an offline client's pending outbound messages, for the
/// reconnect replay
async fn queue_offline(session: &Session, publish: &Publish, qos: QoS) -> Result<()> {
    let mut copy = publish.clone();
    copy.qos = qos;
    copy.retain = false;
    let packet_id = session.next_message_id().await?;
    session
        .pending()
        .save_pub(StoredMessage::from_publish(packet_id, &copy))
        .await?;
    Ok(())
}

/// Collapse overlapping plain subscriptions of one client into a single
/// copy at the highest granted QoS
fn dedup_direct(direct: &[Subscription]) -> Targets {
    let mut by_client: AHashMap<Arc<str>, Target> = AHashMap::with_capacity(direct.len());
    for sub in direct {
        by_client
            .entry(sub.client_id.clone())
            .and_modify(|t| {
                t.qos = t.qos.max(sub.qos);
                t.persistent |= sub.persistent;
            })
            .or_insert_with(|| Target::from(sub));
    }
    by_client.into_values().collect()
}

fn retained_copy(publish: &Publish) -> StoredRetainedMessage {
    StoredRetainedMessage {
        topic: publish.topic.to_string(),
        payload: publish.payload.to_vec(),
        qos: publish.qos as u8,
        stored_at_millis: now_millis(),
    }
}
