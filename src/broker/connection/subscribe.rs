//! SUBSCRIBE and UNSUBSCRIBE packet handling

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{ConnectionContext, ConnectionError};
use crate::broker::dispatcher::Handler;
use crate::broker::Broker;
use crate::cluster::{EventKind, SubscriptionEvent, UnsubscribeEvent};
use crate::protocol::{
    Packet, ProtocolError, QoS, SubAck, SubAckReturnCode, Subscribe, Unsubscribe,
};
use crate::topic::{parse_shared_subscription, validate_topic_filter, Subscription};

pub struct OnSubscribe;

#[async_trait]
impl Handler for OnSubscribe {
    async fn handle(
        &self,
        broker: &Broker,
        ctx: &mut ConnectionContext,
        packet: Packet,
    ) -> Result<(), ConnectionError> {
        let subscribe = match packet {
            Packet::Subscribe(subscribe) => subscribe,
            other => return Err(ProtocolError::UnexpectedPacket(other.name()).into()),
        };
        handle_subscribe(broker, ctx, subscribe).await
    }
}

async fn handle_subscribe(
    broker: &Broker,
    ctx: &mut ConnectionContext,
    subscribe: Subscribe,
) -> Result<(), ConnectionError> {
    let (client_id, session) = ctx.connected()?;

    let mut return_codes = Vec::with_capacity(subscribe.filters.len());
    // Filters that get retained messages once the SUBACK is out
    let mut granted = Vec::new();

    for request in &subscribe.filters {
        if let Err(reason) = validate_topic_filter(&request.filter) {
            debug!(
                "Invalid filter '{}' from {}: {}",
                request.filter, client_id, reason
            );
            return_codes.push(SubAckReturnCode::Failure);
            continue;
        }

        if !broker
            .authorizer()
            .can_subscribe(&client_id, &ctx.auth, &request.filter)
        {
            debug!(
                "Client {} not authorized to subscribe to '{}'",
                client_id, request.filter
            );
            return_codes.push(SubAckReturnCode::Failure);
            continue;
        }

        let sub = Subscription::new(
            &client_id,
            &request.filter,
            request.qos,
            session.is_persistent(),
        );
        broker.registry().subscribe(sub).await?;
        if session.is_persistent() {
            let event = SubscriptionEvent {
                client_id: client_id.to_string(),
                filter: request.filter.clone(),
                qos: request.qos as u8,
            };
            broker.broadcast(EventKind::Subscribe, &event).await;
        }
        broker.metrics().subscription_added();
        debug!(
            "Client {} subscribed to '{}' qos={:?}",
            client_id, request.filter, request.qos
        );

        return_codes.push(SubAckReturnCode::Granted(request.qos));
        if parse_shared_subscription(&request.filter).is_none() {
            granted.push((request.filter.as_str(), request.qos));
        }
    }

    ctx.outlet
        .send(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }))
        .await;

    for (filter, qos) in granted {
        send_retained(broker, ctx, filter, qos).await?;
    }
    Ok(())
}

async fn send_retained(
    broker: &Broker,
    ctx: &ConnectionContext,
    filter: &str,
    qos: QoS,
) -> Result<(), ConnectionError> {
    let (client_id, session) = ctx.connected()?;
    if let Err(e) = broker
        .engine()
        .deliver_retained(&session, &ctx.outlet, filter, qos)
        .await
    {
        warn!(
            "Failed to send retained messages for '{}' to {}: {}",
            filter, client_id, e
        );
        return Err(e.into());
    }
    Ok(())
}

pub struct OnUnsubscribe;

#[async_trait]
impl Handler for OnUnsubscribe {
    async fn handle(
        &self,
        broker: &Broker,
        ctx: &mut ConnectionContext,
        packet: Packet,
    ) -> Result<(), ConnectionError> {
        let unsubscribe = match packet {
            Packet::Unsubscribe(unsubscribe) => unsubscribe,
            other => return Err(ProtocolError::UnexpectedPacket(other.name()).into()),
        };
        handle_unsubscribe(broker, ctx, unsubscribe).await
    }
}

async fn handle_unsubscribe(
    broker: &Broker,
    ctx: &mut ConnectionContext,
    unsubscribe: Unsubscribe,
) -> Result<(), ConnectionError> {
    let (client_id, _) = ctx.connected()?;

    let removed = broker
        .registry()
        .unsubscribe(&client_id, &unsubscribe.filters)
        .await?;
    for _ in removed.iter().filter(|existed| **existed) {
        broker.metrics().subscription_removed();
    }

    let event = UnsubscribeEvent {
        client_id: client_id.to_string(),
        filters: unsubscribe.filters.clone(),
    };
    broker.broadcast(EventKind::Unsubscribe, &event).await;
    debug!(
        "Client {} unsubscribed from {:?}",
        client_id, unsubscribe.filters
    );

    // UNSUBACK is sent whether or not the filters existed
    ctx.outlet
        .send(Packet::UnsubAck(unsubscribe.packet_id))
        .await;
    Ok(())
}
