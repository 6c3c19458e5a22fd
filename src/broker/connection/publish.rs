//! Inbound PUBLISH handling

use async_trait::async_trait;
use tracing::{debug, trace};

use super::{ConnectionContext, ConnectionError};
use crate::broker::dispatcher::Handler;
use crate::broker::Broker;
use crate::protocol::{Packet, ProtocolError, Publish, QoS};
use crate::topic::validate_topic_name;

pub struct OnPublish;

#[async_trait]
impl Handler for OnPublish {
    async fn handle(
        &self,
        broker: &Broker,
        ctx: &mut ConnectionContext,
        packet: Packet,
    ) -> Result<(), ConnectionError> {
        let publish = match packet {
            Packet::Publish(publish) => publish,
            other => return Err(ProtocolError::UnexpectedPacket(other.name()).into()),
        };
        handle_publish(broker, ctx, publish).await
    }
}

async fn handle_publish(
    broker: &Broker,
    ctx: &mut ConnectionContext,
    publish: Publish,
) -> Result<(), ConnectionError> {
    let (client_id, session) = ctx.connected()?;

    validate_topic_name(&publish.topic).map_err(ProtocolError::InvalidTopicName)?;
    let packet_id = match (publish.qos, publish.packet_id) {
        (QoS::AtMostOnce, _) => None,
        (_, Some(id)) => Some(id),
        (_, None) => return Err(ProtocolError::MissingPacketId.into()),
    };

    broker.metrics().publish_messages_received.inc();

    if !broker
        .authorizer()
        .can_publish(&client_id, &ctx.auth, &publish.topic)
    {
        debug!(
            "Client {} not authorized to publish to '{}'",
            client_id, publish.topic
        );
        return Err(ConnectionError::NotAuthorized(publish.topic.to_string()));
    }

    trace!(
        "PUBLISH from {} on '{}' qos={:?} retain={}",
        client_id,
        publish.topic,
        publish.qos,
        publish.retain
    );

    match (publish.qos, packet_id) {
        (QoS::AtLeastOnce, Some(packet_id)) => {
            broker.engine().publish(&client_id, &publish).await?;
            ctx.outlet.send(Packet::PubAck(packet_id)).await;
        }
        (QoS::ExactlyOnce, Some(packet_id)) => {
            // A redelivered id still awaiting PUBREL was already routed
            if session.pending().is_duplicate(packet_id).await? {
                debug!(
                    "Duplicate QoS 2 message {} from {}, not routing again",
                    packet_id, client_id
                );
            } else {
                broker.engine().publish(&client_id, &publish).await?;
                session.pending().save_rel(packet_id).await?;
            }
            ctx.outlet.send(Packet::PubRec(packet_id)).await;
        }
        _ => {
            broker.engine().publish(&client_id, &publish).await?;
        }
    }
    Ok(())
}
