//! QoS acknowledgment packet handling (PUBACK, PUBREC, PUBREL, PUBCOMP)

use async_trait::async_trait;
use tracing::{debug, trace};

use super::{ConnectionContext, ConnectionError};
use crate::broker::dispatcher::Handler;
use crate::broker::Broker;
use crate::protocol::{Packet, ProtocolError};

fn packet_id(packet: &Packet) -> Result<u16, ConnectionError> {
    match packet {
        Packet::PubAck(id) | Packet::PubRec(id) | Packet::PubRel(id) | Packet::PubComp(id) => {
            Ok(*id)
        }
        other => Err(ProtocolError::UnexpectedPacket(other.name()).into()),
    }
}

/// PUBACK from a subscriber: QoS 1 delivery complete
pub struct OnPubAck;

#[async_trait]
impl Handler for OnPubAck {
    async fn handle(
        &self,
        _broker: &Broker,
        ctx: &mut ConnectionContext,
        packet: Packet,
    ) -> Result<(), ConnectionError> {
        let packet_id = packet_id(&packet)?;
        let (client_id, session) = ctx.connected()?;

        if session.pending().remove_pub(packet_id).await?.is_none() {
            debug!("PUBACK for unknown packet id {} from {}", packet_id, client_id);
        }
        Ok(())
    }
}

/// PUBREC from a subscriber: first half of outbound QoS 2
pub struct OnPubRec;

#[async_trait]
impl Handler for OnPubRec {
    async fn handle(
        &self,
        _broker: &Broker,
        ctx: &mut ConnectionContext,
        packet: Packet,
    ) -> Result<(), ConnectionError> {
        let packet_id = packet_id(&packet)?;
        let (client_id, session) = ctx.connected()?;

        let pending = session.pending();
        if pending.remove_pub(packet_id).await?.is_some() {
            pending.save_comp(packet_id).await?;
        } else if !pending.contains_comp(packet_id).await? {
            // No marker: the id must stay free for new messages
            debug!("PUBREC for unknown packet id {} from {}", packet_id, client_id);
        }
        // Answer with PUBREL even for unknown ids so the client can finish
        ctx.outlet.send(Packet::PubRel(packet_id)).await;
        Ok(())
    }
}

/// PUBREL from a publisher: inbound QoS 2 released
pub struct OnPubRel;

#[async_trait]
impl Handler for OnPubRel {
    async fn handle(
        &self,
        _broker: &Broker,
        ctx: &mut ConnectionContext,
        packet: Packet,
    ) -> Result<(), ConnectionError> {
        let packet_id = packet_id(&packet)?;
        let (client_id, session) = ctx.connected()?;

        if !session.pending().remove_rel(packet_id).await? {
            trace!("PUBREL for unknown packet id {} from {}", packet_id, client_id);
        }
        ctx.outlet.send(Packet::PubComp(packet_id)).await;
        Ok(())
    }
}

/// PUBCOMP from a subscriber: outbound QoS 2 complete
pub struct OnPubComp;

#[async_trait]
impl Handler for OnPubComp {
    async fn handle(
        &self,
        _broker: &Broker,
        ctx: &mut ConnectionContext,
        packet: Packet,
    ) -> Result<(), ConnectionError> {
        let packet_id = packet_id(&packet)?;
        let (client_id, session) = ctx.connected()?;

        if !session.pending().remove_comp(packet_id).await? {
            debug!("PUBCOMP for unknown packet id {} from {}", packet_id, client_id);
        }
        Ok(())
    }
}
