//! Packet handler table
//!
//! Built once at broker start from an explicit list of (kind, handler)
//! pairs. Construction fails if any inbound packet kind is left without a
//! handler or bound twice.

use std::collections::HashMap;

use async_trait::async_trait;

use super::connection::{
    ConnectionContext, ConnectionError, OnConnect, OnDisconnect, OnPing, OnPubAck, OnPubComp,
    OnPubRec, OnPubRel, OnPublish, OnSubscribe, OnUnsubscribe,
};
use super::Broker;
use crate::protocol::{Packet, PacketKind, ProtocolError};

/// Handles one kind of inbound packet for a connection
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        broker: &Broker,
        ctx: &mut ConnectionContext,
        packet: Packet,
    ) -> Result<(), ConnectionError>;
}

/// Handler table construction error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No handler bound for a packet kind
    Unhandled(PacketKind),
    /// Two handlers bound for one packet kind
    Duplicate(PacketKind),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Unhandled(kind) => write!(f, "no handler for {}", kind),
            DispatchError::Duplicate(kind) => write!(f, "more than one handler for {}", kind),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Pair a packet kind with its handler
pub fn bind<H: Handler + 'static>(
    kind: PacketKind,
    handler: H,
) -> (PacketKind, Box<dyn Handler>) {
    (kind, Box::new(handler))
}

pub struct Dispatcher {
    handlers: HashMap<PacketKind, Box<dyn Handler>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().collect();
        kinds.sort();
        f.debug_struct("Dispatcher").field("kinds", &kinds).finish()
    }
}

impl Dispatcher {
    pub fn new(bindings: Vec<(PacketKind, Box<dyn Handler>)>) -> Result<Self, DispatchError> {
        let mut handlers = HashMap::with_capacity(bindings.len());
        for (kind, handler) in bindings {
            if handlers.insert(kind, handler).is_some() {
                return Err(DispatchError::Duplicate(kind));
            }
        }

        if let Some(kind) = PacketKind::ALL
            .iter()
            .find(|kind| !handlers.contains_key(*kind))
        {
            return Err(DispatchError::Unhandled(*kind));
        }

        Ok(Self { handlers })
    }

    /// The table binding every `on_*` handler
    pub fn standard() -> Result<Self, DispatchError> {
        Self::new(vec![
            bind(PacketKind::Connect, OnConnect),
            bind(PacketKind::Publish, OnPublish),
            bind(PacketKind::PubAck, OnPubAck),
            bind(PacketKind::PubRec, OnPubRec),
            bind(PacketKind::PubRel, OnPubRel),
            bind(PacketKind::PubComp, OnPubComp),
            bind(PacketKind::Subscribe, OnSubscribe),
            bind(PacketKind::Unsubscribe, OnUnsubscribe),
            bind(PacketKind::PingReq, OnPing),
            bind(PacketKind::Disconnect, OnDisconnect),
        ])
    }

    /// Route a packet to its handler
    pub async fn dispatch(
        &self,
        broker: &Broker,
        ctx: &mut ConnectionContext,
        packet: Packet,
    ) -> Result<(), ConnectionError> {
        let kind = packet
            .kind()
            .ok_or(ProtocolError::UnexpectedPacket(packet.name()))?;
        broker.metrics().packet_received(kind.name());

        match self.handlers.get(&kind) {
            Some(handler) => handler.handle(broker, ctx, packet).await,
            None => Err(ProtocolError::UnexpectedPacket(kind.name()).into()),
        }
    }
}
