//! PINGREQ and DISCONNECT handling

use async_trait::async_trait;
use tracing::{debug, trace};

use super::{ConnectionContext, ConnectionError};
use crate::broker::dispatcher::Handler;
use crate::broker::Broker;
use crate::protocol::Packet;

pub struct OnPing;

#[async_trait]
impl Handler for OnPing {
    async fn handle(
        &self,
        _broker: &Broker,
        ctx: &mut ConnectionContext,
        _packet: Packet,
    ) -> Result<(), ConnectionError> {
        ctx.connected()?;
        trace!("PINGREQ from {:?}", ctx.client_id());
        ctx.outlet.send(Packet::PingResp).await;
        Ok(())
    }
}

/// Graceful DISCONNECT: the will is discarded and the worker stops
pub struct OnDisconnect;

#[async_trait]
impl Handler for OnDisconnect {
    async fn handle(
        &self,
        _broker: &Broker,
        ctx: &mut ConnectionContext,
        _packet: Packet,
    ) -> Result<(), ConnectionError> {
        ctx.connected()?;
        debug!("DISCONNECT from {:?}", ctx.client_id());
        ctx.discard_will();
        Err(ConnectionError::Shutdown)
    }
}
