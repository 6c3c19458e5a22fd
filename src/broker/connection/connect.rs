//! CONNECT packet handling

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, trace, warn};

use super::{ConnectionContext, ConnectionError};
use crate::auth::AuthError;
use crate::broker::connections::ConnectionHandle;
use crate::broker::dispatcher::Handler;
use crate::broker::Broker;
use crate::cluster::{ClientEvent, EventKind};
use crate::protocol::{ConnAck, Connect, ConnectReturnCode, Packet, ProtocolError};
use crate::session::Session;

pub struct OnConnect;

#[async_trait]
impl Handler for OnConnect {
    async fn handle(
        &self,
        broker: &Broker,
        ctx: &mut ConnectionContext,
        packet: Packet,
    ) -> Result<(), ConnectionError> {
        let connect = match packet {
            Packet::Connect(connect) => *connect,
            other => return Err(ProtocolError::UnexpectedPacket(other.name()).into()),
        };
        if ctx.is_connected() {
            return Err(ProtocolError::DuplicateConnect.into());
        }
        handle_connect(broker, ctx, connect).await
    }
}

async fn handle_connect(
    broker: &Broker,
    ctx: &mut ConnectionContext,
    connect: Connect,
) -> Result<(), ConnectionError> {
    let client_id: Arc<str> = if connect.client_id.is_empty() {
        if !connect.clean_session {
            debug!("Rejecting empty client id without clean session");
            ctx.outlet
                .send(Packet::ConnAck(ConnAck::refused(
                    ConnectReturnCode::IdentifierRejected,
                )))
                .await;
            broker.metrics().connection_rejected("identifier_rejected");
            return Err(ProtocolError::ProtocolViolation(
                "empty client id requires clean session",
            )
            .into());
        }
        format!(
            "{}{:016x}",
            broker.generated_id_prefix(),
            rand::random::<u64>()
        )
        .into()
    } else {
        connect.client_id.as_str().into()
    };

    // Authenticate
    let auth = match broker
        .authenticator()
        .authenticate(connect.username.as_deref(), connect.password.as_deref())
        .await
    {
        Ok(auth) => auth,
        Err(e) => {
            warn!("Authentication failed for {}: {}", client_id, e);
            let (code, reason) = match &e {
                AuthError::BadCredentials => {
                    (ConnectReturnCode::BadUsernameOrPassword, "bad_credentials")
                }
                AuthError::NotAuthorized => (ConnectReturnCode::NotAuthorized, "not_authorized"),
                AuthError::Backend(_) => (ConnectReturnCode::ServerUnavailable, "auth_backend"),
            };
            ctx.outlet
                .send(Packet::ConnAck(ConnAck::refused(code)))
                .await;
            broker.metrics().connection_rejected(reason);
            return Err(e.into());
        }
    };

    // Close the previous connection before the new session is opened
    if let Some(previous) = broker.connections().remove(&client_id) {
        info!(
            "Client {} reconnected, taking over connection {}",
            client_id, previous.conn_id
        );
        previous.kick();
        broker.metrics().session_takeovers_total.inc();
    }
    let event = ClientEvent {
        client_id: client_id.to_string(),
    };
    broker.broadcast(EventKind::ClientConnected, &event).await;
    if connect.clean_session {
        broker.broadcast(EventKind::ClearSubscriptions, &event).await;
    }

    let (session, session_present) = broker
        .sessions()
        .open(&client_id, connect.clean_session)
        .await?;
    if session.is_persistent() {
        broker
            .sessions()
            .save_will(&client_id, connect.will.as_ref())
            .await?;
    }

    ctx.outlet
        .send(Packet::ConnAck(ConnAck::accepted(session_present)))
        .await;

    let handle = ConnectionHandle::new(
        ctx.conn_id,
        ctx.outlet.clone(),
        session.clone(),
        auth.clone(),
        ctx.takeover_signal(),
    );
    if let Some(raced) = broker
        .connections()
        .register(client_id.clone(), Arc::new(handle))
    {
        // Another connection for the same id registered while we opened
        raced.kick();
        broker.metrics().session_takeovers_total.inc();
    }
    broker.mark_online(&client_id).await?;

    let keep_alive = broker.negotiate_keep_alive(connect.keep_alive);
    ctx.bind(
        client_id.clone(),
        session.clone(),
        auth,
        connect.will,
        keep_alive,
    );
    broker.metrics().client_connected();
    info!(
        "Client {} connected (clean_session={}, keep_alive={}s, session_present={})",
        client_id, connect.clean_session, keep_alive, session_present
    );

    if session_present {
        replay(ctx, &session).await?;
    }
    Ok(())
}

/// Resend everything the previous connection left unacknowledged
async fn replay(ctx: &ConnectionContext, session: &Session) -> Result<(), ConnectionError> {
    let pending = session.pending();

    let messages = pending.pending_pubs().await?;
    let count = messages.len();
    for message in messages {
        let mut publish = message.to_publish()?;
        publish.dup = true;
        trace!(
            "Replaying message {} on '{}' to {}",
            message.packet_id,
            publish.topic,
            session.client_id()
        );
        ctx.outlet.send(Packet::Publish(publish)).await;
    }

    for packet_id in pending.pending_comps().await? {
        ctx.outlet.send(Packet::PubRel(packet_id)).await;
    }
    for packet_id in pending.pending_rels().await? {
        ctx.outlet.send(Packet::PubRec(packet_id)).await;
    }

    if count > 0 {
        debug!(
            "Replayed {} pending messages to {}",
            count,
            session.client_id()
        );
    }
    Ok(())
}
