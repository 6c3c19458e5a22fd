//! MQTT Connection Handler
//!
//! One worker per connection. The transport feeds it decoded packets and
//! drains the frames it writes back; the worker processes one packet to
//! completion before reading the next, so a client's events are handled
//! strictly in arrival order.
//!
//! Teardown depends on how the connection ended:
//! - DISCONNECT: will discarded, session closed
//! - taken over by a newer connection: nothing but closing the transport
//! - anything else: will published, then session closed
//!
//! The transport is told to close last, once session state is settled.

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;

pub use connect::OnConnect;
pub use disconnect::{OnDisconnect, OnPing};
pub use publish::OnPublish;
pub use qos::{OnPubAck, OnPubComp, OnPubRec, OnPubRel};
pub use subscribe::{OnSubscribe, OnUnsubscribe};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use super::connections::Outlet;
use super::Broker;
use crate::auth::{AuthError, Authentication};
use crate::persistence::StoreError;
use crate::protocol::{Packet, ProtocolError, Will};
use crate::session::{Session, SessionError};

/// Time allowed between transport attach and CONNECT
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Events the transport hands to a connection worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Packet(Packet),
    /// Read or decode failure; the worker tears the connection down
    TransportError(String),
}

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Protocol(ProtocolError),
    /// PUBLISH denied by the authorizer
    NotAuthorized(String),
    Auth(AuthError),
    Session(SessionError),
    Store(StoreError),
    Transport(String),
    Timeout,
    /// Client sent DISCONNECT
    Shutdown,
    /// A newer connection took over the client id
    TakenOver,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::NotAuthorized(topic) => {
                write!(f, "Not authorized to publish to '{}'", topic)
            }
            ConnectionError::Auth(e) => write!(f, "Authentication failed: {}", e),
            ConnectionError::Session(e) => write!(f, "Session error: {}", e),
            ConnectionError::Store(e) => write!(f, "Store error: {}", e),
            ConnectionError::Transport(e) => write!(f, "Transport error: {}", e),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
            ConnectionError::Shutdown => write!(f, "Shutdown"),
            ConnectionError::TakenOver => write!(f, "Taken over"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

impl From<AuthError> for ConnectionError {
    fn from(e: AuthError) -> Self {
        ConnectionError::Auth(e)
    }
}

impl From<SessionError> for ConnectionError {
    fn from(e: SessionError) -> Self {
        ConnectionError::Session(e)
    }
}

impl From<StoreError> for ConnectionError {
    fn from(e: StoreError) -> Self {
        ConnectionError::Store(e)
    }
}

/// Per-connection state owned by the worker
pub struct ConnectionContext {
    conn_id: u64,
    outlet: Arc<Outlet>,
    takeover: Arc<Notify>,
    client_id: Option<Arc<str>>,
    session: Option<Arc<Session>>,
    auth: Authentication,
    will: Option<Will>,
    /// 1.5x the negotiated keep-alive, None when disabled
    idle_timeout: Option<Duration>,
    last_received: Instant,
}

impl ConnectionContext {
    pub(crate) fn new(conn_id: u64, outlet: Arc<Outlet>) -> Self {
        Self {
            conn_id,
            outlet,
            takeover: Arc::new(Notify::new()),
            client_id: None,
            session: None,
            auth: Authentication::anonymous(),
            will: None,
            idle_timeout: None,
            last_received: Instant::now(),
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn client_id(&self) -> Option<&Arc<str>> {
        self.client_id.as_ref()
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    pub fn auth(&self) -> &Authentication {
        &self.auth
    }

    pub fn outlet(&self) -> &Arc<Outlet> {
        &self.outlet
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Client id and session of an established connection
    pub(crate) fn connected(&self) -> Result<(Arc<str>, Arc<Session>), ConnectionError> {
        match (&self.client_id, &self.session) {
            (Some(client_id), Some(session)) => Ok((client_id.clone(), session.clone())),
            _ => Err(ProtocolError::ConnectExpected.into()),
        }
    }

    pub(crate) fn bind(
        &mut self,
        client_id: Arc<str>,
        session: Arc<Session>,
        auth: Authentication,
        will: Option<Will>,
        keep_alive: u16,
    ) {
        self.client_id = Some(client_id);
        self.session = Some(session);
        self.auth = auth;
        self.will = will;
        self.idle_timeout =
            (keep_alive > 0).then(|| Duration::from_millis(keep_alive as u64 * 1500));
    }

    pub(crate) fn takeover_signal(&self) -> Arc<Notify> {
        self.takeover.clone()
    }

    /// Forget the will; a DISCONNECT discards it
    pub(crate) fn discard_will(&mut self) {
        self.will = None;
    }

    fn touch(&mut self) {
        self.last_received = Instant::now();
    }

    /// When the connection counts as idle, given traffic in either direction
    fn idle_deadline(&self) -> Option<Instant> {
        let last = self.last_received.max(self.outlet.last_sent());
        self.idle_timeout.map(|t| last + t)
    }
}

/// Drive one connection from attach to teardown
pub(crate) async fn run(
    broker: Arc<Broker>,
    mut ctx: ConnectionContext,
    mut inbound: mpsc::Receiver<Inbound>,
) {
    let result = serve(&broker, &mut ctx, &mut inbound).await;
    match &result {
        Ok(()) | Err(ConnectionError::Shutdown) | Err(ConnectionError::TakenOver) => {}
        Err(ConnectionError::Transport(e)) => debug!("Connection {}: {}", ctx.conn_id, e),
        Err(e) => warn!("Connection {} closing: {}", ctx.conn_id, e),
    }
    teardown(&broker, &mut ctx, &result).await;
}

async fn serve(
    broker: &Broker,
    ctx: &mut ConnectionContext,
    inbound: &mut mpsc::Receiver<Inbound>,
) -> Result<(), ConnectionError> {
    // Wait for CONNECT packet with timeout
    let first = match timeout(CONNECT_TIMEOUT, inbound.recv()).await {
        Err(_) => return Err(ConnectionError::Timeout),
        Ok(None) => return Err(ConnectionError::Transport("closed before CONNECT".into())),
        Ok(Some(Inbound::TransportError(e))) => return Err(ConnectionError::Transport(e)),
        Ok(Some(Inbound::Packet(packet))) => packet,
    };
    if !matches!(first, Packet::Connect(_)) {
        return Err(ProtocolError::ConnectExpected.into());
    }
    ctx.touch();
    broker.dispatcher().dispatch(broker, ctx, first).await?;

    let takeover = ctx.takeover_signal();
    loop {
        let deadline = ctx.idle_deadline();
        tokio::select! {
            biased;

            _ = takeover.notified() => return Err(ConnectionError::TakenOver),

            event = inbound.recv() => match event {
                Some(Inbound::Packet(packet)) => {
                    ctx.touch();
                    broker.dispatcher().dispatch(broker, ctx, packet).await?;
                }
                Some(Inbound::TransportError(e)) => return Err(ConnectionError::Transport(e)),
                None => {
                    return Err(ConnectionError::Transport(
                        "closed without DISCONNECT".into(),
                    ))
                }
            },

            _ = sleep_until(deadline), if deadline.is_some() => {
                // Outbound traffic may have moved the deadline while we slept
                if ctx.idle_deadline().is_some_and(|d| d <= Instant::now()) {
                    info!(
                        "Keep alive timeout for {:?} - disconnecting",
                        ctx.client_id()
                    );
                    return Err(ConnectionError::Timeout);
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn teardown(broker: &Broker, ctx: &mut ConnectionContext, result: &Result<(), ConnectionError>) {
    let (client_id, session) = match (ctx.client_id.clone(), ctx.session.clone()) {
        (Some(client_id), Some(session)) => (client_id, session),
        _ => {
            ctx.outlet.close();
            return;
        }
    };
    broker.metrics().client_disconnected();

    match result {
        Err(ConnectionError::TakenOver) => {
            debug!("Connection {} of {} taken over", ctx.conn_id, client_id);
            ctx.outlet.close();
            return;
        }
        Ok(()) | Err(ConnectionError::Shutdown) => {
            debug!("{} disconnected", client_id);
        }
        Err(_) => {
            if let Some(will) = ctx.will.take() {
                if let Err(e) = broker.engine().publish_will(&client_id, &will).await {
                    error!("Failed to publish will of {}: {}", client_id, e);
                }
            }
        }
    }

    broker.connections().unregister(&client_id, ctx.conn_id);
    if let Err(e) = broker.clear_presence(&client_id).await {
        warn!("Failed to clear presence of {}: {}", client_id, e);
    }
    if let Err(e) = broker.sessions().close(&session).await {
        error!("Failed to close session of {}: {}", client_id, e);
    }
    ctx.outlet.close();
}
