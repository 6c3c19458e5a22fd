//! Decoded MQTT packets
//!
//! Inbound packets arrive from the transport already parsed and validated at
//! the byte level. Outbound packets are handed back to the transport through
//! the connection's outbound channel.

use std::sync::Arc;

use bytes::Bytes;

use super::{PacketKind, QoS};

/// MQTT packet, inbound or outbound
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Kind of an inbound packet, or `None` for server-to-client packets
    pub fn kind(&self) -> Option<PacketKind> {
        match self {
            Packet::Connect(_) => Some(PacketKind::Connect),
            Packet::Publish(_) => Some(PacketKind::Publish),
            Packet::PubAck(_) => Some(PacketKind::PubAck),
            Packet::PubRec(_) => Some(PacketKind::PubRec),
            Packet::PubRel(_) => Some(PacketKind::PubRel),
            Packet::PubComp(_) => Some(PacketKind::PubComp),
            Packet::Subscribe(_) => Some(PacketKind::Subscribe),
            Packet::Unsubscribe(_) => Some(PacketKind::Unsubscribe),
            Packet::PingReq => Some(PacketKind::PingReq),
            Packet::Disconnect => Some(PacketKind::Disconnect),
            Packet::ConnAck(_)
            | Packet::SubAck(_)
            | Packet::UnsubAck(_)
            | Packet::PingResp => None,
        }
    }

    /// Packet type name, for logging and metric labels
    pub fn name(&self) -> &'static str {
        match self.kind() {
            Some(kind) => kind.name(),
            None => match self {
                Packet::ConnAck(_) => "CONNACK",
                Packet::SubAck(_) => "SUBACK",
                Packet::UnsubAck(_) => "UNSUBACK",
                _ => "PINGRESP",
            },
        }
    }
}

/// CONNECT packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Client identifier (may be empty)
    pub client_id: String,
    /// Clean session flag
    pub clean_session: bool,
    /// Keep alive interval in seconds
    pub keep_alive: u16,
    /// Username (optional)
    pub username: Option<String>,
    /// Password (optional)
    pub password: Option<Bytes>,
    /// Will message (optional)
    pub will: Option<Will>,
}

impl Default for Connect {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            clean_session: true,
            keep_alive: 60,
            username: None,
            password: None,
            will: None,
        }
    }
}

/// Will message configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK return codes (MQTT v3.1.1 table 3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernameOrPassword = 4,
    NotAuthorized = 5,
}

/// CONNACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

impl ConnAck {
    pub fn accepted(session_present: bool) -> Self {
        Self {
            session_present,
            return_code: ConnectReturnCode::Accepted,
        }
    }

    pub fn refused(return_code: ConnectReturnCode) -> Self {
        Self {
            session_present: false,
            return_code,
        }
    }
}

/// PUBLISH packet (bidirectional)
///
/// The topic uses `Arc<str>` so fan-out copies share one allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Duplicate delivery flag
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: Arc<str>,
    /// Packet identifier (required for QoS > 0)
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

impl Publish {
    pub fn new(topic: impl Into<Arc<str>>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            dup: false,
            qos,
            retain: false,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
        }
    }

    pub fn with_packet_id(mut self, packet_id: u16) -> Self {
        self.packet_id = Some(packet_id);
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// One topic filter in a SUBSCRIBE request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub filter: String,
    pub qos: QoS,
}

/// SUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<SubscribeFilter>,
}

/// SUBACK per-filter return code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAckReturnCode {
    Granted(QoS),
    Failure,
}

impl SubAckReturnCode {
    pub fn as_u8(self) -> u8 {
        match self {
            SubAckReturnCode::Granted(qos) => qos as u8,
            SubAckReturnCode::Failure => 0x80,
        }
    }
}

/// SUBACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    pub return_codes: Vec<SubAckReturnCode>,
}

/// UNSUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}
