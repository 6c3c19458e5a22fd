//! Protocol error types

use std::fmt;

/// Protocol-level violations raised while handling a decoded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// First packet on a connection was not CONNECT
    ConnectExpected,
    /// A second CONNECT arrived on an established connection
    DuplicateConnect,
    /// QoS > 0 PUBLISH without a packet identifier
    MissingPacketId,
    /// Invalid topic name in PUBLISH
    InvalidTopicName(&'static str),
    /// Packet kind the server never accepts from a client
    UnexpectedPacket(&'static str),
    /// Generic protocol violation
    ProtocolViolation(&'static str),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectExpected => write!(f, "first packet must be CONNECT"),
            Self::DuplicateConnect => write!(f, "second CONNECT on an established connection"),
            Self::MissingPacketId => write!(f, "QoS > 0 publish without packet identifier"),
            Self::InvalidTopicName(reason) => write!(f, "invalid topic name: {}", reason),
            Self::UnexpectedPacket(name) => write!(f, "unexpected packet: {}", name),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}
