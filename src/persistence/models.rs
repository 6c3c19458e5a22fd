//! Serializable data models for persistence.
//!
//! These are storage-friendly versions of runtime types that can be
//! serialized with bincode.

use std::time::{SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};
use bytes::Bytes;

use super::error::{Result, StoreError};
use crate::protocol::{Publish, QoS, Will};

/// Encode a record with bincode
pub fn encode<T: Encode>(value: &T) -> Result<Bytes> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map(Bytes::from)
        .map_err(StoreError::from)
}

/// Decode a record with bincode
pub fn decode<T: Decode<()>>(bytes: &[u8]) -> Result<T> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(StoreError::from)
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn qos_from_stored(qos: u8) -> Result<QoS> {
    QoS::from_u8(qos).ok_or_else(|| StoreError::Corruption(format!("invalid stored QoS {}", qos)))
}

/// Stored outbound message awaiting acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredMessage {
    pub packet_id: u16,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    /// Unix millis when queued, orders replay across id wraparound
    pub queued_at_millis: u64,
}

impl StoredMessage {
    pub fn from_publish(packet_id: u16, publish: &Publish) -> Self {
        Self {
            packet_id,
            topic: publish.topic.to_string(),
            payload: publish.payload.to_vec(),
            qos: publish.qos as u8,
            retain: publish.retain,
            queued_at_millis: now_millis(),
        }
    }

    pub fn to_publish(&self) -> Result<Publish> {
        Ok(Publish {
            dup: false,
            qos: qos_from_stored(self.qos)?,
            retain: self.retain,
            topic: self.topic.as_str().into(),
            packet_id: Some(self.packet_id),
            payload: Bytes::from(self.payload.clone()),
        })
    }
}

/// Stored retained message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredRetainedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    /// Unix millis when the message was stored
    pub stored_at_millis: u64,
}

impl StoredRetainedMessage {
    pub fn qos(&self) -> Result<QoS> {
        qos_from_stored(self.qos)
    }
}

/// Stored will message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredWillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

impl From<&Will> for StoredWillMessage {
    fn from(will: &Will) -> Self {
        Self {
            topic: will.topic.clone(),
            payload: will.payload.to_vec(),
            qos: will.qos as u8,
            retain: will.retain,
        }
    }
}

impl StoredWillMessage {
    pub fn to_will(&self) -> Result<Will> {
        Ok(Will {
            topic: self.topic.clone(),
            payload: Bytes::from(self.payload.clone()),
            qos: qos_from_stored(self.qos)?,
            retain: self.retain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_message_keeps_publish_fields() {
        let publish = Publish::new("a/b", Bytes::from_static(b"x"), QoS::ExactlyOnce)
            .with_retain(true);
        let stored = StoredMessage::from_publish(7, &publish);
        let bytes = encode(&stored).unwrap();
        let back: StoredMessage = decode(&bytes).unwrap();
        let restored = back.to_publish().unwrap();

        assert_eq!(restored.packet_id, Some(7));
        assert_eq!(restored.qos, QoS::ExactlyOnce);
        assert!(restored.retain);
        assert_eq!(&*restored.topic, "a/b");
    }

    #[test]
    fn test_corrupt_qos_is_reported() {
        let stored = StoredMessage {
            packet_id: 1,
            topic: "t".into(),
            payload: vec![],
            qos: 9,
            retain: false,
            queued_at_millis: 0,
        };
        assert!(matches!(
            stored.to_publish(),
            Err(StoreError::Corruption(_))
        ));
    }
}
