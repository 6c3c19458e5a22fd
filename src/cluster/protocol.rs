//! Cluster Protocol Messages
//!
//! Defines the events exchanged between brokers over the store's pub/sub
//! channel. Envelopes and bodies are serialized using bincode.

use bincode::{Decode, Encode};

use super::ClusterError;
use crate::persistence::now_millis;

/// Kinds of cluster event, used to key watcher registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum EventKind {
    /// A message published on the origin broker
    Publish,
    /// A persistent subscription was added
    Subscribe,
    /// Subscriptions were removed
    Unsubscribe,
    /// A client connected; other brokers close their connection for it
    ClientConnected,
    /// A clean session wiped a client's subscriptions
    ClearSubscriptions,
    /// A client's permissions changed at runtime
    AuthorizationChanged,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Publish,
        EventKind::Subscribe,
        EventKind::Unsubscribe,
        EventKind::ClientConnected,
        EventKind::ClearSubscriptions,
        EventKind::AuthorizationChanged,
    ];

    /// Get the event kind name for logging
    pub fn name(self) -> &'static str {
        match self {
            EventKind::Publish => "publish",
            EventKind::Subscribe => "subscribe",
            EventKind::Unsubscribe => "unsubscribe",
            EventKind::ClientConnected => "client_connected",
            EventKind::ClearSubscriptions => "clear_subscriptions",
            EventKind::AuthorizationChanged => "authorization_changed",
        }
    }
}

/// Envelope broadcast on the cluster channel
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ClusterEvent {
    pub kind: EventKind,
    /// bincode-encoded body, one of the `*Event` structs below
    pub payload: Vec<u8>,
    pub timestamp_millis: u64,
    /// Broker that sent the event (to prevent loops)
    pub origin_broker_id: String,
}

impl ClusterEvent {
    pub fn new<T: Encode>(kind: EventKind, body: &T, origin: &str) -> Result<Self, ClusterError> {
        Ok(Self {
            kind,
            payload: bincode::encode_to_vec(body, bincode::config::standard())?,
            timestamp_millis: now_millis(),
            origin_broker_id: origin.to_string(),
        })
    }

    /// Decode the body
    pub fn body<T: Decode<()>>(&self) -> Result<T, ClusterError> {
        Ok(bincode::decode_from_slice(&self.payload, bincode::config::standard())?.0)
    }

    /// Encode event to bytes using bincode
    pub fn encode(&self) -> Result<Vec<u8>, ClusterError> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    /// Decode event from bytes using bincode
    pub fn decode(data: &[u8]) -> Result<Self, ClusterError> {
        Ok(bincode::decode_from_slice(data, bincode::config::standard())?.0)
    }
}

/// Body of [`EventKind::Publish`]
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PublishEvent {
    /// Client id of the publisher
    pub publisher: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    /// (share group filter, chosen client id) as selected by the origin
    pub choices: Vec<(String, String)>,
}

/// Body of [`EventKind::Subscribe`]
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SubscriptionEvent {
    pub client_id: String,
    pub filter: String,
    pub qos: u8,
}

/// Body of [`EventKind::Unsubscribe`]
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct UnsubscribeEvent {
    pub client_id: String,
    pub filters: Vec<String>,
}

/// Body of [`EventKind::ClientConnected`] and [`EventKind::ClearSubscriptions`]
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ClientEvent {
    pub client_id: String,
}

/// Body of [`EventKind::AuthorizationChanged`]
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct AuthorizationEvent {
    pub client_id: String,
    pub publish: Vec<String>,
    pub subscribe: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_carries_body() {
        let body = PublishEvent {
            publisher: "pub1".to_string(),
            topic: "test/topic".to_string(),
            payload: vec![1, 2, 3, 4],
            qos: 1,
            retain: true,
            choices: vec![("$share/g/test/+".to_string(), "c2".to_string())],
        };
        let event = ClusterEvent::new(EventKind::Publish, &body, "node1").unwrap();

        let decoded = ClusterEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, EventKind::Publish);
        assert_eq!(decoded.origin_broker_id, "node1");
        assert_eq!(decoded.body::<PublishEvent>().unwrap(), body);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(ClusterEvent::decode(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_kind_names_unique() {
        let mut names: Vec<_> = EventKind::ALL.iter().map(|k| k.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), EventKind::ALL.len());
    }
}
