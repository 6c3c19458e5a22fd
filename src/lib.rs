//! TideMQ - clusterable MQTT v3.1.1 broker core
//!
//! Sessions, QoS 0/1/2 delivery, wildcard and shared subscriptions,
//! retained messages and cross-broker fan-out over a shared durable store.
//! Transports attach connections through [`Broker::attach`] and exchange
//! decoded packets with the broker.

pub mod acl;
pub mod auth;
pub mod broker;
pub mod cluster;
pub mod config;
pub mod metrics;
pub mod persistence;
pub mod protocol;
pub mod session;
pub mod topic;

pub use acl::{AclProvider, Authorizer, Permissions};
pub use auth::{AuthProvider, Authenticator};
pub use broker::{Broker, BrokerError, Inbound, Outbound, TransportLink};
pub use cluster::{ClusterBus, ClusterConfig};
pub use config::Config;
pub use metrics::Metrics;
pub use persistence::{open_store, DurableStore, FjallStore, MemoryStore};
pub use protocol::{Packet, QoS};
