//! Cluster Module
//!
//! Provides horizontal scale-out for TideMQ. Brokers sharing a durable store
//! exchange events over the store's pub/sub channel.
//!
//! # Architecture
//!
//! - **Durable store**: sessions, persistent subscriptions, retained
//!   messages and pending deliveries are shared by every broker
//! - **Cluster bus**: publishes, subscription changes, takeovers and
//!   permission changes are broadcast so each broker can update its
//!   in-memory state and deliver to its own connections
//!
//! # Usage
//!
//! ```toml
//! # tidemq.toml
//! [cluster]
//! enabled = true
//! channel = "tidemq:cluster"
//!
//! [store]
//! backend = "fjall"
//! ```

mod bus;
mod protocol;

pub use bus::{ClusterBus, Watcher};
pub use protocol::{
    AuthorizationEvent, ClientEvent, ClusterEvent, EventKind, PublishEvent, SubscriptionEvent,
    UnsubscribeEvent,
};

// Re-export cluster config
pub use crate::config::ClusterConfig;

use crate::persistence::StoreError;

/// Cluster bus error types
#[derive(Debug)]
pub enum ClusterError {
    Encode(bincode::error::EncodeError),
    Decode(bincode::error::DecodeError),
    Store(StoreError),
}

impl std::fmt::Display for ClusterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterError::Encode(e) => write!(f, "encode error: {}", e),
            ClusterError::Decode(e) => write!(f, "decode error: {}", e),
            ClusterError::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl std::error::Error for ClusterError {}

impl From<bincode::error::EncodeError> for ClusterError {
    fn from(e: bincode::error::EncodeError) -> Self {
        ClusterError::Encode(e)
    }
}

impl From<bincode::error::DecodeError> for ClusterError {
    fn from(e: bincode::error::DecodeError) -> Self {
        ClusterError::Decode(e)
    }
}

impl From<StoreError> for ClusterError {
    fn from(e: StoreError) -> Self {
        ClusterError::Store(e)
    }
}
