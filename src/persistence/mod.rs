//! Persistence module for TideMQ.
//!
//! Provides the durable store collaborator that backs:
//! - Persistent sessions (message-id counter, will message)
//! - Pending QoS 1/2 deliveries and QoS 2 release markers
//! - Persistent subscriptions
//! - Retained messages
//! - The cluster bus (pub/sub channel)
//!
//! Uses a trait-based design allowing different backends:
//! - `MemoryStore` - process-local maps, also usable as an in-process cluster
//! - `FjallStore` - Local LSM-tree storage

mod backend;
mod error;
mod fjall;
pub mod keys;
mod memory;
mod models;

pub use backend::DurableStore;
pub use error::{Result, StoreError};
pub use fjall::FjallStore;
pub use memory::MemoryStore;
pub use models::{
    decode, encode, StoredMessage, StoredRetainedMessage, StoredWillMessage,
};
pub(crate) use models::now_millis;

use std::sync::Arc;

use tracing::info;

use crate::config::{StoreBackend, StoreConfig};

/// Open the store selected by configuration
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn DurableStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory store (state does not survive restarts)");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Fjall => {
            info!("Opening fjall store at {}", config.path.display());
            Ok(Arc::new(FjallStore::open(&config.path)?))
        }
    }
}
