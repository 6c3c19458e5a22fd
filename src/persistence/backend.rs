//! Durable store trait.
//!
//! The broker core only needs three primitive families from its store:
//! string-keyed hashes, string sets and a pub/sub broadcast channel. Any
//! key/value service offering those (an embedded LSM tree, Redis, ...) can
//! back sessions, subscriptions, retained messages, pending deliveries and
//! the cluster bus.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;

use super::error::Result;

/// Capacity of each pub/sub channel before slow receivers start lagging
const CHANNEL_CAPACITY: usize = 4096;

/// Storage backend trait
///
/// Every write is an idempotent re-apply: setting a field to the value it
/// already holds, adding a present member or deleting an absent one is a
/// no-op, so a torn-down connection can always replay its cleanup.
#[async_trait]
pub trait DurableStore: Send + Sync {
    // ========================================================================
    // Hashes
    // ========================================================================

    /// Get one field of a hash
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Bytes>>;

    /// Set one field of a hash
    async fn hset(&self, key: &str, field: &str, value: Bytes) -> Result<()>;

    /// Delete one field of a hash, returning whether it existed
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;

    /// All fields of a hash
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Bytes)>>;

    /// Whether a hash field exists
    async fn hexists(&self, key: &str, field: &str) -> Result<bool> {
        Ok(self.hget(key, field).await?.is_some())
    }

    // ========================================================================
    // Sets
    // ========================================================================

    /// Add a member to a set, returning whether it was newly added
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// Remove a member from a set, returning whether it was present
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    /// All members of a set
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Whether a set contains a member
    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

    // ========================================================================
    // Keys
    // ========================================================================

    /// Delete a key (hash or set) entirely
    async fn del(&self, key: &str) -> Result<()>;

    // ========================================================================
    // Pub/sub
    // ========================================================================

    /// Broadcast a payload on a channel
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;

    /// Receive everything published on a channel from now on
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Bytes>;

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Flush all pending writes to durable media
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// In-process broadcast channels shared by the bundled backends
#[derive(Default)]
pub(crate) struct LocalChannels {
    channels: DashMap<String, broadcast::Sender<Bytes>>,
}

impl LocalChannels {
    pub(crate) fn publish(&self, channel: &str, payload: Bytes) {
        if let Some(tx) = self.channels.get(channel) {
            // No receivers is not an error: nobody is listening yet
            let _ = tx.send(payload);
        }
    }

    pub(crate) fn subscribe(&self, channel: &str) -> broadcast::Receiver<Bytes> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }
}
