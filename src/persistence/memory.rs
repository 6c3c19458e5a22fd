//! In-memory store backend.
//!
//! Holds everything in sharded maps. Several brokers in one process may
//! share a single `MemoryStore`, which then also acts as their cluster
//! transport.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;

use super::backend::{DurableStore, LocalChannels};
use super::error::Result;

/// Memory-backed store
#[derive(Default)]
pub struct MemoryStore {
    hashes: DashMap<String, HashMap<String, Bytes>>,
    sets: DashMap<String, HashSet<String>>,
    channels: LocalChannels,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Bytes>> {
        Ok(self
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hset(&self, key: &str, field: &str, value: Bytes) -> Result<()> {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let removed = match self.hashes.get_mut(key) {
            Some(mut hash) => hash.remove(field).is_some(),
            None => false,
        };
        // Drop empty hashes outside the shard guard above
        self.hashes.remove_if(key, |_, hash| hash.is_empty());
        Ok(removed)
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Bytes)>> {
        Ok(self
            .hashes
            .get(key)
            .map(|hash| {
                hash.iter()
                    .map(|(field, value)| (field.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let removed = match self.sets.get_mut(key) {
            Some(mut set) => set.remove(member),
            None => false,
        };
        self.sets.remove_if(key, |_, set| set.is_empty());
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self
            .sets
            .get(key)
            .map(|set| set.contains(member))
            .unwrap_or(false))
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.hashes.remove(key);
        self.sets.remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        self.channels.publish(channel, payload);
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Bytes> {
        self.channels.subscribe(channel)
    }
}
