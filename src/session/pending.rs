//! Per-client pending-delivery state
//!
//! Three collections per client:
//! - outbound QoS 1/2 messages awaiting PUBACK or PUBREC
//! - inbound QoS 2 packet ids awaiting PUBREL (duplicate detection)
//! - outbound QoS 2 packet ids awaiting PUBCOMP
//!
//! Ephemeral sessions keep them in memory; persistent sessions keep them in
//! the durable store so they survive reconnects and broker restarts.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::persistence::{decode, encode, keys, DurableStore, Result, StoredMessage};

/// Pending-delivery operations for one client
#[async_trait]
pub trait PendingStore: Send + Sync {
    /// Record an outbound message awaiting acknowledgement
    async fn save_pub(&self, message: StoredMessage) -> Result<()>;

    /// Drop an acknowledged outbound message
    async fn remove_pub(&self, packet_id: u16) -> Result<Option<StoredMessage>>;

    async fn contains_pub(&self, packet_id: u16) -> Result<bool>;

    /// Outbound messages in the order they were queued
    async fn pending_pubs(&self) -> Result<Vec<StoredMessage>>;

    /// Record an inbound QoS 2 packet id awaiting PUBREL
    async fn save_rel(&self, packet_id: u16) -> Result<()>;

    async fn remove_rel(&self, packet_id: u16) -> Result<bool>;

    /// Whether an inbound QoS 2 packet id was already received and not yet
    /// released
    async fn is_duplicate(&self, packet_id: u16) -> Result<bool>;

    async fn pending_rels(&self) -> Result<Vec<u16>>;

    /// Record an outbound QoS 2 packet id awaiting PUBCOMP
    async fn save_comp(&self, packet_id: u16) -> Result<()>;

    async fn remove_comp(&self, packet_id: u16) -> Result<bool>;

    async fn contains_comp(&self, packet_id: u16) -> Result<bool>;

    async fn pending_comps(&self) -> Result<Vec<u16>>;

    /// Drop everything
    async fn clear(&self) -> Result<()>;

    /// Whether an outbound packet id is still part of a handshake
    async fn in_use(&self, packet_id: u16) -> Result<bool> {
        Ok(self.contains_pub(packet_id).await? || self.contains_comp(packet_id).await?)
    }
}

fn sort_for_replay(messages: &mut [StoredMessage]) {
    messages.sort_by(|a, b| {
        a.queued_at_millis
            .cmp(&b.queued_at_millis)
            .then(a.packet_id.cmp(&b.packet_id))
    });
}

#[derive(Default)]
struct MemoryPendingState {
    pubs: BTreeMap<u16, StoredMessage>,
    rels: BTreeSet<u16>,
    comps: BTreeSet<u16>,
}

/// Pending state held in memory, for ephemeral sessions
#[derive(Default)]
pub struct MemoryPending {
    state: Mutex<MemoryPendingState>,
}

impl MemoryPending {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingStore for MemoryPending {
    async fn save_pub(&self, message: StoredMessage) -> Result<()> {
        self.state.lock().pubs.insert(message.packet_id, message);
        Ok(())
    }

    async fn remove_pub(&self, packet_id: u16) -> Result<Option<StoredMessage>> {
        Ok(self.state.lock().pubs.remove(&packet_id))
    }

    async fn contains_pub(&self, packet_id: u16) -> Result<bool> {
        Ok(self.state.lock().pubs.contains_key(&packet_id))
    }

    async fn pending_pubs(&self) -> Result<Vec<StoredMessage>> {
        let mut messages: Vec<_> = self.state.lock().pubs.values().cloned().collect();
        sort_for_replay(&mut messages);
        Ok(messages)
    }

    async fn save_rel(&self, packet_id: u16) -> Result<()> {
        self.state.lock().rels.insert(packet_id);
        Ok(())
    }

    async fn remove_rel(&self, packet_id: u16) -> Result<bool> {
        Ok(self.state.lock().rels.remove(&packet_id))
    }

    async fn is_duplicate(&self, packet_id: u16) -> Result<bool> {
        Ok(self.state.lock().rels.contains(&packet_id))
    }

    async fn pending_rels(&self) -> Result<Vec<u16>> {
        Ok(self.state.lock().rels.iter().copied().collect())
    }

    async fn save_comp(&self, packet_id: u16) -> Result<()> {
        self.state.lock().comps.insert(packet_id);
        Ok(())
    }

    async fn remove_comp(&self, packet_id: u16) -> Result<bool> {
        Ok(self.state.lock().comps.remove(&packet_id))
    }

    async fn contains_comp(&self, packet_id: u16) -> Result<bool> {
        Ok(self.state.lock().comps.contains(&packet_id))
    }

    async fn pending_comps(&self) -> Result<Vec<u16>> {
        Ok(self.state.lock().comps.iter().copied().collect())
    }

    async fn clear(&self) -> Result<()> {
        *self.state.lock() = MemoryPendingState::default();
        Ok(())
    }
}

/// Pending state held in the durable store, for persistent sessions
pub struct DurablePending {
    store: Arc<dyn DurableStore>,
    pub_key: String,
    rel_key: String,
    comp_key: String,
}

impl DurablePending {
    pub fn new(store: Arc<dyn DurableStore>, client_id: &str) -> Self {
        Self {
            store,
            pub_key: keys::pending_pub(client_id),
            rel_key: keys::pending_rel(client_id),
            comp_key: keys::pending_comp(client_id),
        }
    }
}

fn parse_ids(members: Vec<String>) -> Vec<u16> {
    let mut ids: Vec<u16> = members.iter().filter_map(|m| m.parse().ok()).collect();
    ids.sort_unstable();
    ids
}

#[async_trait]
impl PendingStore for DurablePending {
    async fn save_pub(&self, message: StoredMessage) -> Result<()> {
        let field = message.packet_id.to_string();
        self.store
            .hset(&self.pub_key, &field, encode(&message)?)
            .await
    }

    async fn remove_pub(&self, packet_id: u16) -> Result<Option<StoredMessage>> {
        let field = packet_id.to_string();
        let existing = match self.store.hget(&self.pub_key, &field).await? {
            Some(bytes) => Some(decode::<StoredMessage>(&bytes)?),
            None => None,
        };
        self.store.hdel(&self.pub_key, &field).await?;
        Ok(existing)
    }

    async fn contains_pub(&self, packet_id: u16) -> Result<bool> {
        self.store
            .hexists(&self.pub_key, &packet_id.to_string())
            .await
    }

    async fn pending_pubs(&self) -> Result<Vec<StoredMessage>> {
        let mut messages = self
            .store
            .hgetall(&self.pub_key)
            .await?
            .into_iter()
            .map(|(_, bytes)| decode::<StoredMessage>(&bytes))
            .collect::<Result<Vec<_>>>()?;
        sort_for_replay(&mut messages);
        Ok(messages)
    }

    async fn save_rel(&self, packet_id: u16) -> Result<()> {
        self.store
            .sadd(&self.rel_key, &packet_id.to_string())
            .await
            .map(|_| ())
    }

    async fn remove_rel(&self, packet_id: u16) -> Result<bool> {
        self.store.srem(&self.rel_key, &packet_id.to_string()).await
    }

    async fn is_duplicate(&self, packet_id: u16) -> Result<bool> {
        self.store
            .sismember(&self.rel_key, &packet_id.to_string())
            .await
    }

    async fn pending_rels(&self) -> Result<Vec<u16>> {
        Ok(parse_ids(self.store.smembers(&self.rel_key).await?))
    }

    async fn save_comp(&self, packet_id: u16) -> Result<()> {
        self.store
            .sadd(&self.comp_key, &packet_id.to_string())
            .await
            .map(|_| ())
    }

    async fn remove_comp(&self, packet_id: u16) -> Result<bool> {
        self.store.srem(&self.comp_key, &packet_id.to_string()).await
    }

    async fn contains_comp(&self, packet_id: u16) -> Result<bool> {
        self.store
            .sismember(&self.comp_key, &packet_id.to_string())
            .await
    }

    async fn pending_comps(&self) -> Result<Vec<u16>> {
        Ok(parse_ids(self.store.smembers(&self.comp_key).await?))
    }

    async fn clear(&self) -> Result<()> {
        self.store.del(&self.pub_key).await?;
        self.store.del(&self.rel_key).await?;
        self.store.del(&self.comp_key).await
    }
}
