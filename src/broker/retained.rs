//! Retained message store
//!
//! Last-value cache keyed by exact topic, mirrored to the `retain` hash of
//! the durable store and loaded in full at startup.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::metrics::Metrics;
use crate::persistence::{decode, encode, keys, DurableStore, Result, StoredRetainedMessage};
use crate::topic::topic_matches_filter;

pub struct RetainedStore {
    store: Arc<dyn DurableStore>,
    cache: DashMap<Arc<str>, StoredRetainedMessage>,
    metrics: Arc<Metrics>,
}

impl RetainedStore {
    pub fn new(store: Arc<dyn DurableStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            metrics,
        }
    }

    /// Load every retained message from the store
    pub async fn load(&self) -> Result<usize> {
        let entries = self.store.hgetall(keys::RETAIN).await?;
        for (topic, bytes) in entries {
            let message: StoredRetainedMessage = decode(&bytes)?;
            self.cache.insert(topic.into(), message);
        }
        self.update_gauge();
        debug!("Loaded {} retained messages", self.cache.len());
        Ok(self.cache.len())
    }

    pub fn get(&self, topic: &str) -> Option<StoredRetainedMessage> {
        self.cache.get(topic).map(|m| m.clone())
    }

    /// Insert or replace the retained message of a topic
    pub async fn save(&self, topic: &str, message: StoredRetainedMessage) -> Result<()> {
        self.store
            .hset(keys::RETAIN, topic, encode(&message)?)
            .await?;
        self.remember(topic, message);
        Ok(())
    }

    /// Remove the retained message of a topic; returns whether one existed
    pub async fn remove(&self, topic: &str) -> Result<bool> {
        let in_store = self.store.hdel(keys::RETAIN, topic).await?;
        Ok(self.forget(topic) || in_store)
    }

    /// Every retained message whose topic matches the filter
    pub fn search_by_filter(&self, filter: &str) -> Vec<StoredRetainedMessage> {
        self.cache
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Cache a message another broker already stored
    pub fn remember(&self, topic: &str, message: StoredRetainedMessage) {
        trace!("Retained message set for '{}'", topic);
        self.cache.insert(topic.into(), message);
        self.update_gauge();
    }

    /// Drop a cached message another broker already removed
    pub fn forget(&self, topic: &str) -> bool {
        let removed = self.cache.remove(topic).is_some();
        if removed {
            trace!("Retained message cleared for '{}'", topic);
            self.update_gauge();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn update_gauge(&self) {
        self.metrics
            .retained_messages_current
            .set(self.cache.len() as i64);
    }
}
