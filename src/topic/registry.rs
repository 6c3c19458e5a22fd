//! Subscription registry
//!
//! Filters are partitioned into an exact set (no wildcard level) and a
//! wildcard set. Matching a topic is one hash lookup against the exact set
//! plus a linear scan of the wildcard set, on the assumption that wildcard
//! filters are far fewer than exact ones.
//!
//! Both sets are sharded maps keyed by filter, so subscribers of unrelated
//! filters never contend. No shard guard is ever held across a durable store
//! call.
//!
//! Persistent subscriptions are mirrored to the durable store. With the
//! cache enabled they are also loaded into memory at startup and matched
//! there; with the cache disabled every match query reads them from the
//! store directly.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, trace, warn};

use super::validation::{
    filter_covered_by, is_wildcard, parse_shared_subscription, topic_matches_filter,
    SHARE_PREFIX,
};
use crate::persistence::{keys, DurableStore, Result};
use crate::protocol::QoS;

/// A subscription entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Client ID
    pub client_id: Arc<str>,
    /// Filter exactly as subscribed, including any `$share/{group}/` prefix
    pub filter: Arc<str>,
    /// Granted QoS
    pub qos: QoS,
    /// Mirrored to the durable store
    pub persistent: bool,
    /// Share group name for `$share/{group}/{filter}` subscriptions
    pub share_group: Option<Arc<str>>,
}

impl Subscription {
    pub fn new(client_id: &str, filter: &str, qos: QoS, persistent: bool) -> Self {
        let share_group = parse_shared_subscription(filter).map(|(group, _)| Arc::from(group));
        Self {
            client_id: client_id.into(),
            filter: filter.into(),
            qos,
            persistent,
            share_group,
        }
    }

    /// The filter part that is matched against topics
    pub fn match_filter(&self) -> &str {
        match_filter(&self.filter)
    }
}

fn match_filter(filter: &str) -> &str {
    parse_shared_subscription(filter)
        .map(|(_, actual)| actual)
        .unwrap_or(filter)
}

/// Subscribers of one match filter, keyed by (client, share group)
type FilterEntry = AHashMap<(Arc<str>, Option<Arc<str>>), Subscription>;

/// Thread-safe subscription registry
pub struct SubscriptionRegistry {
    store: Arc<dyn DurableStore>,
    /// Keep persistent subscriptions in memory too
    cache_enabled: bool,
    /// Match filter without wildcards -> subscribers
    exact: DashMap<Arc<str>, FilterEntry>,
    /// Match filter with wildcards -> subscribers
    wildcard: DashMap<Arc<str>, FilterEntry>,
    /// Client -> full filters it holds in memory
    clients: DashMap<Arc<str>, AHashSet<Arc<str>>>,
}

impl SubscriptionRegistry {
    pub fn new(store: Arc<dyn DurableStore>, cache_enabled: bool) -> Self {
        Self {
            store,
            cache_enabled,
            exact: DashMap::new(),
            wildcard: DashMap::new(),
            clients: DashMap::new(),
        }
    }

    /// Whether persistent subscriptions are matched from memory
    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled
    }

    /// Reload every persistent subscription from the store into memory.
    ///
    /// Called once at broker start; a no-op when the cache is disabled.
    pub async fn load_persistent(&self) -> Result<usize> {
        if !self.cache_enabled {
            return Ok(0);
        }

        let mut loaded = 0;
        for filter in self.store.smembers(keys::SUB_FILTERS).await? {
            for sub in self.read_filter_from_store(&filter).await? {
                self.index_insert(sub);
                loaded += 1;
            }
        }
        debug!("Loaded {} persistent subscriptions", loaded);
        Ok(loaded)
    }

    /// Add or overwrite a subscription.
    ///
    /// Re-subscribing to the same filter replaces the granted QoS.
    pub async fn subscribe(&self, sub: Subscription) -> Result<()> {
        trace!(
            "Subscribe {} -> {} ({:?}, persistent={})",
            sub.client_id,
            sub.filter,
            sub.qos,
            sub.persistent
        );

        if sub.persistent {
            let key = keys::subscription(&sub.filter);
            self.store
                .hset(&key, &sub.client_id, Bytes::from(vec![sub.qos as u8]))
                .await?;
            self.store.sadd(keys::SUB_FILTERS, &sub.filter).await?;
            self.store
                .sadd(&keys::client_subscriptions(&sub.client_id), &sub.filter)
                .await?;
        }

        if !sub.persistent || self.cache_enabled {
            self.index_insert(sub);
        }
        Ok(())
    }

    /// Remove a client's subscriptions to the given filters.
    ///
    /// Returns, per filter, whether a subscription existed.
    pub async fn unsubscribe(&self, client_id: &str, filters: &[String]) -> Result<Vec<bool>> {
        let mut removed = Vec::with_capacity(filters.len());
        for filter in filters {
            let in_memory = self.index_remove(client_id, filter);
            let in_store = self.remove_from_store(client_id, filter).await?;
            removed.push(in_memory || in_store);
        }
        Ok(removed)
    }

    /// Every subscription whose filter matches the topic, shared group
    /// members included (group selection happens at fan-out).
    pub async fn match_subscribers(&self, topic: &str) -> Result<Vec<Subscription>> {
        let mut result = Vec::new();

        if let Some(entry) = self.exact.get(topic) {
            result.extend(entry.values().cloned());
        }

        for entry in self.wildcard.iter() {
            if topic_matches_filter(topic, entry.key()) {
                result.extend(entry.value().values().cloned());
            }
        }

        if !self.cache_enabled {
            result.extend(self.match_from_store(topic).await?);
        }

        Ok(result)
    }

    /// Drop every subscription a client holds, in memory and in the store
    pub async fn clear_client_subscriptions(&self, client_id: &str) -> Result<()> {
        let filters = self
            .clients
            .get(client_id)
            .map(|set| set.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        for filter in &filters {
            self.index_remove(client_id, filter);
        }

        let client_key = keys::client_subscriptions(client_id);
        for filter in self.store.smembers(&client_key).await? {
            self.remove_from_store(client_id, &filter).await?;
        }
        self.store.del(&client_key).await?;

        debug!("Cleared subscriptions of {}", client_id);
        Ok(())
    }

    /// Drop every subscriber of one literal filter
    pub async fn remove_topic(&self, filter: &str) -> Result<()> {
        let actual = match_filter(filter);
        let map = if is_wildcard(filter) {
            &self.wildcard
        } else {
            &self.exact
        };

        let mut removed_clients = Vec::new();
        if let Some(mut entry) = map.get_mut(actual) {
            entry.retain(|_, sub| {
                if &*sub.filter == filter {
                    removed_clients.push(sub.client_id.clone());
                    false
                } else {
                    true
                }
            });
        }
        map.remove_if(actual, |_, entry| entry.is_empty());
        for client_id in &removed_clients {
            self.forget_client_filter(client_id, filter);
        }

        let key = keys::subscription(filter);
        for (client_id, _) in self.store.hgetall(&key).await? {
            self.store
                .srem(&keys::client_subscriptions(&client_id), filter)
                .await?;
        }
        self.store.del(&key).await?;
        self.store.srem(keys::SUB_FILTERS, filter).await?;
        Ok(())
    }

    /// Remove a client's subscriptions that no allowed filter covers.
    ///
    /// Returns the removed filters.
    pub async fn clear_unauthorized(
        &self,
        client_id: &str,
        allowed_filters: &[String],
    ) -> Result<Vec<String>> {
        let mut revoked = Vec::new();
        for sub in self.subscriptions_of(client_id).await? {
            let target = sub.match_filter();
            let covered = allowed_filters
                .iter()
                .any(|allowed| filter_covered_by(target, allowed));
            if !covered {
                revoked.push(sub.filter.to_string());
            }
        }

        if !revoked.is_empty() {
            warn!(
                "Revoking {} unauthorized subscriptions of {}",
                revoked.len(),
                client_id
            );
            self.unsubscribe(client_id, &revoked).await?;
        }
        Ok(revoked)
    }

    /// Every subscription a client holds, memory and store combined
    pub async fn subscriptions_of(&self, client_id: &str) -> Result<Vec<Subscription>> {
        let mut subs: AHashMap<Arc<str>, Subscription> = AHashMap::new();

        let filters = self
            .clients
            .get(client_id)
            .map(|set| set.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        for filter in filters {
            if let Some(sub) = self.index_get(client_id, &filter) {
                subs.insert(filter, sub);
            }
        }

        let key = keys::client_subscriptions(client_id);
        for filter in self.store.smembers(&key).await? {
            if subs.contains_key(filter.as_str()) {
                continue;
            }
            if let Some(bytes) = self
                .store
                .hget(&keys::subscription(&filter), client_id)
                .await?
            {
                let qos = decode_qos(&bytes);
                subs.insert(
                    filter.as_str().into(),
                    Subscription::new(client_id, &filter, qos, true),
                );
            }
        }

        Ok(subs.into_values().collect())
    }

    /// Apply a subscription made on another broker (memory only; the
    /// originating broker already wrote the store)
    pub fn apply_remote_subscribe(&self, sub: Subscription) {
        if self.cache_enabled {
            self.index_insert(sub);
        }
    }

    /// Apply an unsubscribe made on another broker (memory only)
    pub fn apply_remote_unsubscribe(&self, client_id: &str, filters: &[String]) {
        for filter in filters {
            self.index_remove(client_id, filter);
        }
    }

    /// Drop a client's in-memory subscriptions after another broker
    /// cleared its session
    pub fn apply_remote_clear(&self, client_id: &str) {
        let filters = self
            .clients
            .get(client_id)
            .map(|set| set.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        for filter in &filters {
            self.index_remove(client_id, filter);
        }
    }

    /// Number of distinct filters indexed in memory
    pub fn filter_count(&self) -> usize {
        self.exact.len() + self.wildcard.len()
    }

    /// Number of wildcard filters indexed in memory
    pub fn wildcard_filter_count(&self) -> usize {
        self.wildcard.len()
    }

    // ========================================================================
    // In-memory index
    // ========================================================================

    fn index_map(&self, filter: &str) -> &DashMap<Arc<str>, FilterEntry> {
        if is_wildcard(filter) {
            &self.wildcard
        } else {
            &self.exact
        }
    }

    fn index_insert(&self, sub: Subscription) {
        let client_id = sub.client_id.clone();
        let filter = sub.filter.clone();
        let key = (sub.client_id.clone(), sub.share_group.clone());

        self.index_map(&filter)
            .entry(Arc::from(sub.match_filter()))
            .or_default()
            .insert(key, sub);

        self.clients.entry(client_id).or_default().insert(filter);
    }

    fn index_get(&self, client_id: &str, filter: &str) -> Option<Subscription> {
        let group = parse_shared_subscription(filter).map(|(group, _)| Arc::<str>::from(group));
        let entry = self.index_map(filter).get(match_filter(filter))?;
        entry.get(&(Arc::from(client_id), group)).cloned()
    }

    fn index_remove(&self, client_id: &str, filter: &str) -> bool {
        let group = parse_shared_subscription(filter).map(|(group, _)| Arc::<str>::from(group));
        let actual = match_filter(filter);
        let map = self.index_map(filter);

        let removed = match map.get_mut(actual) {
            Some(mut entry) => entry.remove(&(Arc::from(client_id), group)).is_some(),
            None => false,
        };
        map.remove_if(actual, |_, entry| entry.is_empty());

        if removed {
            self.forget_client_filter(client_id, filter);
        }
        removed
    }

    fn forget_client_filter(&self, client_id: &str, filter: &str) {
        if let Some(mut filters) = self.clients.get_mut(client_id) {
            filters.remove(filter);
        }
        self.clients.remove_if(client_id, |_, filters| filters.is_empty());
    }

    // ========================================================================
    // Durable store
    // ========================================================================

    async fn remove_from_store(&self, client_id: &str, filter: &str) -> Result<bool> {
        let key = keys::subscription(filter);
        let existed = self.store.hdel(&key, client_id).await?;
        self.store
            .srem(&keys::client_subscriptions(client_id), filter)
            .await?;
        if existed && self.store.hgetall(&key).await?.is_empty() {
            self.store.srem(keys::SUB_FILTERS, filter).await?;
        }
        Ok(existed)
    }

    async fn read_filter_from_store(&self, filter: &str) -> Result<Vec<Subscription>> {
        Ok(self
            .store
            .hgetall(&keys::subscription(filter))
            .await?
            .into_iter()
            .map(|(client_id, bytes)| {
                Subscription::new(&client_id, filter, decode_qos(&bytes), true)
            })
            .collect())
    }

    async fn match_from_store(&self, topic: &str) -> Result<Vec<Subscription>> {
        // Shared filters are stored under their `$share/` form, which a
        // topic name must not hit directly
        let mut result = if topic.starts_with(SHARE_PREFIX) {
            Vec::new()
        } else {
            self.read_filter_from_store(topic).await?
        };

        for filter in self.store.smembers(keys::SUB_FILTERS).await? {
            let shared = parse_shared_subscription(&filter).is_some();
            if !shared && !is_wildcard(&filter) {
                // Plain exact filters were covered by the direct lookup
                continue;
            }
            if topic_matches_filter(topic, match_filter(&filter)) {
                result.extend(self.read_filter_from_store(&filter).await?);
            }
        }
        Ok(result)
    }
}

fn decode_qos(bytes: &[u8]) -> QoS {
    bytes
        .first()
        .and_then(|qos| QoS::from_u8(*qos))
        .unwrap_or(QoS::AtMostOnce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use test_case::test_case;

    fn registry(cache_enabled: bool) -> (Arc<MemoryStore>, SubscriptionRegistry) {
        let store = Arc::new(MemoryStore::new());
        let registry = SubscriptionRegistry::new(store.clone(), cache_enabled);
        (store, registry)
    }

    fn client_ids(subs: &[Subscription]) -> Vec<String> {
        let mut ids: Vec<_> = subs.iter().map(|s| s.client_id.to_string()).collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_exact_and_wildcard_matching() {
        let (_, reg) = registry(true);
        reg.subscribe(Subscription::new("c1", "a/b/c", QoS::AtLeastOnce, false))
            .await
            .unwrap();
        reg.subscribe(Subscription::new("c2", "a/+/c", QoS::AtMostOnce, false))
            .await
            .unwrap();
        reg.subscribe(Subscription::new("c3", "a/#", QoS::ExactlyOnce, false))
            .await
            .unwrap();
        reg.subscribe(Subscription::new("c4", "b/#", QoS::ExactlyOnce, false))
            .await
            .unwrap();

        let subs = reg.match_subscribers("a/b/c").await.unwrap();
        assert_eq!(client_ids(&subs), vec!["c1", "c2", "c3"]);
        assert_eq!(reg.wildcard_filter_count(), 3);
    }

    #[tokio::test]
    async fn test_resubscribe_overwrites_qos() {
        let (_, reg) = registry(true);
        reg.subscribe(Subscription::new("c1", "t", QoS::AtMostOnce, false))
            .await
            .unwrap();
        reg.subscribe(Subscription::new("c1", "t", QoS::ExactlyOnce, false))
            .await
            .unwrap();

        let subs = reg.match_subscribers("t").await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].qos, QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn test_unsubscribe_reports_existence() {
        let (_, reg) = registry(true);
        reg.subscribe(Subscription::new("c1", "a/+", QoS::AtMostOnce, true))
            .await
            .unwrap();

        let removed = reg
            .unsubscribe("c1", &["a/+".to_string(), "x".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, vec![true, false]);
        assert!(reg.match_subscribers("a/b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persistent_subscriptions_reload() {
        let (store, reg) = registry(true);
        reg.subscribe(Subscription::new("c1", "a/+", QoS::AtLeastOnce, true))
            .await
            .unwrap();
        reg.subscribe(Subscription::new("c2", "eph", QoS::AtLeastOnce, false))
            .await
            .unwrap();

        let fresh = SubscriptionRegistry::new(store, true);
        assert_eq!(fresh.load_persistent().await.unwrap(), 1);
        let subs = fresh.match_subscribers("a/x").await.unwrap();
        assert_eq!(client_ids(&subs), vec!["c1"]);
        assert!(subs[0].persistent);
        assert!(fresh.match_subscribers("eph").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cache_disabled_matches_from_store() {
        let (_, reg) = registry(false);
        reg.subscribe(Subscription::new("c1", "a/b", QoS::AtLeastOnce, true))
            .await
            .unwrap();
        reg.subscribe(Subscription::new("c2", "a/#", QoS::AtLeastOnce, true))
            .await
            .unwrap();
        reg.subscribe(Subscription::new("c3", "$share/g/a/b", QoS::AtLeastOnce, true))
            .await
            .unwrap();
        reg.subscribe(Subscription::new("c4", "a/b", QoS::AtMostOnce, false))
            .await
            .unwrap();

        // Persistent entries are not held in memory
        assert_eq!(reg.filter_count(), 1);

        let subs = reg.match_subscribers("a/b").await.unwrap();
        assert_eq!(client_ids(&subs), vec!["c1", "c2", "c3", "c4"]);
        let shared = subs.iter().find(|s| &*s.client_id == "c3").unwrap();
        assert_eq!(shared.share_group.as_deref(), Some("g"));
    }

    #[test_case(true ; "cached")]
    #[test_case(false ; "from store")]
    #[tokio::test]
    async fn test_share_prefixed_topic_does_not_hit_shared_filter(cache_enabled: bool) {
        let (_, reg) = registry(cache_enabled);
        reg.subscribe(Subscription::new("c1", "$share/g/a", QoS::AtLeastOnce, true))
            .await
            .unwrap();

        assert!(reg.match_subscribers("$share/g/a").await.unwrap().is_empty());
        assert_eq!(client_ids(&reg.match_subscribers("a").await.unwrap()), vec!["c1"]);
    }

    #[tokio::test]
    async fn test_clear_client_subscriptions() {
        let (store, reg) = registry(true);
        reg.subscribe(Subscription::new("c1", "a", QoS::AtLeastOnce, true))
            .await
            .unwrap();
        reg.subscribe(Subscription::new("c1", "b/+", QoS::AtLeastOnce, false))
            .await
            .unwrap();
        reg.subscribe(Subscription::new("c2", "a", QoS::AtLeastOnce, true))
            .await
            .unwrap();

        reg.clear_client_subscriptions("c1").await.unwrap();

        assert_eq!(client_ids(&reg.match_subscribers("a").await.unwrap()), vec!["c2"]);
        assert!(reg.match_subscribers("b/x").await.unwrap().is_empty());
        assert!(store
            .smembers(&keys::client_subscriptions("c1"))
            .await
            .unwrap()
            .is_empty());
        assert!(store.sismember(keys::SUB_FILTERS, "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_topic_drops_all_subscribers() {
        let (store, reg) = registry(true);
        reg.subscribe(Subscription::new("c1", "x/y", QoS::AtLeastOnce, true))
            .await
            .unwrap();
        reg.subscribe(Subscription::new("c2", "x/y", QoS::AtLeastOnce, false))
            .await
            .unwrap();
        reg.subscribe(Subscription::new("c3", "x/+", QoS::AtLeastOnce, false))
            .await
            .unwrap();

        reg.remove_topic("x/y").await.unwrap();

        assert_eq!(client_ids(&reg.match_subscribers("x/y").await.unwrap()), vec!["c3"]);
        assert!(!store.sismember(keys::SUB_FILTERS, "x/y").await.unwrap());
        assert!(reg.subscriptions_of("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_unauthorized() {
        let (_, reg) = registry(true);
        reg.subscribe(Subscription::new("c1", "sensors/a", QoS::AtMostOnce, false))
            .await
            .unwrap();
        reg.subscribe(Subscription::new("c1", "admin/#", QoS::AtMostOnce, true))
            .await
            .unwrap();
        reg.subscribe(Subscription::new("c1", "$share/g/sensors/+", QoS::AtMostOnce, false))
            .await
            .unwrap();

        let mut revoked = reg
            .clear_unauthorized("c1", &["sensors/#".to_string()])
            .await
            .unwrap();
        revoked.sort();
        assert_eq!(revoked, vec!["admin/#".to_string()]);

        let mut left: Vec<_> = reg
            .subscriptions_of("c1")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.filter.to_string())
            .collect();
        left.sort();
        assert_eq!(left, vec!["$share/g/sensors/+", "sensors/a"]);
    }

    #[tokio::test]
    async fn test_shared_and_plain_subscription_coexist() {
        let (_, reg) = registry(true);
        reg.subscribe(Subscription::new("c1", "t/+", QoS::AtMostOnce, false))
            .await
            .unwrap();
        reg.subscribe(Subscription::new("c1", "$share/g/t/+", QoS::AtLeastOnce, false))
            .await
            .unwrap();

        assert_eq!(reg.match_subscribers("t/1").await.unwrap().len(), 2);

        reg.unsubscribe("c1", &["$share/g/t/+".to_string()])
            .await
            .unwrap();
        let subs = reg.match_subscribers("t/1").await.unwrap();
        assert_eq!(subs.len(), 1);
        assert!(subs[0].share_group.is_none());
    }

    #[tokio::test]
    async fn test_remote_apply_is_memory_only() {
        let (store, reg) = registry(true);
        reg.apply_remote_subscribe(Subscription::new("c9", "r/#", QoS::AtLeastOnce, true));
        assert_eq!(reg.match_subscribers("r/1").await.unwrap().len(), 1);
        assert!(store.smembers(keys::SUB_FILTERS).await.unwrap().is_empty());

        reg.apply_remote_unsubscribe("c9", &["r/#".to_string()]);
        assert!(reg.match_subscribers("r/1").await.unwrap().is_empty());
    }
}
