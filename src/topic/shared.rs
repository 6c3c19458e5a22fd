//! Shared subscription member selection
//!
//! Subscriptions of the form `$share/{group}/{filter}` form a group; each
//! matching message goes to exactly one member.

use std::hash::Hasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use dashmap::DashMap;
use fnv::FnvHasher;
use rand::Rng;

use super::Subscription;
use crate::config::SharedStrategy;

/// Matched subscriptions split into plain ones and share groups
#[derive(Debug, Default)]
pub struct Selection {
    /// Non-shared subscriptions, every one receives the message
    pub direct: Vec<Subscription>,
    /// Share groups keyed by their full `$share/...` filter, members sorted
    /// by client id
    pub groups: Vec<(Arc<str>, Vec<Subscription>)>,
}

impl Selection {
    /// Partition matched subscriptions
    pub fn partition(subs: Vec<Subscription>) -> Self {
        let mut direct = Vec::new();
        let mut groups: AHashMap<Arc<str>, Vec<Subscription>> = AHashMap::new();

        for sub in subs {
            if sub.share_group.is_some() {
                groups.entry(sub.filter.clone()).or_default().push(sub);
            } else {
                direct.push(sub);
            }
        }

        let mut groups: Vec<_> = groups
            .into_iter()
            .map(|(filter, mut members)| {
                members.sort_by(|a, b| a.client_id.cmp(&b.client_id));
                members.dedup_by(|a, b| a.client_id == b.client_id);
                (filter, members)
            })
            .collect();
        groups.sort_by(|a, b| a.0.cmp(&b.0));

        Self { direct, groups }
    }
}

/// Picks one member per share group
pub struct SharedSelector {
    strategy: SharedStrategy,
    /// Round-robin counters keyed by group filter and topic
    counters: DashMap<(Arc<str>, Arc<str>), AtomicUsize>,
}

impl SharedSelector {
    pub fn new(strategy: SharedStrategy) -> Self {
        Self {
            strategy,
            counters: DashMap::new(),
        }
    }

    pub fn strategy(&self) -> SharedStrategy {
        self.strategy
    }

    /// Choose the member of a group that receives a message.
    ///
    /// `members` must be sorted by client id, as [`Selection::partition`]
    /// leaves them, so that hash selection agrees across brokers.
    pub fn choose<'a>(
        &self,
        publisher: &str,
        topic: &str,
        group_filter: &Arc<str>,
        members: &'a [Subscription],
    ) -> Option<&'a Subscription> {
        if members.is_empty() {
            return None;
        }
        let idx = match self.strategy {
            SharedStrategy::Hash => hash_index(publisher, topic, members),
            SharedStrategy::Random => rand::thread_rng().gen_range(0..members.len()),
            SharedStrategy::RoundRobin => {
                let counter = self
                    .counters
                    .entry((group_filter.clone(), Arc::from(topic)))
                    .or_insert_with(|| AtomicUsize::new(0));
                counter.fetch_add(1, Ordering::Relaxed) % members.len()
            }
        };
        members.get(idx)
    }
}

fn hash_index(publisher: &str, topic: &str, members: &[Subscription]) -> usize {
    let mut hasher = FnvHasher::default();
    hasher.write(publisher.as_bytes());
    hasher.write_u8(0);
    hasher.write(topic.as_bytes());
    for member in members {
        hasher.write_u8(0);
        hasher.write(member.client_id.as_bytes());
    }
    (hasher.finish() % members.len() as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;

    fn group(members: &[&str]) -> (Arc<str>, Vec<Subscription>) {
        let filter = "$share/g/sensors/+";
        let subs = members
            .iter()
            .map(|c| Subscription::new(c, filter, QoS::AtLeastOnce, false))
            .collect::<Vec<_>>();
        let selection = Selection::partition(subs);
        selection.groups.into_iter().next().unwrap()
    }

    #[test]
    fn test_partition_separates_groups() {
        let subs = vec![
            Subscription::new("a", "sensors/+", QoS::AtMostOnce, false),
            Subscription::new("c", "$share/g/sensors/+", QoS::AtMostOnce, false),
            Subscription::new("b", "$share/g/sensors/+", QoS::AtMostOnce, false),
            Subscription::new("d", "$share/h/sensors/+", QoS::AtMostOnce, false),
        ];
        let selection = Selection::partition(subs);

        assert_eq!(selection.direct.len(), 1);
        assert_eq!(selection.groups.len(), 2);
        let members: Vec<_> = selection.groups[0]
            .1
            .iter()
            .map(|s| s.client_id.to_string())
            .collect();
        assert_eq!(members, vec!["b", "c"]);
    }

    #[test]
    fn test_hash_is_deterministic() {
        let (filter, members) = group(&["m1", "m2", "m3", "m4"]);
        let a = SharedSelector::new(SharedStrategy::Hash);
        let b = SharedSelector::new(SharedStrategy::Hash);

        for publisher in ["p1", "p2", "p3"] {
            let first = a.choose(publisher, "sensors/1", &filter, &members).unwrap();
            for _ in 0..10 {
                let again = a.choose(publisher, "sensors/1", &filter, &members).unwrap();
                assert_eq!(first.client_id, again.client_id);
            }
            let other = b.choose(publisher, "sensors/1", &filter, &members).unwrap();
            assert_eq!(first.client_id, other.client_id);
        }
    }

    #[test]
    fn test_hash_ignores_arrival_order() {
        let (filter, forward) = group(&["m1", "m2", "m3"]);
        let (_, backward) = group(&["m3", "m2", "m1"]);
        let selector = SharedSelector::new(SharedStrategy::Hash);

        let x = selector.choose("p", "sensors/1", &filter, &forward).unwrap();
        let y = selector.choose("p", "sensors/1", &filter, &backward).unwrap();
        assert_eq!(x.client_id, y.client_id);
    }

    #[test]
    fn test_round_robin_cycles_per_topic() {
        let (filter, members) = group(&["m1", "m2", "m3"]);
        let selector = SharedSelector::new(SharedStrategy::RoundRobin);

        let picks: Vec<_> = (0..6)
            .map(|_| {
                selector
                    .choose("p", "sensors/1", &filter, &members)
                    .unwrap()
                    .client_id
                    .to_string()
            })
            .collect();
        assert_eq!(picks, vec!["m1", "m2", "m3", "m1", "m2", "m3"]);

        // Another topic has its own counter
        let first = selector.choose("p", "sensors/2", &filter, &members).unwrap();
        assert_eq!(&*first.client_id, "m1");
    }

    #[test]
    fn test_random_stays_in_group() {
        let (filter, members) = group(&["m1", "m2"]);
        let selector = SharedSelector::new(SharedStrategy::Random);
        for _ in 0..50 {
            let pick = selector.choose("p", "sensors/1", &filter, &members).unwrap();
            assert!(members.iter().any(|m| m.client_id == pick.client_id));
        }
    }

    #[test]
    fn test_empty_group() {
        let selector = SharedSelector::new(SharedStrategy::Hash);
        let filter: Arc<str> = "$share/g/x".into();
        assert!(selector.choose("p", "x", &filter, &[]).is_none());
    }
}
