//! Fjall-based storage backend implementation.
//!
//! Uses fjall (an LSM-tree based embedded database) for local persistence.
//! Hash fields and set members are flattened into two partitions keyed
//! `<key>\0<field>`, so a whole hash or set is one prefix scan.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use tokio::sync::broadcast;

use super::backend::{DurableStore, LocalChannels};
use super::error::Result;

const SEPARATOR: char = '\0';

/// Fjall-based storage backend
pub struct FjallStore {
    keyspace: Keyspace,
    hashes: PartitionHandle,
    sets: PartitionHandle,
    channels: LocalChannels,
}

impl FjallStore {
    /// Open a fjall store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let keyspace = Config::new(path).open()?;

        let hashes = keyspace.open_partition("hashes", PartitionCreateOptions::default())?;
        let sets = keyspace.open_partition("sets", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            hashes,
            sets,
            channels: LocalChannels::default(),
        })
    }

    fn compound_key(key: &str, field: &str) -> String {
        let mut compound = String::with_capacity(key.len() + field.len() + 1);
        compound.push_str(key);
        compound.push(SEPARATOR);
        compound.push_str(field);
        compound
    }

    fn prefix(key: &str) -> String {
        let mut prefix = String::with_capacity(key.len() + 1);
        prefix.push_str(key);
        prefix.push(SEPARATOR);
        prefix
    }

    /// Strip `<key>\0` from a stored compound key
    fn field_of(compound: &[u8], prefix_len: usize) -> String {
        String::from_utf8_lossy(&compound[prefix_len..]).to_string()
    }

    fn remove_prefix(partition: &PartitionHandle, prefix: &str) -> Result<()> {
        let keys = partition
            .prefix(prefix)
            .map(|item| item.map(|(key, _)| key))
            .collect::<std::result::Result<Vec<_>, fjall::Error>>()?;
        for key in keys {
            partition.remove(key)?;
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for FjallStore {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Bytes>> {
        Ok(self
            .hashes
            .get(Self::compound_key(key, field))?
            .map(|value| Bytes::copy_from_slice(&value)))
    }

    async fn hset(&self, key: &str, field: &str, value: Bytes) -> Result<()> {
        self.hashes
            .insert(Self::compound_key(key, field), value.as_ref())?;
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let compound = Self::compound_key(key, field);
        let existed = self.hashes.contains_key(&compound)?;
        if existed {
            self.hashes.remove(compound)?;
        }
        Ok(existed)
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Bytes)>> {
        let prefix = Self::prefix(key);
        let mut result = Vec::new();
        for item in self.hashes.prefix(&prefix) {
            let (compound, value) = item?;
            result.push((
                Self::field_of(&compound, prefix.len()),
                Bytes::copy_from_slice(&value),
            ));
        }
        Ok(result)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let compound = Self::compound_key(key, member);
        if self.sets.contains_key(&compound)? {
            return Ok(false);
        }
        self.sets.insert(compound, Vec::<u8>::new())?;
        Ok(true)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let compound = Self::compound_key(key, member);
        let existed = self.sets.contains_key(&compound)?;
        if existed {
            self.sets.remove(compound)?;
        }
        Ok(existed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let prefix = Self::prefix(key);
        let mut result = Vec::new();
        for item in self.sets.prefix(&prefix) {
            let (compound, _) = item?;
            result.push(Self::field_of(&compound, prefix.len()));
        }
        Ok(result)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self.sets.contains_key(Self::compound_key(key, member))?)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let prefix = Self::prefix(key);
        Self::remove_prefix(&self.hashes, &prefix)?;
        Self::remove_prefix(&self.sets, &prefix)?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        self.channels.publish(channel, payload);
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Bytes> {
        self.channels.subscribe(channel)
    }

    async fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fjall_hash_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FjallStore::open(temp_dir.path()).unwrap();

        store
            .hset("retain", "a/b", Bytes::from_static(b"payload"))
            .await
            .unwrap();
        store
            .hset("retain", "a/c", Bytes::from_static(b"other"))
            .await
            .unwrap();
        // A key sharing the textual prefix must not leak into the scan
        store
            .hset("retained", "x", Bytes::from_static(b"x"))
            .await
            .unwrap();

        let mut all = store.hgetall("retain").await.unwrap();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, "a/b");
        assert_eq!(all[0].1, Bytes::from_static(b"payload"));

        assert!(store.hdel("retain", "a/b").await.unwrap());
        assert!(!store.hdel("retain", "a/b").await.unwrap());
    }

    #[tokio::test]
    async fn test_fjall_sets_and_del() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FjallStore::open(temp_dir.path()).unwrap();

        assert!(store.sadd("sub:filters", "a/+").await.unwrap());
        assert!(!store.sadd("sub:filters", "a/+").await.unwrap());
        assert!(store.sadd("sub:filters", "b").await.unwrap());
        assert!(store.sismember("sub:filters", "b").await.unwrap());
        assert_eq!(store.smembers("sub:filters").await.unwrap().len(), 2);

        store.del("sub:filters").await.unwrap();
        assert!(store.smembers("sub:filters").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fjall_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        {
            let store = FjallStore::open(temp_dir.path()).unwrap();
            store.sadd("sessions", "c1").await.unwrap();
            store.flush().await.unwrap();
        }
        let store = FjallStore::open(temp_dir.path()).unwrap();
        assert!(store.sismember("sessions", "c1").await.unwrap());
    }
}
