use std::sync::{Arc, RwLock};

use fnv::FnvHashMap;

use crate::errors::BufferPoolExhausted;
use crate::mem_store::part_key::hash_key;
use crate::mem_store::partition::Partition;

/// Mapping from partition-key bytes to partitions, keyed by the 64-bit
/// seahash of the key with collision buckets that hold the full key for
/// equality. Writes happen only on the shard's ingestion thread; `get` and
/// `values` are safe from any thread.
#[derive(Default)]
pub struct PartitionTable {
    // Hash -> collision bucket. Buckets almost always hold one entry.
    map: RwLock<FnvHashMap<u64, Vec<Arc<Partition>>>>,
}

impl PartitionTable {
    pub fn new() -> PartitionTable {
        PartitionTable::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<Arc<Partition>> {
        let map = self.map.read().unwrap();
        map.get(&hash_key(key))
            .and_then(|bucket| bucket.iter().find(|p| p.key() == key).cloned())
    }

    /// Looks up the partition for `key`, creating it via `create` if
    /// absent. Returns the partition and whether it was created. Ingestion
    /// thread only.
    pub fn get_or_create(
        &self,
        key: &[u8],
        create: impl FnOnce(u64) -> Result<Arc<Partition>, BufferPoolExhausted>,
    ) -> Result<(Arc<Partition>, bool), BufferPoolExhausted> {
        if let Some(partition) = self.get(key) {
            return Ok((partition, false));
        }
        let hash = hash_key(key);
        let partition = create(hash)?;
        let mut map = self.map.write().unwrap();
        map.entry(hash).or_default().push(partition.clone());
        Ok((partition, true))
    }

    /// Ingestion thread only.
    pub fn remove(&self, key: &[u8]) -> Option<Arc<Partition>> {
        let mut map = self.map.write().unwrap();
        let hash = hash_key(key);
        let bucket = map.get_mut(&hash)?;
        let pos = bucket.iter().position(|p| p.key() == key)?;
        let partition = bucket.swap_remove(pos);
        if bucket.is_empty() {
            map.remove(&hash);
        }
        Some(partition)
    }

    /// Weakly consistent iteration: a snapshot of the partitions present
    /// when the read lock was held.
    pub fn values(&self) -> Vec<Arc<Partition>> {
        let map = self.map.read().unwrap();
        map.values().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let map = self.map.read().unwrap();
        map.values().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> Vec<Arc<Partition>> {
        let mut map = self.map.write().unwrap();
        map.drain().flat_map(|(_, bucket)| bucket).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_store::buffer_pool::NativeBufferPool;

    fn insert(table: &PartitionTable, pool: &NativeBufferPool, id: u64, key: &[u8]) {
        let (_, created) = table
            .get_or_create(key, |hash| {
                Ok(Arc::new(Partition::new(id, (hash % 2) as u32, key, pool, 0).unwrap()))
            })
            .unwrap();
        assert!(created);
    }

    #[test]
    fn test_get_or_create_is_idempotent_per_key() {
        let pool = NativeBufferPool::new(1 << 20, vec![]);
        let table = PartitionTable::new();
        insert(&table, &pool, 1, b"series-a");
        let (p, created) = table
            .get_or_create(b"series-a", |_| unreachable!("key already present"))
            .unwrap();
        assert!(!created);
        assert_eq!(p.id(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_distinct_keys_coexist() {
        let pool = NativeBufferPool::new(1 << 20, vec![]);
        let table = PartitionTable::new();
        insert(&table, &pool, 1, b"series-a");
        insert(&table, &pool, 2, b"series-b");
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(b"series-b").unwrap().id(), 2);
        assert!(table.get(b"series-c").is_none());
    }

    #[test]
    fn test_remove() {
        let pool = NativeBufferPool::new(1 << 20, vec![]);
        let table = PartitionTable::new();
        insert(&table, &pool, 1, b"series-a");
        assert_eq!(table.remove(b"series-a").unwrap().id(), 1);
        assert!(table.get(b"series-a").is_none());
        assert!(table.remove(b"series-a").is_none());
    }
}
