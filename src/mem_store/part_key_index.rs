use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};

use crate::mem_store::partition::PartitionId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterOp {
    Eq(String),
    In(Vec<String>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelFilter {
    pub label: String,
    pub op: FilterOp,
}

impl LabelFilter {
    pub fn eq(label: &str, value: &str) -> LabelFilter {
        LabelFilter {
            label: label.to_string(),
            op: FilterOp::Eq(value.to_string()),
        }
    }

    pub fn is_in(label: &str, values: &[&str]) -> LabelFilter {
        LabelFilter {
            label: label.to_string(),
            op: FilterOp::In(values.iter().map(|v| v.to_string()).collect()),
        }
    }
}

/// One indexed partition as persisted in a time bucket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketEntry {
    pub part_key: Vec<u8>,
    pub labels: Vec<(String, String)>,
    pub first_ts: i64,
    pub last_ts: i64,
}

/// Serializable snapshot of the index entries created or mutated for one
/// group since its previous snapshot. Epochs are monotonic per group.
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexBucket {
    pub group: u32,
    pub epoch: u64,
    pub entries: Vec<BucketEntry>,
}

struct PartInfo {
    key: Vec<u8>,
    labels: Vec<(String, String)>,
    group: u32,
    first_ts: AtomicI64,
    last_ts: AtomicI64,
}

impl PartInfo {
    fn time_range(&self) -> (i64, i64) {
        (
            self.first_ts.load(Ordering::SeqCst),
            self.last_ts.load(Ordering::SeqCst),
        )
    }
}

#[derive(Default)]
struct Registry {
    by_id: FnvHashMap<PartitionId, Arc<PartInfo>>,
    by_key: HashMap<Vec<u8>, PartitionId>,
}

/// Per-shard inverted index over label pairs. Writes are serialized by the
/// shard's ingestion thread; readers work against copy-on-write posting
/// lists so lookups never block ingestion for long.
pub struct PartitionKeyIndex {
    // Label name -> value -> posting list. Posting lists are COW: writers
    // clone-on-mutate when a reader still holds the Arc.
    postings: RwLock<HashMap<String, BTreeMap<String, Arc<HashSet<PartitionId>>>>>,
    registry: RwLock<Registry>,
    // Per group: ids created or mutated since the last snapshot.
    dirty: Mutex<Vec<HashSet<PartitionId>>>,
    epochs: Vec<AtomicU64>,
}

impl PartitionKeyIndex {
    pub fn new(groups_per_shard: u32) -> PartitionKeyIndex {
        PartitionKeyIndex {
            postings: RwLock::new(HashMap::new()),
            registry: RwLock::new(Registry::default()),
            dirty: Mutex::new((0..groups_per_shard).map(|_| HashSet::new()).collect()),
            epochs: (0..groups_per_shard).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Registers a partition. Called once per partition creation on the
    /// ingestion thread. A key that is already indexed (e.g. recovered
    /// from a persisted bucket) is re-bound to the new id.
    pub fn add_key(
        &self,
        id: PartitionId,
        key: &[u8],
        labels: Vec<(String, String)>,
        group: u32,
    ) {
        let prior = {
            let registry = self.registry.read().unwrap();
            registry.by_key.get(key).copied()
        };
        if let Some(old_id) = prior {
            self.remove_key(old_id);
        }
        let info = Arc::new(PartInfo {
            key: key.to_vec(),
            labels: labels.clone(),
            group,
            first_ts: AtomicI64::new(i64::MAX),
            last_ts: AtomicI64::new(i64::MIN),
        });
        {
            let mut registry = self.registry.write().unwrap();
            registry.by_id.insert(id, info);
            registry.by_key.insert(key.to_vec(), id);
        }
        {
            let mut postings = self.postings.write().unwrap();
            for (name, value) in &labels {
                let list = postings
                    .entry(name.clone())
                    .or_default()
                    .entry(value.clone())
                    .or_insert_with(|| Arc::new(HashSet::new()));
                Arc::make_mut(list).insert(id);
            }
        }
        self.dirty.lock().unwrap()[group as usize].insert(id);
    }

    /// Extends the partition's observed time range. Cheap on the hot path:
    /// only range extensions touch the dirty set.
    pub fn observe(&self, id: PartitionId, ts: i64) {
        let (group, extended) = {
            let registry = self.registry.read().unwrap();
            let info = match registry.by_id.get(&id) {
                Some(info) => info,
                None => return,
            };
            let prev_first = info.first_ts.fetch_min(ts, Ordering::SeqCst);
            let prev_last = info.last_ts.fetch_max(ts, Ordering::SeqCst);
            (info.group, ts < prev_first || ts > prev_last)
        };
        if extended {
            self.dirty.lock().unwrap()[group as usize].insert(id);
        }
    }

    /// Drops a partition from the in-memory index (eviction). The durable
    /// time buckets are unaffected.
    pub fn remove_key(&self, id: PartitionId) {
        let info = {
            let mut registry = self.registry.write().unwrap();
            match registry.by_id.remove(&id) {
                Some(info) => {
                    registry.by_key.remove(&info.key);
                    info
                }
                None => return,
            }
        };
        let mut postings = self.postings.write().unwrap();
        for (name, value) in &info.labels {
            if let Some(values) = postings.get_mut(name) {
                if let Some(list) = values.get_mut(value) {
                    Arc::make_mut(list).remove(&id);
                    if list.is_empty() {
                        values.remove(value);
                    }
                }
                if values.is_empty() {
                    postings.remove(name);
                }
            }
        }
    }

    /// The `top_k` most frequent values of a label, by descending
    /// frequency, ties broken lexicographically.
    pub fn values_for(&self, label: &str, top_k: usize) -> Vec<(String, u64)> {
        let postings = self.postings.read().unwrap();
        let values = match postings.get(label) {
            Some(values) => values,
            None => return Vec::new(),
        };
        let mut freqs: Vec<(String, u64)> = values
            .iter()
            .map(|(value, list)| (value.clone(), list.len() as u64))
            .collect();
        freqs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        freqs.truncate(top_k);
        freqs
    }

    /// Up to `limit` partition ids whose labels match all filters and
    /// whose observed time range intersects `[start, end]`.
    pub fn filter(
        &self,
        filters: &[LabelFilter],
        start: i64,
        end: i64,
        limit: usize,
    ) -> Vec<PartitionId> {
        let mut candidates: Option<HashSet<PartitionId>> = None;
        {
            let postings = self.postings.read().unwrap();
            for filter in filters {
                let values = postings.get(&filter.label);
                let mut matched = HashSet::new();
                if let Some(values) = values {
                    match &filter.op {
                        FilterOp::Eq(v) => {
                            if let Some(list) = values.get(v) {
                                matched.extend(list.iter().copied());
                            }
                        }
                        FilterOp::In(vs) => {
                            for v in vs {
                                if let Some(list) = values.get(v) {
                                    matched.extend(list.iter().copied());
                                }
                            }
                        }
                    }
                }
                candidates = Some(match candidates {
                    None => matched,
                    Some(prev) => prev.intersection(&matched).copied().collect(),
                });
                if candidates.as_ref().unwrap().is_empty() {
                    return Vec::new();
                }
            }
        }
        let registry = self.registry.read().unwrap();
        let mut ids: Vec<PartitionId> = match candidates {
            Some(set) => set.into_iter().collect(),
            None => registry.by_id.keys().copied().collect(),
        };
        ids.sort_unstable();
        ids.retain(|id| {
            registry
                .by_id
                .get(id)
                .map(|info| {
                    let (first, last) = info.time_range();
                    first <= end && last >= start
                })
                .unwrap_or(false)
        });
        ids.truncate(limit);
        ids
    }

    pub fn index_names(&self, limit: usize) -> Vec<String> {
        let postings = self.postings.read().unwrap();
        let mut names: Vec<String> = postings.keys().cloned().collect();
        names.sort_unstable();
        names.truncate(limit);
        names
    }

    pub fn part_key_of(&self, id: PartitionId) -> Option<Vec<u8>> {
        let registry = self.registry.read().unwrap();
        registry.by_id.get(&id).map(|info| info.key.clone())
    }

    pub fn labels_of(&self, id: PartitionId) -> Option<Vec<(String, String)>> {
        let registry = self.registry.read().unwrap();
        registry.by_id.get(&id).map(|info| info.labels.clone())
    }

    pub fn part_count(&self) -> usize {
        self.registry.read().unwrap().by_id.len()
    }

    /// Serializes the entries created or mutated for `group` since its
    /// previous snapshot. `None` when nothing changed. Ingestion thread
    /// only; epochs advance monotonically per group.
    pub fn snapshot_bucket(&self, group: u32) -> Option<Vec<u8>> {
        let drained: Vec<PartitionId> = {
            let mut dirty = self.dirty.lock().unwrap();
            dirty[group as usize].drain().collect()
        };
        let epoch = self.epochs[group as usize].fetch_add(1, Ordering::SeqCst) + 1;
        let registry = self.registry.read().unwrap();
        let mut entries: Vec<BucketEntry> = drained
            .into_iter()
            .filter_map(|id| registry.by_id.get(&id))
            .map(|info| {
                let (first_ts, last_ts) = info.time_range();
                BucketEntry {
                    part_key: info.key.clone(),
                    labels: info.labels.clone(),
                    first_ts,
                    last_ts,
                }
            })
            .collect();
        if entries.is_empty() {
            return None;
        }
        entries.sort_by(|a, b| a.part_key.cmp(&b.part_key));
        let bucket = IndexBucket {
            group,
            epoch,
            entries,
        };
        Some(bincode::serialize(&bucket).expect("index bucket serialization cannot fail"))
    }

    /// Replays a persisted time bucket into the in-memory index, assigning
    /// fresh ids to unknown keys. Used by index recovery.
    pub fn load_bucket(
        &self,
        blob: &[u8],
        mut next_id: impl FnMut() -> PartitionId,
    ) -> Result<usize, String> {
        let bucket: IndexBucket = bincode::deserialize(blob)
            .map_err(|e| format!("undecodable index bucket: {}", e))?;
        if bucket.group as usize >= self.epochs.len() {
            return Err(format!(
                "index bucket for group {} exceeds configured groups",
                bucket.group
            ));
        }
        self.epochs[bucket.group as usize].fetch_max(bucket.epoch, Ordering::SeqCst);
        let count = bucket.entries.len();
        for entry in bucket.entries {
            let known = {
                let registry = self.registry.read().unwrap();
                registry.by_key.get(&entry.part_key).copied()
            };
            match known {
                Some(id) => {
                    let registry = self.registry.read().unwrap();
                    if let Some(info) = registry.by_id.get(&id) {
                        info.first_ts.fetch_min(entry.first_ts, Ordering::SeqCst);
                        info.last_ts.fetch_max(entry.last_ts, Ordering::SeqCst);
                    }
                }
                None => {
                    let id = next_id();
                    self.add_key(id, &entry.part_key, entry.labels, bucket.group);
                    let registry = self.registry.read().unwrap();
                    if let Some(info) = registry.by_id.get(&id) {
                        info.first_ts.store(entry.first_ts, Ordering::SeqCst);
                        info.last_ts.store(entry.last_ts, Ordering::SeqCst);
                    }
                    // Recovered entries are already durable.
                    self.dirty.lock().unwrap()[bucket.group as usize].remove(&id);
                }
            }
        }
        Ok(count)
    }

    pub fn clear(&self) {
        self.postings.write().unwrap().clear();
        let mut registry = self.registry.write().unwrap();
        registry.by_id.clear();
        registry.by_key.clear();
        for set in self.dirty.lock().unwrap().iter_mut() {
            set.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn index_with_three_hosts() -> PartitionKeyIndex {
        let index = PartitionKeyIndex::new(2);
        index.add_key(1, b"k1", labels(&[("host", "a"), ("dc", "eu")]), 0);
        index.add_key(2, b"k2", labels(&[("host", "b"), ("dc", "eu")]), 1);
        index.add_key(3, b"k3", labels(&[("host", "a"), ("dc", "us")]), 0);
        index.observe(1, 100);
        index.observe(2, 200);
        index.observe(3, 300);
        index
    }

    #[test]
    fn test_values_for_orders_by_frequency_then_value() {
        let index = index_with_three_hosts();
        assert_eq!(
            index.values_for("host", 10),
            vec![("a".to_string(), 2), ("b".to_string(), 1)]
        );
        // eu and us tie at different frequencies; dc=eu has 2.
        assert_eq!(
            index.values_for("dc", 1),
            vec![("eu".to_string(), 2)]
        );
        assert!(index.values_for("missing", 10).is_empty());
    }

    #[test]
    fn test_filter_intersects_labels_and_time() {
        let index = index_with_three_hosts();
        let host_a = vec![LabelFilter::eq("host", "a")];
        assert_eq!(index.filter(&host_a, 0, 1000, 10), vec![1, 3]);
        assert_eq!(index.filter(&host_a, 0, 150, 10), vec![1]);
        assert_eq!(index.filter(&host_a, 0, 1000, 1), vec![1]);
        let host_a_us = vec![LabelFilter::eq("host", "a"), LabelFilter::eq("dc", "us")];
        assert_eq!(index.filter(&host_a_us, 0, 1000, 10), vec![3]);
        assert!(index
            .filter(&[LabelFilter::eq("host", "z")], 0, 1000, 10)
            .is_empty());
    }

    #[test]
    fn test_filter_in_operator() {
        let index = index_with_three_hosts();
        let f = vec![LabelFilter::is_in("host", &["a", "b"])];
        assert_eq!(index.filter(&f, 0, 1000, 10), vec![1, 2, 3]);
    }

    #[test]
    fn test_remove_key_drops_postings() {
        let index = index_with_three_hosts();
        index.remove_key(1);
        assert_eq!(index.values_for("host", 10), vec![
            ("a".to_string(), 1),
            ("b".to_string(), 1)
        ]);
        assert_eq!(index.filter(&[LabelFilter::eq("host", "a")], 0, 1000, 10), vec![3]);
    }

    #[test]
    fn test_snapshot_drains_dirty_and_is_monotonic() {
        let index = PartitionKeyIndex::new(2);
        index.add_key(1, b"k1", labels(&[("host", "a")]), 0);
        index.observe(1, 100);
        let blob = index.snapshot_bucket(0).unwrap();
        let bucket: IndexBucket = bincode::deserialize(&blob).unwrap();
        assert_eq!(bucket.epoch, 1);
        assert_eq!(bucket.entries.len(), 1);
        assert_eq!(bucket.entries[0].first_ts, 100);

        // Nothing changed since: no bucket, but the epoch still advances.
        assert!(index.snapshot_bucket(0).is_none());

        // A range extension re-dirties the entry.
        index.observe(1, 500);
        let blob = index.snapshot_bucket(0).unwrap();
        let bucket: IndexBucket = bincode::deserialize(&blob).unwrap();
        assert!(bucket.epoch > 1);
        assert_eq!(bucket.entries[0].last_ts, 500);

        // Group 1 snapshots are independent.
        assert!(index.snapshot_bucket(1).is_none());
    }

    #[test]
    fn test_load_bucket_roundtrip() {
        let index = index_with_three_hosts();
        index.observe(1, 150);
        let blob = index.snapshot_bucket(0).unwrap();

        let recovered = PartitionKeyIndex::new(2);
        let mut next = 100;
        let count = recovered
            .load_bucket(&blob, || {
                next += 1;
                next
            })
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(recovered.part_count(), 2);
        assert_eq!(
            recovered.filter(&[LabelFilter::eq("host", "a")], 0, 1000, 10).len(),
            2
        );
        // Recovered entries are not re-snapshotted.
        assert!(recovered.snapshot_bucket(0).is_none());
    }

    #[test]
    fn test_load_bucket_rejects_garbage() {
        let index = PartitionKeyIndex::new(2);
        assert!(index.load_bucket(b"not a bucket", || 1).is_err());
    }
}
