use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::errors::StoreError;
use crate::mem_store::chunk::Chunk;
use crate::schema::Dataset;
use crate::store::{
    ChunkScanMethod, ColumnStore, DownsamplePublisher, DownsampleRecord, FlushChunk, MetaStore,
    PartitionScanMethod, RawPartData,
};

type ChunkSetKey = (String, u32, u32, i64);

#[derive(Default)]
struct State {
    // Flush units keyed by (dataset, shard, group, offset): re-writing the
    // same unit replaces it, which is what makes flush retries idempotent.
    chunk_sets: BTreeMap<ChunkSetKey, Vec<FlushChunk>>,
    // (dataset, shard) -> (group, offset) -> bucket blob
    buckets: HashMap<(String, u32), BTreeMap<(u32, i64), Vec<u8>>>,
}

/// In-memory column store used by tests and embedders that do not need
/// durability. Faithful to the write-addressing contract of the real
/// store.
#[derive(Default)]
pub struct MemColumnStore {
    state: Mutex<State>,
    chunk_writes: AtomicU64,
}

impl MemColumnStore {
    pub fn new() -> MemColumnStore {
        MemColumnStore::default()
    }

    /// Number of `write_chunks` calls that reached the store.
    pub fn chunk_writes(&self) -> u64 {
        self.chunk_writes.load(Ordering::SeqCst)
    }

    pub fn chunk_set_count(&self) -> usize {
        self.state.lock().unwrap().chunk_sets.len()
    }

    pub fn bucket_count(&self, dataset: &str, shard: u32) -> usize {
        self.state
            .lock()
            .unwrap()
            .buckets
            .get(&(dataset.to_string(), shard))
            .map(|b| b.len())
            .unwrap_or(0)
    }

    /// Total durable rows for a dataset, across all flush units.
    pub fn total_rows(&self, dataset: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .chunk_sets
            .iter()
            .filter(|((ds, _, _, _), _)| ds == dataset)
            .flat_map(|(_, chunks)| chunks)
            .filter_map(|c| Chunk::from_encoded(c.data.clone()).ok())
            .map(|c| c.rows())
            .sum()
    }
}

impl ColumnStore for MemColumnStore {
    fn write_chunks(
        &self,
        dataset: &str,
        shard: u32,
        group: u32,
        offset: i64,
        chunks: &[FlushChunk],
        _ttl_seconds: i64,
    ) -> Result<(), StoreError> {
        self.chunk_writes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state
            .chunk_sets
            .insert((dataset.to_string(), shard, group, offset), chunks.to_vec());
        Ok(())
    }

    fn write_index_time_bucket(
        &self,
        dataset: &str,
        shard: u32,
        group: u32,
        offset: i64,
        bucket: &[u8],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state
            .buckets
            .entry((dataset.to_string(), shard))
            .or_default()
            .insert((group, offset), bucket.to_vec());
        Ok(())
    }

    fn read_raw_partitions(
        &self,
        dataset: &str,
        _column_ids: &[usize],
        part: &PartitionScanMethod,
        chunk: &ChunkScanMethod,
    ) -> Result<Vec<RawPartData>, StoreError> {
        let (start, end) = chunk.window();
        let state = self.state.lock().unwrap();
        let mut by_key: BTreeMap<Vec<u8>, Vec<Vec<u8>>> = BTreeMap::new();
        for ((ds, _, _, _), chunks) in &state.chunk_sets {
            if ds != dataset {
                continue;
            }
            for flush_chunk in chunks {
                if let PartitionScanMethod::SinglePartition(key) = part {
                    if &flush_chunk.part_key != key {
                        continue;
                    }
                }
                let in_window = Chunk::from_encoded(flush_chunk.data.clone())
                    .map(|c| c.intersects(start, end))
                    .unwrap_or(false);
                if in_window {
                    by_key
                        .entry(flush_chunk.part_key.clone())
                        .or_default()
                        .push(flush_chunk.data.clone());
                }
            }
        }
        Ok(by_key
            .into_iter()
            .map(|(part_key, chunks)| RawPartData { part_key, chunks })
            .collect())
    }

    fn scan_index_buckets(&self, dataset: &str, shard: u32) -> Result<Vec<Vec<u8>>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .buckets
            .get(&(dataset.to_string(), shard))
            .map(|buckets| buckets.values().cloned().collect())
            .unwrap_or_default())
    }

    fn truncate(&self, dataset: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.chunk_sets.retain(|(ds, _, _, _), _| ds != dataset);
        state.buckets.retain(|(ds, _), _| ds != dataset);
        Ok(())
    }

    fn reset(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.chunk_sets.clear();
        state.buckets.clear();
        Ok(())
    }
}

#[derive(Default)]
pub struct MemMetaStore {
    datasets: Mutex<HashMap<String, Dataset>>,
}

impl MemMetaStore {
    pub fn new() -> MemMetaStore {
        MemMetaStore::default()
    }
}

impl MetaStore for MemMetaStore {
    fn put_dataset(&self, dataset: &Dataset) -> Result<(), StoreError> {
        self.datasets
            .lock()
            .unwrap()
            .insert(dataset.name.clone(), dataset.clone());
        Ok(())
    }

    fn get_dataset(&self, name: &str) -> Result<Option<Dataset>, StoreError> {
        Ok(self.datasets.lock().unwrap().get(name).cloned())
    }

    fn reset(&self) -> Result<(), StoreError> {
        self.datasets.lock().unwrap().clear();
        Ok(())
    }
}

/// Captures published downsample records for assertions.
#[derive(Default)]
pub struct RecordingPublisher {
    started: AtomicBool,
    stopped: AtomicBool,
    records: Mutex<Vec<DownsampleRecord>>,
}

impl RecordingPublisher {
    pub fn new() -> RecordingPublisher {
        RecordingPublisher::default()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<DownsampleRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl DownsamplePublisher for RecordingPublisher {
    fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    fn publish(&self, records: Vec<DownsampleRecord>) {
        self.records.lock().unwrap().extend(records);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_bytes(ts: i64) -> Vec<u8> {
        use crate::ingest::record::RowVal;
        use crate::mem_store::buffer_pool::NativeBufferPool;
        use crate::mem_store::chunk::ChunkBuilder;
        use crate::schema::{ColKind, ColumnSpec};
        let pool = NativeBufferPool::new(1 << 16, vec![]);
        let cols = vec![ColumnSpec::new("timestamp", ColKind::Long)];
        let mut builder = ChunkBuilder::new(&cols, 4, &pool).unwrap();
        builder.append(&[RowVal::Long(ts)]).unwrap();
        builder.freeze().unwrap().encoded().to_vec()
    }

    #[test]
    fn test_rewriting_a_flush_unit_is_idempotent() {
        let store = MemColumnStore::new();
        let chunks = vec![FlushChunk {
            part_key: b"k".to_vec(),
            data: chunk_bytes(1),
        }];
        store.write_chunks("ts", 0, 0, 5, &chunks, 0).unwrap();
        store.write_chunks("ts", 0, 0, 5, &chunks, 0).unwrap();
        assert_eq!(store.chunk_writes(), 2);
        assert_eq!(store.chunk_set_count(), 1);
        assert_eq!(store.total_rows("ts"), 1);
    }

    #[test]
    fn test_read_raw_partitions_filters_by_key_and_window() {
        let store = MemColumnStore::new();
        let a = FlushChunk {
            part_key: b"a".to_vec(),
            data: chunk_bytes(10),
        };
        let b = FlushChunk {
            part_key: b"b".to_vec(),
            data: chunk_bytes(20),
        };
        store
            .write_chunks("ts", 0, 0, 1, &[a, b], 0)
            .unwrap();
        let single = store
            .read_raw_partitions(
                "ts",
                &[],
                &PartitionScanMethod::SinglePartition(b"a".to_vec()),
                &ChunkScanMethod::All,
            )
            .unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].part_key, b"a".to_vec());

        let windowed = store
            .read_raw_partitions(
                "ts",
                &[],
                &PartitionScanMethod::All,
                &ChunkScanMethod::TimeRange(15, 25),
            )
            .unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].part_key, b"b".to_vec());
    }
}
