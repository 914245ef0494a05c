use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use crate::errors::MemStoreError;
use crate::ingest::record::RecordBatch;
use crate::ingest::stream::{FlushStream, IngestionStream};
use crate::mem_store::chunk::Chunk;
use crate::mem_store::eviction::{EvictionPolicy, WriteBufferFreeEvictionPolicy};
use crate::mem_store::part_key_index::LabelFilter;
use crate::mem_store::partition::Partition;
use crate::mem_store::NativeBufferPool;
use crate::schema::Dataset;
use crate::shard::{FlushCommand, Shard, ShardStats};
use crate::store::{
    ChunkScanMethod, ColumnStore, DownsamplePublisher, MetaStore, NoopPublisher,
    PartitionScanMethod,
};

/// Per-shard store configuration. Defaults are production-shaped; tests
/// shrink them to exercise rotation and eviction.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub groups_per_shard: u32,
    /// Maximum rows per chunk before rotation.
    pub max_chunks_size: usize,
    /// Frozen chunks retained in memory per partition once persisted.
    pub chunks_to_keep: usize,
    /// Size of the per-dataset native arena in bytes.
    pub ingestion_buffer_mem_size: usize,
    /// Eviction triggers when pool free bytes fall below this.
    pub min_write_buffers_free: usize,
    pub flush_task_parallelism: usize,
    pub disk_time_to_live_seconds: i64,
    pub flush_drain_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> StoreConfig {
        StoreConfig {
            groups_per_shard: 32,
            max_chunks_size: 400,
            chunks_to_keep: 10,
            ingestion_buffer_mem_size: 256 * 1024 * 1024, // 256 MiB
            min_write_buffers_free: 4 * 1024 * 1024,      // 4 MiB
            flush_task_parallelism: (num_cpus::get() / 2).max(1),
            disk_time_to_live_seconds: 3 * 24 * 3600,
            flush_drain_timeout: Duration::from_secs(60),
        }
    }
}

impl StoreConfig {
    /// Builds a config from a free-form keyed map, falling back to the
    /// defaults for missing or unparsable keys.
    pub fn from_map(config: &HashMap<String, String>) -> StoreConfig {
        let defaults = StoreConfig::default();
        fn get<T: std::str::FromStr>(
            config: &HashMap<String, String>,
            key: &str,
            default: T,
        ) -> T {
            config
                .get(key)
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }
        StoreConfig {
            groups_per_shard: get(config, "groupsPerShard", defaults.groups_per_shard),
            max_chunks_size: get(config, "maxChunksSize", defaults.max_chunks_size),
            chunks_to_keep: get(config, "chunksToKeep", defaults.chunks_to_keep),
            ingestion_buffer_mem_size: get(
                config,
                "ingestionBufferMemSize",
                defaults.ingestion_buffer_mem_size,
            ),
            min_write_buffers_free: get(
                config,
                "minWriteBuffersFree",
                defaults.min_write_buffers_free,
            ),
            flush_task_parallelism: get(
                config,
                "flushTaskParallelism",
                defaults.flush_task_parallelism,
            ),
            disk_time_to_live_seconds: get(
                config,
                "diskTimeToLiveSeconds",
                defaults.disk_time_to_live_seconds,
            ),
            flush_drain_timeout: Duration::from_secs(get(
                config,
                "flushDrainTimeout",
                defaults.flush_drain_timeout.as_secs(),
            )),
        }
    }
}

struct DatasetResources {
    dataset: Arc<Dataset>,
    pool: NativeBufferPool,
    publisher: Arc<dyn DownsamplePublisher>,
    shards: HashMap<u32, Arc<Shard>>,
}

/// The per-node memstore: a registry of datasets and their shard-local
/// ingestion engines, and the public façade over ingestion, flushing,
/// recovery and scans.
pub struct MemStore {
    store: Arc<dyn ColumnStore>,
    meta: Arc<dyn MetaStore>,
    datasets: RwLock<HashMap<String, DatasetResources>>,
}

impl MemStore {
    pub fn new(store: Arc<dyn ColumnStore>, meta: Arc<dyn MetaStore>) -> MemStore {
        MemStore {
            store,
            meta,
            datasets: RwLock::new(HashMap::new()),
        }
    }

    /// Initializes a shard for a dataset. Per-dataset resources (arena,
    /// publisher) are created lazily on the first shard. Fails with
    /// `ShardAlreadySetup` on a duplicate; only an explicit reset or
    /// shutdown removes shards.
    pub fn setup(
        &self,
        dataset: &Dataset,
        shard: u32,
        config: StoreConfig,
        publisher: Option<Arc<dyn DownsamplePublisher>>,
    ) -> Result<(), MemStoreError> {
        self.setup_with_policy(dataset, shard, config, publisher, None)
    }

    pub fn setup_with_policy(
        &self,
        dataset: &Dataset,
        shard: u32,
        config: StoreConfig,
        publisher: Option<Arc<dyn DownsamplePublisher>>,
        policy: Option<Arc<dyn EvictionPolicy>>,
    ) -> Result<(), MemStoreError> {
        dataset.validate()?;
        let mut datasets = self.datasets.write().unwrap();
        let resources = datasets
            .entry(dataset.name.clone())
            .or_insert_with(|| {
                let pool = NativeBufferPool::new(
                    config.ingestion_buffer_mem_size,
                    vec![("dataset".to_string(), dataset.name.clone())],
                );
                let publisher = publisher
                    .clone()
                    .unwrap_or_else(|| Arc::new(NoopPublisher) as Arc<dyn DownsamplePublisher>);
                publisher.start();
                DatasetResources {
                    dataset: Arc::new(dataset.clone()),
                    pool,
                    publisher,
                    shards: HashMap::new(),
                }
            });
        if resources.shards.contains_key(&shard) {
            return Err(MemStoreError::ShardAlreadySetup {
                dataset: dataset.name.clone(),
                shard,
            });
        }
        self.meta.put_dataset(dataset)?;
        let policy =
            policy.unwrap_or_else(|| Arc::new(WriteBufferFreeEvictionPolicy) as Arc<dyn EvictionPolicy>);
        let engine = Shard::spawn(
            resources.dataset.clone(),
            shard,
            Arc::new(config),
            resources.pool.clone(),
            self.store.clone(),
            resources.publisher.clone(),
            policy,
        );
        resources.shards.insert(shard, engine);
        info!("set up shard {} of dataset {}", shard, dataset.name);
        Ok(())
    }

    fn shard(&self, dataset: &str, shard: u32) -> Result<Arc<Shard>, MemStoreError> {
        let datasets = self.datasets.read().unwrap();
        datasets
            .get(dataset)
            .and_then(|r| r.shards.get(&shard))
            .cloned()
            .ok_or_else(|| MemStoreError::ShardNotAssigned {
                dataset: dataset.to_string(),
                shard,
            })
    }

    /// Synchronous enqueue onto the shard's ingestion input.
    pub fn ingest(
        &self,
        dataset: &str,
        shard: u32,
        batch: RecordBatch,
    ) -> Result<(), MemStoreError> {
        self.shard(dataset, shard)?.ingest(batch);
        Ok(())
    }

    /// Enqueues a flush command for one group, ordered after previously
    /// ingested batches.
    pub fn flush(&self, dataset: &str, shard: u32, group: u32) -> Result<(), MemStoreError> {
        self.shard(dataset, shard)?
            .enqueue_flush(FlushCommand { group });
        Ok(())
    }

    /// Subscribes the shard to the merge of a data stream and a flush
    /// stream. At most one active subscription per (dataset, shard);
    /// duplicates are rejected. The returned handle cancels by draining
    /// in-flight flushes and then halting ingestion.
    pub fn ingest_stream(
        &self,
        dataset: &str,
        shard: u32,
        data: Box<dyn IngestionStream>,
        flushes: Option<Box<dyn FlushStream>>,
        ttl_seconds: Option<i64>,
    ) -> Result<IngestionHandle, MemStoreError> {
        let engine = self.shard(dataset, shard)?;
        if !engine.try_claim_stream() {
            return Err(MemStoreError::StreamAlreadyActive {
                dataset: dataset.to_string(),
                shard,
            });
        }
        if let Some(ttl) = ttl_seconds {
            engine.set_ttl_seconds(ttl);
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut feeders = Vec::new();
        {
            let engine = engine.clone();
            let cancelled = cancelled.clone();
            let mut data = data;
            feeders.push(thread::spawn(move || {
                while !cancelled.load(Ordering::SeqCst) {
                    match data.next() {
                        Some(Ok(batch)) => {
                            if !engine.ingest(batch) {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            error!("ingestion stream of shard {} ended: {}", engine.shard_num(), e);
                            break;
                        }
                        None => break,
                    }
                }
            }));
        }
        if let Some(mut flushes) = flushes {
            let engine = engine.clone();
            let cancelled = cancelled.clone();
            feeders.push(thread::spawn(move || {
                while !cancelled.load(Ordering::SeqCst) {
                    match flushes.next() {
                        Some(command) => {
                            if !engine.enqueue_flush(command) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }));
        }
        let drain_timeout = engine.flush_drain_timeout();
        Ok(IngestionHandle {
            cancelled,
            feeders,
            shard: engine,
            drain_timeout,
        })
    }

    /// Installs per-group watermarks from `checkpoints` and replays the
    /// stream, yielding the current offset every `report_interval` source
    /// units and a final event at `end`. No flushes are emitted during
    /// recovery.
    #[allow(clippy::too_many_arguments)]
    pub fn recover_stream(
        &self,
        dataset: &str,
        shard: u32,
        stream: Box<dyn IngestionStream>,
        start: i64,
        end: i64,
        checkpoints: &HashMap<u32, i64>,
        report_interval: i64,
    ) -> Result<RecoveryProgress, MemStoreError> {
        let engine = self.shard(dataset, shard)?;
        engine.install_watermarks(checkpoints);
        engine.set_recovering(true);
        Ok(RecoveryProgress {
            shard: engine,
            stream,
            end,
            report_interval: report_interval.max(1),
            next_report: start.saturating_add(report_interval.max(1)),
            last_reported: None,
            empty: end < start,
            done: false,
        })
    }

    /// Rebuilds the shard's partition key index from persisted time
    /// buckets. Returns the number of recovered index entries.
    pub fn recover_index(&self, dataset: &str, shard: u32) -> Result<usize, MemStoreError> {
        let engine = self.shard(dataset, shard)?;
        let blobs = self.store.scan_index_buckets(dataset, shard)?;
        let mut entries = 0;
        for blob in blobs {
            entries += engine
                .load_index_bucket(&blob)
                .map_err(MemStoreError::IndexCorruption)?;
        }
        info!(
            "recovered {} index entries for shard {} of dataset {}",
            entries, shard, dataset
        );
        Ok(entries)
    }

    /// Lazy sequence of readable partitions: resident partitions first,
    /// then partitions materialized on demand from the column store.
    pub fn scan_partitions(
        &self,
        dataset: &str,
        shard: u32,
        column_ids: &[usize],
        part: &PartitionScanMethod,
        chunk: &ChunkScanMethod,
    ) -> Result<PartitionScans, MemStoreError> {
        let engine = self.shard(dataset, shard)?;
        let (start, end) = chunk.window();
        let resident = engine.resident_partitions(part);
        // Keys the index knows but the table no longer holds (recovered or
        // evicted partitions) are paged from the durable store.
        let resident_keys: HashSet<Vec<u8>> =
            resident.iter().map(|p| p.key().to_vec()).collect();
        let indexed: Vec<Vec<u8>> = match part {
            PartitionScanMethod::ByFilters(filters) => engine
                .indexed_keys(filters, start, end, usize::MAX)
                .into_iter()
                .filter(|key| !resident_keys.contains(key))
                .collect(),
            PartitionScanMethod::SinglePartition(key) if !resident_keys.contains(key) => {
                vec![key.clone()]
            }
            _ => Vec::new(),
        };
        Ok(PartitionScans {
            store: self.store.clone(),
            dataset: dataset.to_string(),
            column_ids: column_ids.to_vec(),
            window: (start, end),
            resident: resident.into(),
            non_resident: indexed.into(),
            sweep_store: matches!(part, PartitionScanMethod::All),
            seen: HashSet::new(),
            paged: None,
        })
    }

    // Label lookups return empty sequences for unknown shards rather than
    // errors; only scan_partitions surfaces ShardNotAssigned.

    pub fn label_values(
        &self,
        dataset: &str,
        shard: u32,
        label: &str,
        top_k: usize,
    ) -> Vec<(String, u64)> {
        self.shard(dataset, shard)
            .map(|s| s.label_values(label, top_k))
            .unwrap_or_default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn label_values_with_filters(
        &self,
        dataset: &str,
        shard: u32,
        filters: &[LabelFilter],
        labels: &[String],
        start: i64,
        end: i64,
        limit: usize,
    ) -> Vec<Vec<(String, String)>> {
        self.shard(dataset, shard)
            .map(|s| s.labels_with_filters(filters, labels, start, end, limit))
            .unwrap_or_default()
    }

    pub fn part_keys_with_filters(
        &self,
        dataset: &str,
        shard: u32,
        filters: &[LabelFilter],
        start: i64,
        end: i64,
        limit: usize,
    ) -> Vec<Vec<u8>> {
        self.shard(dataset, shard)
            .map(|s| s.indexed_keys(filters, start, end, limit))
            .unwrap_or_default()
    }

    pub fn index_names(&self, dataset: &str, shard: u32, limit: usize) -> Vec<String> {
        self.shard(dataset, shard)
            .map(|s| s.index_names(limit))
            .unwrap_or_default()
    }

    pub fn shard_stats(&self, dataset: &str, shard: u32) -> Result<ShardStats, MemStoreError> {
        Ok(self.shard(dataset, shard)?.stats())
    }

    /// Drops all in-memory state of a dataset and truncates its durable
    /// data.
    pub fn truncate(&self, dataset: &str) -> Result<(), MemStoreError> {
        {
            let datasets = self.datasets.read().unwrap();
            if let Some(resources) = datasets.get(dataset) {
                for shard in resources.shards.values() {
                    shard.truncate();
                }
            }
        }
        self.store.truncate(dataset)?;
        Ok(())
    }

    /// Tears everything down and resets the durable store.
    pub fn reset(&self) -> Result<(), MemStoreError> {
        self.teardown();
        self.store.reset()?;
        self.meta.reset()?;
        Ok(())
    }

    /// Tears down in dependency order: stop ingestion, drain flushes,
    /// close indexes, release arenas, stop publishers. The durable store
    /// is left untouched.
    pub fn shutdown(&self) {
        self.teardown();
    }

    fn teardown(&self) {
        let mut datasets = self.datasets.write().unwrap();
        for (name, resources) in datasets.drain() {
            for (_, shard) in resources.shards {
                let timeout = shard.flush_drain_timeout();
                shard.shutdown(timeout);
            }
            resources.publisher.stop();
            info!("tore down dataset {}", name);
        }
    }
}

impl Drop for MemStore {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Cancellable handle for an active ingestion stream subscription.
pub struct IngestionHandle {
    cancelled: Arc<AtomicBool>,
    feeders: Vec<thread::JoinHandle<()>>,
    shard: Arc<Shard>,
    drain_timeout: Duration,
}

impl IngestionHandle {
    /// Unsubscribes from upstream, waits for the event in progress,
    /// drains the flush pipeline up to the drain timeout (abandoning
    /// in-flight flushes on expiry) and releases the shard's native
    /// memory. Returns whether the pipeline drained in time.
    pub fn cancel(mut self) -> bool {
        self.cancelled.store(true, Ordering::SeqCst);
        for feeder in self.feeders.drain(..) {
            let _ = feeder.join();
        }
        let drained = self.shard.drain_flushes(self.drain_timeout);
        self.shard.release_buffers();
        self.shard.stream_done();
        drained
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> IngestionHandle {
        self.drain_timeout = timeout;
        self
    }
}

/// Lazy progress sequence of a recovery replay.
pub struct RecoveryProgress {
    shard: Arc<Shard>,
    stream: Box<dyn IngestionStream>,
    end: i64,
    report_interval: i64,
    next_report: i64,
    last_reported: Option<i64>,
    empty: bool,
    done: bool,
}

impl RecoveryProgress {
    fn finish(&mut self) {
        self.done = true;
        self.shard.set_recovering(false);
    }
}

impl Iterator for RecoveryProgress {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        if self.done {
            return None;
        }
        if self.empty {
            self.finish();
            return None;
        }
        loop {
            match self.stream.next() {
                Some(Ok(batch)) if batch.offset <= self.end => {
                    let offset = batch.offset;
                    self.shard.apply_batch(batch);
                    if offset >= self.next_report {
                        self.next_report = offset.saturating_add(self.report_interval);
                        self.last_reported = Some(offset);
                        return Some(offset);
                    }
                }
                Some(Err(e)) => {
                    error!("recovery stream failed: {}", e);
                    self.finish();
                    return Some(self.end);
                }
                _ => {
                    // Stream exhausted or past the recovery window: emit
                    // the final event unless it was just reported.
                    self.finish();
                    if self.last_reported == Some(self.end) {
                        return None;
                    }
                    return Some(self.end);
                }
            }
        }
    }
}

impl Drop for RecoveryProgress {
    fn drop(&mut self) {
        self.shard.set_recovering(false);
    }
}

/// One readable partition produced by a scan.
#[derive(Debug)]
pub struct ScannedPartition {
    pub part_key: Vec<u8>,
    pub chunks: Vec<Arc<Chunk>>,
}

/// Iterator over readable partitions. Resident partitions are served
/// first; historical partitions are materialized from the column store
/// only once the resident ones are exhausted.
pub struct PartitionScans {
    store: Arc<dyn ColumnStore>,
    dataset: String,
    column_ids: Vec<usize>,
    window: (i64, i64),
    resident: VecDeque<Arc<Partition>>,
    non_resident: VecDeque<Vec<u8>>,
    sweep_store: bool,
    seen: HashSet<Vec<u8>>,
    paged: Option<VecDeque<ScannedPartition>>,
}

impl PartitionScans {
    fn page_single(&self, key: &[u8]) -> Vec<Arc<Chunk>> {
        let method = PartitionScanMethod::SinglePartition(key.to_vec());
        let chunk_method = ChunkScanMethod::TimeRange(self.window.0, self.window.1);
        match self
            .store
            .read_raw_partitions(&self.dataset, &self.column_ids, &method, &chunk_method)
        {
            Ok(parts) => parts
                .into_iter()
                .flat_map(|p| p.chunks)
                .filter_map(|data| Chunk::from_encoded(data).ok())
                .map(Arc::new)
                .collect(),
            Err(e) => {
                error!("on-demand paging of partition failed: {}", e);
                Vec::new()
            }
        }
    }

    fn load_store_sweep(&mut self) {
        let chunk_method = ChunkScanMethod::TimeRange(self.window.0, self.window.1);
        let parts = match self.store.read_raw_partitions(
            &self.dataset,
            &self.column_ids,
            &PartitionScanMethod::All,
            &chunk_method,
        ) {
            Ok(parts) => parts,
            Err(e) => {
                error!("partition sweep of column store failed: {}", e);
                Vec::new()
            }
        };
        let paged = parts
            .into_iter()
            .filter(|p| !self.seen.contains(&p.part_key))
            .map(|p| ScannedPartition {
                part_key: p.part_key,
                chunks: p
                    .chunks
                    .into_iter()
                    .filter_map(|data| Chunk::from_encoded(data).ok())
                    .map(Arc::new)
                    .collect(),
            })
            .collect();
        self.paged = Some(paged);
    }
}

impl Iterator for PartitionScans {
    type Item = ScannedPartition;

    fn next(&mut self) -> Option<ScannedPartition> {
        let (start, end) = self.window;
        if let Some(partition) = self.resident.pop_front() {
            let mut chunks = partition.scan(start, end);
            // Page older history in when the window reaches past the
            // oldest resident chunk.
            let oldest = partition.oldest_resident_ts();
            if oldest.map(|ts| start < ts).unwrap_or(true) {
                let cutoff = oldest.unwrap_or(i64::MAX);
                let mut paged: Vec<Arc<Chunk>> = self
                    .page_single(partition.key())
                    .into_iter()
                    .filter(|c| c.time_range().1 < cutoff)
                    .collect();
                paged.extend(chunks);
                chunks = paged;
            }
            self.seen.insert(partition.key().to_vec());
            return Some(ScannedPartition {
                part_key: partition.key().to_vec(),
                chunks,
            });
        }
        while let Some(key) = self.non_resident.pop_front() {
            if !self.seen.insert(key.clone()) {
                continue;
            }
            let chunks = self.page_single(&key);
            return Some(ScannedPartition {
                part_key: key,
                chunks,
            });
        }
        if self.sweep_store {
            if self.paged.is_none() {
                self.load_store_sweep();
            }
            return self.paged.as_mut().unwrap().pop_front();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_map() {
        let mut map = HashMap::new();
        map.insert("groupsPerShard".to_string(), "4".to_string());
        map.insert("maxChunksSize".to_string(), "128".to_string());
        map.insert("flushDrainTimeout".to_string(), "5".to_string());
        map.insert("chunksToKeep".to_string(), "not a number".to_string());
        let config = StoreConfig::from_map(&map);
        assert_eq!(config.groups_per_shard, 4);
        assert_eq!(config.max_chunks_size, 128);
        assert_eq!(config.flush_drain_timeout, Duration::from_secs(5));
        // Unparsable keys fall back to the default.
        assert_eq!(config.chunks_to_keep, StoreConfig::default().chunks_to_keep);
    }
}
