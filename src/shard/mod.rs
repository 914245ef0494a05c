pub mod flush;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::ingest::record::{RecordBatch, RowVal};
use crate::mem_store::eviction::{EvictionPolicy, PoolState};
use crate::mem_store::part_key::{group_of, PartKeyCodec};
use crate::mem_store::part_key_index::{LabelFilter, PartitionKeyIndex};
use crate::mem_store::partition::{IngestOutcome, Partition, PartitionId};
use crate::mem_store::partition_table::PartitionTable;
use crate::mem_store::NativeBufferPool;
use crate::memstore::StoreConfig;
use crate::observability::{metrics, ShardPerfCounter};
use crate::schema::{ColKind, Dataset};
use crate::store::{ColumnStore, DownsamplePublisher, PartitionScanMethod};

pub use self::flush::{FlushGroup, FlushItem, FlushPipeline};

const INGEST_QUEUE_DEPTH: usize = 1024;

/// Instructs a shard to flush one group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlushCommand {
    pub group: u32,
}

/// The merged per-shard event stream: data batches and flush commands,
/// processed strictly in arrival order by a single ingestion thread.
pub enum ShardEvent {
    Data(RecordBatch),
    Flush(FlushCommand),
}

/// Per-group durable source offsets. `-1` until the group's first
/// successful flush; advances monotonically.
pub struct GroupWatermarks {
    offsets: Vec<AtomicI64>,
}

impl GroupWatermarks {
    pub fn new(groups: u32) -> GroupWatermarks {
        GroupWatermarks {
            offsets: (0..groups).map(|_| AtomicI64::new(-1)).collect(),
        }
    }

    pub fn get(&self, group: u32) -> i64 {
        self.offsets[group as usize].load(Ordering::SeqCst)
    }

    /// Monotonic advance; called only after a successful flush.
    pub fn advance(&self, group: u32, offset: i64) {
        self.offsets[group as usize].fetch_max(offset, Ordering::SeqCst);
    }

    /// Installs a recovered checkpoint.
    pub fn install(&self, group: u32, offset: i64) {
        self.offsets[group as usize].store(offset, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Vec<i64> {
        self.offsets
            .iter()
            .map(|o| o.load(Ordering::SeqCst))
            .collect()
    }

    pub fn reset(&self) {
        for offset in &self.offsets {
            offset.store(-1, Ordering::SeqCst);
        }
    }
}

#[derive(Clone, Debug)]
pub struct ShardStats {
    pub shard: u32,
    pub partitions: usize,
    pub rows_ingested: u64,
    pub rows_dropped: u64,
    pub partitions_created: u64,
    pub partitions_evicted: u64,
    pub flushes_completed: u64,
    pub flushes_failed: u64,
    pub latest_offset: i64,
    pub watermarks: Vec<i64>,
    pub pool_bytes_free: usize,
    pub pool_capacity: usize,
}

/// A shard-local ingestion engine: one dedicated ingestion thread owns all
/// writes to the partition table, the index and the active chunks; a
/// multi-threaded flush pipeline persists frozen chunks; reader threads
/// scan immutable snapshots.
pub struct Shard {
    dataset: Arc<Dataset>,
    shard_num: u32,
    config: Arc<StoreConfig>,
    codec: PartKeyCodec,
    pool: NativeBufferPool,
    table: PartitionTable,
    index: PartitionKeyIndex,
    watermarks: Arc<GroupWatermarks>,
    policy: Arc<dyn EvictionPolicy>,
    pipeline: FlushPipeline,
    counters: Arc<ShardPerfCounter>,
    latest_offset: AtomicI64,
    next_part_id: AtomicU64,
    // Logical clock ordering ingests for the eviction policy.
    clock: AtomicU64,
    ttl_seconds: AtomicI64,
    running: AtomicBool,
    recovering: AtomicBool,
    stream_active: AtomicBool,
    tx: Mutex<Option<SyncSender<ShardEvent>>>,
    ingest_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Shard {
    pub fn spawn(
        dataset: Arc<Dataset>,
        shard_num: u32,
        config: Arc<StoreConfig>,
        pool: NativeBufferPool,
        store: Arc<dyn ColumnStore>,
        publisher: Arc<dyn DownsamplePublisher>,
        policy: Arc<dyn EvictionPolicy>,
    ) -> Arc<Shard> {
        let counters = Arc::new(ShardPerfCounter::new());
        let watermarks = Arc::new(GroupWatermarks::new(config.groups_per_shard));
        let pipeline = FlushPipeline::new(
            &dataset.name,
            shard_num,
            config.flush_task_parallelism,
            config.chunks_to_keep,
            store,
            publisher,
            watermarks.clone(),
            counters.clone(),
        );
        let codec = PartKeyCodec::for_dataset(&dataset);
        let (tx, rx) = mpsc::sync_channel(INGEST_QUEUE_DEPTH);
        let shard = Arc::new(Shard {
            codec,
            index: PartitionKeyIndex::new(config.groups_per_shard),
            table: PartitionTable::new(),
            watermarks,
            policy,
            pipeline,
            counters,
            latest_offset: AtomicI64::new(-1),
            next_part_id: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            ttl_seconds: AtomicI64::new(config.disk_time_to_live_seconds),
            running: AtomicBool::new(true),
            recovering: AtomicBool::new(false),
            stream_active: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
            ingest_thread: Mutex::new(None),
            dataset,
            shard_num,
            config,
            pool,
        });
        let cloned = shard.clone();
        let handle = thread::spawn(move || cloned.ingest_loop(rx));
        *shard.ingest_thread.lock().unwrap() = Some(handle);
        shard
    }

    pub fn shard_num(&self) -> u32 {
        self.shard_num
    }

    pub fn counters(&self) -> &ShardPerfCounter {
        &self.counters
    }

    pub fn watermark(&self, group: u32) -> i64 {
        self.watermarks.get(group)
    }

    pub fn watermarks(&self) -> Vec<i64> {
        self.watermarks.snapshot()
    }

    pub fn latest_offset(&self) -> i64 {
        self.latest_offset.load(Ordering::SeqCst)
    }

    pub fn set_ttl_seconds(&self, ttl: i64) {
        self.ttl_seconds.store(ttl, Ordering::SeqCst);
    }

    pub fn flush_drain_timeout(&self) -> Duration {
        self.config.flush_drain_timeout
    }

    /// Synchronous enqueue onto the shard's event stream. Returns false
    /// once the shard is shut down.
    pub fn ingest(&self, batch: RecordBatch) -> bool {
        self.send(ShardEvent::Data(batch))
    }

    pub fn enqueue_flush(&self, command: FlushCommand) -> bool {
        self.send(ShardEvent::Flush(command))
    }

    fn send(&self, event: ShardEvent) -> bool {
        let tx = self.tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    fn ingest_loop(self: Arc<Shard>, rx: mpsc::Receiver<ShardEvent>) {
        info!(
            "shard {} of dataset {} ready: {} groups",
            self.shard_num, self.dataset.name, self.config.groups_per_shard
        );
        while self.running.load(Ordering::SeqCst) {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(ShardEvent::Data(batch)) => self.apply_batch(batch),
                Ok(ShardEvent::Flush(command)) => self.handle_flush(command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("shard {} of dataset {} stopped", self.shard_num, self.dataset.name);
    }

    /// Applies one batch on the calling thread. Outside of recovery this
    /// is only ever the ingestion thread.
    pub(crate) fn apply_batch(&self, batch: RecordBatch) {
        if self.policy.should_evict(&self.pool_state()) {
            self.evict_for_headroom(None);
        }
        let offset = batch.offset;
        for record in &batch.records {
            self.apply_record(&record.part_vals, &record.row, offset);
        }
        self.latest_offset.fetch_max(offset, Ordering::SeqCst);
        self.counters.batch_ingested();
        metrics::BUFFER_POOL_FREE_BYTES.set(self.pool.bytes_free() as f64);
    }

    fn apply_record(&self, part_vals: &[crate::ingest::record::PartVal], row: &[RowVal], offset: i64) {
        if !self.row_matches_schema(row) {
            self.drop_record("row does not match dataset schema");
            return;
        }
        let key = match self.codec.encode(part_vals) {
            Ok(key) => key,
            Err(e) => {
                self.drop_record(&e.0);
                return;
            }
        };
        let tick = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let partition = match self.lookup_or_create(&key, part_vals, tick) {
            Some(partition) => partition,
            None => {
                self.drop_record("buffer pool exhausted while creating partition");
                return;
            }
        };
        let mut outcome = partition.ingest(
            row,
            offset,
            &self.dataset.data_columns,
            self.config.max_chunks_size,
            self.config.chunks_to_keep,
            &self.pool,
            tick,
        );
        if outcome.is_err() {
            // Pool exhausted: evict cold partitions and retry once before
            // dropping the record.
            self.evict_for_headroom(Some(partition.id()));
            outcome = partition.ingest(
                row,
                offset,
                &self.dataset.data_columns,
                self.config.max_chunks_size,
                self.config.chunks_to_keep,
                &self.pool,
                tick,
            );
        }
        match outcome {
            Ok(IngestOutcome::Appended) => {
                self.counters.row_ingested();
                metrics::INGESTED_ROW_COUNT.inc();
                if let Some(ts) = row.first().and_then(RowVal::as_long) {
                    self.index.observe(partition.id(), ts);
                }
            }
            Ok(IngestOutcome::OutOfOrder) => {
                self.counters.row_out_of_order();
                metrics::OUT_OF_ORDER_ROW_COUNT.inc();
            }
            Ok(IngestOutcome::RowTooLarge) => {
                self.drop_record("row exceeds chunk buffer capacity");
            }
            Err(_) => {
                self.drop_record("buffer pool exhausted after eviction");
            }
        }
    }

    fn row_matches_schema(&self, row: &[RowVal]) -> bool {
        if row.len() != self.dataset.data_columns.len() {
            return false;
        }
        row.iter()
            .zip(&self.dataset.data_columns)
            .all(|(val, col)| match (val, col.kind) {
                (RowVal::Long(_), ColKind::Long) => true,
                (RowVal::Double(_), ColKind::Double) => true,
                (RowVal::Long(_), ColKind::Double) => true,
                (RowVal::Str(_), ColKind::Str) => true,
                _ => false,
            })
    }

    fn drop_record(&self, reason: &str) {
        warn!(
            "dropping record for shard {} of dataset {}: {}",
            self.shard_num, self.dataset.name, reason
        );
        self.counters.row_dropped();
        metrics::DROPPED_ROW_COUNT.inc();
    }

    fn lookup_or_create(
        &self,
        key: &[u8],
        part_vals: &[crate::ingest::record::PartVal],
        tick: u64,
    ) -> Option<Arc<Partition>> {
        let mut result = self.create_in_table(key, tick);
        if result.is_err() {
            self.evict_for_headroom(None);
            result = self.create_in_table(key, tick);
        }
        match result {
            Ok((partition, created)) => {
                if created {
                    self.index.add_key(
                        partition.id(),
                        key,
                        self.codec.labels(part_vals),
                        partition.group_id(),
                    );
                    self.counters.partition_created();
                    metrics::PARTITION_CREATE_COUNT.inc();
                }
                Some(partition)
            }
            Err(_) => None,
        }
    }

    fn create_in_table(
        &self,
        key: &[u8],
        tick: u64,
    ) -> Result<(Arc<Partition>, bool), crate::errors::BufferPoolExhausted> {
        self.table.get_or_create(key, |hash| {
            let id = self.next_part_id.fetch_add(1, Ordering::SeqCst);
            let group = group_of(hash, self.config.groups_per_shard);
            Ok(Arc::new(Partition::new(id, group, key, &self.pool, tick)?))
        })
    }

    fn handle_flush(&self, command: FlushCommand) {
        if self.recovering.load(Ordering::SeqCst) {
            debug!(
                "ignoring flush command for group {} during recovery",
                command.group
            );
            return;
        }
        let group = command.group;
        let mut items = Vec::new();
        for partition in self.table.values() {
            if partition.group_id() != group {
                continue;
            }
            for chunk in partition.switch_buffers(self.config.chunks_to_keep) {
                items.push(FlushItem {
                    partition: partition.clone(),
                    chunk,
                });
            }
        }
        let bucket = self.index.snapshot_bucket(group);
        let task = FlushGroup {
            shard: self.shard_num,
            group,
            offset: self.latest_offset.load(Ordering::SeqCst),
            ttl_seconds: self.ttl_seconds.load(Ordering::SeqCst),
            bucket,
            items,
        };
        self.pipeline.submit(task);
    }

    fn pool_state(&self) -> PoolState {
        PoolState {
            capacity: self.pool.capacity(),
            bytes_free: self.pool.bytes_free(),
            min_write_buffers_free: self.config.min_write_buffers_free,
        }
    }

    /// Evicts cold partitions until the pool is back above the free-byte
    /// threshold or no candidates remain. `protect` shields the partition
    /// currently being ingested into.
    fn evict_for_headroom(&self, protect: Option<PartitionId>) {
        loop {
            let candidates: Vec<Arc<Partition>> = self
                .table
                .values()
                .into_iter()
                .filter(|p| Some(p.id()) != protect)
                .collect();
            let victims = self.policy.select_victims(&candidates, 1);
            if victims.is_empty() {
                warn!(
                    "shard {} of dataset {} under memory pressure but no evictable partitions",
                    self.shard_num, self.dataset.name
                );
                return;
            }
            for victim in victims {
                debug!(
                    "evicting partition {} of shard {} (last ingest tick {})",
                    victim.id(),
                    self.shard_num,
                    victim.last_ingest()
                );
                victim.evict();
                self.table.remove(victim.key());
                self.index.remove_key(victim.id());
                self.counters.partition_evicted();
                metrics::PARTITION_EVICT_COUNT.inc();
            }
            if !self.policy.should_evict(&self.pool_state()) {
                return;
            }
        }
    }

    // ---- reader-side API ------------------------------------------------

    /// Resident partitions matching the scan method, ordered by key.
    pub fn resident_partitions(&self, method: &PartitionScanMethod) -> Vec<Arc<Partition>> {
        let mut partitions = match method {
            PartitionScanMethod::All => self.table.values(),
            PartitionScanMethod::SinglePartition(key) => {
                self.table.get(key).into_iter().collect()
            }
            PartitionScanMethod::ByFilters(filters) => self
                .index
                .filter(filters, i64::MIN, i64::MAX, usize::MAX)
                .into_iter()
                .filter_map(|id| self.index.part_key_of(id))
                .filter_map(|key| self.table.get(&key))
                .collect(),
        };
        partitions.sort_by(|a, b| a.key().cmp(b.key()));
        partitions
    }

    /// Partition keys known to the index for the scan method, including
    /// recovered keys whose data is not resident.
    pub fn indexed_keys(&self, filters: &[LabelFilter], start: i64, end: i64, limit: usize) -> Vec<Vec<u8>> {
        self.index
            .filter(filters, start, end, limit)
            .into_iter()
            .filter_map(|id| self.index.part_key_of(id))
            .collect()
    }

    pub fn label_values(&self, label: &str, top_k: usize) -> Vec<(String, u64)> {
        self.index.values_for(label, top_k)
    }

    pub fn labels_with_filters(
        &self,
        filters: &[LabelFilter],
        labels: &[String],
        start: i64,
        end: i64,
        limit: usize,
    ) -> Vec<Vec<(String, String)>> {
        self.index
            .filter(filters, start, end, limit)
            .into_iter()
            .filter_map(|id| self.index.labels_of(id))
            .map(|pairs| {
                pairs
                    .into_iter()
                    .filter(|(name, _)| labels.is_empty() || labels.iter().any(|l| l == name))
                    .collect()
            })
            .collect()
    }

    pub fn index_names(&self, limit: usize) -> Vec<String> {
        self.index.index_names(limit)
    }

    // ---- recovery -------------------------------------------------------

    pub fn set_recovering(&self, recovering: bool) {
        self.recovering.store(recovering, Ordering::SeqCst);
    }

    pub fn install_watermarks(&self, checkpoints: &std::collections::HashMap<u32, i64>) {
        for (group, offset) in checkpoints {
            if *group < self.config.groups_per_shard {
                self.watermarks.install(*group, *offset);
            }
        }
    }

    pub fn load_index_bucket(&self, blob: &[u8]) -> Result<usize, String> {
        self.index
            .load_bucket(blob, || self.next_part_id.fetch_add(1, Ordering::SeqCst))
    }

    // ---- stream bookkeeping ---------------------------------------------

    pub fn try_claim_stream(&self) -> bool {
        self.stream_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn stream_done(&self) {
        self.stream_active.store(false, Ordering::SeqCst);
    }

    // ---- teardown -------------------------------------------------------

    pub fn drain_flushes(&self, timeout: Duration) -> bool {
        self.pipeline.drain(timeout)
    }

    /// Evicts every partition and clears the index, returning all native
    /// regions to the arena.
    pub fn release_buffers(&self) {
        for partition in self.table.clear() {
            partition.evict();
        }
        self.index.clear();
    }

    /// Drops all in-memory state for the shard; watermarks restart at -1.
    pub fn truncate(&self) {
        self.release_buffers();
        self.watermarks.reset();
        self.latest_offset.store(-1, Ordering::SeqCst);
    }

    /// Stops the ingestion thread (completing the event in progress),
    /// drains the flush pipeline up to `timeout`, and releases buffers.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        {
            self.tx.lock().unwrap().take();
        }
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.ingest_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        let drained = self.pipeline.shutdown(timeout);
        self.release_buffers();
        drained
    }

    pub fn stats(&self) -> ShardStats {
        ShardStats {
            shard: self.shard_num,
            partitions: self.table.len(),
            rows_ingested: self.counters.rows_ingested(),
            rows_dropped: self.counters.rows_dropped(),
            partitions_created: self.counters.partitions_created(),
            partitions_evicted: self.counters.partitions_evicted(),
            flushes_completed: self.counters.flushes_completed(),
            flushes_failed: self.counters.flushes_failed(),
            latest_offset: self.latest_offset(),
            watermarks: self.watermarks.snapshot(),
            pool_bytes_free: self.pool.bytes_free(),
            pool_capacity: self.pool.capacity(),
        }
    }
}
