use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use rand::Rng;

use crate::errors::StoreError;
use crate::mem_store::chunk::Chunk;
use crate::mem_store::partition::Partition;
use crate::observability::{metrics, ShardPerfCounter};
use crate::shard::GroupWatermarks;
use crate::store::{ColumnStore, DownsamplePublisher, DownsampleRecord, FlushChunk};

/// Attempts per flush task before a transient store failure is treated as
/// permanent for this cycle. The group is retried on its next flush.
pub const MAX_FLUSH_ATTEMPTS: usize = 3;

/// One frozen chunk of one partition, headed for the column store.
pub struct FlushItem {
    pub partition: Arc<Partition>,
    pub chunk: Arc<Chunk>,
}

/// The flush unit for one group of one shard, addressed by
/// `(shard, group, offset)`.
pub struct FlushGroup {
    pub shard: u32,
    pub group: u32,
    pub offset: i64,
    pub ttl_seconds: i64,
    pub bucket: Option<Vec<u8>>,
    pub items: Vec<FlushItem>,
}

struct TaskQueue {
    pending: VecDeque<FlushGroup>,
    in_flight: HashSet<u32>,
    outstanding: usize,
}

struct PipelineShared {
    dataset: String,
    shard: u32,
    store: Arc<dyn ColumnStore>,
    publisher: Arc<dyn DownsamplePublisher>,
    watermarks: Arc<GroupWatermarks>,
    counters: Arc<ShardPerfCounter>,
    chunks_to_keep: usize,
    queue: Mutex<TaskQueue>,
    queue_changed: Condvar,
    running: AtomicBool,
    // Set when a drain timed out: late completions must not advance
    // watermarks anymore.
    abandon_inflight: AtomicBool,
}

/// Runs up to `flush_task_parallelism` flush tasks concurrently on a
/// dedicated worker pool. Tasks for different groups commit out of order;
/// tasks for the same group are serialized. The submission channel is
/// bounded, so a full pipeline back-pressures the ingestion thread.
pub struct FlushPipeline {
    shared: Arc<PipelineShared>,
    tx: Mutex<Option<SyncSender<FlushGroup>>>,
}

impl FlushPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dataset: &str,
        shard: u32,
        parallelism: usize,
        chunks_to_keep: usize,
        store: Arc<dyn ColumnStore>,
        publisher: Arc<dyn DownsamplePublisher>,
        watermarks: Arc<GroupWatermarks>,
        counters: Arc<ShardPerfCounter>,
    ) -> FlushPipeline {
        let parallelism = parallelism.max(1);
        let shared = Arc::new(PipelineShared {
            dataset: dataset.to_string(),
            shard,
            store,
            publisher,
            watermarks,
            counters,
            chunks_to_keep,
            queue: Mutex::new(TaskQueue {
                pending: VecDeque::new(),
                in_flight: HashSet::new(),
                outstanding: 0,
            }),
            queue_changed: Condvar::new(),
            running: AtomicBool::new(true),
            abandon_inflight: AtomicBool::new(false),
        });
        let (tx, rx) = mpsc::sync_channel::<FlushGroup>(parallelism * 2);
        let feeder = shared.clone();
        thread::spawn(move || {
            while let Ok(task) = rx.recv() {
                let mut queue = feeder.queue.lock().unwrap();
                queue.pending.push_back(task);
                feeder.queue_changed.notify_all();
            }
        });
        for _ in 0..parallelism {
            let worker = shared.clone();
            thread::spawn(move || FlushPipeline::worker_loop(worker));
        }
        FlushPipeline {
            shared,
            tx: Mutex::new(Some(tx)),
        }
    }

    /// Enqueues a flush task. Blocks the caller (the ingestion thread)
    /// while the pipeline queue is full.
    pub fn submit(&self, task: FlushGroup) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.outstanding += 1;
        }
        let tx = self.tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) => {
                if tx.send(task).is_err() {
                    self.submission_failed();
                }
            }
            None => {
                warn!(
                    "flush pipeline of shard {} already shut down, dropping task",
                    self.shared.shard
                );
                self.submission_failed();
            }
        }
    }

    fn submission_failed(&self) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.outstanding -= 1;
        self.shared.queue_changed.notify_all();
    }

    /// Waits until every submitted task has completed, up to `timeout`.
    /// On expiry, in-flight tasks are abandoned: they finish their store
    /// writes but no longer advance watermarks.
    pub fn drain(&self, timeout: Duration) -> bool {
        let queue = self.shared.queue.lock().unwrap();
        let (queue, result) = self
            .shared
            .queue_changed
            .wait_timeout_while(queue, timeout, |q| q.outstanding > 0)
            .unwrap();
        if result.timed_out() && queue.outstanding > 0 {
            warn!(
                "flush drain of shard {} timed out with {} tasks outstanding",
                self.shared.shard, queue.outstanding
            );
            self.shared.abandon_inflight.store(true, Ordering::SeqCst);
            false
        } else {
            true
        }
    }

    /// Stops accepting tasks, drains up to `timeout`, and winds the
    /// workers down.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.tx.lock().unwrap().take();
        let drained = self.drain(timeout);
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.queue_changed.notify_all();
        drained
    }

    fn worker_loop(shared: Arc<PipelineShared>) {
        loop {
            let task = {
                let mut queue = shared.queue.lock().unwrap();
                loop {
                    let position = {
                        let in_flight = &queue.in_flight;
                        queue
                            .pending
                            .iter()
                            .position(|t| !in_flight.contains(&t.group))
                    };
                    if let Some(position) = position {
                        let task = queue.pending.remove(position).unwrap();
                        queue.in_flight.insert(task.group);
                        break task;
                    }
                    if !shared.running.load(Ordering::SeqCst) {
                        return;
                    }
                    queue = shared.queue_changed.wait(queue).unwrap();
                }
            };
            let group = task.group;
            run_flush_task(&shared, task);
            let mut queue = shared.queue.lock().unwrap();
            queue.in_flight.remove(&group);
            queue.outstanding -= 1;
            shared.queue_changed.notify_all();
        }
    }
}

fn run_flush_task(shared: &PipelineShared, task: FlushGroup) {
    debug!(
        "flushing shard {} group {} at offset {}: {} chunks",
        shared.shard,
        task.group,
        task.offset,
        task.items.len()
    );
    let result = write_with_retry(shared, &task);

    // A partition can contribute several chunks to one task.
    let mut partitions: Vec<&Arc<Partition>> = Vec::new();
    let mut seen = HashSet::new();
    for item in &task.items {
        if seen.insert(item.partition.id()) {
            partitions.push(&item.partition);
        }
    }

    match result {
        Ok(()) => {
            for item in &task.items {
                item.chunk.mark_persisted();
            }
            for partition in &partitions {
                partition.flush_complete(shared.chunks_to_keep);
            }
            if shared.abandon_inflight.load(Ordering::SeqCst) {
                warn!(
                    "flush of shard {} group {} completed after drain timeout, leaving watermark unchanged",
                    shared.shard, task.group
                );
            } else {
                shared.watermarks.advance(task.group, task.offset);
                let records: Vec<DownsampleRecord> = task
                    .items
                    .iter()
                    .map(|item| {
                        let (ts_min, ts_max) = item.chunk.time_range();
                        DownsampleRecord {
                            part_key: item.partition.key().to_vec(),
                            ts_min,
                            ts_max,
                            rows: item.chunk.rows(),
                        }
                    })
                    .collect();
                if !records.is_empty() {
                    shared.publisher.publish(records);
                }
            }
            shared.counters.flush_completed(task.items.len() as u64);
            metrics::FLUSH_COMPLETED_COUNT.inc();
            metrics::CHUNKS_FLUSHED_COUNT.inc_by(task.items.len() as f64);
        }
        Err(e) => {
            error!(
                "flush of shard {} group {} at offset {} failed: {}",
                shared.shard, task.group, task.offset, e
            );
            // The watermark stays put; the group's next flush re-snapshots
            // the unflushed chunks.
            for partition in &partitions {
                partition.flush_complete(shared.chunks_to_keep);
            }
            shared.counters.flush_failed();
            metrics::FLUSH_FAILED_COUNT.inc();
        }
    }
}

fn write_with_retry(shared: &PipelineShared, task: &FlushGroup) -> Result<(), StoreError> {
    if task.items.is_empty() && task.bucket.is_none() {
        // No-op flush: nothing to persist, but the watermark still moves.
        return Ok(());
    }
    let mut backoff = Backoff::new(
        Duration::from_millis(50),
        Duration::from_secs(5),
        3.0,
    );
    let mut attempt = 1;
    loop {
        match write_once(shared, task) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < MAX_FLUSH_ATTEMPTS => {
                warn!(
                    "transient flush failure for shard {} group {} (attempt {}/{}): {}",
                    shared.shard, task.group, attempt, MAX_FLUSH_ATTEMPTS, e
                );
                shared.counters.flush_retried();
                metrics::FLUSH_RETRY_COUNT.inc();
                thread::sleep(backoff.next());
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn write_once(shared: &PipelineShared, task: &FlushGroup) -> Result<(), StoreError> {
    if !task.items.is_empty() {
        let chunks: Vec<FlushChunk> = task
            .items
            .iter()
            .map(|item| FlushChunk {
                part_key: item.partition.key().to_vec(),
                data: item.chunk.encoded().to_vec(),
            })
            .collect();
        shared.store.write_chunks(
            &shared.dataset,
            shared.shard,
            task.group,
            task.offset,
            &chunks,
            task.ttl_seconds,
        )?;
    }
    if let Some(bucket) = &task.bucket {
        shared.store.write_index_time_bucket(
            &shared.dataset,
            shared.shard,
            task.group,
            task.offset,
            bucket,
        )?;
    }
    Ok(())
}

/// Exponential backoff with jitter for transient store failures.
pub struct Backoff {
    init_secs: f64,
    next_secs: f64,
    max_secs: f64,
    base: f64,
}

impl Backoff {
    pub fn new(init: Duration, max: Duration, base: f64) -> Backoff {
        let init_secs = init.as_secs_f64();
        Backoff {
            init_secs,
            next_secs: init_secs,
            max_secs: max.as_secs_f64(),
            base,
        }
    }

    /// The next duration to sleep for.
    pub fn next(&mut self) -> Duration {
        let jittered = rand::rng().random_range(self.init_secs..self.next_secs * self.base);
        let next = self.max_secs.min(jittered);
        Duration::from_secs_f64(std::mem::replace(&mut self.next_secs, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_starts_at_init() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10), 3.0);
        assert_eq!(backoff.next(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_is_bounded() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(2), 3.0);
        for _ in 0..20 {
            let d = backoff.next();
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_secs(2));
        }
    }
}
