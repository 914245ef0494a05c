use std::sync::atomic::{AtomicU64, Ordering};

const ORDERING: Ordering = Ordering::SeqCst;

/// Per-shard ingestion and flush counters. Ingestion-thread errors are
/// converted into increments here rather than propagated.
#[derive(Debug, Default)]
pub struct ShardPerfCounter {
    rows_ingested: AtomicU64,
    rows_dropped: AtomicU64,
    rows_out_of_order: AtomicU64,
    batches_ingested: AtomicU64,
    partitions_created: AtomicU64,
    partitions_evicted: AtomicU64,
    flushes_completed: AtomicU64,
    flushes_failed: AtomicU64,
    flush_retries: AtomicU64,
    chunks_flushed: AtomicU64,
}

impl ShardPerfCounter {
    pub fn new() -> ShardPerfCounter {
        ShardPerfCounter::default()
    }

    pub fn row_ingested(&self) {
        self.rows_ingested.fetch_add(1, ORDERING);
    }

    pub fn row_dropped(&self) {
        self.rows_dropped.fetch_add(1, ORDERING);
    }

    pub fn row_out_of_order(&self) {
        self.rows_out_of_order.fetch_add(1, ORDERING);
    }

    pub fn batch_ingested(&self) {
        self.batches_ingested.fetch_add(1, ORDERING);
    }

    pub fn partition_created(&self) {
        self.partitions_created.fetch_add(1, ORDERING);
    }

    pub fn partition_evicted(&self) {
        self.partitions_evicted.fetch_add(1, ORDERING);
    }

    pub fn flush_completed(&self, chunks: u64) {
        self.flushes_completed.fetch_add(1, ORDERING);
        self.chunks_flushed.fetch_add(chunks, ORDERING);
    }

    pub fn flush_failed(&self) {
        self.flushes_failed.fetch_add(1, ORDERING);
    }

    pub fn flush_retried(&self) {
        self.flush_retries.fetch_add(1, ORDERING);
    }

    pub fn rows_ingested(&self) -> u64 {
        self.rows_ingested.load(ORDERING)
    }

    pub fn rows_dropped(&self) -> u64 {
        self.rows_dropped.load(ORDERING)
    }

    pub fn rows_out_of_order(&self) -> u64 {
        self.rows_out_of_order.load(ORDERING)
    }

    pub fn batches_ingested(&self) -> u64 {
        self.batches_ingested.load(ORDERING)
    }

    pub fn partitions_created(&self) -> u64 {
        self.partitions_created.load(ORDERING)
    }

    pub fn partitions_evicted(&self) -> u64 {
        self.partitions_evicted.load(ORDERING)
    }

    pub fn flushes_completed(&self) -> u64 {
        self.flushes_completed.load(ORDERING)
    }

    pub fn flushes_failed(&self) -> u64 {
        self.flushes_failed.load(ORDERING)
    }

    pub fn flush_retries(&self) -> u64 {
        self.flush_retries.load(ORDERING)
    }

    pub fn chunks_flushed(&self) -> u64 {
        self.chunks_flushed.load(ORDERING)
    }
}
