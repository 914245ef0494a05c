use std::sync::Arc;

use itertools::Itertools;

use crate::mem_store::partition::Partition;

/// Telemetry snapshot of the buffer pool handed to the policy.
#[derive(Clone, Copy, Debug)]
pub struct PoolState {
    pub capacity: usize,
    pub bytes_free: usize,
    pub min_write_buffers_free: usize,
}

/// Decides which partitions to evict when the write-buffer pool runs
/// tight. Pluggable per shard.
pub trait EvictionPolicy: Send + Sync {
    fn should_evict(&self, pool: &PoolState) -> bool;

    /// Up to `n` victims from the candidate set. Must skip partitions that
    /// are currently flushing.
    fn select_victims(&self, candidates: &[Arc<Partition>], n: usize) -> Vec<Arc<Partition>>;
}

/// Default policy: evict while pool free bytes are below the configured
/// threshold, preferring the partitions that have not ingested for the
/// longest, ties broken lexicographically on the partition key.
#[derive(Default)]
pub struct WriteBufferFreeEvictionPolicy;

impl EvictionPolicy for WriteBufferFreeEvictionPolicy {
    fn should_evict(&self, pool: &PoolState) -> bool {
        pool.bytes_free < pool.min_write_buffers_free
    }

    fn select_victims(&self, candidates: &[Arc<Partition>], n: usize) -> Vec<Arc<Partition>> {
        candidates
            .iter()
            .filter(|p| !p.is_flushing())
            .sorted_by(|a, b| {
                a.last_ingest()
                    .cmp(&b.last_ingest())
                    .then_with(|| a.key().cmp(b.key()))
            })
            .take(n)
            .cloned()
            .collect()
    }
}
