use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::errors::{BufferPoolExhausted, ChunkFull};
use crate::ingest::record::RowVal;
use crate::mem_store::buffer_pool::{NativeBufferPool, Region};
use crate::mem_store::chunk::{Chunk, ChunkBuilder};
use crate::schema::ColumnSpec;

pub type PartitionId = u64;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PartitionState {
    Active,
    Flushing,
    Evicted,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IngestOutcome {
    Appended,
    /// Row-key value below the active chunk's last value; the row was
    /// dropped to keep chunks ordered.
    OutOfOrder,
    /// The row does not fit even into a freshly allocated chunk.
    RowTooLarge,
}

struct PartitionInner {
    state: PartitionState,
    active: Option<ChunkBuilder>,
    // Immutable chunk sets, most recent last, bounded to chunks_to_keep
    // once persisted.
    flushed: VecDeque<Arc<Chunk>>,
}

/// Per-series state: the owned partition key in pool memory, the active
/// append chunk, and the frozen chunks not yet trimmed. All mutations
/// happen on the shard's ingestion thread; readers take the inner mutex
/// only long enough to snapshot chunk handles.
pub struct Partition {
    id: PartitionId,
    group_id: u32,
    key_hash: u64,
    key: Region,
    key_len: usize,
    inner: Mutex<PartitionInner>,
    // Logical ingestion tick, used by the eviction policy for ordering.
    last_ingest: AtomicU64,
    ingested_rows: AtomicU64,
    first_offset: AtomicI64,
    last_offset: AtomicI64,
}

impl Partition {
    pub fn new(
        id: PartitionId,
        group_id: u32,
        key_bytes: &[u8],
        pool: &NativeBufferPool,
        created_tick: u64,
    ) -> Result<Partition, BufferPoolExhausted> {
        let mut key = pool.allocate(key_bytes.len().max(1))?;
        key.as_mut_slice()[..key_bytes.len()].copy_from_slice(key_bytes);
        Ok(Partition {
            id,
            group_id,
            key_hash: crate::mem_store::part_key::hash_key(key_bytes),
            key,
            key_len: key_bytes.len(),
            inner: Mutex::new(PartitionInner {
                state: PartitionState::Active,
                active: None,
                flushed: VecDeque::new(),
            }),
            // A new partition counts as just ingested so the eviction
            // policy does not pick it before its first row lands.
            last_ingest: AtomicU64::new(created_tick),
            ingested_rows: AtomicU64::new(0),
            first_offset: AtomicI64::new(-1),
            last_offset: AtomicI64::new(-1),
        })
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn group_id(&self) -> u32 {
        self.group_id
    }

    pub fn key_hash(&self) -> u64 {
        self.key_hash
    }

    pub fn key(&self) -> &[u8] {
        &self.key.as_slice()[..self.key_len]
    }

    pub fn state(&self) -> PartitionState {
        self.inner.lock().unwrap().state
    }

    pub fn is_flushing(&self) -> bool {
        self.state() == PartitionState::Flushing
    }

    pub fn last_ingest(&self) -> u64 {
        self.last_ingest.load(Ordering::SeqCst)
    }

    pub fn ingested_rows(&self) -> u64 {
        self.ingested_rows.load(Ordering::SeqCst)
    }

    pub fn first_offset(&self) -> i64 {
        self.first_offset.load(Ordering::SeqCst)
    }

    pub fn last_offset(&self) -> i64 {
        self.last_offset.load(Ordering::SeqCst)
    }

    /// Appends one row to the active chunk, rotating it when full. Called
    /// on the ingestion thread only. Exhaustion is returned to the caller,
    /// which evicts and retries; the row is not partially applied.
    #[allow(clippy::too_many_arguments)]
    pub fn ingest(
        &self,
        row: &[RowVal],
        offset: i64,
        data_columns: &[ColumnSpec],
        max_rows: usize,
        chunks_to_keep: usize,
        pool: &NativeBufferPool,
        tick: u64,
    ) -> Result<IngestOutcome, BufferPoolExhausted> {
        let mut inner = self.inner.lock().unwrap();
        if inner.active.is_none() {
            inner.active = Some(ChunkBuilder::new(data_columns, max_rows, pool)?);
        }
        let row_key = row.first().and_then(RowVal::as_long);
        if let (Some(ts), Some(last)) = (row_key, inner.active.as_ref().unwrap().last_row_key()) {
            if ts < last {
                return Ok(IngestOutcome::OutOfOrder);
            }
        }
        if let Err(ChunkFull) = inner.active.as_mut().unwrap().append(row) {
            // Rotate: freeze the full chunk and start a fresh one. If the
            // fresh allocation fails the partition is left without an
            // active chunk and the caller retries after eviction.
            let frozen = inner.active.take().unwrap().freeze();
            if let Some(chunk) = frozen {
                inner.flushed.push_back(Arc::new(chunk));
            }
            Self::trim_persisted(&mut inner, chunks_to_keep);
            let mut builder = ChunkBuilder::new(data_columns, max_rows, pool)?;
            let appended = builder.append(row);
            inner.active = Some(builder);
            if appended.is_err() {
                return Ok(IngestOutcome::RowTooLarge);
            }
        }
        drop(inner);
        self.ingested_rows.fetch_add(1, Ordering::SeqCst);
        self.last_ingest.store(tick, Ordering::SeqCst);
        self.last_offset.store(offset, Ordering::SeqCst);
        let _ = self
            .first_offset
            .compare_exchange(-1, offset, Ordering::SeqCst, Ordering::SeqCst);
        Ok(IngestOutcome::Appended)
    }

    /// Freezes the current chunk unconditionally and returns every frozen
    /// chunk that is not yet durably persisted as flush candidates. A fresh
    /// active chunk is allocated lazily by the next ingest.
    pub fn switch_buffers(&self, chunks_to_keep: usize) -> Vec<Arc<Chunk>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(builder) = inner.active.take() {
            if let Some(chunk) = builder.freeze() {
                inner.flushed.push_back(Arc::new(chunk));
            }
        }
        Self::trim_persisted(&mut inner, chunks_to_keep);
        let candidates: Vec<Arc<Chunk>> = inner
            .flushed
            .iter()
            .filter(|c| !c.is_persisted())
            .cloned()
            .collect();
        if !candidates.is_empty() {
            inner.state = PartitionState::Flushing;
        }
        candidates
    }

    /// Called by the flush pipeline when its task for this partition's
    /// group finished (successfully or not). Trims chunks that are now
    /// durable beyond the retention bound and makes the partition
    /// evictable again.
    pub fn flush_complete(&self, chunks_to_keep: usize) {
        let mut inner = self.inner.lock().unwrap();
        Self::trim_persisted(&mut inner, chunks_to_keep);
        if inner.state == PartitionState::Flushing {
            inner.state = PartitionState::Active;
        }
    }

    fn trim_persisted(inner: &mut PartitionInner, chunks_to_keep: usize) {
        while inner.flushed.len() > chunks_to_keep
            && inner.flushed.front().map(|c| c.is_persisted()).unwrap_or(false)
        {
            inner.flushed.pop_front();
        }
    }

    /// Reader-thread safe: chunk handles whose time range intersects the
    /// window, ordered by min row-key, including a point-in-time snapshot
    /// of the active chunk. Handles are reference-counted; the underlying
    /// memory outlives the scan.
    pub fn scan(&self, start: i64, end: i64) -> Vec<Arc<Chunk>> {
        let inner = self.inner.lock().unwrap();
        let mut chunks: Vec<Arc<Chunk>> = inner
            .flushed
            .iter()
            .filter(|c| c.intersects(start, end))
            .cloned()
            .collect();
        if let Some(snapshot) = inner.active.as_ref().and_then(|b| b.snapshot()) {
            if snapshot.intersects(start, end) {
                chunks.push(Arc::new(snapshot));
            }
        }
        chunks
    }

    /// Oldest row-key value still resident, if any.
    pub fn oldest_resident_ts(&self) -> Option<i64> {
        let inner = self.inner.lock().unwrap();
        inner
            .flushed
            .front()
            .map(|c| c.time_range().0)
            .or_else(|| {
                inner
                    .active
                    .as_ref()
                    .and_then(|b| b.time_range())
                    .map(|(min, _)| min)
            })
    }

    /// Drops the append buffers and chunk handles, returning pool regions
    /// to the arena. The partition key region follows when the last
    /// reference (e.g. an outstanding scan) is released.
    pub fn evict(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = PartitionState::Evicted;
        inner.active = None;
        inner.flushed.clear();
    }

    pub fn resident_chunk_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.flushed.len() + inner.active.iter().filter(|b| !b.is_empty()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColKind, ColumnSpec};

    fn cols() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new("timestamp", ColKind::Long),
            ColumnSpec::new("value", ColKind::Double),
        ]
    }

    fn row(ts: i64, v: f64) -> Vec<RowVal> {
        vec![RowVal::Long(ts), RowVal::Double(v)]
    }

    fn partition(pool: &NativeBufferPool) -> Partition {
        Partition::new(1, 0, b"series-a", pool, 0).unwrap()
    }

    #[test]
    fn test_rotation_at_chunk_cap() {
        let pool = NativeBufferPool::new(1 << 20, vec![]);
        let p = partition(&pool);
        for i in 0..5 {
            p.ingest(&row(i, i as f64), i, &cols(), 2, 8, &pool, i as u64 + 1)
                .unwrap();
        }
        // 5 rows at cap 2: two frozen chunks plus an active one.
        assert_eq!(p.resident_chunk_count(), 3);
        assert_eq!(p.ingested_rows(), 5);
        let scanned = p.scan(i64::MIN, i64::MAX);
        let rows: Vec<i64> = scanned
            .iter()
            .flat_map(|c| c.decode_rows())
            .map(|r| r[0].as_long().unwrap())
            .collect();
        assert_eq!(rows, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_out_of_order_row_dropped() {
        let pool = NativeBufferPool::new(1 << 20, vec![]);
        let p = partition(&pool);
        p.ingest(&row(10, 1.0), 0, &cols(), 8, 8, &pool, 1).unwrap();
        let outcome = p
            .ingest(&row(5, 2.0), 1, &cols(), 8, 8, &pool, 2)
            .unwrap();
        assert_eq!(outcome, IngestOutcome::OutOfOrder);
        assert_eq!(p.ingested_rows(), 1);
    }

    #[test]
    fn test_switch_buffers_returns_unpersisted_chunks() {
        let pool = NativeBufferPool::new(1 << 20, vec![]);
        let p = partition(&pool);
        p.ingest(&row(1, 1.0), 0, &cols(), 8, 8, &pool, 1).unwrap();
        let candidates = p.switch_buffers(8);
        assert_eq!(candidates.len(), 1);
        assert!(p.is_flushing());
        // Not yet persisted: the same chunk is a candidate again.
        p.flush_complete(8);
        assert_eq!(p.switch_buffers(8).len(), 1);
        candidates[0].mark_persisted();
        p.flush_complete(8);
        assert!(p.switch_buffers(8).is_empty());
        assert!(!p.is_flushing());
    }

    #[test]
    fn test_trim_keeps_unpersisted_chunks() {
        let pool = NativeBufferPool::new(1 << 20, vec![]);
        let p = partition(&pool);
        for i in 0..8 {
            p.ingest(&row(i, 0.0), i, &cols(), 1, 2, &pool, i as u64 + 1)
                .unwrap();
        }
        // Nothing persisted: every frozen chunk is retained.
        assert!(p.resident_chunk_count() > 2);
        for chunk in p.switch_buffers(2) {
            chunk.mark_persisted();
        }
        p.flush_complete(2);
        let inner_chunks = p.scan(i64::MIN, i64::MAX);
        assert_eq!(inner_chunks.len(), 2);
    }

    #[test]
    fn test_eviction_releases_pool_memory() {
        let pool = NativeBufferPool::new(1 << 20, vec![]);
        let p = partition(&pool);
        p.ingest(&row(1, 1.0), 0, &cols(), 64, 8, &pool, 1).unwrap();
        assert!(pool.bytes_free() < pool.capacity());
        p.evict();
        assert_eq!(p.state(), PartitionState::Evicted);
        drop(p);
        assert_eq!(pool.bytes_free(), pool.capacity());
    }

    #[test]
    fn test_ingest_visible_to_scan_immediately() {
        let pool = NativeBufferPool::new(1 << 20, vec![]);
        let p = partition(&pool);
        p.ingest(&row(7, 0.7), 0, &cols(), 64, 8, &pool, 1).unwrap();
        let chunks = p.scan(7, 7);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].rows(), 1);
    }
}
