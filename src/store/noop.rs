use crate::errors::StoreError;
use crate::store::{
    ChunkScanMethod, ColumnStore, DownsamplePublisher, DownsampleRecord, FlushChunk,
    PartitionScanMethod, RawPartData,
};

/// Discards everything. Useful when running purely in-memory.
pub struct NoopColumnStore;

impl ColumnStore for NoopColumnStore {
    fn write_chunks(
        &self,
        _dataset: &str,
        _shard: u32,
        _group: u32,
        _offset: i64,
        _chunks: &[FlushChunk],
        _ttl_seconds: i64,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    fn write_index_time_bucket(
        &self,
        _dataset: &str,
        _shard: u32,
        _group: u32,
        _offset: i64,
        _bucket: &[u8],
    ) -> Result<(), StoreError> {
        Ok(())
    }

    fn read_raw_partitions(
        &self,
        _dataset: &str,
        _column_ids: &[usize],
        _part: &PartitionScanMethod,
        _chunk: &ChunkScanMethod,
    ) -> Result<Vec<RawPartData>, StoreError> {
        Ok(Vec::new())
    }

    fn scan_index_buckets(&self, _dataset: &str, _shard: u32) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(Vec::new())
    }

    fn truncate(&self, _dataset: &str) -> Result<(), StoreError> {
        Ok(())
    }

    fn reset(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

pub struct NoopPublisher;

impl DownsamplePublisher for NoopPublisher {
    fn start(&self) {}
    fn publish(&self, _records: Vec<DownsampleRecord>) {}
    fn stop(&self) {}
}
