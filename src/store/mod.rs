pub mod memory;
pub mod noop;

use crate::errors::StoreError;
use crate::mem_store::part_key_index::LabelFilter;
use crate::schema::Dataset;

pub use self::memory::{MemColumnStore, MemMetaStore, RecordingPublisher};
pub use self::noop::{NoopColumnStore, NoopPublisher};

/// How to enumerate partitions for a scan.
#[derive(Clone, Debug)]
pub enum PartitionScanMethod {
    All,
    SinglePartition(Vec<u8>),
    ByFilters(Vec<LabelFilter>),
}

/// Which chunks of each partition to surface.
#[derive(Clone, Copy, Debug)]
pub enum ChunkScanMethod {
    All,
    TimeRange(i64, i64),
}

impl ChunkScanMethod {
    pub fn window(&self) -> (i64, i64) {
        match self {
            ChunkScanMethod::All => (i64::MIN, i64::MAX),
            ChunkScanMethod::TimeRange(start, end) => (*start, *end),
        }
    }
}

/// One partition's encoded chunk in a flush unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlushChunk {
    pub part_key: Vec<u8>,
    pub data: Vec<u8>,
}

/// Raw partition data answered by the durable store: the partition key and
/// its encoded chunks.
#[derive(Clone, Debug)]
pub struct RawPartData {
    pub part_key: Vec<u8>,
    pub chunks: Vec<Vec<u8>>,
}

/// The durable column store. Flush units are addressed by
/// `(dataset, shard, group, offset)` and must be idempotent under retry.
pub trait ColumnStore: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn write_chunks(
        &self,
        dataset: &str,
        shard: u32,
        group: u32,
        offset: i64,
        chunks: &[FlushChunk],
        ttl_seconds: i64,
    ) -> Result<(), StoreError>;

    fn write_index_time_bucket(
        &self,
        dataset: &str,
        shard: u32,
        group: u32,
        offset: i64,
        bucket: &[u8],
    ) -> Result<(), StoreError>;

    fn read_raw_partitions(
        &self,
        dataset: &str,
        column_ids: &[usize],
        part: &PartitionScanMethod,
        chunk: &ChunkScanMethod,
    ) -> Result<Vec<RawPartData>, StoreError>;

    fn scan_index_buckets(&self, dataset: &str, shard: u32) -> Result<Vec<Vec<u8>>, StoreError>;

    fn truncate(&self, dataset: &str) -> Result<(), StoreError>;

    fn reset(&self) -> Result<(), StoreError>;
}

/// Persists dataset and schema metadata.
pub trait MetaStore: Send + Sync {
    fn put_dataset(&self, dataset: &Dataset) -> Result<(), StoreError>;
    fn get_dataset(&self, name: &str) -> Result<Option<Dataset>, StoreError>;
    fn reset(&self) -> Result<(), StoreError>;
}

/// Per-chunk summary published downstream after a successful flush.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownsampleRecord {
    pub part_key: Vec<u8>,
    pub ts_min: i64,
    pub ts_max: i64,
    pub rows: usize,
}

/// Opaque sink for downsampled records. Called from flush threads.
pub trait DownsamplePublisher: Send + Sync {
    fn start(&self);
    fn publish(&self, records: Vec<DownsampleRecord>);
    fn stop(&self);
}
