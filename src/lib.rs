#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

pub mod errors;
pub mod ingest;
pub mod mem_store;
mod memstore;
pub mod observability;
pub mod schema;
pub mod shard;
pub mod store;

pub use crate::errors::{MemStoreError, StoreError, StreamError};
pub use crate::ingest::record::{PartVal, Record, RecordBatch, RowVal};
pub use crate::ingest::stream::{
    FlushStream, IngestionStream, IngestionStreamFactory, VecIngestionStream,
};
pub use crate::mem_store::eviction::{EvictionPolicy, PoolState, WriteBufferFreeEvictionPolicy};
pub use crate::mem_store::part_key_index::{FilterOp, LabelFilter};
pub use crate::memstore::{
    IngestionHandle, MemStore, PartitionScans, RecoveryProgress, ScannedPartition, StoreConfig,
};
pub use crate::schema::{ColKind, ColumnSpec, Dataset};
pub use crate::shard::{FlushCommand, ShardStats};
pub use crate::store::{
    ChunkScanMethod, ColumnStore, DownsamplePublisher, DownsampleRecord, FlushChunk,
    MemColumnStore, MemMetaStore, MetaStore, NoopColumnStore, NoopPublisher,
    PartitionScanMethod, RawPartData, RecordingPublisher,
};
