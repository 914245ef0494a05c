use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemStoreError {
    #[error("shard {shard} of dataset {dataset} is already set up")]
    ShardAlreadySetup { dataset: String, shard: u32 },
    #[error("shard {shard} of dataset {dataset} is not assigned to this node")]
    ShardNotAssigned { dataset: String, shard: u32 },
    #[error("an ingestion stream is already active for shard {shard} of dataset {dataset}")]
    StreamAlreadyActive { dataset: String, shard: u32 },
    #[error("invalid dataset schema: {0}")]
    BadSchema(String),
    #[error("index recovery failed: {0}")]
    IndexCorruption(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced by the durable column store. Transient failures are
/// retried by the flush pipeline with backoff, permanent ones abort the
/// flush attempt and leave the group watermark unchanged.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("transient column store failure: {0}")]
    Transient(String),
    #[error("permanent column store failure: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Terminal failure of an ingestion stream, delivered as the final stream
/// event rather than propagated out of the ingestion thread.
#[derive(Error, Debug)]
#[error("ingestion stream failed: {0}")]
pub struct StreamError(pub String);

/// Signalled by the buffer pool when the arena cannot satisfy an
/// allocation. Never crosses the public API: ingestion reacts by evicting
/// and retrying once, then dropping the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolExhausted;

/// Signalled by chunk append buffers when the row cap (or a string region)
/// is reached. Handled internally by rotating the active chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFull;
