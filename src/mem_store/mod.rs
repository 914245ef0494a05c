pub mod buffer_pool;
pub mod chunk;
pub mod eviction;
pub mod part_key;
pub mod part_key_index;
pub mod partition;
pub mod partition_table;

pub use self::buffer_pool::{NativeBufferPool, Region};
pub use self::chunk::{Chunk, ChunkBuilder};
pub use self::eviction::{EvictionPolicy, PoolState, WriteBufferFreeEvictionPolicy};
pub use self::part_key::{PartKeyCodec, PartKeyType};
pub use self::part_key_index::{FilterOp, IndexBucket, LabelFilter, PartitionKeyIndex};
pub use self::partition::{Partition, PartitionId, PartitionState};
pub use self::partition_table::PartitionTable;
