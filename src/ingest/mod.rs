pub mod record;
pub mod stream;

pub use self::record::{PartVal, Record, RecordBatch, RowVal};
pub use self::stream::{
    BatchResult, FlushStream, IngestionStream, IngestionStreamFactory, VecIngestionStream,
};
