use prometheus::{register_counter, register_gauge};
use prometheus::{Counter, Gauge};

lazy_static! {
    pub static ref INGESTED_ROW_COUNT: Counter =
        register_counter!("ingested_row_count", "Number of rows ingested").unwrap();
    pub static ref DROPPED_ROW_COUNT: Counter =
        register_counter!("dropped_row_count", "Number of rows dropped during ingestion").unwrap();
    pub static ref OUT_OF_ORDER_ROW_COUNT: Counter = register_counter!(
        "out_of_order_row_count",
        "Number of rows dropped for violating row key order"
    )
    .unwrap();
    pub static ref PARTITION_CREATE_COUNT: Counter =
        register_counter!("partition_create_count", "Number of partitions created").unwrap();
    pub static ref PARTITION_EVICT_COUNT: Counter =
        register_counter!("partition_evict_count", "Number of partitions evicted").unwrap();
    pub static ref FLUSH_COMPLETED_COUNT: Counter =
        register_counter!("flush_completed_count", "Number of flush tasks completed").unwrap();
    pub static ref FLUSH_FAILED_COUNT: Counter =
        register_counter!("flush_failed_count", "Number of flush tasks that failed permanently")
            .unwrap();
    pub static ref FLUSH_RETRY_COUNT: Counter =
        register_counter!("flush_retry_count", "Number of flush attempts retried").unwrap();
    pub static ref CHUNKS_FLUSHED_COUNT: Counter =
        register_counter!("chunks_flushed_count", "Number of chunks written to the column store")
            .unwrap();
    pub static ref BUFFER_POOL_FREE_BYTES: Gauge =
        register_gauge!("buffer_pool_free_bytes", "Free bytes in the write buffer pool").unwrap();
}
