use std::collections::{HashMap, VecDeque};

use crate::errors::StreamError;
use crate::ingest::record::RecordBatch;
use crate::schema::Dataset;
use crate::shard::FlushCommand;

pub type BatchResult = Result<RecordBatch, StreamError>;

/// A restartable, lazy sequence of record batches. Errors surface as a
/// terminal `Err` item; the stream ends after it.
pub trait IngestionStream: Iterator<Item = BatchResult> + Send {}

impl<T: Iterator<Item = BatchResult> + Send> IngestionStream for T {}

/// Source of flush commands, merged with the data stream by arrival order.
pub trait FlushStream: Iterator<Item = FlushCommand> + Send {}

impl<T: Iterator<Item = FlushCommand> + Send> FlushStream for T {}

/// Creates ingestion streams for a shard, optionally restarting from a
/// source offset. `config` is a free-form keyed map; recognized keys are
/// stream-type-specific.
pub trait IngestionStreamFactory: Send + Sync {
    fn create(
        &self,
        config: &HashMap<String, String>,
        dataset: &Dataset,
        shard_num: u32,
        offset: Option<i64>,
    ) -> Box<dyn IngestionStream>;
}

/// In-memory stream over pre-built batches. Used by tests and embedders;
/// the Kafka/CSV adapters live outside this crate.
pub struct VecIngestionStream {
    batches: VecDeque<RecordBatch>,
    terminal_error: Option<StreamError>,
}

impl VecIngestionStream {
    pub fn new(batches: Vec<RecordBatch>) -> VecIngestionStream {
        VecIngestionStream {
            batches: batches.into(),
            terminal_error: None,
        }
    }

    /// Stream that yields all batches and then fails.
    pub fn failing(batches: Vec<RecordBatch>, error: StreamError) -> VecIngestionStream {
        VecIngestionStream {
            batches: batches.into(),
            terminal_error: Some(error),
        }
    }

    pub fn restarted_from(mut self, offset: i64) -> VecIngestionStream {
        self.batches.retain(|b| b.offset >= offset);
        self
    }
}

impl Iterator for VecIngestionStream {
    type Item = BatchResult;

    fn next(&mut self) -> Option<BatchResult> {
        match self.batches.pop_front() {
            Some(batch) => Some(Ok(batch)),
            None => self.terminal_error.take().map(Err),
        }
    }
}
