use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single data-column value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RowVal {
    Long(i64),
    Double(f64),
    Str(String),
}

impl RowVal {
    pub fn as_long(&self) -> Option<i64> {
        match self {
            RowVal::Long(l) => Some(*l),
            _ => None,
        }
    }
}

/// A partition-column value. Maps use `BTreeMap` so the key encoding is
/// deterministic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartVal {
    Str(String),
    Map(BTreeMap<String, String>),
}

impl PartVal {
    pub fn map(entries: &[(&str, &str)]) -> PartVal {
        PartVal::Map(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

/// One record of an ingestion batch: the partition-column values that
/// identify the series, and one value per data column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub part_vals: Vec<PartVal>,
    pub row: Vec<RowVal>,
}

impl Record {
    /// Value of the leading row-key column.
    pub fn row_key(&self) -> Option<i64> {
        self.row.first().and_then(RowVal::as_long)
    }
}

/// A columnar batch of records tagged with its source offset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordBatch {
    pub records: Vec<Record>,
    pub offset: i64,
}

impl RecordBatch {
    pub fn new(records: Vec<Record>, offset: i64) -> RecordBatch {
        RecordBatch { records, offset }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
