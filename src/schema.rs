use serde::{Deserialize, Serialize};

use crate::errors::MemStoreError;

#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum ColKind {
    Long,
    Double,
    Str,
    /// String-to-string tag map. Only valid as a partition column.
    Map,
}

#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColKind,
}

impl ColumnSpec {
    pub fn new(name: &str, kind: ColKind) -> ColumnSpec {
        ColumnSpec {
            name: name.to_string(),
            kind,
        }
    }
}

/// A named schema of partition-key, row-key, and data columns. Immutable
/// after creation; validated once at shard setup.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub partition_columns: Vec<ColumnSpec>,
    pub row_key_columns: Vec<ColumnSpec>,
    pub data_columns: Vec<ColumnSpec>,
}

impl Dataset {
    pub fn new(
        name: &str,
        partition_columns: Vec<ColumnSpec>,
        row_key_columns: Vec<ColumnSpec>,
        data_columns: Vec<ColumnSpec>,
    ) -> Dataset {
        Dataset {
            name: name.to_string(),
            partition_columns,
            row_key_columns,
            data_columns,
        }
    }

    pub fn validate(&self) -> Result<(), MemStoreError> {
        if self.name.is_empty() {
            return Err(MemStoreError::BadSchema("dataset name is empty".to_string()));
        }
        if self.partition_columns.is_empty() {
            return Err(MemStoreError::BadSchema(format!(
                "dataset {} has no partition columns",
                self.name
            )));
        }
        if self.row_key_columns.is_empty() {
            return Err(MemStoreError::BadSchema(format!(
                "dataset {} has no row key columns",
                self.name
            )));
        }
        for col in &self.row_key_columns {
            if col.kind != ColKind::Long {
                return Err(MemStoreError::BadSchema(format!(
                    "row key column {} must be of kind Long",
                    col.name
                )));
            }
        }
        for col in &self.partition_columns {
            if col.kind != ColKind::Str && col.kind != ColKind::Map {
                return Err(MemStoreError::BadSchema(format!(
                    "partition column {} must be of kind Str or Map",
                    col.name
                )));
            }
        }
        for col in &self.data_columns {
            if col.kind == ColKind::Map {
                return Err(MemStoreError::BadSchema(format!(
                    "data column {} cannot be of kind Map",
                    col.name
                )));
            }
        }
        // Row key columns lead the data columns so every chunk carries them.
        if self.data_columns.len() < self.row_key_columns.len()
            || self
                .row_key_columns
                .iter()
                .zip(&self.data_columns)
                .any(|(rk, dc)| rk != dc)
        {
            return Err(MemStoreError::BadSchema(format!(
                "row key columns of dataset {} must be a prefix of its data columns",
                self.name
            )));
        }
        let mut names: Vec<&str> = self
            .partition_columns
            .iter()
            .chain(&self.data_columns)
            .map(|c| c.name.as_str())
            .collect();
        names.sort_unstable();
        for pair in names.windows(2) {
            if pair[0] == pair[1] {
                return Err(MemStoreError::BadSchema(format!(
                    "duplicate column name {}",
                    pair[0]
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts_dataset() -> Dataset {
        Dataset::new(
            "ts",
            vec![ColumnSpec::new("tags", ColKind::Map)],
            vec![ColumnSpec::new("timestamp", ColKind::Long)],
            vec![
                ColumnSpec::new("timestamp", ColKind::Long),
                ColumnSpec::new("value", ColKind::Double),
            ],
        )
    }

    #[test]
    fn test_valid_schema() {
        assert!(ts_dataset().validate().is_ok());
    }

    #[test]
    fn test_row_key_must_be_long() {
        let mut ds = ts_dataset();
        ds.row_key_columns[0].kind = ColKind::Str;
        assert!(ds.validate().is_err());
    }

    #[test]
    fn test_row_key_must_prefix_data_columns() {
        let mut ds = ts_dataset();
        ds.data_columns.swap(0, 1);
        assert!(ds.validate().is_err());
    }

    #[test]
    fn test_map_data_column_rejected() {
        let mut ds = ts_dataset();
        ds.data_columns.push(ColumnSpec::new("extra", ColKind::Map));
        assert!(ds.validate().is_err());
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let mut ds = ts_dataset();
        ds.data_columns.push(ColumnSpec::new("value", ColKind::Double));
        assert!(ds.validate().is_err());
    }
}
