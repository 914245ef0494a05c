use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::ingest::record::PartVal;
use crate::schema::{ColKind, Dataset};

/// Shape of a dataset's partition key. Single-column keys skip the
/// composite dispatch; both variants share the same per-value wire format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartKeyType {
    Scalar(ColKind),
    Composite(Vec<ColKind>),
}

/// A record whose partition values do not match the dataset's partition
/// schema, or key bytes that cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedKey(pub String);

/// Encodes partition-column values into the opaque byte sequence whose
/// byte-wise equality and hash identify a partition, and back.
#[derive(Clone, Debug)]
pub struct PartKeyCodec {
    kind: PartKeyType,
    column_names: Vec<String>,
}

impl PartKeyCodec {
    pub fn for_dataset(dataset: &Dataset) -> PartKeyCodec {
        let kinds: Vec<ColKind> = dataset.partition_columns.iter().map(|c| c.kind).collect();
        let kind = if kinds.len() == 1 {
            PartKeyType::Scalar(kinds[0])
        } else {
            PartKeyType::Composite(kinds)
        };
        PartKeyCodec {
            kind,
            column_names: dataset
                .partition_columns
                .iter()
                .map(|c| c.name.clone())
                .collect(),
        }
    }

    pub fn key_type(&self) -> &PartKeyType {
        &self.kind
    }

    fn kinds(&self) -> &[ColKind] {
        match &self.kind {
            PartKeyType::Scalar(kind) => std::slice::from_ref(kind),
            PartKeyType::Composite(kinds) => kinds,
        }
    }

    pub fn encode(&self, vals: &[PartVal]) -> Result<Vec<u8>, MalformedKey> {
        let kinds = self.kinds();
        if vals.len() != kinds.len() {
            return Err(MalformedKey(format!(
                "expected {} partition values, got {}",
                kinds.len(),
                vals.len()
            )));
        }
        let mut out = Vec::with_capacity(32);
        for (val, kind) in vals.iter().zip(kinds) {
            match (val, kind) {
                (PartVal::Str(s), ColKind::Str) => {
                    write_str(&mut out, s)?;
                }
                (PartVal::Map(m), ColKind::Map) => {
                    if m.len() > u16::MAX as usize {
                        return Err(MalformedKey("tag map too large".to_string()));
                    }
                    out.write_u16::<LittleEndian>(m.len() as u16).unwrap();
                    for (k, v) in m {
                        write_str(&mut out, k)?;
                        write_str(&mut out, v)?;
                    }
                }
                (val, kind) => {
                    return Err(MalformedKey(format!(
                        "partition value {:?} does not match column kind {:?}",
                        val, kind
                    )))
                }
            }
        }
        Ok(out)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<PartVal>, MalformedKey> {
        let mut cursor = Cursor::new(bytes);
        let mut vals = Vec::with_capacity(self.kinds().len());
        for kind in self.kinds() {
            match kind {
                ColKind::Str => vals.push(PartVal::Str(read_str(&mut cursor)?)),
                ColKind::Map => {
                    let entries = cursor
                        .read_u16::<LittleEndian>()
                        .map_err(|_| truncated())?;
                    let mut map = BTreeMap::new();
                    for _ in 0..entries {
                        let k = read_str(&mut cursor)?;
                        let v = read_str(&mut cursor)?;
                        map.insert(k, v);
                    }
                    vals.push(PartVal::Map(map));
                }
                kind => {
                    return Err(MalformedKey(format!(
                        "column kind {:?} is not a valid partition key component",
                        kind
                    )))
                }
            }
        }
        if cursor.position() != bytes.len() as u64 {
            return Err(MalformedKey("trailing bytes after partition key".to_string()));
        }
        Ok(vals)
    }

    /// Label pairs fed to the partition key index: scalar columns map to a
    /// single `(column, value)` pair, tag maps contribute one pair per entry.
    pub fn labels(&self, vals: &[PartVal]) -> Vec<(String, String)> {
        let mut labels = Vec::new();
        for (val, name) in vals.iter().zip(&self.column_names) {
            match val {
                PartVal::Str(s) => labels.push((name.clone(), s.clone())),
                PartVal::Map(m) => {
                    for (k, v) in m {
                        labels.push((k.clone(), v.clone()));
                    }
                }
            }
        }
        labels
    }
}

pub fn hash_key(bytes: &[u8]) -> u64 {
    seahash::hash(bytes)
}

pub fn group_of(key_hash: u64, groups_per_shard: u32) -> u32 {
    (key_hash % groups_per_shard as u64) as u32
}

fn write_str(out: &mut Vec<u8>, s: &str) -> Result<(), MalformedKey> {
    if s.len() > u16::MAX as usize {
        return Err(MalformedKey("partition key component too large".to_string()));
    }
    out.write_u16::<LittleEndian>(s.len() as u16).unwrap();
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn read_str(cursor: &mut Cursor<&[u8]>) -> Result<String, MalformedKey> {
    let len = cursor.read_u16::<LittleEndian>().map_err(|_| truncated())? as usize;
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf).map_err(|_| truncated())?;
    String::from_utf8(buf).map_err(|_| MalformedKey("partition key is not utf-8".to_string()))
}

fn truncated() -> MalformedKey {
    MalformedKey("truncated partition key".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSpec;

    fn tagged_dataset() -> Dataset {
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
    fn test_scalar_roundtrip() {
        let ds = Dataset::new(
            "metrics",
            vec![ColumnSpec::new("series", ColKind::Str)],
            vec![ColumnSpec::new("timestamp", ColKind::Long)],
            vec![ColumnSpec::new("timestamp", ColKind::Long)],
        );
        let codec = PartKeyCodec::for_dataset(&ds);
        assert_eq!(codec.key_type(), &PartKeyType::Scalar(ColKind::Str));
        let vals = vec![PartVal::Str("cpu_user".to_string())];
        let bytes = codec.encode(&vals).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), vals);
    }

    #[test]
    fn test_map_key_is_order_independent() {
        let codec = PartKeyCodec::for_dataset(&tagged_dataset());
        let a = codec
            .encode(&[PartVal::map(&[("host", "a"), ("dc", "eu")])])
            .unwrap();
        let b = codec
            .encode(&[PartVal::map(&[("dc", "eu"), ("host", "a")])])
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_labels() {
        let codec = PartKeyCodec::for_dataset(&tagged_dataset());
        let labels = codec.labels(&[PartVal::map(&[("host", "a"), ("dc", "eu")])]);
        assert_eq!(
            labels,
            vec![
                ("dc".to_string(), "eu".to_string()),
                ("host".to_string(), "a".to_string())
            ]
        );
    }

    #[test]
    fn test_arity_mismatch_is_malformed() {
        let codec = PartKeyCodec::for_dataset(&tagged_dataset());
        assert!(codec.encode(&[]).is_err());
        assert!(codec
            .encode(&[PartVal::Str("not-a-map".to_string())])
            .is_err());
    }

    #[test]
    fn test_truncated_key_is_malformed() {
        let codec = PartKeyCodec::for_dataset(&tagged_dataset());
        let bytes = codec
            .encode(&[PartVal::map(&[("host", "a")])])
            .unwrap();
        assert!(codec.decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
