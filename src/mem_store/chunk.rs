use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicBool, Ordering};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};

use crate::errors::{BufferPoolExhausted, ChunkFull};
use crate::ingest::record::RowVal;
use crate::mem_store::buffer_pool::{NativeBufferPool, Region};
use crate::schema::{ColKind, ColumnSpec};

/// Append-buffer budget per row for string columns. A chunk rotates early
/// when a string column outgrows its region.
const STRING_BYTES_PER_ROW: usize = 32;

const KIND_LONG: u8 = 0;
const KIND_DOUBLE: u8 = 1;
const KIND_STR: u8 = 2;

/// An immutable, columnar encoding of a bounded run of rows for one
/// partition. Self-describing: no pointers into the buffer pool, safe to
/// hand to flush tasks and scans concurrently.
///
/// Layout: u32 row count, i64 ts min, i64 ts max, u16 column count, then
/// per column a u8 kind tag, u32 payload length, payload.
pub struct Chunk {
    data: Box<[u8]>,
    rows: usize,
    ts_min: i64,
    ts_max: i64,
    persisted: AtomicBool,
}

impl Chunk {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn time_range(&self) -> (i64, i64) {
        (self.ts_min, self.ts_max)
    }

    pub fn intersects(&self, start: i64, end: i64) -> bool {
        self.ts_min <= end && self.ts_max >= start
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted.load(Ordering::SeqCst)
    }

    pub fn mark_persisted(&self) {
        self.persisted.store(true, Ordering::SeqCst);
    }

    pub fn encoded(&self) -> &[u8] {
        &self.data
    }

    /// Rehydrates a chunk paged in from the durable store. Paged chunks
    /// count as persisted.
    pub fn from_encoded(data: Vec<u8>) -> Result<Chunk, String> {
        if data.len() < 22 {
            return Err("chunk header truncated".to_string());
        }
        let rows = LittleEndian::read_u32(&data[0..4]) as usize;
        let ts_min = LittleEndian::read_i64(&data[4..12]);
        let ts_max = LittleEndian::read_i64(&data[12..20]);
        Ok(Chunk {
            data: data.into_boxed_slice(),
            rows,
            ts_min,
            ts_max,
            persisted: AtomicBool::new(true),
        })
    }

    /// Decodes the chunk back into rows, column-major to row-major.
    pub fn decode_rows(&self) -> Vec<Vec<RowVal>> {
        let mut cursor = Cursor::new(&self.data[..]);
        let rows = cursor.read_u32::<LittleEndian>().unwrap() as usize;
        cursor.read_i64::<LittleEndian>().unwrap();
        cursor.read_i64::<LittleEndian>().unwrap();
        let ncols = cursor.read_u16::<LittleEndian>().unwrap() as usize;
        let mut out: Vec<Vec<RowVal>> = (0..rows).map(|_| Vec::with_capacity(ncols)).collect();
        for _ in 0..ncols {
            let kind = cursor.read_u8().unwrap();
            let _payload_len = cursor.read_u32::<LittleEndian>().unwrap();
            match kind {
                KIND_LONG => {
                    for row in out.iter_mut() {
                        row.push(RowVal::Long(cursor.read_i64::<LittleEndian>().unwrap()));
                    }
                }
                KIND_DOUBLE => {
                    for row in out.iter_mut() {
                        row.push(RowVal::Double(cursor.read_f64::<LittleEndian>().unwrap()));
                    }
                }
                KIND_STR => {
                    for row in out.iter_mut() {
                        let slen = cursor.read_u32::<LittleEndian>().unwrap() as usize;
                        let mut buf = vec![0u8; slen];
                        cursor.read_exact(&mut buf).unwrap();
                        row.push(RowVal::Str(String::from_utf8(buf).unwrap()));
                    }
                }
                _ => panic!("Unknown column kind tag {} in chunk!", kind),
            }
        }
        out
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("rows", &self.rows)
            .field("ts_min", &self.ts_min)
            .field("ts_max", &self.ts_max)
            .field("persisted", &self.is_persisted())
            .finish()
    }
}

enum ColBuffer {
    Long { region: Region },
    Double { region: Region },
    Str { region: Region, used: usize },
}

/// Per-column append buffers for one partition's active chunk, backed by
/// pool regions sized to `max_rows`. Freezing encodes the buffered rows
/// into an immutable [`Chunk`] and recycles the regions.
pub struct ChunkBuilder {
    max_rows: usize,
    rows: usize,
    ts_min: i64,
    ts_max: i64,
    cols: Vec<ColBuffer>,
}

impl ChunkBuilder {
    pub fn new(
        data_columns: &[ColumnSpec],
        max_rows: usize,
        pool: &NativeBufferPool,
    ) -> Result<ChunkBuilder, BufferPoolExhausted> {
        let mut cols = Vec::with_capacity(data_columns.len());
        for col in data_columns {
            let buffer = match col.kind {
                ColKind::Long => ColBuffer::Long {
                    region: pool.allocate(max_rows * 8)?,
                },
                ColKind::Double => ColBuffer::Double {
                    region: pool.allocate(max_rows * 8)?,
                },
                ColKind::Str => ColBuffer::Str {
                    region: pool.allocate(max_rows * STRING_BYTES_PER_ROW)?,
                    used: 0,
                },
                ColKind::Map => panic!("Unexpected map data column!"),
            };
            cols.push(buffer);
        }
        Ok(ChunkBuilder {
            max_rows,
            rows: 0,
            ts_min: i64::MAX,
            ts_max: i64::MIN,
            cols,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Appends one value per data column. The caller has already validated
    /// the row against the dataset schema.
    pub fn append(&mut self, row: &[RowVal]) -> Result<(), ChunkFull> {
        if self.rows >= self.max_rows {
            return Err(ChunkFull);
        }
        // Variable-width columns can run out of region before the row cap;
        // check before mutating anything so the append stays atomic.
        for (col, val) in self.cols.iter().zip(row) {
            if let (ColBuffer::Str { region, used }, RowVal::Str(s)) = (col, val) {
                if used + 4 + s.len() > region.capacity() {
                    return Err(ChunkFull);
                }
            }
        }
        let at = self.rows;
        for (col, val) in self.cols.iter_mut().zip(row) {
            match (col, val) {
                (ColBuffer::Long { region }, RowVal::Long(v)) => {
                    LittleEndian::write_i64(&mut region.as_mut_slice()[at * 8..], *v);
                }
                (ColBuffer::Double { region }, RowVal::Double(v)) => {
                    LittleEndian::write_f64(&mut region.as_mut_slice()[at * 8..], *v);
                }
                (ColBuffer::Double { region }, RowVal::Long(v)) => {
                    LittleEndian::write_f64(&mut region.as_mut_slice()[at * 8..], *v as f64);
                }
                (ColBuffer::Str { region, used }, RowVal::Str(s)) => {
                    let slice = region.as_mut_slice();
                    LittleEndian::write_u32(&mut slice[*used..], s.len() as u32);
                    slice[*used + 4..*used + 4 + s.len()].copy_from_slice(s.as_bytes());
                    *used += 4 + s.len();
                }
                _ => panic!("Unexpected value type for column!"),
            }
        }
        if let Some(ts) = row.first().and_then(RowVal::as_long) {
            self.ts_min = self.ts_min.min(ts);
            self.ts_max = self.ts_max.max(ts);
        }
        self.rows += 1;
        Ok(())
    }

    /// Highest row-key value appended so far.
    pub fn last_row_key(&self) -> Option<i64> {
        if self.rows == 0 {
            None
        } else {
            Some(self.ts_max)
        }
    }

    /// Row-key range of the buffered rows.
    pub fn time_range(&self) -> Option<(i64, i64)> {
        if self.rows == 0 {
            None
        } else {
            Some((self.ts_min, self.ts_max))
        }
    }

    fn encode(&self) -> Chunk {
        let mut data = Vec::with_capacity(22 + self.cols.len() * (5 + self.rows * 8));
        data.extend_from_slice(&(self.rows as u32).to_le_bytes());
        data.extend_from_slice(&self.ts_min.to_le_bytes());
        data.extend_from_slice(&self.ts_max.to_le_bytes());
        data.extend_from_slice(&(self.cols.len() as u16).to_le_bytes());
        for col in &self.cols {
            let (kind, payload): (u8, &[u8]) = match col {
                ColBuffer::Long { region } => (KIND_LONG, &region.as_slice()[..self.rows * 8]),
                ColBuffer::Double { region } => (KIND_DOUBLE, &region.as_slice()[..self.rows * 8]),
                ColBuffer::Str { region, used } => (KIND_STR, &region.as_slice()[..*used]),
            };
            data.push(kind);
            data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            data.extend_from_slice(payload);
        }
        Chunk {
            data: data.into_boxed_slice(),
            rows: self.rows,
            ts_min: self.ts_min,
            ts_max: self.ts_max,
            persisted: AtomicBool::new(false),
        }
    }

    /// Point-in-time copy of the buffered rows for readers. Does not
    /// consume the builder.
    pub fn snapshot(&self) -> Option<Chunk> {
        if self.rows == 0 {
            None
        } else {
            Some(self.encode())
        }
    }

    /// Encodes the buffered rows into an immutable chunk and returns the
    /// append regions to the pool. Empty builders freeze to nothing.
    pub fn freeze(self) -> Option<Chunk> {
        if self.rows == 0 {
            None
        } else {
            Some(self.encode())
        }
        // Regions recycle when `self` drops.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSpec;

    fn data_columns() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new("timestamp", ColKind::Long),
            ColumnSpec::new("value", ColKind::Double),
        ]
    }

    fn row(ts: i64, v: f64) -> Vec<RowVal> {
        vec![RowVal::Long(ts), RowVal::Double(v)]
    }

    #[test]
    fn test_append_freeze_decode() {
        let pool = NativeBufferPool::new(1 << 20, vec![]);
        let mut builder = ChunkBuilder::new(&data_columns(), 16, &pool).unwrap();
        builder.append(&row(1, 1.0)).unwrap();
        builder.append(&row(2, 2.0)).unwrap();
        let chunk = builder.freeze().unwrap();
        assert_eq!(chunk.rows(), 2);
        assert_eq!(chunk.time_range(), (1, 2));
        assert_eq!(chunk.decode_rows(), vec![row(1, 1.0), row(2, 2.0)]);
        // All regions returned.
        assert_eq!(pool.bytes_free(), pool.capacity());
    }

    #[test]
    fn test_chunk_full_at_row_cap() {
        let pool = NativeBufferPool::new(1 << 20, vec![]);
        let mut builder = ChunkBuilder::new(&data_columns(), 2, &pool).unwrap();
        builder.append(&row(1, 1.0)).unwrap();
        builder.append(&row(2, 2.0)).unwrap();
        assert_eq!(builder.append(&row(3, 3.0)), Err(ChunkFull));
    }

    #[test]
    fn test_string_region_overflow_rotates_early() {
        let pool = NativeBufferPool::new(1 << 20, vec![]);
        let cols = vec![
            ColumnSpec::new("timestamp", ColKind::Long),
            ColumnSpec::new("unit", ColKind::Str),
        ];
        let mut builder = ChunkBuilder::new(&cols, 1024, &pool).unwrap();
        let big = "x".repeat(20_000);
        let mut appended = 0;
        loop {
            let row = vec![RowVal::Long(appended as i64), RowVal::Str(big.clone())];
            match builder.append(&row) {
                Ok(()) => appended += 1,
                Err(ChunkFull) => break,
            }
        }
        assert!(appended > 0);
        assert!(appended < 1024);
        assert_eq!(builder.rows(), appended);
    }

    #[test]
    fn test_round_trip_through_encoding() {
        let pool = NativeBufferPool::new(1 << 20, vec![]);
        let mut builder = ChunkBuilder::new(&data_columns(), 16, &pool).unwrap();
        builder.append(&row(5, 0.5)).unwrap();
        let chunk = builder.freeze().unwrap();
        let paged = Chunk::from_encoded(chunk.encoded().to_vec()).unwrap();
        assert!(paged.is_persisted());
        assert_eq!(paged.decode_rows(), chunk.decode_rows());
        assert_eq!(paged.time_range(), (5, 5));
    }

    #[test]
    fn test_snapshot_is_point_in_time() {
        let pool = NativeBufferPool::new(1 << 20, vec![]);
        let mut builder = ChunkBuilder::new(&data_columns(), 16, &pool).unwrap();
        builder.append(&row(1, 1.0)).unwrap();
        let snapshot = builder.snapshot().unwrap();
        builder.append(&row(2, 2.0)).unwrap();
        assert_eq!(snapshot.rows(), 1);
        assert_eq!(builder.snapshot().unwrap().rows(), 2);
    }
}
