//! The columnar codec is an explicit external collaborator (see `spec.md` §1, §6):
//! a schema-typed columnar format with zero-copy slicing, concatenation,
//! sort-by-column, and serialize/deserialize to bytes. `ShuffleTable` is the
//! trait boundary the core consumes; `SimpleTable` is a minimal row-oriented
//! reference implementation used by this crate's own tests, standing in for
//! a real columnar engine (arrow, or similar) that an embedding application
//! would supply.

use crate::OutputPartitionId;
use bytes::Bytes;
use std::collections::BTreeMap;

/// ShuffleTable is the boundary the shuffle runtime uses to split, serialize,
/// and reassemble payload data, without depending on a concrete columnar
/// engine. Implementations are expected to provide zero-copy slicing and
/// concatenation; `SimpleTable` trades that away for simplicity since it
/// exists only to exercise the runtime in tests.
pub trait ShuffleTable: Sized + Clone + Send + Sync + std::fmt::Debug + 'static {
    /// Schema is carried alongside a run so that an empty output partition
    /// can be synthesized when no shards land for it.
    type Schema: Clone + Send + Sync + std::fmt::Debug + 'static;

    fn schema(&self) -> Self::Schema;

    /// Serializes a schema to an opaque byte buffer, as carried in a
    /// scheduler `shuffle_get` reply.
    fn schema_to_bytes(schema: &Self::Schema) -> Bytes;

    /// Deserializes a schema previously produced by `schema_to_bytes`.
    fn schema_from_bytes(bytes: &[u8]) -> Result<Self::Schema, String>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes this table to an opaque byte buffer.
    fn to_bytes(&self) -> Bytes;

    /// Deserializes a table previously produced by `to_bytes`.
    fn from_bytes(schema: &Self::Schema, bytes: &[u8]) -> Result<Self, String>;

    /// Concatenates many tables sharing one schema into one table.
    fn concat(schema: &Self::Schema, tables: Vec<Self>) -> Result<Self, String>;

    /// Synthesizes a zero-row table of the given schema.
    fn empty(schema: &Self::Schema) -> Self;

    /// The output partition a given row is destined for, given the total
    /// number of output partitions. Hashing the shuffle key into a partition
    /// count is conceptually upstream of this core (§1 Non-goals); this
    /// method is the single seam both `add_partition` (to resolve a
    /// destination worker via `WorkerFor`) and `receive` (to resolve a
    /// destination partition directly) route every row through, so the two
    /// call sites agree on where a row lands.
    fn output_partition(&self, row: usize, npartitions: u64) -> OutputPartitionId;

    /// Splits this table into contiguous sub-tables grouped by
    /// `output_partition`, sorted by partition id ascending.
    fn split_by_output_partition(&self, npartitions: u64) -> BTreeMap<OutputPartitionId, Self>;
}

/// SimpleTable is a minimal row-oriented table of `(key, value)` pairs,
/// matching the two-column `k: int, v: string` schema used throughout
/// `spec.md` §8's worked scenarios.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleTable {
    pub schema: SimpleSchema,
    pub rows: Vec<(u64, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleSchema {
    pub columns: Vec<String>,
}

impl Default for SimpleSchema {
    fn default() -> Self {
        SimpleSchema {
            columns: vec!["k".to_string(), "v".to_string()],
        }
    }
}

impl SimpleTable {
    pub fn new(rows: Vec<(u64, String)>) -> Self {
        SimpleTable {
            schema: SimpleSchema::default(),
            rows,
        }
    }
}

impl ShuffleTable for SimpleTable {
    type Schema = SimpleSchema;

    fn schema(&self) -> Self::Schema {
        self.schema.clone()
    }

    fn schema_to_bytes(schema: &Self::Schema) -> Bytes {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(schema.columns.len() as u32).to_le_bytes());
        for column in &schema.columns {
            buf.extend_from_slice(&(column.len() as u32).to_le_bytes());
            buf.extend_from_slice(column.as_bytes());
        }
        Bytes::from(buf)
    }

    fn schema_from_bytes(bytes: &[u8]) -> Result<Self::Schema, String> {
        let read_u32 = |b: &[u8], off: usize| -> Result<u32, String> {
            b.get(off..off + 4)
                .map(|s| u32::from_le_bytes(s.try_into().unwrap()))
                .ok_or_else(|| "truncated schema buffer".to_string())
        };

        let count = read_u32(bytes, 0)? as usize;
        let mut off = 4;
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            let len = read_u32(bytes, off)? as usize;
            off += 4;
            let name = bytes
                .get(off..off + len)
                .ok_or_else(|| "truncated schema buffer".to_string())?;
            columns.push(String::from_utf8(name.to_vec()).map_err(|e| e.to_string())?);
            off += len;
        }
        Ok(SimpleSchema { columns })
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn to_bytes(&self) -> Bytes {
        let mut buf = Vec::with_capacity(self.rows.len() * 12);
        buf.extend_from_slice(&(self.rows.len() as u32).to_le_bytes());
        for (k, v) in &self.rows {
            buf.extend_from_slice(&k.to_le_bytes());
            buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
            buf.extend_from_slice(v.as_bytes());
        }
        Bytes::from(buf)
    }

    fn from_bytes(schema: &Self::Schema, bytes: &[u8]) -> Result<Self, String> {
        let mut rows = Vec::new();
        let mut off = 0usize;
        let read_u32 = |b: &[u8], off: usize| -> Result<u32, String> {
            b.get(off..off + 4)
                .map(|s| u32::from_le_bytes(s.try_into().unwrap()))
                .ok_or_else(|| "truncated table buffer".to_string())
        };

        let count = read_u32(bytes, off)? as usize;
        off += 4;
        for _ in 0..count {
            let k = bytes
                .get(off..off + 8)
                .map(|s| u64::from_le_bytes(s.try_into().unwrap()))
                .ok_or_else(|| "truncated table buffer".to_string())?;
            off += 8;
            let vlen = read_u32(bytes, off)? as usize;
            off += 4;
            let v = bytes
                .get(off..off + vlen)
                .ok_or_else(|| "truncated table buffer".to_string())?;
            let v = String::from_utf8(v.to_vec()).map_err(|e| e.to_string())?;
            off += vlen;
            rows.push((k, v));
        }

        Ok(SimpleTable {
            schema: schema.clone(),
            rows,
        })
    }

    fn concat(schema: &Self::Schema, tables: Vec<Self>) -> Result<Self, String> {
        let mut rows = Vec::new();
        for t in tables {
            rows.extend(t.rows);
        }
        Ok(SimpleTable {
            schema: schema.clone(),
            rows,
        })
    }

    fn empty(schema: &Self::Schema) -> Self {
        SimpleTable {
            schema: schema.clone(),
            rows: Vec::new(),
        }
    }

    fn output_partition(&self, row: usize, npartitions: u64) -> OutputPartitionId {
        OutputPartitionId(self.rows[row].0 % npartitions.max(1))
    }

    fn split_by_output_partition(&self, npartitions: u64) -> BTreeMap<OutputPartitionId, Self> {
        let mut groups: BTreeMap<OutputPartitionId, Vec<(u64, String)>> = BTreeMap::new();
        for i in 0..self.rows.len() {
            let part = self.output_partition(i, npartitions);
            groups.entry(part).or_default().push(self.rows[i].clone());
        }
        groups
            .into_iter()
            .map(|(part, rows)| {
                (
                    part,
                    SimpleTable {
                        schema: self.schema.clone(),
                        rows,
                    },
                )
            })
            .collect()
    }
}
