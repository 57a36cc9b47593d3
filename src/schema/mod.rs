//! Tablet schema model.
//!
//! A [`TabletSchema`] is the full, immutable column list of one tablet
//! index. The write path projects it down to a write schema when a load
//! touches a strict subset of columns (partial update).

mod key;

use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema, SchemaRef};
use serde::{Deserialize, Serialize};

use crate::{
    chunk::OP_COLUMN,
    error::{LakeError, Result},
};

pub(crate) use key::encode_primary_keys;

/// Key model declared by a tablet schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeysType {
    /// Rows are uniquely identified by the key prefix; updates are merged by
    /// the primary-key index.
    PrimaryKeys,
    /// Last write per key wins at read/compaction time.
    UniqueKeys,
    /// Rows with equal keys are aggregated by per-column functions.
    AggKeys,
    /// Keys may repeat; rows are only sorted.
    DupKeys,
}

/// Column value types supported by the tablet model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalType {
    /// 1-byte boolean.
    Boolean,
    /// 8-bit signed integer.
    Int8,
    /// 16-bit signed integer.
    Int16,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 32-bit float.
    Float32,
    /// 64-bit float.
    Float64,
    /// Variable-length UTF-8 string.
    Varchar,
}

impl LogicalType {
    /// Arrow type this logical type maps to.
    pub fn to_arrow(self) -> DataType {
        match self {
            LogicalType::Boolean => DataType::Boolean,
            LogicalType::Int8 => DataType::Int8,
            LogicalType::Int16 => DataType::Int16,
            LogicalType::Int32 => DataType::Int32,
            LogicalType::Int64 => DataType::Int64,
            LogicalType::Float32 => DataType::Float32,
            LogicalType::Float64 => DataType::Float64,
            LogicalType::Varchar => DataType::Utf8,
        }
    }
}

/// One column of a tablet schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabletColumn {
    unique_id: i32,
    name: String,
    logical_type: LogicalType,
    is_nullable: bool,
    is_key: bool,
    is_auto_increment: bool,
}

impl TabletColumn {
    /// Create a non-key, non-nullable column.
    pub fn new(unique_id: i32, name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            unique_id,
            name: name.into(),
            logical_type,
            is_nullable: false,
            is_key: false,
            is_auto_increment: false,
        }
    }

    /// Mark the column as part of the key prefix.
    pub fn with_key(mut self) -> Self {
        self.is_key = true;
        self
    }

    /// Mark the column nullable.
    pub fn with_nullable(mut self) -> Self {
        self.is_nullable = true;
        self
    }

    /// Mark the column as allocator-assigned.
    pub fn with_auto_increment(mut self) -> Self {
        self.is_auto_increment = true;
        self
    }

    /// Stable column id, preserved across schema changes and projections.
    pub fn unique_id(&self) -> i32 {
        self.unique_id
    }

    /// Column name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value type.
    pub fn logical_type(&self) -> LogicalType {
        self.logical_type
    }

    /// Whether the column accepts nulls.
    pub fn is_nullable(&self) -> bool {
        self.is_nullable
    }

    /// Whether the column belongs to the key prefix.
    pub fn is_key(&self) -> bool {
        self.is_key
    }

    /// Whether values are assigned by the cluster-global allocator.
    pub fn is_auto_increment(&self) -> bool {
        self.is_auto_increment
    }
}

/// Ordered, immutable column list of one tablet index.
///
/// Key columns must form a prefix of the list. `sort_key_idxes` defaults to
/// that prefix and may be overridden for sort-keyed tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabletSchema {
    id: i64,
    keys_type: KeysType,
    columns: Vec<TabletColumn>,
    sort_key_idxes: Vec<usize>,
}

impl TabletSchema {
    /// Build a schema whose sort key is its key-column prefix.
    pub fn new(id: i64, keys_type: KeysType, columns: Vec<TabletColumn>) -> Self {
        let sort_key_idxes = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_key())
            .map(|(i, _)| i)
            .collect();
        Self {
            id,
            keys_type,
            columns,
            sort_key_idxes,
        }
    }

    /// Override the sort-key column indices (a sort-keyed table).
    pub fn with_sort_key_idxes(mut self, idxes: Vec<usize>) -> Self {
        self.sort_key_idxes = idxes;
        self
    }

    /// Schema id.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Declared key model.
    pub fn keys_type(&self) -> KeysType {
        self.keys_type
    }

    /// Number of columns.
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Number of key columns (the key prefix).
    pub fn num_key_columns(&self) -> usize {
        self.columns.iter().filter(|c| c.is_key()).count()
    }

    /// Column at `idx`.
    pub fn column(&self, idx: usize) -> &TabletColumn {
        &self.columns[idx]
    }

    /// All columns in order.
    pub fn columns(&self) -> &[TabletColumn] {
        &self.columns
    }

    /// Index of the column named `name`, if present.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name() == name)
    }

    /// Sort-key column indices, in declaration order.
    pub fn sort_key_idxes(&self) -> &[usize] {
        &self.sort_key_idxes
    }

    /// Project the schema onto `ids` (indices into this schema), preserving
    /// unique ids and remapping sort-key indices into the projection.
    pub fn project(&self, ids: &[usize]) -> Result<TabletSchema> {
        let mut columns = Vec::with_capacity(ids.len());
        for &id in ids {
            let col = self.columns.get(id).ok_or_else(|| {
                LakeError::InvalidArgument(format!("column index {id} out of range"))
            })?;
            columns.push(col.clone());
        }
        let sort_key_idxes = self
            .sort_key_idxes
            .iter()
            .filter_map(|orig| ids.iter().position(|id| id == orig))
            .collect();
        Ok(TabletSchema {
            id: self.id,
            keys_type: self.keys_type,
            columns,
            sort_key_idxes,
        })
    }

    /// Encode the key prefix of every row of `chunk` into order-preserving
    /// byte strings. The same encoding keys the primary-key index, the
    /// memtable sort, and the delete-file payload.
    pub fn encode_primary_keys(
        &self,
        chunk: &arrow_array::RecordBatch,
    ) -> Result<Vec<Vec<u8>>> {
        key::encode_primary_keys(self, chunk)
    }

    /// Arrow schema for chunks conforming to this tablet schema, with the
    /// trailing virtual `"__op"` field appended when `with_op` is set.
    pub fn to_arrow_schema(&self, with_op: bool) -> SchemaRef {
        let mut fields: Vec<Field> = self
            .columns
            .iter()
            .map(|c| Field::new(c.name(), c.logical_type().to_arrow(), c.is_nullable()))
            .collect();
        if with_op {
            fields.push(Field::new(OP_COLUMN, DataType::UInt8, false));
        }
        Arc::new(Schema::new(fields))
    }
}
