//! Order-preserving primary-key encoding.
//!
//! Key columns of a chunk are folded into one byte string per row whose
//! lexicographic order matches the row order of the composite key. The
//! encoding feeds memtable sort/dedup, the delete-file payload, and the
//! primary-key index probe, so all three agree on key identity.

use arrow_array::{
    cast::AsArray,
    types::{Int16Type, Int32Type, Int64Type, Int8Type},
    Array, RecordBatch,
};

use super::TabletSchema;
use crate::error::{LakeError, Result};

enum KeyColumn<'a> {
    Bool(&'a arrow_array::BooleanArray),
    Int8(&'a arrow_array::Int8Array),
    Int16(&'a arrow_array::Int16Array),
    Int32(&'a arrow_array::Int32Array),
    Int64(&'a arrow_array::Int64Array),
    /// Terminated by `0x00` unless it is the last key column.
    Utf8(&'a arrow_array::StringArray, bool),
}

impl KeyColumn<'_> {
    fn encode(&self, row: usize, buf: &mut Vec<u8>) {
        match self {
            KeyColumn::Bool(a) => buf.push(a.value(row) as u8),
            KeyColumn::Int8(a) => buf.push((a.value(row) as u8) ^ 0x80),
            KeyColumn::Int16(a) => {
                buf.extend_from_slice(&((a.value(row) as u16) ^ (1 << 15)).to_be_bytes())
            }
            KeyColumn::Int32(a) => {
                buf.extend_from_slice(&((a.value(row) as u32) ^ (1 << 31)).to_be_bytes())
            }
            KeyColumn::Int64(a) => {
                buf.extend_from_slice(&((a.value(row) as u64) ^ (1 << 63)).to_be_bytes())
            }
            KeyColumn::Utf8(a, last) => {
                buf.extend_from_slice(a.value(row).as_bytes());
                if !last {
                    buf.push(0);
                }
            }
        }
    }
}

/// Encode the key prefix of every row of `chunk` into comparable byte strings.
///
/// The chunk's leading columns must match the key columns of `schema`.
pub(crate) fn encode_primary_keys(
    schema: &TabletSchema,
    chunk: &RecordBatch,
) -> Result<Vec<Vec<u8>>> {
    let num_keys = schema.num_key_columns();
    if chunk.num_columns() < num_keys {
        return Err(LakeError::Internal(format!(
            "chunk has {} columns, schema declares {} key columns",
            chunk.num_columns(),
            num_keys
        )));
    }

    let mut key_columns = Vec::with_capacity(num_keys);
    for idx in 0..num_keys {
        let column = chunk.column(idx);
        if column.null_count() > 0 {
            return Err(LakeError::InvalidArgument(format!(
                "null value in key column {}",
                schema.column(idx).name()
            )));
        }
        let last = idx + 1 == num_keys;
        let key_column = match schema.column(idx).logical_type() {
            super::LogicalType::Boolean => KeyColumn::Bool(column.as_boolean()),
            super::LogicalType::Int8 => KeyColumn::Int8(column.as_primitive::<Int8Type>()),
            super::LogicalType::Int16 => KeyColumn::Int16(column.as_primitive::<Int16Type>()),
            super::LogicalType::Int32 => KeyColumn::Int32(column.as_primitive::<Int32Type>()),
            super::LogicalType::Int64 => KeyColumn::Int64(column.as_primitive::<Int64Type>()),
            super::LogicalType::Varchar => KeyColumn::Utf8(column.as_string::<i32>(), last),
            other => {
                return Err(LakeError::InvalidArgument(format!(
                    "type {other:?} cannot be a key column"
                )))
            }
        };
        key_columns.push(key_column);
    }

    let mut keys = Vec::with_capacity(chunk.num_rows());
    for row in 0..chunk.num_rows() {
        let mut buf = Vec::new();
        for column in &key_columns {
            column.encode(row, &mut buf);
        }
        keys.push(buf);
    }
    Ok(keys)
}
