//! Chunk helpers.
//!
//! A chunk is an [`arrow_array::RecordBatch`]. Load plans may append a
//! trailing virtual column named [`OP_COLUMN`] whose per-row byte tags the
//! row as an upsert or a delete.

use arrow_array::{cast::AsArray, types::UInt8Type, RecordBatch, UInt8Array};
use arrow_select::take::take_record_batch;

use crate::error::{LakeError, Result};

/// Name of the trailing virtual op column.
pub const OP_COLUMN: &str = "__op";

/// Op byte tagging a row as an upsert.
pub const OP_UPSERT: u8 = 0;

/// Op byte tagging a row as a delete.
pub const OP_DELETE: u8 = 1;

/// Return the trailing `"__op"` column of `chunk`, if the last column carries
/// that name.
pub fn op_column(chunk: &RecordBatch) -> Option<&UInt8Array> {
    let fields = chunk.schema_ref().fields();
    let last = fields.len().checked_sub(1)?;
    if fields[last].name() != OP_COLUMN {
        return None;
    }
    chunk.column(last).as_primitive_opt::<UInt8Type>()
}

/// Apply a caller-supplied selection array, reordering and filtering rows.
///
/// An empty selection yields an empty batch with the chunk's schema.
pub fn select(chunk: &RecordBatch, indexes: &[u32]) -> Result<RecordBatch> {
    let indices = arrow_array::UInt32Array::from(indexes.to_vec());
    take_record_batch(chunk, &indices).map_err(LakeError::from)
}

/// Drop the trailing `"__op"` column, leaving data columns only.
pub(crate) fn strip_op_column(chunk: &RecordBatch) -> Result<RecordBatch> {
    if op_column(chunk).is_none() {
        return Ok(chunk.clone());
    }
    let keep: Vec<usize> = (0..chunk.num_columns() - 1).collect();
    chunk.project(&keep).map_err(LakeError::from)
}
