//! Txn log records.
//!
//! A [`TxnLog`] is written atomically at commit and links the segment files
//! produced under one transaction to the tablet version that will publish
//! them. Optional sub-fields are omitted from the serialized form.

use serde::{Deserialize, Serialize};

/// Commit record for one (tablet, txn) write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxnLog {
    /// Tablet the rowset belongs to.
    pub tablet_id: i64,
    /// Transaction that produced the rowset.
    pub txn_id: i64,
    /// The write operation payload.
    pub op_write: OpWrite,
}

/// Payload of a write operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpWrite {
    /// The committed rowset.
    pub rowset: Rowset,
    /// Delete files, in write order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dels: Vec<String>,
    /// Placeholder filenames reserved for the downstream partial-update
    /// rewrite, one per segment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rewrite_segments: Vec<String>,
    /// Extra metadata carried by partial / condition / auto-increment
    /// updates on primary-key tablets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn_meta: Option<RowsetTxnMeta>,
}

/// Set of segments committed together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rowset {
    /// Segment filenames in flush-submission order.
    pub segments: Vec<String>,
    /// Total row count across segments.
    pub num_rows: i64,
    /// Total byte size across files.
    pub data_size: i64,
    /// True iff the rowset holds more than one segment (segments may have
    /// overlapping key ranges).
    pub overlapped: bool,
}

/// Txn metadata produced by primary-key tablet writers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowsetTxnMeta {
    /// For partial updates: tablet-schema index of every write-schema column.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partial_update_column_ids: Vec<u32>,
    /// For partial updates: unique id of every write-schema column.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partial_update_column_unique_ids: Vec<u32>,
    /// Column name guarding a condition (merge) update; empty when unused.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub merge_condition: String,
    /// Position of the auto-increment column within the write schema, set
    /// when the load omitted that column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_increment_partial_update_column_id: Option<u32>,
}
