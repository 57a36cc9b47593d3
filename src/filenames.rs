//! Naming scheme for files referenced by txn logs.
//!
//! Segment and delete filenames embed the txn id (hex, fixed width) and a
//! ULID so every flush within a commit produces a distinct name.

use ulid::Ulid;

const SEGMENT_SUFFIX: &str = ".dat";
const DEL_SUFFIX: &str = ".del";

/// Generate a fresh segment filename for `txn_id`.
pub fn gen_segment_filename(txn_id: i64) -> String {
    format!("{:016x}_{}{}", txn_id, Ulid::new(), SEGMENT_SUFFIX)
}

/// Generate a fresh delete filename for `txn_id`.
pub fn gen_del_filename(txn_id: i64) -> String {
    format!("{:016x}_{}{}", txn_id, Ulid::new(), DEL_SUFFIX)
}

/// Filename of the txn log committed for `(tablet_id, txn_id)`.
pub fn txn_log_filename(tablet_id: i64, txn_id: i64) -> String {
    format!("{tablet_id:016x}_{txn_id:016x}.log")
}

/// True iff `name` is a segment file.
pub fn is_segment(name: &str) -> bool {
    name.ends_with(SEGMENT_SUFFIX)
}

/// True iff `name` is a delete file.
pub fn is_del(name: &str) -> bool {
    name.ends_with(DEL_SUFFIX)
}
