use serde::{Deserialize, Serialize};

/// Cached snapshot of a tablet's published metadata.
///
/// The write path only consumes the version number: the auto-increment
/// filler probes the primary-key index at this version to decide which rows
/// already exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletMetadata {
    version: i64,
}

impl TabletMetadata {
    /// Snapshot at `version`.
    pub fn new(version: i64) -> Self {
        Self { version }
    }

    /// Published version this snapshot was taken at.
    pub fn version(&self) -> i64 {
        self.version
    }
}
