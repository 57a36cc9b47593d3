use std::sync::Arc;

use super::{core::DeltaWriterCore, DeltaWriter};
use crate::{
    error::{LakeError, Result},
    mem::MemTracker,
    tablet::TabletManager,
};

/// Builder for [`DeltaWriter`].
///
/// Required: `tablet_manager`, non-zero `tablet_id` / `txn_id` / `index_id`,
/// and `mem_tracker`; `table_id` is required iff
/// `miss_auto_increment_column` is set.
#[derive(Default)]
pub struct DeltaWriterBuilder {
    tablet_manager: Option<TabletManager>,
    tablet_id: i64,
    txn_id: i64,
    table_id: i64,
    partition_id: i64,
    index_id: i64,
    mem_tracker: Option<Arc<MemTracker>>,
    slots: Option<Vec<String>>,
    merge_condition: String,
    miss_auto_increment_column: bool,
    immutable_tablet_size: i64,
    max_buffer_size: usize,
}

impl DeltaWriterBuilder {
    /// Start an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// The tablet manager the writer registers accounting with.
    #[must_use]
    pub fn tablet_manager(mut self, tablet_manager: TabletManager) -> Self {
        self.tablet_manager = Some(tablet_manager);
        self
    }

    /// Target tablet.
    #[must_use]
    pub fn tablet_id(mut self, tablet_id: i64) -> Self {
        self.tablet_id = tablet_id;
        self
    }

    /// Transaction the rowset is committed under.
    #[must_use]
    pub fn txn_id(mut self, txn_id: i64) -> Self {
        self.txn_id = txn_id;
        self
    }

    /// Owning table, consulted by the auto-increment allocator.
    #[must_use]
    pub fn table_id(mut self, table_id: i64) -> Self {
        self.table_id = table_id;
        self
    }

    /// Partition the tablet belongs to (observer only).
    #[must_use]
    pub fn partition_id(mut self, partition_id: i64) -> Self {
        self.partition_id = partition_id;
        self
    }

    /// Index whose schema governs the write.
    #[must_use]
    pub fn index_id(mut self, index_id: i64) -> Self {
        self.index_id = index_id;
        self
    }

    /// Memory tracker the writer's buffers are charged to.
    #[must_use]
    pub fn mem_tracker(mut self, mem_tracker: Arc<MemTracker>) -> Self {
        self.mem_tracker = Some(mem_tracker);
        self
    }

    /// Column slots of the load plan, in write order, optionally ending with
    /// the virtual `"__op"` column. Omit for a full write.
    #[must_use]
    pub fn slots(mut self, slots: Vec<String>) -> Self {
        self.slots = Some(slots);
        self
    }

    /// Column name guarding a condition (merge) update.
    #[must_use]
    pub fn merge_condition(mut self, merge_condition: impl Into<String>) -> Self {
        self.merge_condition = merge_condition.into();
        self
    }

    /// Set when the load plan omits the auto-increment column of a partial
    /// primary-key update.
    #[must_use]
    pub fn miss_auto_increment_column(mut self, miss: bool) -> Self {
        self.miss_auto_increment_column = miss;
        self
    }

    /// Threshold (bytes) above which the tablet is advertised as immutable;
    /// 0 disables the feature.
    #[must_use]
    pub fn immutable_tablet_size(mut self, immutable_tablet_size: i64) -> Self {
        self.immutable_tablet_size = immutable_tablet_size;
        self
    }

    /// Memtable capacity in bytes; 0 selects the engine default.
    #[must_use]
    pub fn max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.max_buffer_size = max_buffer_size;
        self
    }

    /// Validate parameters and construct the writer.
    pub fn build(self) -> Result<DeltaWriter> {
        let tablet_manager = self
            .tablet_manager
            .ok_or_else(|| LakeError::InvalidArgument("tablet_manager not set".to_string()))?;
        if self.tablet_id == 0 {
            return Err(LakeError::InvalidArgument("tablet_id not set".to_string()));
        }
        if self.txn_id == 0 {
            return Err(LakeError::InvalidArgument("txn_id not set".to_string()));
        }
        let mem_tracker = self
            .mem_tracker
            .ok_or_else(|| LakeError::InvalidArgument("mem_tracker not set".to_string()))?;
        if self.miss_auto_increment_column && self.table_id == 0 {
            return Err(LakeError::InvalidArgument(
                "must set table_id when miss_auto_increment_column is true".to_string(),
            ));
        }
        if self.index_id == 0 {
            return Err(LakeError::InvalidArgument("index_id not set".to_string()));
        }
        Ok(DeltaWriter::new(DeltaWriterCore::new(
            tablet_manager,
            self.tablet_id,
            self.txn_id,
            self.table_id,
            self.partition_id,
            self.index_id,
            mem_tracker,
            self.slots,
            self.merge_condition,
            self.miss_auto_increment_column,
            self.immutable_tablet_size,
            self.max_buffer_size,
        )))
    }
}
