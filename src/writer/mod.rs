//! The delta writer: public facade, builder, and the core state machine.
//!
//! A writer ingests row batches for one (tablet, txn), buffers them in a
//! memtable, flushes immutable segments through the shared flush pool, and
//! on finish commits a txn log describing the rowset.

mod autoincr;
mod builder;
mod core;
mod reconcile;

use arrow_array::RecordBatch;
pub use builder::DeltaWriterBuilder;

use self::core::DeltaWriterCore;
use crate::{error::Result, mem::MemTracker};

/// Whether `finish` commits a txn log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishMode {
    /// Seal segments and write the txn log (the normal commit).
    WriteTxnLog,
    /// Seal segments only; the caller commits through another channel.
    DontWriteTxnLog,
}

/// Asserts the blocking entry points are not running inside an async task.
///
/// `write`/`flush`/`finish`/`close` block on the flush pool and on segment
/// I/O; parking an async runtime worker on them is a programmer error, not a
/// recoverable condition.
fn debug_assert_blocking_context(op: &str) {
    debug_assert!(
        tokio::runtime::Handle::try_current().is_err(),
        "DeltaWriter::{op}() must not be invoked from an async task context"
    );
    let _ = op;
}

/// Writer for row batches destined for a single tablet under a single
/// transaction.
///
/// `open()` is I/O-free and safe on an async task; every other mutating
/// entry point may block and must run on a plain OS thread.
pub struct DeltaWriter {
    core: DeltaWriterCore,
}

impl std::fmt::Debug for DeltaWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaWriter").finish()
    }
}

impl DeltaWriter {
    fn new(core: DeltaWriterCore) -> Self {
        Self { core }
    }

    /// Acquire the flush token. Must be the first call, exactly once.
    pub fn open(&mut self) -> Result<()> {
        self.core.open()
    }

    /// Buffer the rows of `chunk` selected by `indexes`, flushing when the
    /// memtable fills or memory limits trip.
    pub fn write(&mut self, chunk: &RecordBatch, indexes: &[u32]) -> Result<()> {
        debug_assert_blocking_context("write");
        self.core.write(chunk, indexes)
    }

    /// Submit the current memtable to the flush pool and wait for the queue
    /// to drain.
    pub fn flush(&mut self) -> Result<()> {
        debug_assert_blocking_context("flush");
        self.core.flush()
    }

    /// Submit the current memtable to the flush pool without waiting.
    pub fn flush_async(&mut self) -> Result<()> {
        debug_assert_blocking_context("flush_async");
        self.core.flush_async()
    }

    /// Drain pending flushes, seal the segment writer and, in
    /// [`FinishMode::WriteTxnLog`], commit the txn log.
    pub fn finish(&mut self, mode: FinishMode) -> Result<()> {
        debug_assert_blocking_context("finish");
        self.core.finish(mode)
    }

    /// Release every resource the writer holds. Idempotent; tolerates and
    /// logs prior errors.
    pub fn close(&mut self) {
        debug_assert_blocking_context("close");
        self.core.close()
    }

    /// Partition the tablet belongs to.
    pub fn partition_id(&self) -> i64 {
        self.core.partition_id()
    }

    /// Target tablet id.
    pub fn tablet_id(&self) -> i64 {
        self.core.tablet_id()
    }

    /// Transaction id.
    pub fn txn_id(&self) -> i64 {
        self.core.txn_id()
    }

    /// The tracker this writer's buffers are charged to.
    pub fn mem_tracker(&self) -> &std::sync::Arc<MemTracker> {
        self.core.mem_tracker()
    }

    /// Files written so far, in write order.
    pub fn files(&self) -> Vec<String> {
        self.core.files()
    }

    /// Bytes written so far across all files.
    pub fn data_size(&self) -> i64 {
        self.core.data_size()
    }

    /// Rows written so far across all segments.
    pub fn num_rows(&self) -> i64 {
        self.core.num_rows()
    }

    /// Memtables submitted but not yet flushed.
    pub fn queueing_memtable_num(&self) -> usize {
        self.core.queueing_memtable_num()
    }

    /// Wall-clock seconds of the last `write()`; 0 after a flush.
    pub fn last_write_ts(&self) -> i64 {
        self.core.last_write_ts()
    }

    /// Advisory flag: the tablet crossed `immutable_tablet_size` and new
    /// rows should be routed elsewhere.
    pub fn is_immutable(&self) -> bool {
        self.core.is_immutable()
    }

    /// Refresh [`is_immutable`](Self::is_immutable) against current sizes
    /// without flushing.
    pub fn check_immutable(&self) -> Result<()> {
        self.core.check_immutable()
    }
}
