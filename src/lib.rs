#![warn(missing_docs)]
//! Write path of a lakehouse-style columnar tablet store.
//!
//! Row batches destined for a single tablet under a single transaction flow
//! through a [`DeltaWriter`]: they are buffered in a memtable, flushed as
//! immutable parquet segment files by a shared flush pool, and committed by
//! writing a [`TxnLog`](txnlog::TxnLog) record that links the segments to
//! the transaction. Tablet metadata and data live under a store root shared
//! with the publish/scan side and are referenced by version.
//!
//! ```no_run
//! use lakebed::{DeltaWriterBuilder, FinishMode, MemTracker, TabletManager};
//!
//! # fn demo(mgr: TabletManager, chunk: arrow_array::RecordBatch) -> lakebed::Result<()> {
//! let mut writer = DeltaWriterBuilder::new()
//!     .tablet_manager(mgr)
//!     .tablet_id(100)
//!     .txn_id(7)
//!     .index_id(1)
//!     .mem_tracker(MemTracker::new("load", -1))
//!     .build()?;
//! writer.open()?;
//! let indexes: Vec<u32> = (0..chunk.num_rows() as u32).collect();
//! writer.write(&chunk, &indexes)?;
//! writer.finish(FinishMode::WriteTxnLog)?;
//! writer.close();
//! # Ok(())
//! # }
//! ```

pub mod chunk;
mod engine;
mod error;
pub mod filenames;
mod flush;
mod logging;
mod mem;
mod memtable;
mod option;
mod schema;
mod tablet;
mod tabletwriter;
pub mod txnlog;
mod update;
mod writer;

pub use engine::StorageEngine;
pub use error::{LakeError, Result};
pub use flush::FlushTokenStats;
pub use mem::{current_tracker, MemTracker, ScopedMemTrackerSetter};
pub use memtable::MemTable;
pub use option::{EngineConfig, DEFAULT_WRITE_BUFFER_SIZE};
pub use schema::{KeysType, LogicalType, TabletColumn, TabletSchema};
pub use tablet::{Tablet, TabletManager, TabletMetadata};
pub use tabletwriter::{
    HorizontalGeneralTabletWriter, HorizontalPkTabletWriter, MemTableSink, SegmentInfo,
    TabletWriter,
};
pub use update::{UpdateManager, NO_ROW};
pub use writer::{DeltaWriter, DeltaWriterBuilder, FinishMode};
