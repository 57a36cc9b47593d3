//! Tablet handles.

mod manager;
mod metadata;

use std::{path::PathBuf, sync::Arc};

pub use manager::TabletManager;
pub use metadata::TabletMetadata;

use crate::{error::Result, schema::TabletSchema, txnlog::TxnLog, update::UpdateManager};

/// Value-typed reference to a versioned tablet.
///
/// Cheap to clone and to look up repeatedly; all state lives in the
/// [`TabletManager`].
#[derive(Clone)]
pub struct Tablet {
    mgr: TabletManager,
    id: i64,
}

impl std::fmt::Debug for Tablet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tablet").field("id", &self.id).finish()
    }
}

impl Tablet {
    pub(crate) fn new(mgr: TabletManager, id: i64) -> Self {
        Self { mgr, id }
    }

    /// Tablet id.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Published (already committed) data size in bytes.
    pub fn data_size(&self) -> i64 {
        self.mgr.tablet_data_size(self.id).unwrap_or(0)
    }

    /// Full tablet schema from the tablet metadata.
    pub fn get_schema(&self) -> Result<Arc<TabletSchema>> {
        self.mgr.tablet_schema(self.id)
    }

    /// Schema of one index of the tablet; *not-found* when no schema file
    /// exists for that index.
    pub fn get_schema_by_index_id(&self, index_id: i64) -> Result<Arc<TabletSchema>> {
        self.mgr.tablet_schema_by_index(self.id, index_id)
    }

    /// Atomically persist the txn log. This is the commit point of a write.
    pub fn put_txn_log(&self, log: TxnLog) -> Result<()> {
        self.mgr.put_txn_log(log)
    }

    /// The update manager serving this tablet's primary-key index.
    pub fn update_mgr(&self) -> Arc<UpdateManager> {
        Arc::clone(self.mgr.update_mgr())
    }

    /// Directory holding this tablet's segment files.
    pub fn data_dir(&self) -> PathBuf {
        self.mgr.tablet_data_dir(self.id)
    }
}
