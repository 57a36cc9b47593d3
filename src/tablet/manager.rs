use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;

use super::{metadata::TabletMetadata, Tablet};
use crate::{
    error::{LakeError, Result},
    filenames::txn_log_filename,
    logging::lake_log,
    schema::TabletSchema,
    txnlog::TxnLog,
    update::UpdateManager,
};

struct TabletState {
    schema: Arc<TabletSchema>,
    schemas_by_index: HashMap<i64, Arc<TabletSchema>>,
    data_size: i64,
    metadata: Option<Arc<TabletMetadata>>,
    txn_logs: HashMap<i64, TxnLog>,
}

struct Inner {
    root: PathBuf,
    tablets: Mutex<HashMap<i64, TabletState>>,
    // (tablet_id, txn_id) -> bytes flushed but not yet published
    in_writing: Mutex<HashMap<(i64, i64), i64>>,
    update_mgr: Arc<UpdateManager>,
}

/// Process-wide registry of tablet handles and in-writing byte accounting.
///
/// Cheap to clone; all clones share state. The manager outlives every delta
/// writer, so flush callbacks route their accounting through it instead of
/// holding writer back-references.
#[derive(Clone)]
pub struct TabletManager {
    inner: Arc<Inner>,
}

impl TabletManager {
    /// Create a manager rooted at `root`; tablet data directories are laid
    /// out underneath it.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                tablets: Mutex::new(HashMap::new()),
                in_writing: Mutex::new(HashMap::new()),
                update_mgr: Arc::new(UpdateManager::new()),
            }),
        }
    }

    /// Register a tablet and create its data directory.
    pub fn create_tablet(&self, tablet_id: i64, schema: TabletSchema) -> Result<Tablet> {
        fs::create_dir_all(self.tablet_data_dir(tablet_id))?;
        let mut tablets = self.inner.tablets.lock();
        tablets.insert(
            tablet_id,
            TabletState {
                schema: Arc::new(schema),
                schemas_by_index: HashMap::new(),
                data_size: 0,
                metadata: None,
                txn_logs: HashMap::new(),
            },
        );
        drop(tablets);
        Ok(Tablet::new(self.clone(), tablet_id))
    }

    /// Attach the schema of one index of `tablet_id`, served by
    /// [`Tablet::get_schema_by_index_id`].
    pub fn attach_index_schema(
        &self,
        tablet_id: i64,
        index_id: i64,
        schema: TabletSchema,
    ) -> Result<()> {
        let mut tablets = self.inner.tablets.lock();
        let state = tablets
            .get_mut(&tablet_id)
            .ok_or_else(|| LakeError::NotFound(format!("tablet {tablet_id}")))?;
        state.schemas_by_index.insert(index_id, Arc::new(schema));
        Ok(())
    }

    /// Look up the handle for `tablet_id`.
    pub fn get_tablet(&self, tablet_id: i64) -> Result<Tablet> {
        let tablets = self.inner.tablets.lock();
        if !tablets.contains_key(&tablet_id) {
            return Err(LakeError::NotFound(format!("tablet {tablet_id}")));
        }
        Ok(Tablet::new(self.clone(), tablet_id))
    }

    /// Add flushed-but-unpublished bytes for `(tablet_id, txn_id)`.
    pub fn add_in_writing_data_size(&self, tablet_id: i64, txn_id: i64, bytes: i64) {
        let mut map = self.inner.in_writing.lock();
        *map.entry((tablet_id, txn_id)).or_insert(0) += bytes;
    }

    /// Total in-writing bytes for `tablet_id` across all transactions.
    pub fn in_writing_data_size(&self, tablet_id: i64) -> i64 {
        let map = self.inner.in_writing.lock();
        map.iter()
            .filter(|((tid, _), _)| *tid == tablet_id)
            .map(|(_, bytes)| *bytes)
            .sum()
    }

    /// Drop the in-writing entry for `(tablet_id, txn_id)`.
    pub fn remove_in_writing_data_size(&self, tablet_id: i64, txn_id: i64) {
        let mut map = self.inner.in_writing.lock();
        map.remove(&(tablet_id, txn_id));
    }

    /// Latest cached metadata snapshot for `tablet_id`, if any.
    pub fn get_latest_cached_tablet_metadata(&self, tablet_id: i64) -> Option<Arc<TabletMetadata>> {
        let tablets = self.inner.tablets.lock();
        tablets.get(&tablet_id).and_then(|s| s.metadata.clone())
    }

    /// Install a metadata snapshot in the cache (publish side).
    pub fn cache_tablet_metadata(&self, tablet_id: i64, metadata: TabletMetadata) {
        let mut tablets = self.inner.tablets.lock();
        if let Some(state) = tablets.get_mut(&tablet_id) {
            state.metadata = Some(Arc::new(metadata));
        }
    }

    /// Record the published data size of `tablet_id` (publish side).
    pub fn set_tablet_data_size(&self, tablet_id: i64, bytes: i64) {
        let mut tablets = self.inner.tablets.lock();
        if let Some(state) = tablets.get_mut(&tablet_id) {
            state.data_size = bytes;
        }
    }

    /// The primary-key update manager shared by all tablets.
    pub fn update_mgr(&self) -> &Arc<UpdateManager> {
        &self.inner.update_mgr
    }

    /// Store root.
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Data directory of `tablet_id`.
    pub fn tablet_data_dir(&self, tablet_id: i64) -> PathBuf {
        self.inner.root.join(tablet_id.to_string())
    }

    /// Committed txn log for `(tablet_id, txn_id)`, if one was written.
    pub fn get_txn_log(&self, tablet_id: i64, txn_id: i64) -> Option<TxnLog> {
        let tablets = self.inner.tablets.lock();
        tablets
            .get(&tablet_id)
            .and_then(|s| s.txn_logs.get(&txn_id).cloned())
    }

    pub(crate) fn tablet_data_size(&self, tablet_id: i64) -> Result<i64> {
        let tablets = self.inner.tablets.lock();
        tablets
            .get(&tablet_id)
            .map(|s| s.data_size)
            .ok_or_else(|| LakeError::NotFound(format!("tablet {tablet_id}")))
    }

    pub(crate) fn tablet_schema(&self, tablet_id: i64) -> Result<Arc<TabletSchema>> {
        let tablets = self.inner.tablets.lock();
        tablets
            .get(&tablet_id)
            .map(|s| Arc::clone(&s.schema))
            .ok_or_else(|| LakeError::NotFound(format!("tablet {tablet_id}")))
    }

    pub(crate) fn tablet_schema_by_index(
        &self,
        tablet_id: i64,
        index_id: i64,
    ) -> Result<Arc<TabletSchema>> {
        let tablets = self.inner.tablets.lock();
        let state = tablets
            .get(&tablet_id)
            .ok_or_else(|| LakeError::NotFound(format!("tablet {tablet_id}")))?;
        state
            .schemas_by_index
            .get(&index_id)
            .cloned()
            .ok_or_else(|| {
                LakeError::NotFound(format!("schema for index {index_id} of tablet {tablet_id}"))
            })
    }

    pub(crate) fn put_txn_log(&self, log: TxnLog) -> Result<()> {
        let path = self
            .tablet_data_dir(log.tablet_id)
            .join(txn_log_filename(log.tablet_id, log.txn_id));
        let bytes = serde_json::to_vec_pretty(&log)
            .map_err(|e| LakeError::Internal(format!("serialize txn log: {e}")))?;
        fs::write(&path, bytes)?;
        lake_log!(
            log::Level::Debug,
            "put_txn_log",
            "tablet={} txn={} segments={} dels={}",
            log.tablet_id,
            log.txn_id,
            log.op_write.rowset.segments.len(),
            log.op_write.dels.len(),
        );
        let mut tablets = self.inner.tablets.lock();
        if let Some(state) = tablets.get_mut(&log.tablet_id) {
            state.txn_logs.insert(log.txn_id, log);
        }
        Ok(())
    }
}
