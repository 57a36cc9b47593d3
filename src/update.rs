//! Primary-key update manager.
//!
//! The write path consumes two operations: a probe of the primary-key index
//! (`(rssid << 32) | rowid` per key) used by the auto-increment filler, and
//! a best-effort warm-up of the update state cache at commit so publishing
//! pays less.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::{error::Result, logging::lake_log, tablet::Tablet, txnlog::TxnLog};

/// Marker for "key not present in the index": the rssid half is all ones.
pub const NO_ROW: u64 = (u32::MAX as u64) << 32;

/// In-process mirror of the primary-key index service.
#[derive(Default)]
pub struct UpdateManager {
    // tablet_id -> encoded pk -> (rssid << 32) | rowid
    indexes: Mutex<HashMap<i64, HashMap<Vec<u8>, u64>>>,
    preloaded: Mutex<HashSet<(i64, i64)>>,
}

impl UpdateManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install index entries for a tablet (publish side).
    pub fn insert_pk_entries<I>(&self, tablet_id: i64, entries: I)
    where
        I: IntoIterator<Item = (Vec<u8>, u64)>,
    {
        let mut indexes = self.indexes.lock();
        indexes.entry(tablet_id).or_default().extend(entries);
    }

    /// Resolve each encoded key to its `(rssid << 32) | rowid` mapping at
    /// `version`; absent keys map to [`NO_ROW`].
    pub fn get_rowids_from_pkindex(
        &self,
        tablet: &Tablet,
        version: i64,
        keys: &[Vec<u8>],
    ) -> Result<Vec<u64>> {
        let indexes = self.indexes.lock();
        let index = indexes.get(&tablet.id());
        let rowids = keys
            .iter()
            .map(|k| index.and_then(|ix| ix.get(k).copied()).unwrap_or(NO_ROW))
            .collect();
        lake_log!(
            log::Level::Trace,
            "pk_index_probe",
            "tablet={} version={} keys={}",
            tablet.id(),
            version,
            keys.len(),
        );
        Ok(rowids)
    }

    /// Warm the update state cache for a txn log about to be published.
    /// Best-effort: failures are tolerated and never fail the commit.
    pub fn preload_update_state(&self, log: &TxnLog, tablet: &Tablet) {
        let mut preloaded = self.preloaded.lock();
        preloaded.insert((tablet.id(), log.txn_id));
        lake_log!(
            log::Level::Debug,
            "preload_update_state",
            "tablet={} txn={}",
            tablet.id(),
            log.txn_id,
        );
    }

    /// Whether `(tablet_id, txn_id)` had its update state preloaded.
    pub fn is_preloaded(&self, tablet_id: i64, txn_id: i64) -> bool {
        self.preloaded.lock().contains(&(tablet_id, txn_id))
    }
}
