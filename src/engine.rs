//! Process-wide storage engine.
//!
//! The engine owns the shared memtable flush pool and the auto-increment id
//! allocator. It is created lazily with default configuration; call
//! [`StorageEngine::init`] before first use to override.

use std::{collections::HashMap, sync::Arc};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::{
    error::{LakeError, Result},
    flush::{FlushExecutor, FlushToken},
    option::EngineConfig,
};

static ENGINE: OnceCell<StorageEngine> = OnceCell::new();

/// Singleton owning shared write-path resources.
pub struct StorageEngine {
    config: EngineConfig,
    flush_executor: Arc<FlushExecutor>,
    // table_id -> next id; intervals are contiguous and monotonic per table
    increment_ids: Mutex<HashMap<i64, i64>>,
    increment_allocated: Mutex<HashMap<i64, i64>>,
}

impl StorageEngine {
    fn new(config: EngineConfig) -> Self {
        let flush_executor = Arc::new(FlushExecutor::new(config.flush_threads));
        Self {
            config,
            flush_executor,
            increment_ids: Mutex::new(HashMap::new()),
            increment_allocated: Mutex::new(HashMap::new()),
        }
    }

    /// Install the engine with `config`. Returns the existing instance if one
    /// was already created.
    pub fn init(config: EngineConfig) -> &'static StorageEngine {
        ENGINE.get_or_init(|| StorageEngine::new(config))
    }

    /// The process-wide engine, created with defaults on first use.
    pub fn instance() -> &'static StorageEngine {
        ENGINE.get_or_init(|| StorageEngine::new(EngineConfig::default()))
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create a flush token bound to the shared flush pool.
    pub(crate) fn create_flush_token(&self) -> FlushToken {
        self.flush_executor.create_flush_token()
    }

    /// Allocate `count` contiguous auto-increment ids scoped to `table_id`.
    pub fn next_increment_id_interval(&self, table_id: i64, count: usize) -> Result<Vec<i64>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut ids = self.increment_ids.lock();
        let next = ids.entry(table_id).or_insert(1);
        let start = *next;
        let end = start
            .checked_add(count as i64)
            .ok_or_else(|| LakeError::Internal(format!("id space exhausted for table {table_id}")))?;
        *next = end;
        drop(ids);
        let mut allocated = self.increment_allocated.lock();
        *allocated.entry(table_id).or_insert(0) += count as i64;
        Ok((start..end).collect())
    }

    /// Total ids handed out for `table_id` so far.
    pub fn increment_ids_allocated(&self, table_id: i64) -> i64 {
        self.increment_allocated
            .lock()
            .get(&table_id)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_are_contiguous_per_table() {
        let engine = StorageEngine::instance();
        let table = 0x7e57_0001;
        let a = engine.next_increment_id_interval(table, 3).unwrap();
        let b = engine.next_increment_id_interval(table, 2).unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(b[0], a[2] + 1);
        assert_eq!(engine.increment_ids_allocated(table), 5);

        // other tables have their own counter
        let other = 0x7e57_0002;
        let c = engine.next_increment_id_interval(other, 1).unwrap();
        assert_eq!(c, vec![1]);
    }

    #[test]
    fn zero_count_allocates_nothing() {
        let engine = StorageEngine::instance();
        let table = 0x7e57_0003;
        assert!(engine.next_increment_id_interval(table, 0).unwrap().is_empty());
        assert_eq!(engine.increment_ids_allocated(table), 0);
    }
}
