use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use parking_lot::Mutex;

use super::{
    autoincr::fill_auto_increment_ids,
    reconcile::{build_write_schema, has_op_slot},
    FinishMode,
};
use crate::{
    chunk::{self, OP_UPSERT},
    engine::StorageEngine,
    error::{LakeError, Result},
    filenames::{gen_segment_filename, is_del, is_segment},
    flush::FlushToken,
    logging::lake_log,
    mem::{MemTracker, ScopedMemTrackerSetter},
    memtable::MemTable,
    schema::{KeysType, TabletSchema},
    tablet::TabletManager,
    tabletwriter::{
        HorizontalGeneralTabletWriter, HorizontalPkTabletWriter, MemTableSink, SharedTabletWriter,
        TabletWriter, TabletWriterSink,
    },
    txnlog::{OpWrite, TxnLog},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    New,
    Open,
    Writing,
    Finished,
    Closed,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// The delta writer state machine.
///
/// Schema reconciliation and tablet-writer construction are deferred to the
/// first write (or `finish` on an empty writer) so that `open()` stays free
/// of I/O.
pub(crate) struct DeltaWriterCore {
    tablet_manager: TabletManager,
    tablet_id: i64,
    txn_id: i64,
    table_id: i64,
    partition_id: i64,
    index_id: i64,
    mem_tracker: Arc<MemTracker>,
    slots: Option<Vec<String>>,
    max_buffer_size: usize,
    immutable_tablet_size: i64,
    merge_condition: String,
    miss_auto_increment_column: bool,

    state: WriterState,
    flush_token: Option<FlushToken>,
    tablet_writer: Option<SharedTabletWriter>,
    mem_table: Option<MemTable>,
    mem_table_sink: Option<Arc<dyn MemTableSink>>,
    tablet_schema: Option<Arc<TabletSchema>>,
    write_schema: Option<Arc<TabletSchema>>,
    write_column_ids: Vec<usize>,
    write_schema_for_mem_table: Option<SchemaRef>,
    partial_schema_with_sort_key: bool,
    is_immutable: Arc<AtomicBool>,
    last_write_ts: i64,
}

#[allow(clippy::too_many_arguments)]
impl DeltaWriterCore {
    pub(crate) fn new(
        tablet_manager: TabletManager,
        tablet_id: i64,
        txn_id: i64,
        table_id: i64,
        partition_id: i64,
        index_id: i64,
        mem_tracker: Arc<MemTracker>,
        slots: Option<Vec<String>>,
        merge_condition: String,
        miss_auto_increment_column: bool,
        immutable_tablet_size: i64,
        max_buffer_size: usize,
    ) -> Self {
        let max_buffer_size = if max_buffer_size > 0 {
            max_buffer_size
        } else {
            StorageEngine::instance().config().write_buffer_size
        };
        Self {
            tablet_manager,
            tablet_id,
            txn_id,
            table_id,
            partition_id,
            index_id,
            mem_tracker,
            slots,
            max_buffer_size,
            immutable_tablet_size,
            merge_condition,
            miss_auto_increment_column,
            state: WriterState::New,
            flush_token: None,
            tablet_writer: None,
            mem_table: None,
            mem_table_sink: None,
            tablet_schema: None,
            write_schema: None,
            write_column_ids: Vec::new(),
            write_schema_for_mem_table: None,
            partial_schema_with_sort_key: false,
            is_immutable: Arc::new(AtomicBool::new(false)),
            last_write_ts: 0,
        }
    }

    pub(crate) fn partition_id(&self) -> i64 {
        self.partition_id
    }

    pub(crate) fn tablet_id(&self) -> i64 {
        self.tablet_id
    }

    pub(crate) fn txn_id(&self) -> i64 {
        self.txn_id
    }

    pub(crate) fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    pub(crate) fn last_write_ts(&self) -> i64 {
        self.last_write_ts
    }

    pub(crate) fn is_immutable(&self) -> bool {
        self.is_immutable.load(Ordering::Relaxed)
    }

    pub(crate) fn files(&self) -> Vec<String> {
        self.tablet_writer
            .as_ref()
            .map(|w| w.lock().files())
            .unwrap_or_default()
    }

    pub(crate) fn data_size(&self) -> i64 {
        self.tablet_writer
            .as_ref()
            .map(|w| w.lock().data_size())
            .unwrap_or(0)
    }

    pub(crate) fn num_rows(&self) -> i64 {
        self.tablet_writer
            .as_ref()
            .map(|w| w.lock().num_rows())
            .unwrap_or(0)
    }

    pub(crate) fn queueing_memtable_num(&self) -> usize {
        self.flush_token
            .as_ref()
            .map(|t| t.stats().queueing_memtable_num)
            .unwrap_or(0)
    }

    /// Out-of-band refresh of the immutable flag.
    pub(crate) fn check_immutable(&self) -> Result<()> {
        if self.immutable_tablet_size > 0 {
            let tablet = self.tablet_manager.get_tablet(self.tablet_id)?;
            let total =
                tablet.data_size() + self.tablet_manager.in_writing_data_size(self.tablet_id);
            if total > self.immutable_tablet_size {
                self.is_immutable.store(true, Ordering::Relaxed);
            }
            lake_log!(
                log::Level::Debug,
                "check_immutable",
                "tablet={} txn={} immutable_tablet_size={} data_size={} is_immutable={}",
                self.tablet_id,
                self.txn_id,
                self.immutable_tablet_size,
                total,
                self.is_immutable(),
            );
        }
        Ok(())
    }

    /// Acquire the flush token. No I/O happens here.
    pub(crate) fn open(&mut self) -> Result<()> {
        let _mem = ScopedMemTrackerSetter::new(&self.mem_tracker);
        if self.state != WriterState::New {
            return Err(LakeError::InvalidArgument(format!(
                "open() on a writer in state {:?}",
                self.state
            )));
        }
        self.flush_token = Some(StorageEngine::instance().create_flush_token());
        self.state = WriterState::Open;
        Ok(())
    }

    fn init_tablet_schema(&mut self) -> Result<()> {
        if self.tablet_schema.is_some() {
            return Ok(());
        }
        let tablet = self.tablet_manager.get_tablet(self.tablet_id)?;
        match tablet.get_schema_by_index_id(self.index_id) {
            Ok(schema) => {
                self.tablet_schema = Some(schema);
                Ok(())
            }
            // no schema file for the index, fall back to the tablet metadata
            Err(err) if err.is_not_found() => {
                self.tablet_schema = Some(tablet.get_schema()?);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn init_write_schema(&mut self) -> Result<()> {
        let tablet_schema = self.tablet_schema.as_ref().ok_or_else(|| {
            LakeError::Internal(
                "init_write_schema() must be invoked after init_tablet_schema()".to_string(),
            )
        })?;
        let plan = build_write_schema(
            tablet_schema,
            self.slots.as_deref(),
            self.miss_auto_increment_column,
        )?;
        self.write_schema = Some(plan.write_schema);
        self.write_column_ids = plan.write_column_ids;
        self.partial_schema_with_sort_key = plan.partial_schema_with_sort_key;
        Ok(())
    }

    fn build_schema_and_writer(&mut self) -> Result<()> {
        if self.mem_table_sink.is_some() {
            return Ok(());
        }
        debug_assert!(self.tablet_writer.is_none());
        let tablet = self.tablet_manager.get_tablet(self.tablet_id)?;
        self.init_tablet_schema()?;
        self.init_write_schema()?;

        let tablet_schema = self.tablet_schema.as_ref().expect("tablet schema");
        let write_schema = self.write_schema.as_ref().expect("write schema");
        let segment_schema = write_schema.to_arrow_schema(false);
        let mut writer: Box<dyn TabletWriter> =
            if tablet_schema.keys_type() == KeysType::PrimaryKeys {
                Box::new(HorizontalPkTabletWriter::new(
                    tablet,
                    segment_schema,
                    self.txn_id,
                ))
            } else {
                Box::new(HorizontalGeneralTabletWriter::new(
                    tablet,
                    segment_schema,
                    self.txn_id,
                ))
            };
        writer.open()?;
        let writer: SharedTabletWriter = Arc::new(Mutex::new(writer));
        self.mem_table_sink = Some(Arc::new(TabletWriterSink::new(Arc::clone(&writer))));
        self.tablet_writer = Some(writer);
        self.write_schema_for_mem_table =
            Some(write_schema.to_arrow_schema(has_op_slot(self.slots.as_deref())));

        debug_assert!(write_schema.num_columns() <= tablet_schema.num_columns());
        if write_schema.num_columns() < tablet_schema.num_columns() {
            debug_assert_eq!(self.write_column_ids.len(), write_schema.num_columns());
        }
        Ok(())
    }

    fn reset_memtable(&mut self) -> Result<()> {
        self.build_schema_and_writer()?;
        self.mem_table = Some(MemTable::new(
            Arc::clone(self.write_schema_for_mem_table.as_ref().expect("memtable schema")),
            Arc::clone(self.write_schema.as_ref().expect("write schema")),
            Arc::clone(self.mem_table_sink.as_ref().expect("sink")),
            self.max_buffer_size,
            Arc::clone(&self.mem_tracker),
        ));
        Ok(())
    }

    fn check_partial_update_with_sort_key(&self, chunk: &RecordBatch) -> Result<()> {
        if self.partial_schema_with_sort_key && has_op_slot(self.slots.as_deref()) {
            if let Some(ops) = chunk::op_column(chunk) {
                if ops.values().iter().any(|&op| op == OP_UPSERT) {
                    lake_log!(
                        log::Level::Warn,
                        "write_rejected",
                        "table with sort key do not support partial update",
                    );
                    return Err(LakeError::NotSupported(
                        "table with sort key do not support partial update".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn write(&mut self, chunk: &RecordBatch, indexes: &[u32]) -> Result<()> {
        let _mem = ScopedMemTrackerSetter::new(&self.mem_tracker);
        match self.state {
            WriterState::Open | WriterState::Writing => {}
            state => {
                return Err(LakeError::InvalidArgument(format!(
                    "write() on a writer in state {state:?}"
                )))
            }
        }
        if self.mem_table.is_none() {
            self.reset_memtable()?;
        }
        self.check_partial_update_with_sort_key(chunk)?;
        self.state = WriterState::Writing;
        self.last_write_ts = now_secs();

        let full = self
            .mem_table
            .as_mut()
            .expect("memtable")
            .insert(chunk, indexes)?;

        if self.mem_tracker.limit_exceeded() {
            lake_log!(
                log::Level::Debug,
                "flush_on_memory_limit",
                "tablet={} txn={}",
                self.tablet_id,
                self.txn_id,
            );
            self.flush()
        } else if self
            .mem_tracker
            .parent()
            .is_some_and(|p| p.limit_exceeded())
        {
            lake_log!(
                log::Level::Debug,
                "flush_on_parent_memory_limit",
                "tablet={} txn={}",
                self.tablet_id,
                self.txn_id,
            );
            self.flush()
        } else if full {
            self.flush_async()
        } else {
            Ok(())
        }
    }

    pub(crate) fn flush_async(&mut self) -> Result<()> {
        let Some(mut mem_table) = self.mem_table.take() else {
            return Ok(());
        };
        mem_table.finalize()?;
        if self.miss_auto_increment_column && mem_table.result_chunk().is_some() {
            let tablet = self.tablet_manager.get_tablet(self.tablet_id)?;
            let filled = fill_auto_increment_ids(
                &self.tablet_manager,
                &tablet,
                self.write_schema.as_ref().expect("write schema"),
                self.table_id,
                mem_table.result_chunk().expect("result chunk"),
            )?;
            mem_table.set_result_chunk(filled);
        }

        let tablet_manager = self.tablet_manager.clone();
        let tablet_id = self.tablet_id;
        let txn_id = self.txn_id;
        let immutable_tablet_size = self.immutable_tablet_size;
        let is_immutable = Arc::clone(&self.is_immutable);
        let token = self.flush_token.as_ref().ok_or_else(|| {
            LakeError::Internal("flush before open: no flush token".to_string())
        })?;
        token.submit(
            mem_table,
            false,
            Box::new(move |segment, _eos| {
                if let Some(segment) = segment {
                    tablet_manager.add_in_writing_data_size(tablet_id, txn_id, segment.data_size);
                }
                if immutable_tablet_size > 0 {
                    // runs on a pool thread: log and return, never propagate
                    let tablet = match tablet_manager.get_tablet(tablet_id) {
                        Ok(tablet) => tablet,
                        Err(err) => {
                            lake_log!(
                                log::Level::Warn,
                                "immutable_check_skipped",
                                "tablet={} txn={} error={}",
                                tablet_id,
                                txn_id,
                                err,
                            );
                            return;
                        }
                    };
                    let in_writing = tablet_manager.in_writing_data_size(tablet_id);
                    if tablet.data_size() + in_writing > immutable_tablet_size {
                        is_immutable.store(true, Ordering::Relaxed);
                    }
                    lake_log!(
                        log::Level::Debug,
                        "flush_memtable",
                        "tablet={} txn={} immutable_tablet_size={} tablet_data_size={} \
                         in_writing_data_size={} is_immutable={}",
                        tablet_id,
                        txn_id,
                        immutable_tablet_size,
                        tablet.data_size(),
                        in_writing,
                        is_immutable.load(Ordering::Relaxed),
                    );
                }
            }),
        )?;
        self.last_write_ts = 0;
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        self.flush_async()?;
        self.flush_token
            .as_ref()
            .ok_or_else(|| LakeError::Internal("flush before open: no flush token".to_string()))?
            .wait()
    }

    pub(crate) fn finish(&mut self, mode: FinishMode) -> Result<()> {
        let _mem = ScopedMemTrackerSetter::new(&self.mem_tracker);
        match self.state {
            WriterState::Open | WriterState::Writing => {}
            state => {
                return Err(LakeError::InvalidArgument(format!(
                    "finish() on a writer in state {state:?}"
                )))
            }
        }
        self.build_schema_and_writer()?;
        self.flush()?;
        self.tablet_writer
            .as_ref()
            .expect("tablet writer")
            .lock()
            .finish()?;
        self.state = WriterState::Finished;

        if mode == FinishMode::DontWriteTxnLog {
            return Ok(());
        }
        if self.txn_id < 0 {
            return Err(LakeError::InvalidArgument(format!(
                "negative txn id: {}",
                self.txn_id
            )));
        }

        let tablet = self.tablet_manager.get_tablet(self.tablet_id)?;
        let writer = self.tablet_writer.as_ref().expect("tablet writer");
        let (files, num_rows, data_size, writer_txn_meta) = {
            let writer = writer.lock();
            (
                writer.files(),
                writer.num_rows(),
                writer.data_size(),
                writer.rowset_txn_meta(),
            )
        };

        let mut op_write = OpWrite::default();
        for file in files {
            if is_segment(&file) {
                op_write.rowset.segments.push(file);
            } else if is_del(&file) {
                op_write.dels.push(file);
            } else {
                return Err(LakeError::Internal(format!("unknown file {file}")));
            }
        }
        op_write.rowset.num_rows = num_rows;
        op_write.rowset.data_size = data_size;
        op_write.rowset.overlapped = op_write.rowset.segments.len() > 1;

        let tablet_schema = self.tablet_schema.as_ref().expect("tablet schema");
        let write_schema = self.write_schema.as_ref().expect("write schema");
        let is_partial_update = write_schema.num_columns() < tablet_schema.num_columns();

        if is_partial_update && !self.merge_condition.is_empty() {
            return Err(LakeError::NotSupported(
                "partial update and condition update at the same time".to_string(),
            ));
        }

        if let Some(mut txn_meta) = writer_txn_meta {
            let mut used = false;
            if is_partial_update {
                for (i, column) in write_schema.columns().iter().enumerate() {
                    txn_meta
                        .partial_update_column_ids
                        .push(self.write_column_ids[i] as u32);
                    txn_meta
                        .partial_update_column_unique_ids
                        .push(column.unique_id() as u32);
                }
                // reserve rewrite names now so gc never collects them
                for _ in 0..op_write.rowset.segments.len() {
                    op_write
                        .rewrite_segments
                        .push(gen_segment_filename(self.txn_id));
                }
                used = true;
            }
            if !self.merge_condition.is_empty() {
                txn_meta.merge_condition = self.merge_condition.clone();
                used = true;
            }
            if self.miss_auto_increment_column {
                // the id recorded here is the column's offset within the
                // partial segment file, not the tablet schema
                if let Some(idx) = write_schema
                    .columns()
                    .iter()
                    .position(|c| c.is_auto_increment())
                {
                    txn_meta.auto_increment_partial_update_column_id = Some(idx as u32);
                }
                if op_write.rewrite_segments.is_empty() {
                    for _ in 0..op_write.rowset.segments.len() {
                        op_write
                            .rewrite_segments
                            .push(gen_segment_filename(self.txn_id));
                    }
                }
                used = true;
            }
            if used {
                op_write.txn_meta = Some(txn_meta);
            }
        }

        let txn_log = TxnLog {
            tablet_id: self.tablet_id,
            txn_id: self.txn_id,
            op_write,
        };
        if tablet_schema.keys_type() == KeysType::PrimaryKeys {
            // warm the update state cache to cut publish latency; best-effort
            tablet.update_mgr().preload_update_state(&txn_log, &tablet);
        }
        tablet.put_txn_log(txn_log)
    }

    pub(crate) fn close(&mut self) {
        let _mem = ScopedMemTrackerSetter::new(&self.mem_tracker);
        if self.state == WriterState::Closed {
            return;
        }
        self.state = WriterState::Closed;

        if let Some(token) = &self.flush_token {
            if let Err(err) = token.wait() {
                lake_log!(
                    log::Level::Warn,
                    "flush_token_error",
                    "tablet={} txn={} error={}",
                    self.tablet_id,
                    self.txn_id,
                    err,
                );
            }
            let stats = token.stats();
            lake_log!(
                log::Level::Trace,
                "flush_token_stats",
                "tablet={} flushed={} queueing={}",
                self.tablet_id,
                stats.flushed_memtable_num,
                stats.queueing_memtable_num,
            );
        }

        if let Some(writer) = &self.tablet_writer {
            writer.lock().close();
        }
        // teardown order matters: memtable -> sink -> tablet writer, so the
        // destructor costs accrue to this writer's tracker
        self.mem_table = None;
        self.mem_table_sink = None;
        self.tablet_writer = None;
        self.flush_token = None;
        self.tablet_schema = None;
        self.write_schema = None;
        self.write_schema_for_mem_table = None;
        self.merge_condition.clear();

        if self.immutable_tablet_size > 0 {
            self.tablet_manager
                .remove_in_writing_data_size(self.tablet_id, self.txn_id);
        }
    }
}
