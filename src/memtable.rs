//! In-memory row buffer.
//!
//! A [`MemTable`] accumulates selected rows until it reports full, then is
//! finalized and handed to the flush token. Finalization applies the keys
//! model: primary/unique/aggregate-key tablets are sorted by encoded key and
//! collapsed to the last version per key, and rows whose final op is a
//! delete move their encoded key into the delete column. Duplicate-key
//! tablets keep insertion order.

use std::{collections::BTreeMap, sync::Arc};

use arrow_array::{BinaryArray, RecordBatch, UInt32Array};
use arrow_schema::SchemaRef;
use arrow_select::{concat::concat_batches, take::take_record_batch};

use crate::{
    chunk::{self, OP_DELETE, OP_UPSERT},
    error::{LakeError, Result},
    mem::MemTracker,
    schema::{encode_primary_keys, KeysType, TabletSchema},
    tabletwriter::{MemTableSink, SegmentInfo},
};

/// Bounded in-memory buffer for one flush's worth of rows.
pub struct MemTable {
    /// Arrow schema chunks must conform to, including the trailing `"__op"`
    /// field when the load plan declares one.
    schema: SchemaRef,
    write_schema: Arc<TabletSchema>,
    sink: Arc<dyn MemTableSink>,
    max_buffer_size: usize,
    tracker: Arc<MemTracker>,
    batches: Vec<RecordBatch>,
    buffered_bytes: usize,
    tracked_bytes: i64,
    finalized: bool,
    result: Option<RecordBatch>,
    deletes: Option<BinaryArray>,
}

impl MemTable {
    /// Create a memtable pushing finalized chunks into `sink`.
    pub fn new(
        schema: SchemaRef,
        write_schema: Arc<TabletSchema>,
        sink: Arc<dyn MemTableSink>,
        max_buffer_size: usize,
        tracker: Arc<MemTracker>,
    ) -> Self {
        Self {
            schema,
            write_schema,
            sink,
            max_buffer_size,
            tracker,
            batches: Vec::new(),
            buffered_bytes: 0,
            tracked_bytes: 0,
            finalized: false,
            result: None,
            deletes: None,
        }
    }

    fn check_chunk_schema(&self, chunk: &RecordBatch) -> Result<()> {
        let expect = self.schema.fields();
        let got = chunk.schema_ref().fields();
        if expect.len() != got.len() {
            return Err(LakeError::InvalidArgument(format!(
                "chunk has {} columns, memtable schema expects {}",
                got.len(),
                expect.len()
            )));
        }
        for (e, g) in expect.iter().zip(got.iter()) {
            if e.name() != g.name() || e.data_type() != g.data_type() {
                return Err(LakeError::InvalidArgument(format!(
                    "chunk column {} ({}) does not match memtable column {} ({})",
                    g.name(),
                    g.data_type(),
                    e.name(),
                    e.data_type()
                )));
            }
        }
        Ok(())
    }

    /// Insert the rows of `chunk` selected by `indexes`.
    ///
    /// Returns true once the buffer holds at least `max_buffer_size` bytes.
    pub fn insert(&mut self, chunk: &RecordBatch, indexes: &[u32]) -> Result<bool> {
        debug_assert!(!self.finalized, "insert after finalize");
        self.check_chunk_schema(chunk)?;
        let selected = chunk::select(chunk, indexes)?;
        if selected.num_rows() > 0 {
            let bytes = selected.get_array_memory_size();
            self.tracker.consume(bytes as i64);
            self.tracked_bytes += bytes as i64;
            self.buffered_bytes += bytes;
            self.batches.push(selected);
        }
        Ok(self.buffered_bytes >= self.max_buffer_size)
    }

    /// True iff no rows are buffered.
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty() && self.result.is_none()
    }

    /// Collapse the buffer into the result chunk (and delete column).
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        if self.batches.is_empty() {
            return Ok(());
        }
        let merged = concat_batches(&self.schema, &self.batches)?;
        self.batches.clear();

        let ops: Option<Vec<u8>> = chunk::op_column(&merged).map(|a| a.values().to_vec());
        let data = chunk::strip_op_column(&merged)?;

        match self.write_schema.keys_type() {
            KeysType::DupKeys => {
                self.result = Some(data);
            }
            KeysType::PrimaryKeys | KeysType::UniqueKeys | KeysType::AggKeys => {
                let keys = encode_primary_keys(&self.write_schema, &data)?;
                // last version per key wins; BTreeMap iteration yields key order
                let mut last: BTreeMap<Vec<u8>, (u32, u8)> = BTreeMap::new();
                for (row, key) in keys.into_iter().enumerate() {
                    let op = ops.as_ref().map_or(OP_UPSERT, |o| o[row]);
                    last.insert(key, (row as u32, op));
                }
                let mut upsert_rows = Vec::new();
                let mut delete_keys = Vec::new();
                for (key, (row, op)) in last {
                    if op == OP_DELETE {
                        delete_keys.push(key);
                    } else {
                        upsert_rows.push(row);
                    }
                }
                let indices = UInt32Array::from(upsert_rows);
                self.result = Some(take_record_batch(&data, &indices)?);
                if !delete_keys.is_empty() {
                    self.deletes = Some(BinaryArray::from_iter_values(delete_keys.iter()));
                }
            }
        }
        Ok(())
    }

    /// The sorted, deduplicated result chunk. Present only after
    /// [`finalize`](Self::finalize) on a non-empty buffer.
    pub fn result_chunk(&self) -> Option<&RecordBatch> {
        self.result.as_ref()
    }

    /// Replace the result chunk (auto-increment filling rebuilds a column).
    pub(crate) fn set_result_chunk(&mut self, chunk: RecordBatch) {
        self.result = Some(chunk);
    }

    /// Push the finalized rows through the sink. Runs on a flush-pool
    /// thread; at most one segment is produced.
    pub(crate) fn flush(&mut self) -> Result<Option<SegmentInfo>> {
        debug_assert!(self.finalized, "flush before finalize");
        let result = self.result.take();
        let deletes = self.deletes.take();
        match (result, deletes) {
            (Some(upserts), Some(dels)) => self.sink.flush_chunk_with_deletes(&upserts, &dels),
            (None, Some(dels)) => {
                let empty = RecordBatch::new_empty(self.write_schema.to_arrow_schema(false));
                self.sink.flush_chunk_with_deletes(&empty, &dels)
            }
            (Some(upserts), None) if upserts.num_rows() > 0 => self.sink.flush_chunk(&upserts),
            _ => Ok(None),
        }
    }
}

impl Drop for MemTable {
    fn drop(&mut self) {
        if self.tracked_bytes != 0 {
            self.tracker.release(self.tracked_bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use arrow_array::{cast::AsArray, types::Int64Type, Array, Int64Array, UInt8Array};
    use arrow_schema::{DataType, Field, Schema};
    use parking_lot::Mutex;

    use super::*;
    use crate::schema::{LogicalType, TabletColumn};

    #[derive(Default)]
    struct RecordingSink {
        flushed: Mutex<Vec<(RecordBatch, Option<BinaryArray>)>>,
    }

    impl MemTableSink for RecordingSink {
        fn flush_chunk(&self, chunk: &RecordBatch) -> Result<Option<SegmentInfo>> {
            self.flushed.lock().push((chunk.clone(), None));
            Ok(Some(SegmentInfo {
                name: "seg.dat".into(),
                data_size: 1,
                num_rows: chunk.num_rows() as i64,
            }))
        }

        fn flush_chunk_with_deletes(
            &self,
            upserts: &RecordBatch,
            deletes: &BinaryArray,
        ) -> Result<Option<SegmentInfo>> {
            self.flushed
                .lock()
                .push((upserts.clone(), Some(deletes.clone())));
            Ok(Some(SegmentInfo {
                name: "seg.dat".into(),
                data_size: 1,
                num_rows: upserts.num_rows() as i64,
            }))
        }
    }

    fn pk_schema(keys_type: KeysType) -> Arc<TabletSchema> {
        Arc::new(TabletSchema::new(
            1,
            keys_type,
            vec![
                TabletColumn::new(1, "id", LogicalType::Int64).with_key(),
                TabletColumn::new(2, "v", LogicalType::Int64),
            ],
        ))
    }

    fn memtable(
        keys_type: KeysType,
        with_op: bool,
        max_buffer_size: usize,
    ) -> (MemTable, Arc<RecordingSink>) {
        let schema = pk_schema(keys_type);
        let sink = Arc::new(RecordingSink::default());
        let mem = MemTable::new(
            schema.to_arrow_schema(with_op),
            schema,
            Arc::clone(&sink) as Arc<dyn MemTableSink>,
            max_buffer_size,
            MemTracker::new("test", -1),
        );
        (mem, sink)
    }

    fn plain_batch(ids: Vec<i64>, vs: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("v", DataType::Int64, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from(ids)), Arc::new(Int64Array::from(vs))],
        )
        .unwrap()
    }

    fn op_batch(ids: Vec<i64>, vs: Vec<i64>, ops: Vec<u8>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("v", DataType::Int64, false),
            Field::new(chunk::OP_COLUMN, DataType::UInt8, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(Int64Array::from(vs)),
                Arc::new(UInt8Array::from(ops)),
            ],
        )
        .unwrap()
    }

    fn all(n: usize) -> Vec<u32> {
        (0..n as u32).collect()
    }

    fn ids_of(batch: &RecordBatch) -> Vec<i64> {
        batch.column(0).as_primitive::<Int64Type>().values().to_vec()
    }

    #[test]
    fn primary_keys_sort_and_last_wins() {
        let (mut mem, sink) = memtable(KeysType::PrimaryKeys, false, usize::MAX);
        mem.insert(&plain_batch(vec![3, 1], vec![30, 10]), &all(2))
            .unwrap();
        mem.insert(&plain_batch(vec![1, 2], vec![11, 20]), &all(2))
            .unwrap();
        mem.finalize().unwrap();

        let result = mem.result_chunk().expect("result chunk");
        assert_eq!(ids_of(result), vec![1, 2, 3]);
        // id=1 took the later version
        let vs = result.column(1).as_primitive::<Int64Type>();
        assert_eq!(&vs.values()[..], &[11, 20, 30]);

        mem.flush().unwrap();
        let flushed = sink.flushed.lock();
        assert_eq!(flushed.len(), 1);
        assert!(flushed[0].1.is_none());
    }

    #[test]
    fn delete_ops_split_into_delete_column() {
        let (mut mem, sink) = memtable(KeysType::PrimaryKeys, true, usize::MAX);
        mem.insert(
            &op_batch(
                vec![1, 2, 3],
                vec![10, 20, 30],
                vec![OP_UPSERT, OP_DELETE, OP_UPSERT],
            ),
            &all(3),
        )
        .unwrap();
        // later delete of id=3 overrides its upsert
        mem.insert(&op_batch(vec![3], vec![0], vec![OP_DELETE]), &all(1))
            .unwrap();
        mem.finalize().unwrap();

        let result = mem.result_chunk().unwrap();
        assert_eq!(ids_of(result), vec![1]);

        mem.flush().unwrap();
        let flushed = sink.flushed.lock();
        let deletes = flushed[0].1.as_ref().expect("delete column");
        assert_eq!(deletes.len(), 2);
    }

    #[test]
    fn dup_keys_preserve_insertion_order() {
        let (mut mem, _sink) = memtable(KeysType::DupKeys, false, usize::MAX);
        mem.insert(&plain_batch(vec![5, 5, 2], vec![1, 2, 3]), &all(3))
            .unwrap();
        mem.finalize().unwrap();
        assert_eq!(ids_of(mem.result_chunk().unwrap()), vec![5, 5, 2]);
    }

    #[test]
    fn insert_reports_full_by_bytes() {
        let (mut mem, _sink) = memtable(KeysType::DupKeys, false, 1);
        assert!(mem.insert(&plain_batch(vec![1], vec![1]), &all(1)).unwrap());
    }

    #[test]
    fn selection_array_filters_rows() {
        let (mut mem, _sink) = memtable(KeysType::DupKeys, false, usize::MAX);
        let full = mem
            .insert(&plain_batch(vec![1, 2, 3], vec![1, 2, 3]), &[2, 0])
            .unwrap();
        assert!(!full);
        mem.finalize().unwrap();
        assert_eq!(ids_of(mem.result_chunk().unwrap()), vec![3, 1]);
    }

    #[test]
    fn chunk_missing_declared_op_column_is_rejected() {
        let (mut mem, _sink) = memtable(KeysType::PrimaryKeys, true, usize::MAX);
        let err = mem
            .insert(&plain_batch(vec![1], vec![1]), &all(1))
            .unwrap_err();
        assert!(matches!(err, LakeError::InvalidArgument(_)));
    }

    #[test]
    fn empty_memtable_finalizes_to_nothing() {
        let (mut mem, sink) = memtable(KeysType::PrimaryKeys, false, usize::MAX);
        mem.finalize().unwrap();
        assert!(mem.result_chunk().is_none());
        assert!(mem.flush().unwrap().is_none());
        assert!(sink.flushed.lock().is_empty());
    }

    #[test]
    fn tracker_releases_on_drop() {
        let tracker = MemTracker::new("t", -1);
        let schema = pk_schema(KeysType::DupKeys);
        let sink = Arc::new(RecordingSink::default());
        let mut mem = MemTable::new(
            schema.to_arrow_schema(false),
            schema,
            sink as Arc<dyn MemTableSink>,
            usize::MAX,
            Arc::clone(&tracker),
        );
        mem.insert(&plain_batch(vec![1, 2], vec![1, 2]), &all(2))
            .unwrap();
        assert!(tracker.consumption() > 0);
        drop(mem);
        assert_eq!(tracker.consumption(), 0);
    }
}
