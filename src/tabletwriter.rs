//! Segment-file writers.
//!
//! A [`TabletWriter`] encodes finalized chunks into immutable parquet
//! segment files inside the tablet's data directory. Two horizontal
//! variants exist: the general writer for non-primary-key tablets and the
//! primary-key writer, which additionally emits delete files and carries a
//! [`RowsetTxnMeta`] for the commit path to populate.

use std::{fs, fs::File, sync::Arc};

use arrow_array::{Array, BinaryArray, RecordBatch};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use parking_lot::Mutex;
use parquet::{arrow::ArrowWriter, basic::Compression, file::properties::WriterProperties};

use crate::{
    error::{LakeError, Result},
    filenames::{gen_del_filename, gen_segment_filename},
    logging::lake_log,
    tablet::Tablet,
    txnlog::RowsetTxnMeta,
};

/// Description of one flushed segment, reported to the on-segment callback.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// Segment filename (no directory component).
    pub name: String,
    /// File size in bytes.
    pub data_size: i64,
    /// Rows encoded into the segment.
    pub num_rows: i64,
}

/// Encoder of finalized chunks into segment files.
///
/// `write` buffers rows; `flush` encodes everything buffered since the last
/// flush into at most one new segment. File names are reported by `files()`
/// in write order, a delete file before the segment of the same memtable.
pub trait TabletWriter: Send {
    /// Prepare the writer. Must be called before any write.
    fn open(&mut self) -> Result<()>;

    /// Buffer a chunk for the next segment.
    fn write(&mut self, chunk: &RecordBatch) -> Result<()>;

    /// Encode buffered rows into a segment file, if any rows are buffered.
    fn flush(&mut self) -> Result<Option<SegmentInfo>>;

    /// Write a delete file holding encoded primary keys of deleted rows.
    fn flush_del_file(&mut self, deletes: &BinaryArray) -> Result<()>;

    /// Seal the writer; no further writes are accepted.
    fn finish(&mut self) -> Result<()>;

    /// Release buffered state. Safe to call at any point.
    fn close(&mut self);

    /// All file names written so far, in write order.
    fn files(&self) -> Vec<String>;

    /// Total bytes written across all files.
    fn data_size(&self) -> i64;

    /// Total rows written across all segments.
    fn num_rows(&self) -> i64;

    /// Txn metadata skeleton, present only for primary-key writers.
    fn rowset_txn_meta(&self) -> Option<RowsetTxnMeta>;
}

/// Shared handle to a tablet writer, lockable from the flush pool and the
/// delta writer alike.
pub(crate) type SharedTabletWriter = Arc<Mutex<Box<dyn TabletWriter>>>;

fn parquet_props() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::LZ4)
        .set_created_by(concat!("lakebed version ", env!("CARGO_PKG_VERSION")).to_owned())
        .build()
}

/// Horizontal writer for duplicate/unique/aggregate key tablets.
pub struct HorizontalGeneralTabletWriter {
    tablet: Tablet,
    schema: SchemaRef,
    txn_id: i64,
    buffered: Vec<RecordBatch>,
    buffered_rows: i64,
    files: Vec<String>,
    data_size: i64,
    num_rows: i64,
    finished: bool,
}

impl HorizontalGeneralTabletWriter {
    /// Create a writer emitting segments with `schema` under `txn_id`.
    pub fn new(tablet: Tablet, schema: SchemaRef, txn_id: i64) -> Self {
        Self {
            tablet,
            schema,
            txn_id,
            buffered: Vec::new(),
            buffered_rows: 0,
            files: Vec::new(),
            data_size: 0,
            num_rows: 0,
            finished: false,
        }
    }

    fn write_parquet(&self, name: &str, schema: &SchemaRef, batches: &[RecordBatch]) -> Result<i64> {
        let path = self.tablet.data_dir().join(name);
        let file = File::create(&path)?;
        let mut writer = ArrowWriter::try_new(file, Arc::clone(schema), Some(parquet_props()))?;
        for batch in batches {
            writer.write(batch)?;
        }
        writer.close()?;
        Ok(fs::metadata(&path)?.len() as i64)
    }
}

impl TabletWriter for HorizontalGeneralTabletWriter {
    fn open(&mut self) -> Result<()> {
        fs::create_dir_all(self.tablet.data_dir())?;
        Ok(())
    }

    fn write(&mut self, chunk: &RecordBatch) -> Result<()> {
        if self.finished {
            return Err(LakeError::Internal(
                "write after tablet writer finish".to_string(),
            ));
        }
        if chunk.num_rows() == 0 {
            return Ok(());
        }
        self.buffered_rows += chunk.num_rows() as i64;
        self.buffered.push(chunk.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<Option<SegmentInfo>> {
        if self.buffered.is_empty() {
            return Ok(None);
        }
        let name = gen_segment_filename(self.txn_id);
        let batches = std::mem::take(&mut self.buffered);
        let rows = std::mem::take(&mut self.buffered_rows);
        let bytes = self.write_parquet(&name, &Arc::clone(&self.schema), &batches)?;
        self.files.push(name.clone());
        self.data_size += bytes;
        self.num_rows += rows;
        lake_log!(
            log::Level::Debug,
            "segment_flushed",
            "tablet={} txn={} segment={} rows={} bytes={}",
            self.tablet.id(),
            self.txn_id,
            name,
            rows,
            bytes,
        );
        Ok(Some(SegmentInfo {
            name,
            data_size: bytes,
            num_rows: rows,
        }))
    }

    fn flush_del_file(&mut self, _deletes: &BinaryArray) -> Result<()> {
        Err(LakeError::NotSupported(
            "delete files require a primary-key tablet writer".to_string(),
        ))
    }

    fn finish(&mut self) -> Result<()> {
        self.flush()?;
        self.finished = true;
        Ok(())
    }

    fn close(&mut self) {
        self.buffered.clear();
        self.buffered_rows = 0;
    }

    fn files(&self) -> Vec<String> {
        self.files.clone()
    }

    fn data_size(&self) -> i64 {
        self.data_size
    }

    fn num_rows(&self) -> i64 {
        self.num_rows
    }

    fn rowset_txn_meta(&self) -> Option<RowsetTxnMeta> {
        None
    }
}

/// Horizontal writer for primary-key tablets.
pub struct HorizontalPkTabletWriter {
    inner: HorizontalGeneralTabletWriter,
    txn_meta: RowsetTxnMeta,
}

impl HorizontalPkTabletWriter {
    /// Create a primary-key writer emitting segments with `schema` under
    /// `txn_id`.
    pub fn new(tablet: Tablet, schema: SchemaRef, txn_id: i64) -> Self {
        Self {
            inner: HorizontalGeneralTabletWriter::new(tablet, schema, txn_id),
            txn_meta: RowsetTxnMeta::default(),
        }
    }

    fn del_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("pk", DataType::Binary, false)]))
    }
}

impl TabletWriter for HorizontalPkTabletWriter {
    fn open(&mut self) -> Result<()> {
        self.inner.open()
    }

    fn write(&mut self, chunk: &RecordBatch) -> Result<()> {
        self.inner.write(chunk)
    }

    fn flush(&mut self) -> Result<Option<SegmentInfo>> {
        self.inner.flush()
    }

    fn flush_del_file(&mut self, deletes: &BinaryArray) -> Result<()> {
        let schema = Self::del_schema();
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![Arc::new(deletes.clone()) as arrow_array::ArrayRef],
        )?;
        let name = gen_del_filename(self.inner.txn_id);
        let bytes = self.inner.write_parquet(&name, &schema, &[batch])?;
        self.inner.files.push(name.clone());
        self.inner.data_size += bytes;
        lake_log!(
            log::Level::Debug,
            "del_file_flushed",
            "tablet={} txn={} del={} keys={} bytes={}",
            self.inner.tablet.id(),
            self.inner.txn_id,
            name,
            deletes.len(),
            bytes,
        );
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.inner.finish()
    }

    fn close(&mut self) {
        self.inner.close()
    }

    fn files(&self) -> Vec<String> {
        self.inner.files()
    }

    fn data_size(&self) -> i64 {
        self.inner.data_size()
    }

    fn num_rows(&self) -> i64 {
        self.inner.num_rows()
    }

    fn rowset_txn_meta(&self) -> Option<RowsetTxnMeta> {
        Some(self.txn_meta.clone())
    }
}

/// Destination a memtable pushes finalized chunks into.
///
/// Delete-bearing flushes write the delete file before the upsert segment so
/// a reader never observes upserts without the deletes that precede them.
pub trait MemTableSink: Send + Sync {
    /// Encode `chunk` and flush it as one segment.
    fn flush_chunk(&self, chunk: &RecordBatch) -> Result<Option<SegmentInfo>>;

    /// Write `deletes` as a delete file, then flush `upserts` as a segment.
    fn flush_chunk_with_deletes(
        &self,
        upserts: &RecordBatch,
        deletes: &BinaryArray,
    ) -> Result<Option<SegmentInfo>>;
}

/// Sink adapter bridging the memtable to a shared tablet writer.
pub(crate) struct TabletWriterSink {
    writer: SharedTabletWriter,
}

impl TabletWriterSink {
    pub(crate) fn new(writer: SharedTabletWriter) -> Self {
        Self { writer }
    }
}

impl MemTableSink for TabletWriterSink {
    fn flush_chunk(&self, chunk: &RecordBatch) -> Result<Option<SegmentInfo>> {
        let mut writer = self.writer.lock();
        writer.write(chunk)?;
        writer.flush()
    }

    fn flush_chunk_with_deletes(
        &self,
        upserts: &RecordBatch,
        deletes: &BinaryArray,
    ) -> Result<Option<SegmentInfo>> {
        let mut writer = self.writer.lock();
        writer.flush_del_file(deletes)?;
        writer.write(upserts)?;
        writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use arrow_array::Int64Array;

    use super::*;
    use crate::{
        filenames::{is_del, is_segment},
        schema::{KeysType, LogicalType, TabletColumn, TabletSchema},
        tablet::TabletManager,
    };

    fn pk_tablet() -> (tempfile::TempDir, Tablet, SchemaRef) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = TabletManager::new(dir.path());
        let schema = TabletSchema::new(
            1,
            KeysType::PrimaryKeys,
            vec![
                TabletColumn::new(1, "id", LogicalType::Int64).with_key(),
                TabletColumn::new(2, "v", LogicalType::Int64),
            ],
        );
        let arrow = schema.to_arrow_schema(false);
        let tablet = mgr.create_tablet(3, schema).unwrap();
        (dir, tablet, arrow)
    }

    fn batch(schema: &SchemaRef, ids: Vec<i64>) -> RecordBatch {
        let vs: Vec<i64> = ids.iter().map(|i| i * 10).collect();
        RecordBatch::try_new(
            Arc::clone(schema),
            vec![Arc::new(Int64Array::from(ids)), Arc::new(Int64Array::from(vs))],
        )
        .unwrap()
    }

    #[test]
    fn flush_emits_one_segment_per_call() {
        let (_dir, tablet, arrow) = pk_tablet();
        let mut writer = HorizontalGeneralTabletWriter::new(tablet.clone(), arrow.clone(), 42);
        writer.open().unwrap();

        writer.write(&batch(&arrow, vec![1, 2])).unwrap();
        writer.write(&batch(&arrow, vec![3])).unwrap();
        let seg = writer.flush().unwrap().expect("segment");
        assert_eq!(seg.num_rows, 3);
        assert!(is_segment(&seg.name));
        assert!(tablet.data_dir().join(&seg.name).exists());
        assert_eq!(seg.data_size, writer.data_size());

        // nothing buffered, nothing flushed
        assert!(writer.flush().unwrap().is_none());
        assert_eq!(writer.num_rows(), 3);
        assert_eq!(writer.files().len(), 1);
    }

    #[test]
    fn general_writer_rejects_del_files() {
        let (_dir, tablet, arrow) = pk_tablet();
        let mut writer = HorizontalGeneralTabletWriter::new(tablet, arrow, 42);
        writer.open().unwrap();
        let deletes = BinaryArray::from_vec(vec![b"k".as_ref()]);
        assert!(matches!(
            writer.flush_del_file(&deletes),
            Err(LakeError::NotSupported(_))
        ));
    }

    #[test]
    fn sink_orders_del_file_before_segment() {
        let (_dir, tablet, arrow) = pk_tablet();
        let mut writer = HorizontalPkTabletWriter::new(tablet, arrow.clone(), 7);
        writer.open().unwrap();
        let shared: SharedTabletWriter = Arc::new(Mutex::new(Box::new(writer)));
        let sink = TabletWriterSink::new(Arc::clone(&shared));

        let deletes = BinaryArray::from_vec(vec![b"a".as_ref(), b"b".as_ref()]);
        let seg = sink
            .flush_chunk_with_deletes(&batch(&arrow, vec![5]), &deletes)
            .unwrap()
            .expect("segment");
        assert!(is_segment(&seg.name));

        let files = shared.lock().files();
        assert_eq!(files.len(), 2);
        assert!(is_del(&files[0]), "delete file first, got {files:?}");
        assert!(is_segment(&files[1]));
    }

    #[test]
    fn pk_writer_carries_txn_meta() {
        let (_dir, tablet, arrow) = pk_tablet();
        let pk = HorizontalPkTabletWriter::new(tablet.clone(), arrow.clone(), 7);
        assert!(pk.rowset_txn_meta().is_some());
        let general = HorizontalGeneralTabletWriter::new(tablet, arrow, 7);
        assert!(general.rowset_txn_meta().is_none());
    }
}
