//! Auto-increment filling for partial primary-key updates.
//!
//! When the load plan omits the auto-increment column, rows whose primary
//! key is new to the tablet need freshly allocated ids before the segment is
//! encoded. Rows that already exist keep their placeholder value; the
//! downstream rewrite restores the stored id for them.

use arrow_array::{builder::Int64Builder, cast::AsArray, types::Int64Type, Array, RecordBatch};

use crate::{
    engine::StorageEngine,
    error::{LakeError, Result},
    logging::lake_log,
    schema::{encode_primary_keys, LogicalType, TabletSchema},
    tablet::{Tablet, TabletManager},
    update::NO_ROW,
};

/// Fill freshly allocated ids into the auto-increment column of `chunk` for
/// rows whose primary key is absent from the tablet's pk index, returning
/// the rebuilt chunk.
pub(crate) fn fill_auto_increment_ids(
    tablet_manager: &TabletManager,
    tablet: &Tablet,
    write_schema: &TabletSchema,
    table_id: i64,
    chunk: &RecordBatch,
) -> Result<RecordBatch> {
    let keys = encode_primary_keys(write_schema, chunk)?;
    let num_rows = keys.len();

    // Without cached metadata, or when the probe fails, every row is treated
    // as new; that burns ids but never assigns a stale one.
    let metadata = tablet_manager.get_latest_cached_tablet_metadata(tablet.id());
    let rowids = match &metadata {
        Some(meta) => tablet
            .update_mgr()
            .get_rowids_from_pkindex(tablet, meta.version(), &keys)
            .map_err(|err| {
                lake_log!(
                    log::Level::Warn,
                    "pk_index_probe_failed",
                    "tablet={} error={}",
                    tablet.id(),
                    err,
                );
                err
            })
            .ok(),
        None => None,
    };

    let filter: Vec<bool> = match rowids {
        Some(rowids) => rowids.iter().map(|&v| (v >> 32) == (NO_ROW >> 32)).collect(),
        None => vec![true; num_rows],
    };
    let gen_num = filter.iter().filter(|new| **new).count();

    let ids = StorageEngine::instance().next_increment_id_interval(table_id, gen_num)?;

    let auto_idx = write_schema
        .columns()
        .iter()
        .position(|c| c.is_auto_increment())
        .ok_or_else(|| {
            LakeError::Internal("write schema has no auto increment column".to_string())
        })?;
    if write_schema.column(auto_idx).logical_type() != LogicalType::Int64 {
        return Err(LakeError::Internal(format!(
            "auto increment column {} is not Int64",
            write_schema.column(auto_idx).name()
        )));
    }

    let existing = chunk.column(auto_idx).as_primitive::<Int64Type>();
    let mut builder = Int64Builder::with_capacity(num_rows);
    let mut next = ids.iter();
    for row in 0..num_rows {
        if filter[row] {
            // interval length equals the filter count, so this never runs dry
            builder.append_value(*next.next().expect("allocated id"));
        } else if existing.is_null(row) {
            builder.append_null();
        } else {
            builder.append_value(existing.value(row));
        }
    }

    let mut columns = chunk.columns().to_vec();
    columns[auto_idx] = std::sync::Arc::new(builder.finish());
    RecordBatch::try_new(chunk.schema(), columns).map_err(LakeError::from)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_array::Int64Array;

    use super::*;
    use crate::{
        schema::{KeysType, TabletColumn, TabletSchema},
        tablet::TabletMetadata,
    };

    fn write_schema() -> TabletSchema {
        TabletSchema::new(
            1,
            KeysType::PrimaryKeys,
            vec![
                TabletColumn::new(1, "id", LogicalType::Int64).with_key(),
                TabletColumn::new(2, "ai", LogicalType::Int64).with_auto_increment(),
                TabletColumn::new(3, "v", LogicalType::Int64),
            ],
        )
    }

    fn chunk(schema: &TabletSchema, ids: Vec<i64>) -> RecordBatch {
        let n = ids.len();
        RecordBatch::try_new(
            schema.to_arrow_schema(false),
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(Int64Array::from(vec![0; n])),
                Arc::new(Int64Array::from(vec![7; n])),
            ],
        )
        .unwrap()
    }

    fn setup(tablet_id: i64) -> (tempfile::TempDir, TabletManager, Tablet) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = TabletManager::new(dir.path());
        let tablet = mgr.create_tablet(tablet_id, write_schema()).unwrap();
        (dir, mgr, tablet)
    }

    #[test]
    fn fills_only_rows_missing_from_the_index() {
        let (_dir, mgr, tablet) = setup(21);
        let schema = write_schema();
        let batch = chunk(&schema, vec![1, 2, 3]);

        // id=2 exists in the pk index at version 4
        let existing = encode_primary_keys(&schema, &batch.slice(1, 1)).unwrap();
        tablet
            .update_mgr()
            .insert_pk_entries(21, vec![(existing[0].clone(), (1u64 << 32) | 9)]);
        mgr.cache_tablet_metadata(21, TabletMetadata::new(4));

        let table_id = 0x7e57_1001;
        let filled = fill_auto_increment_ids(&mgr, &tablet, &schema, table_id, &batch).unwrap();
        let ai = filled.column(1).as_primitive::<Int64Type>();
        assert_eq!(StorageEngine::instance().increment_ids_allocated(table_id), 2);
        // new rows got fresh ids, the existing row kept its placeholder
        assert!(ai.value(0) > 0);
        assert_eq!(ai.value(1), 0);
        assert!(ai.value(2) > 0);
        assert_ne!(ai.value(0), ai.value(2));
    }

    #[test]
    fn missing_metadata_allocates_for_every_row() {
        let (_dir, mgr, tablet) = setup(22);
        let schema = write_schema();
        let batch = chunk(&schema, vec![10, 11]);

        let table_id = 0x7e57_1002;
        let filled = fill_auto_increment_ids(&mgr, &tablet, &schema, table_id, &batch).unwrap();
        assert_eq!(StorageEngine::instance().increment_ids_allocated(table_id), 2);
        let ai = filled.column(1).as_primitive::<Int64Type>();
        assert!(ai.value(0) > 0 && ai.value(1) > 0);
    }
}
