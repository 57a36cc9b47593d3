//! Write-schema reconciliation.
//!
//! Computes the write schema from the full tablet schema and the
//! caller-supplied column slots, classifying the write as full or partial.

use std::sync::Arc;

use crate::{
    chunk::OP_COLUMN,
    error::{LakeError, Result},
    logging::lake_log,
    schema::{KeysType, TabletSchema},
};

/// Outcome of reconciling caller slots against the tablet schema.
#[derive(Debug)]
pub(crate) struct WriteSchemaPlan {
    /// Schema chunks are written with; equals the tablet schema for a full
    /// write.
    pub write_schema: Arc<TabletSchema>,
    /// Tablet-schema index of each write-schema column; empty for a full
    /// write, otherwise one entry per write-schema column.
    pub write_column_ids: Vec<usize>,
    /// True iff this is a partial update whose column set does not cover
    /// every sort-key column.
    pub partial_schema_with_sort_key: bool,
}

/// True iff the last slot names the virtual op column.
pub(crate) fn has_op_slot(slots: Option<&[String]>) -> bool {
    slots
        .and_then(|s| s.last())
        .is_some_and(|name| name.as_str() == OP_COLUMN)
}

pub(crate) fn build_write_schema(
    tablet_schema: &Arc<TabletSchema>,
    slots: Option<&[String]>,
    miss_auto_increment_column: bool,
) -> Result<WriteSchemaPlan> {
    let mut plan = WriteSchemaPlan {
        write_schema: Arc::clone(tablet_schema),
        write_column_ids: Vec::new(),
        partial_schema_with_sort_key: false,
    };

    if let Some(slots) = slots {
        let write_columns = slots.len() - usize::from(has_op_slot(Some(slots)));

        // a strict subset of a primary-key schema is a partial update
        if tablet_schema.keys_type() == KeysType::PrimaryKeys
            && write_columns < tablet_schema.num_columns()
        {
            let mut write_column_ids = Vec::with_capacity(write_columns);
            for name in &slots[..write_columns] {
                let index = tablet_schema.field_index(name).ok_or_else(|| {
                    LakeError::InvalidArgument(format!("invalid column name: {name}"))
                })?;
                write_column_ids.push(index);
            }
            let mut sort_key_idxes = tablet_schema.sort_key_idxes().to_vec();
            sort_key_idxes.sort_unstable();
            if !sort_key_idxes
                .iter()
                .all(|idx| write_column_ids.contains(idx))
            {
                plan.partial_schema_with_sort_key = true;
            }
            plan.write_schema = Arc::new(tablet_schema.project(&write_column_ids)?);
            plan.write_column_ids = write_column_ids;
        }
    }

    let auto_increment_in_sort_key = plan
        .write_schema
        .sort_key_idxes()
        .iter()
        .any(|&idx| plan.write_schema.column(idx).is_auto_increment());
    if auto_increment_in_sort_key && miss_auto_increment_column {
        lake_log!(
            log::Level::Warn,
            "reconcile_rejected",
            "auto increment column in sort key do not support partial update",
        );
        return Err(LakeError::NotSupported(
            "auto increment column in sort key do not support partial update".to_string(),
        ));
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{LogicalType, TabletColumn};

    fn pk_schema() -> Arc<TabletSchema> {
        Arc::new(TabletSchema::new(
            1,
            KeysType::PrimaryKeys,
            vec![
                TabletColumn::new(10, "id", LogicalType::Int64).with_key(),
                TabletColumn::new(11, "a", LogicalType::Int32),
                TabletColumn::new(12, "b", LogicalType::Int32),
                TabletColumn::new(13, "c", LogicalType::Int32),
            ],
        ))
    }

    fn slots(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn no_slots_is_a_full_write() {
        let schema = pk_schema();
        let plan = build_write_schema(&schema, None, false).unwrap();
        assert!(plan.write_column_ids.is_empty());
        assert_eq!(plan.write_schema.num_columns(), 4);
        assert!(!plan.partial_schema_with_sort_key);
    }

    #[test]
    fn strict_subset_is_a_partial_update() {
        let schema = pk_schema();
        let plan = build_write_schema(&schema, Some(&slots(&["id", "b"])), false).unwrap();
        assert_eq!(plan.write_column_ids, vec![0, 2]);
        assert_eq!(plan.write_schema.num_columns(), 2);
        assert_eq!(plan.write_schema.column(1).unique_id(), 12);
        // sort key (= pk) is covered, so the flag stays off
        assert!(!plan.partial_schema_with_sort_key);
    }

    #[test]
    fn op_slot_does_not_count_as_a_write_column() {
        let schema = pk_schema();
        let plan =
            build_write_schema(&schema, Some(&slots(&["id", "b", OP_COLUMN])), false).unwrap();
        assert_eq!(plan.write_column_ids, vec![0, 2]);
    }

    #[test]
    fn every_column_listed_reduces_to_a_full_update() {
        let schema = pk_schema();
        let plan =
            build_write_schema(&schema, Some(&slots(&["id", "a", "b", "c"])), false).unwrap();
        assert!(plan.write_column_ids.is_empty());
        assert_eq!(plan.write_schema.num_columns(), 4);
    }

    #[test]
    fn unknown_slot_name_fails() {
        let schema = pk_schema();
        let err = build_write_schema(&schema, Some(&slots(&["id", "nope"])), false).unwrap_err();
        assert!(matches!(err, LakeError::InvalidArgument(_)));
    }

    #[test]
    fn uncovered_sort_key_sets_the_flag() {
        let schema = Arc::new(
            TabletSchema::new(
                1,
                KeysType::PrimaryKeys,
                vec![
                    TabletColumn::new(10, "id", LogicalType::Int64).with_key(),
                    TabletColumn::new(11, "a", LogicalType::Int32),
                    TabletColumn::new(12, "b", LogicalType::Int32),
                ],
            )
            .with_sort_key_idxes(vec![2]),
        );
        let plan = build_write_schema(&schema, Some(&slots(&["id", "a"])), false).unwrap();
        assert!(plan.partial_schema_with_sort_key);
    }

    #[test]
    fn missing_auto_increment_in_sort_key_is_rejected() {
        let schema = Arc::new(
            TabletSchema::new(
                1,
                KeysType::PrimaryKeys,
                vec![
                    TabletColumn::new(10, "id", LogicalType::Int64).with_key(),
                    TabletColumn::new(11, "ai", LogicalType::Int64).with_auto_increment(),
                    TabletColumn::new(12, "v", LogicalType::Int32),
                ],
            )
            .with_sort_key_idxes(vec![0, 1]),
        );
        let err = build_write_schema(&schema, Some(&slots(&["id", "ai", "v"])), true).unwrap_err();
        assert!(matches!(err, LakeError::NotSupported(_)));
    }
}
