//! Pre-merge invariant checks. Everything here runs before the first write;
//! none of these failures is recoverable by the engine.

use color_eyre::eyre::Report;
use color_eyre::Result;
use polars::prelude::{DataFrame, DataType, Schema};

use crate::error::MergeError;
use crate::keys::null_key_columns;
use crate::plan::MergeStrategy;

/// Argument-level checks that need no IO: key columns declared and non-null,
/// partition columns present in the source.
pub fn validate_request(
    source: &DataFrame,
    strategy: MergeStrategy,
    key_columns: &[String],
    partition_columns: &[String],
) -> Result<()> {
    if strategy.requires_keys() && key_columns.is_empty() {
        return Err(Report::new(MergeError::EmptyKeyColumns {
            strategy: strategy.as_str().to_string(),
        }));
    }
    for name in key_columns {
        if source.column(name).is_err() {
            return Err(Report::new(MergeError::Schema(format!(
                "key column '{}' not found in source",
                name
            ))));
        }
    }
    for name in partition_columns {
        if source.column(name).is_err() {
            return Err(Report::new(MergeError::Schema(format!(
                "partition column '{}' not found in source",
                name
            ))));
        }
    }
    if let Some((column, null_count)) = null_key_columns(source, key_columns)?.into_iter().next() {
        return Err(Report::new(MergeError::NullKey { column, null_count }));
    }
    // Partition values determine a row's directory and are immutable per key,
    // so they are held to the same non-null rule as keys.
    for name in partition_columns {
        let nulls = source
            .column(name)
            .map_err(Report::from)?
            .null_count();
        if nulls > 0 {
            return Err(Report::new(MergeError::NullKey {
                column: name.clone(),
                null_count: nulls,
            }));
        }
    }
    Ok(())
}

/// Whether a source value of `from` can be written into a target column of
/// `to`. Equal types always; integers and floats are assignable within their
/// family (the merger casts to the target type).
fn assignable(from: &DataType, to: &DataType) -> bool {
    if from == to {
        return true;
    }
    if from.is_integer() && to.is_integer() {
        return true;
    }
    if from.is_float() && to.is_float() {
        return true;
    }
    false
}

/// Compare the source schema against a target file schema. Partition columns
/// are path-encoded on the target side and exempt from the comparison.
pub fn validate_schema(
    source: &Schema,
    target: &Schema,
    partition_columns: &[String],
) -> Result<()> {
    for (name, target_dtype) in target.iter() {
        if partition_columns.iter().any(|p| p == name.as_str()) {
            continue;
        }
        match source.get(name) {
            None => {
                return Err(Report::new(MergeError::Schema(format!(
                    "target column '{}' missing from source",
                    name
                ))));
            }
            Some(source_dtype) => {
                if !assignable(source_dtype, target_dtype) {
                    return Err(Report::new(MergeError::Schema(format!(
                        "column '{}' has incompatible types: source {:?}, target {:?}",
                        name, source_dtype, target_dtype
                    ))));
                }
            }
        }
    }
    for (name, _) in source.iter() {
        let is_partition = partition_columns.iter().any(|p| p == name.as_str());
        if !is_partition && target.get(name).is_none() {
            return Err(Report::new(MergeError::Schema(format!(
                "source column '{}' not present in target",
                name
            ))));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::merge_error_kind;
    use polars::prelude::*;

    #[test]
    fn rejects_empty_keys_for_upsert() {
        let source = df!("id" => [1i64]).unwrap();
        let err = validate_request(&source, MergeStrategy::Upsert, &[], &[]).unwrap_err();
        assert!(matches!(
            merge_error_kind(&err),
            Some(MergeError::EmptyKeyColumns { .. })
        ));
    }

    #[test]
    fn allows_empty_keys_for_insert() {
        let source = df!("id" => [1i64]).unwrap();
        assert!(validate_request(&source, MergeStrategy::Insert, &[], &[]).is_ok());
    }

    #[test]
    fn rejects_null_keys() {
        let source = df!("id" => [Some(1i64), None]).unwrap();
        let err =
            validate_request(&source, MergeStrategy::Upsert, &["id".to_string()], &[]).unwrap_err();
        match merge_error_kind(&err) {
            Some(MergeError::NullKey { column, null_count }) => {
                assert_eq!(column, "id");
                assert_eq!(*null_count, 1);
            }
            other => panic!("expected NullKey, got {:?}", other),
        }
    }

    #[test]
    fn rejects_missing_partition_column() {
        let source = df!("id" => [1i64]).unwrap();
        let err = validate_request(
            &source,
            MergeStrategy::Upsert,
            &["id".to_string()],
            &["day".to_string()],
        )
        .unwrap_err();
        assert!(matches!(merge_error_kind(&err), Some(MergeError::Schema(_))));
    }

    #[test]
    fn schema_compare_exempts_partition_columns() {
        let mut source = Schema::default();
        source.with_column("id".into(), DataType::Int64);
        source.with_column("day".into(), DataType::String);
        let mut target = Schema::default();
        target.with_column("id".into(), DataType::Int64);
        assert!(validate_schema(&source, &target, &["day".to_string()]).is_ok());
    }

    #[test]
    fn schema_compare_rejects_type_mismatch() {
        let mut source = Schema::default();
        source.with_column("id".into(), DataType::String);
        let mut target = Schema::default();
        target.with_column("id".into(), DataType::Int64);
        let err = validate_schema(&source, &target, &[]).unwrap_err();
        assert!(matches!(merge_error_kind(&err), Some(MergeError::Schema(_))));
    }

    #[test]
    fn schema_compare_allows_int_widening() {
        let mut source = Schema::default();
        source.with_column("id".into(), DataType::Int32);
        let mut target = Schema::default();
        target.with_column("id".into(), DataType::Int64);
        assert!(validate_schema(&source, &target, &[]).is_ok());
    }
}
