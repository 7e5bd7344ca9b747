//! Typed merge failure kinds.
//!
//! Fallible operations return `color_eyre::Result`; a `MergeError` sits at the
//! base of the report chain so callers can classify failures by kind (typed
//! matching, no string parsing). `merge_error_kind` walks the chain.

use std::fmt;

/// Classified failure kinds for a merge. `PartialPromotion` carries the
/// completed and pending rename sets so operators can reconcile.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeError {
    /// Bad options or arguments (unknown codec, zero chunk size, ...).
    InvalidArgument(String),
    /// A key column of the source contains nulls.
    NullKey { column: String, null_count: usize },
    /// No key columns declared for a strategy that requires them.
    EmptyKeyColumns { strategy: String },
    /// A key present in both source and target has different partition values.
    PartitionMove {
        key: String,
        column: String,
        source_value: String,
        target_value: String,
    },
    /// Field names missing or types incompatible between source and target.
    Schema(String),
    /// Read, write, rename, or remove failed in the filesystem collaborator.
    Filesystem {
        op: &'static str,
        path: String,
        message: String,
    },
    /// Parquet footer or data could not be decoded.
    CorruptParquet { path: String, message: String },
    /// Memory pressure reached the emergency level.
    MemoryBudgetExceeded {
        allocated_bytes: u64,
        limit_bytes: u64,
    },
    /// The cancellation token was observed set.
    Cancelled,
    /// Some promotion renames succeeded and some did not. The dataset is in a
    /// mixed state; the engine does not clean this up.
    PartialPromotion {
        completed: Vec<String>,
        pending: Vec<String>,
        message: String,
    },
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            MergeError::NullKey { column, null_count } => write!(
                f,
                "Key column '{}' contains {} null value(s); key columns must be non-null",
                column, null_count
            ),
            MergeError::EmptyKeyColumns { strategy } => write!(
                f,
                "Strategy '{}' requires at least one key column",
                strategy
            ),
            MergeError::PartitionMove {
                key,
                column,
                source_value,
                target_value,
            } => write!(
                f,
                "Key {} would move partition '{}' from '{}' to '{}'; partitions are immutable per key",
                key, column, target_value, source_value
            ),
            MergeError::Schema(msg) => write!(f, "Schema mismatch: {}", msg),
            MergeError::Filesystem { op, path, message } => {
                write!(f, "Filesystem {} failed for '{}': {}", op, path, message)
            }
            MergeError::CorruptParquet { path, message } => {
                write!(f, "Corrupt parquet file '{}': {}", path, message)
            }
            MergeError::MemoryBudgetExceeded {
                allocated_bytes,
                limit_bytes,
            } => write!(
                f,
                "Memory budget exceeded: {} bytes allocated against a limit of {}",
                allocated_bytes, limit_bytes
            ),
            MergeError::Cancelled => write!(f, "Merge cancelled"),
            MergeError::PartialPromotion {
                completed,
                pending,
                message,
            } => write!(
                f,
                "Partial promotion: {} rename(s) completed, {} pending: {}",
                completed.len(),
                pending.len(),
                message
            ),
        }
    }
}

impl std::error::Error for MergeError {}

/// Walk a report's cause chain and return the first `MergeError`, if any.
pub fn merge_error_kind(report: &color_eyre::eyre::Report) -> Option<&MergeError> {
    report
        .chain()
        .find_map(|cause| cause.downcast_ref::<MergeError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::eyre::Report;

    #[test]
    fn merge_error_kind_finds_base_of_chain() {
        let report = Report::new(MergeError::Cancelled).wrap_err("while rewriting file");
        assert_eq!(merge_error_kind(&report), Some(&MergeError::Cancelled));
    }

    #[test]
    fn merge_error_kind_none_for_foreign_error() {
        let report = Report::msg("unrelated");
        assert!(merge_error_kind(&report).is_none());
    }

    #[test]
    fn null_key_display_names_column() {
        let err = MergeError::NullKey {
            column: "id".to_string(),
            null_count: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("'id'"), "expected column name, got: {}", msg);
        assert!(msg.contains("3 null"), "expected count, got: {}", msg);
    }

    #[test]
    fn partition_move_display_names_both_values() {
        let err = MergeError::PartitionMove {
            key: "2".to_string(),
            column: "day".to_string(),
            source_value: "2024-01-02".to_string(),
            target_value: "2024-01-01".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("2024-01-01") && msg.contains("2024-01-02"));
    }
}
