//! Rewrite planning: fold the confirmation results into the set of files to
//! rewrite and the set to preserve, and fix the strategy semantics in one
//! place (a tagged choice, not a hierarchy).

use polars::prelude::IdxSize;

use crate::metadata::FileDescriptor;

/// How source rows combine with the target dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Only keys absent from the target are written; existing rows are
    /// never touched.
    Insert,
    /// Only keys present in the target are replaced; the rest of the source
    /// is discarded.
    Update,
    /// Present keys are replaced, absent keys are appended.
    Upsert,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::Insert => "insert",
            MergeStrategy::Update => "update",
            MergeStrategy::Upsert => "upsert",
        }
    }

    /// Whether matched keys replace target rows (forces file rewrites).
    pub fn rewrites_matches(&self) -> bool {
        matches!(self, MergeStrategy::Update | MergeStrategy::Upsert)
    }

    /// Whether unmatched keys are written as new files.
    pub fn inserts_new(&self) -> bool {
        matches!(self, MergeStrategy::Insert | MergeStrategy::Upsert)
    }

    /// Insert without keys degenerates to a plain partitioned append, so only
    /// update and upsert demand a key list.
    pub fn requires_keys(&self) -> bool {
        matches!(self, MergeStrategy::Update | MergeStrategy::Upsert)
    }
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The file-level outcome of planning: which descriptor indices get rewritten
/// and which are left untouched.
#[derive(Debug, Clone)]
pub struct RewritePlan {
    pub affected: Vec<usize>,
    pub preserved: Vec<usize>,
    /// Rows inside the affected files (drives progress reporting).
    pub affected_row_count: usize,
    /// Rows across the whole dataset before the merge.
    pub target_row_count: usize,
}

/// Build the plan from confirmation results. `candidates` and
/// `affected_flags` are parallel; every other descriptor index is preserved.
/// Insert never rewrites, so its affected set is empty by construction.
pub fn build_plan(
    descriptors: &[FileDescriptor],
    candidates: &[usize],
    affected_flags: &[bool],
    strategy: MergeStrategy,
) -> RewritePlan {
    let mut affected: Vec<usize> = Vec::new();
    if strategy.rewrites_matches() {
        for (ci, &di) in candidates.iter().enumerate() {
            if affected_flags[ci] {
                affected.push(di);
            }
        }
        affected.sort_unstable();
    }
    let affected_set: std::collections::HashSet<usize> = affected.iter().copied().collect();
    let preserved: Vec<usize> = (0..descriptors.len())
        .filter(|i| !affected_set.contains(i))
        .collect();

    RewritePlan {
        affected_row_count: affected.iter().map(|&i| descriptors[i].row_count).sum(),
        target_row_count: descriptors.iter().map(|d| d.row_count).sum(),
        affected,
        preserved,
    }
}

/// Split deduplicated source rows by applied-key membership after the rewrite
/// pass: `matched` rows replaced a target row, `unmatched` rows did not.
pub fn split_source_rows(
    hashes: &[u128],
    applied: impl Fn(u128) -> bool,
) -> (Vec<IdxSize>, Vec<IdxSize>) {
    let mut matched = Vec::new();
    let mut unmatched = Vec::new();
    for (i, &hash) in hashes.iter().enumerate() {
        if applied(hash) {
            matched.push(i as IdxSize);
        } else {
            unmatched.push(i as IdxSize);
        }
    }
    (matched, unmatched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::FileDescriptor;
    use std::collections::HashMap;

    fn descriptor(rows: usize) -> FileDescriptor {
        FileDescriptor {
            path: format!("{}rows.parquet", rows),
            partition_values: Vec::new(),
            row_count: rows,
            row_group_count: 1,
            column_stats: HashMap::new(),
            size_bytes: None,
            footer_ok: true,
        }
    }

    #[test]
    fn plan_partitions_affected_and_preserved() {
        let descs = vec![descriptor(10), descriptor(20), descriptor(30)];
        let plan = build_plan(&descs, &[0, 2], &[true, false], MergeStrategy::Upsert);
        assert_eq!(plan.affected, vec![0]);
        assert_eq!(plan.preserved, vec![1, 2]);
        assert_eq!(plan.affected_row_count, 10);
        assert_eq!(plan.target_row_count, 60);
    }

    #[test]
    fn insert_plans_no_rewrites() {
        let descs = vec![descriptor(10)];
        let plan = build_plan(&descs, &[0], &[true], MergeStrategy::Insert);
        assert!(plan.affected.is_empty());
        assert_eq!(plan.preserved, vec![0]);
    }

    #[test]
    fn split_source_rows_by_membership() {
        let hashes = vec![1u128, 2, 3];
        let (matched, unmatched) = split_source_rows(&hashes, |h| h == 2);
        assert_eq!(matched, vec![1]);
        assert_eq!(unmatched, vec![0, 2]);
    }

    #[test]
    fn strategy_flags() {
        assert!(MergeStrategy::Upsert.rewrites_matches());
        assert!(MergeStrategy::Upsert.inserts_new());
        assert!(!MergeStrategy::Insert.rewrites_matches());
        assert!(!MergeStrategy::Update.inserts_new());
        assert!(!MergeStrategy::Insert.requires_keys());
    }
}
