//! Confirmation scanning: stream only the key columns of candidate files in
//! bounded batches and intersect them with the source key set. Also detects
//! partition-move violations, since those hide in files whose partitions the
//! source never mentions.

use color_eyre::eyre::Report;
use color_eyre::Result;
use log::debug;
use polars::prelude::{col, DataFrame, Expr, IdxSize, LazyFrame, PlPathRef, ScanArgsParquet};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::MergeError;
use crate::keys::encode_row_keys;
use crate::metadata::FileDescriptor;
use crate::prune::file_partition_tokens;

/// Read a bounded slice of one parquet file, optionally projected to a column
/// subset. Hive path inference is off: partition values live in paths only
/// and must not materialize as columns here.
pub(crate) fn scan_parquet_slice(
    path: &str,
    columns: Option<&[String]>,
    offset: usize,
    len: usize,
) -> Result<DataFrame> {
    let pl_path = PlPathRef::new(path).into_owned();
    let args = ScanArgsParquet {
        glob: false,
        hive_options: polars::io::HiveOptions {
            enabled: Some(false),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut lf = LazyFrame::scan_parquet(pl_path, args).map_err(|e| {
        Report::new(MergeError::CorruptParquet {
            path: path.to_string(),
            message: e.to_string(),
        })
    })?;
    if let Some(names) = columns {
        let exprs: Vec<Expr> = names.iter().map(|n| col(n.as_str())).collect();
        lf = lf.select(exprs);
    }
    lf.slice(offset as i64, len as IdxSize)
        .collect()
        .map_err(|e| {
            Report::new(MergeError::CorruptParquet {
                path: path.to_string(),
                message: e.to_string(),
            })
        })
}

pub(crate) fn check_cancel(cancel: Option<&Arc<AtomicBool>>) -> Result<()> {
    if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
        return Err(Report::new(MergeError::Cancelled));
    }
    Ok(())
}

/// Source keys prepared for confirmation: the full hash set plus, when
/// partition columns are declared, the subset belonging to each partition
/// combination.
pub struct SourceKeys {
    pub all: HashSet<u128>,
    pub by_combo: Option<HashMap<Vec<String>, HashSet<u128>>>,
}

/// A partition-move violation: `key_hash` was found in the candidate at
/// `candidate_index` although its source row maps to a different partition.
#[derive(Debug, Clone, Copy)]
pub struct PartitionViolation {
    pub candidate_index: usize,
    pub key_hash: u128,
}

#[derive(Debug)]
pub struct ConfirmOutcome {
    /// Parallel to the candidate slice: true when the file shares at least
    /// one key with the source under the file's own partition.
    pub affected: Vec<bool>,
    /// Exact source∩target key hashes. Complete only when `collect_matches`
    /// was requested; otherwise scanning short-circuits per file.
    pub present_keys: HashSet<u128>,
    pub violation: Option<PartitionViolation>,
}

/// Stream the key columns of each candidate and intersect with the source.
///
/// Candidates whose footer could not be read are marked affected without
/// scanning. When partition columns are declared the whole file is scanned so
/// a key hiding under the wrong partition is caught; otherwise a file
/// short-circuits on its first match (unless `collect_matches` asks for the
/// complete intersection).
pub fn confirm_candidates(
    descriptors: &[FileDescriptor],
    candidates: &[usize],
    source: &SourceKeys,
    key_columns: &[String],
    partition_columns: &[String],
    batch_rows: usize,
    collect_matches: bool,
    cancel: Option<&Arc<AtomicBool>>,
) -> Result<ConfirmOutcome> {
    let batch_rows = batch_rows.max(1);
    let mut affected = vec![false; candidates.len()];
    let mut present_keys: HashSet<u128> = HashSet::new();

    for (ci, &di) in candidates.iter().enumerate() {
        check_cancel(cancel)?;
        let descriptor = &descriptors[di];
        if !descriptor.footer_ok {
            affected[ci] = true;
            continue;
        }
        if descriptor.row_count == 0 {
            continue;
        }

        let validate_partitions = !partition_columns.is_empty();
        let own_keys: Option<&HashSet<u128>> = match (&source.by_combo, validate_partitions) {
            (Some(by_combo), true) => file_partition_tokens(descriptor, partition_columns)
                .as_ref()
                .and_then(|tokens| by_combo.get(tokens)),
            _ => None,
        };
        // A flat file under declared partition columns has no mapping to
        // check against; every match counts as its own partition.
        let has_mapping = !validate_partitions
            || file_partition_tokens(descriptor, partition_columns).is_some();

        let mut offset = 0usize;
        'batches: while offset < descriptor.row_count {
            check_cancel(cancel)?;
            let len = batch_rows.min(descriptor.row_count - offset);
            let batch = scan_parquet_slice(&descriptor.path, Some(key_columns), offset, len)?;
            let hashes = encode_row_keys(&batch, key_columns)?;
            for hash in hashes {
                if !source.all.contains(&hash) {
                    continue;
                }
                // A match belongs to this file only when the source row's
                // partition equals the file's partition; a flat file cannot
                // be checked and accepts every match.
                let own = if validate_partitions && has_mapping {
                    own_keys.is_some_and(|keys| keys.contains(&hash))
                } else {
                    true
                };
                if own {
                    affected[ci] = true;
                    if collect_matches {
                        present_keys.insert(hash);
                    } else if !validate_partitions {
                        debug!("{} confirmed affected, short-circuiting", descriptor.path);
                        break 'batches;
                    }
                } else {
                    return Ok(ConfirmOutcome {
                        affected,
                        present_keys,
                        violation: Some(PartitionViolation {
                            candidate_index: ci,
                            key_hash: hash,
                        }),
                    });
                }
            }
            offset += len;
        }
    }

    Ok(ConfirmOutcome {
        affected,
        present_keys,
        violation: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::analyze_files;
    use crate::vfs::LocalFs;
    use polars::prelude::*;
    use std::fs::File;

    fn write_parquet(path: &std::path::Path, df: &mut DataFrame) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let file = File::create(path).unwrap();
        ParquetWriter::new(file).finish(df).unwrap();
    }

    fn keys_of(df: &DataFrame, key_columns: &[String]) -> SourceKeys {
        SourceKeys {
            all: encode_row_keys(df, key_columns).unwrap().into_iter().collect(),
            by_combo: None,
        }
    }

    #[test]
    fn scan_parquet_slice_bounds_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.parquet");
        let mut df = df!("id" => (0..100i64).collect::<Vec<_>>()).unwrap();
        write_parquet(&path, &mut df);
        let part = scan_parquet_slice(path.to_str().unwrap(), None, 90, 20).unwrap();
        assert_eq!(part.height(), 10);
        let first = part.column("id").unwrap().get(0).unwrap();
        assert_eq!(first, AnyValue::Int64(90));
    }

    #[test]
    fn confirm_marks_only_intersecting_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap().to_string();
        let a = dir.path().join("a.parquet");
        let b = dir.path().join("b.parquet");
        write_parquet(&a, &mut df!("id" => [1i64, 2, 3]).unwrap());
        write_parquet(&b, &mut df!("id" => [10i64, 11]).unwrap());

        let paths = vec![
            a.to_str().unwrap().to_string(),
            b.to_str().unwrap().to_string(),
        ];
        let descs = analyze_files(&LocalFs, &root, &paths, 1).unwrap();
        let key_cols = vec!["id".to_string()];
        let source = df!("id" => [2i64, 99]).unwrap();
        let keys = keys_of(&source, &key_cols);

        let outcome =
            confirm_candidates(&descs, &[0, 1], &keys, &key_cols, &[], 2, false, None).unwrap();
        assert_eq!(outcome.affected, vec![true, false]);
        assert!(outcome.violation.is_none());
    }

    #[test]
    fn confirm_collects_full_intersection_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap().to_string();
        let a = dir.path().join("a.parquet");
        write_parquet(&a, &mut df!("id" => [1i64, 2, 3, 4]).unwrap());
        let paths = vec![a.to_str().unwrap().to_string()];
        let descs = analyze_files(&LocalFs, &root, &paths, 1).unwrap();
        let key_cols = vec!["id".to_string()];
        let source = df!("id" => [2i64, 4, 50]).unwrap();
        let keys = keys_of(&source, &key_cols);

        let outcome =
            confirm_candidates(&descs, &[0], &keys, &key_cols, &[], 2, true, None).unwrap();
        assert_eq!(outcome.present_keys.len(), 2);
    }

    #[test]
    fn confirm_detects_partition_violation() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap().to_string();
        let a = dir.path().join("day=2024-01-01/a.parquet");
        write_parquet(&a, &mut df!("id" => [1i64, 2]).unwrap());
        let paths = vec![a.to_str().unwrap().to_string()];
        let descs = analyze_files(&LocalFs, &root, &paths, 1).unwrap();
        let key_cols = vec!["id".to_string()];
        let part_cols = vec!["day".to_string()];

        // Source puts id=2 under a different day.
        let source = df!("id" => [2i64], "day" => ["2024-01-02"]).unwrap();
        let hashes = encode_row_keys(&source, &key_cols).unwrap();
        let mut by_combo: HashMap<Vec<String>, HashSet<u128>> = HashMap::new();
        by_combo.insert(
            vec!["2024-01-02".to_string()],
            hashes.iter().copied().collect(),
        );
        let keys = SourceKeys {
            all: hashes.into_iter().collect(),
            by_combo: Some(by_combo),
        };

        let outcome = confirm_candidates(
            &descs, &[0], &keys, &key_cols, &part_cols, 10, false, None,
        )
        .unwrap();
        let violation = outcome.violation.expect("expected a violation");
        assert_eq!(violation.candidate_index, 0);
    }

    #[test]
    fn cancelled_flag_aborts_scan() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap().to_string();
        let a = dir.path().join("a.parquet");
        write_parquet(&a, &mut df!("id" => [1i64]).unwrap());
        let paths = vec![a.to_str().unwrap().to_string()];
        let descs = analyze_files(&LocalFs, &root, &paths, 1).unwrap();
        let key_cols = vec!["id".to_string()];
        let source = df!("id" => [1i64]).unwrap();
        let keys = keys_of(&source, &key_cols);

        let cancel = Arc::new(AtomicBool::new(true));
        let err = confirm_candidates(
            &descs,
            &[0],
            &keys,
            &key_cols,
            &[],
            10,
            false,
            Some(&cancel),
        )
        .unwrap_err();
        assert!(matches!(
            crate::error::merge_error_kind(&err),
            Some(MergeError::Cancelled)
        ));
    }
}
