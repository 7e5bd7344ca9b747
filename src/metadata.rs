//! Footer metadata analysis: per-file row counts and per-column min/max and
//! null-count statistics, merged across row groups. Reads parquet footers
//! only, never row-group data. Unreadable footers degrade to a conservative
//! descriptor instead of failing the merge.

use color_eyre::eyre::Report;
use color_eyre::Result;
use log::warn;
use polars::prelude::{ParquetReader, Schema, SchemaExt, SerReader};
use polars_parquet::parquet::metadata::FileMetadata;
use polars_parquet::parquet::read::read_metadata;
use polars_parquet::parquet::statistics::Statistics as ParquetStatistics;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom};

use crate::dataset::partition_values_from_path;
use crate::error::MergeError;
use crate::vfs::Vfs;

const PARQUET_FOOTER_TAIL_BYTES: u64 = 256 * 1024;

/// A footer statistic value, reduced to the families the pruner can compare.
#[derive(Debug, Clone, PartialEq)]
pub enum StatValue {
    Bool(bool),
    Int(i128),
    Float(f64),
    Bytes(Vec<u8>),
}

impl StatValue {
    /// Compare two values of the same family. `None` when the families differ
    /// or the comparison is unsafe (NaN), in which case pruning must keep the
    /// file.
    pub fn cmp_same(&self, other: &StatValue) -> Option<Ordering> {
        match (self, other) {
            (StatValue::Bool(a), StatValue::Bool(b)) => Some(a.cmp(b)),
            (StatValue::Int(a), StatValue::Int(b)) => Some(a.cmp(b)),
            (StatValue::Float(a), StatValue::Float(b)) => a.partial_cmp(b),
            (StatValue::Bytes(a), StatValue::Bytes(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// Min/max/null-count for one column, merged across row groups. `reliable`
/// is false when any row group lacks usable statistics or the physical type
/// does not support safe min/max comparison.
#[derive(Debug, Clone, Default)]
pub struct ColumnStats {
    pub min: Option<StatValue>,
    pub max: Option<StatValue>,
    pub null_count: Option<u64>,
    pub reliable: bool,
}

/// Everything the planner needs to know about one dataset file.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub path: String,
    pub partition_values: Vec<(String, String)>,
    pub row_count: usize,
    pub row_group_count: usize,
    pub column_stats: HashMap<String, ColumnStats>,
    pub size_bytes: Option<u64>,
    /// False when the footer could not be read; such files are always
    /// treated as affected.
    pub footer_ok: bool,
}

impl FileDescriptor {
    fn unreadable(path: String, partition_values: Vec<(String, String)>) -> Self {
        FileDescriptor {
            path,
            partition_values,
            row_count: 0,
            row_group_count: 0,
            column_stats: HashMap::new(),
            size_bytes: None,
            footer_ok: false,
        }
    }
}

fn i64_to_u64(v: Option<i64>) -> Option<u64> {
    v.and_then(|n| u64::try_from(n).ok())
}

/// Reduce one parquet statistics object to (min, max, null_count, reliable).
fn reduce_statistics(
    stats: &ParquetStatistics,
) -> (Option<StatValue>, Option<StatValue>, Option<u64>, bool) {
    match stats {
        ParquetStatistics::Boolean(s) => (
            s.min_value.map(StatValue::Bool),
            s.max_value.map(StatValue::Bool),
            i64_to_u64(s.null_count),
            true,
        ),
        ParquetStatistics::Int32(s) => (
            s.min_value.map(|v| StatValue::Int(v as i128)),
            s.max_value.map(|v| StatValue::Int(v as i128)),
            i64_to_u64(s.null_count),
            true,
        ),
        ParquetStatistics::Int64(s) => (
            s.min_value.map(|v| StatValue::Int(v as i128)),
            s.max_value.map(|v| StatValue::Int(v as i128)),
            i64_to_u64(s.null_count),
            true,
        ),
        ParquetStatistics::Float(s) => (
            s.min_value.map(|v| StatValue::Float(v as f64)),
            s.max_value.map(|v| StatValue::Float(v as f64)),
            i64_to_u64(s.null_count),
            true,
        ),
        ParquetStatistics::Double(s) => (
            s.min_value.map(StatValue::Float),
            s.max_value.map(StatValue::Float),
            i64_to_u64(s.null_count),
            true,
        ),
        ParquetStatistics::Binary(s) => (
            s.min_value.clone().map(StatValue::Bytes),
            s.max_value.clone().map(StatValue::Bytes),
            i64_to_u64(s.null_count),
            true,
        ),
        // Int96 timestamps and fixed-length decimals: min/max ordering is not
        // safe to compare byte-wise, so only the null count is kept.
        ParquetStatistics::FixedLen(s) => (None, None, i64_to_u64(s.null_count), false),
        ParquetStatistics::Int96(s) => (None, None, i64_to_u64(s.null_count), false),
    }
}

/// Merge per-row-group statistics into per-column statistics for the file.
fn column_stats_from_footer(meta: &FileMetadata) -> HashMap<String, ColumnStats> {
    // (min, max, null_count, reliable, chunks_seen)
    let mut merged: HashMap<String, (Option<StatValue>, Option<StatValue>, Option<u64>, bool, usize)> =
        HashMap::new();

    for rg in &meta.row_groups {
        for cc in rg.parquet_columns() {
            let descriptor = cc.descriptor();
            let name = match descriptor.path_in_schema.first() {
                Some(n) => n.to_string(),
                None => continue,
            };
            let nested = descriptor.path_in_schema.len() > 1;
            let entry = merged.entry(name).or_insert((None, None, Some(0), true, 0));
            entry.4 += 1;

            if nested {
                entry.3 = false;
                continue;
            }
            match cc.statistics() {
                Some(Ok(stats)) => {
                    let (min, max, nulls, reliable) = reduce_statistics(&stats);
                    entry.3 &= reliable;
                    match min {
                        Some(new) => match &entry.0 {
                            None => entry.0 = Some(new),
                            Some(cur) => {
                                if matches!(new.cmp_same(cur), Some(Ordering::Less)) {
                                    entry.0 = Some(new);
                                }
                            }
                        },
                        None => entry.3 = false,
                    }
                    match max {
                        Some(new) => match &entry.1 {
                            None => entry.1 = Some(new),
                            Some(cur) => {
                                if matches!(new.cmp_same(cur), Some(Ordering::Greater)) {
                                    entry.1 = Some(new);
                                }
                            }
                        },
                        None => entry.3 = false,
                    }
                    entry.2 = match (entry.2, nulls) {
                        (Some(acc), Some(n)) => Some(acc + n),
                        _ => None,
                    };
                }
                Some(Err(_)) | None => {
                    entry.3 = false;
                    entry.2 = None;
                }
            }
        }
    }

    merged
        .into_iter()
        .map(|(name, (min, max, null_count, reliable, chunks))| {
            let reliable = reliable && chunks == meta.row_groups.len() && min.is_some() && max.is_some();
            (
                name,
                ColumnStats {
                    min,
                    max,
                    null_count,
                    reliable,
                },
            )
        })
        .collect()
}

fn analyze_one(vfs: &dyn Vfs, root: &str, path: &str) -> Result<FileDescriptor> {
    let mut reader = vfs.open_read(path)?;
    let meta = read_metadata(&mut reader).map_err(|e| {
        Report::new(MergeError::CorruptParquet {
            path: path.to_string(),
            message: e.to_string(),
        })
    })?;
    Ok(FileDescriptor {
        path: path.to_string(),
        partition_values: partition_values_from_path(root, path),
        row_count: meta.num_rows,
        row_group_count: meta.row_groups.len(),
        column_stats: column_stats_from_footer(&meta),
        size_bytes: vfs.size(path).unwrap_or(None),
        footer_ok: true,
    })
}

/// Analyze the footers of all dataset files. Footer reads fan out over a
/// bounded worker pool; output order matches the input path order. Files
/// whose footers cannot be read come back with `footer_ok = false`.
pub fn analyze_files(
    vfs: &dyn Vfs,
    root: &str,
    paths: &[String],
    pool_width: usize,
) -> Result<Vec<FileDescriptor>> {
    if paths.is_empty() {
        return Ok(Vec::new());
    }
    let width = pool_width.max(1).min(paths.len());
    let mut descriptors: Vec<Option<FileDescriptor>> = vec![None; paths.len()];

    if width == 1 {
        for (i, path) in paths.iter().enumerate() {
            descriptors[i] = Some(analyze_or_degrade(vfs, root, path));
        }
    } else {
        let indexed: Vec<(usize, &String)> = paths.iter().enumerate().collect();
        let chunk_len = paths.len().div_ceil(width);
        let mut results: Vec<(usize, FileDescriptor)> = Vec::with_capacity(paths.len());
        std::thread::scope(|scope| {
            let handles: Vec<_> = indexed
                .chunks(chunk_len)
                .map(|chunk| {
                    scope.spawn(move || {
                        chunk
                            .iter()
                            .map(|(i, path)| (*i, analyze_or_degrade(vfs, root, path)))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            for handle in handles {
                if let Ok(part) = handle.join() {
                    results.extend(part);
                }
            }
        });
        for (i, desc) in results {
            descriptors[i] = Some(desc);
        }
    }

    Ok(descriptors
        .into_iter()
        .zip(paths)
        .map(|(d, path)| {
            d.unwrap_or_else(|| {
                FileDescriptor::unreadable(path.clone(), partition_values_from_path(root, path))
            })
        })
        .collect())
}

fn analyze_or_degrade(vfs: &dyn Vfs, root: &str, path: &str) -> FileDescriptor {
    match analyze_one(vfs, root, path) {
        Ok(desc) => desc,
        Err(e) => {
            warn!("footer read failed for {}; treating file as affected: {e:#}", path);
            FileDescriptor::unreadable(path.to_string(), partition_values_from_path(root, path))
        }
    }
}

/// Read the polars schema of one parquet file from its footer tail. Fetches
/// only the last 256 KiB, mirroring how remote stores are probed.
pub fn read_file_schema(vfs: &dyn Vfs, path: &str) -> Result<Schema> {
    let mut reader = vfs.open_read(path)?;
    let size = reader
        .seek(SeekFrom::End(0))
        .map_err(|e| Report::new(MergeError::Filesystem {
            op: "read",
            path: path.to_string(),
            message: e.to_string(),
        }))?;
    let start = size.saturating_sub(PARQUET_FOOTER_TAIL_BYTES);
    reader
        .seek(SeekFrom::Start(start))
        .map_err(|e| Report::new(MergeError::Filesystem {
            op: "read",
            path: path.to_string(),
            message: e.to_string(),
        }))?;
    let mut tail = Vec::new();
    reader
        .read_to_end(&mut tail)
        .map_err(|e| Report::new(MergeError::Filesystem {
            op: "read",
            path: path.to_string(),
            message: e.to_string(),
        }))?;

    let mut cursor = Cursor::new(tail.as_slice());
    let mut parquet = ParquetReader::new(&mut cursor);
    let arrow_schema = parquet.schema().map_err(|e| {
        Report::new(MergeError::CorruptParquet {
            path: path.to_string(),
            message: e.to_string(),
        })
    })?;
    Ok(Schema::from_arrow_schema(arrow_schema.as_ref()))
}

/// Read-only dataset summary: layout, totals, and schema without merging.
#[derive(Debug, Clone)]
pub struct DatasetInfo {
    pub file_count: usize,
    pub row_count: usize,
    pub partition_columns: Vec<String>,
    pub schema: Option<Schema>,
    pub files: Vec<FileDescriptor>,
}

/// Inspect a dataset: enumerate its files, analyze footers, and report the
/// partition columns observed in paths plus the schema of the first readable
/// file.
pub fn dataset_info(vfs: &dyn Vfs, root: &str, pool_width: usize) -> Result<DatasetInfo> {
    let paths = crate::dataset::enumerate_parquet_files(vfs, root)?;
    let files = analyze_files(vfs, root, &paths, pool_width)?;
    let mut partition_columns: Vec<String> = Vec::new();
    for descriptor in &files {
        for (name, _) in &descriptor.partition_values {
            if !partition_columns.contains(name) {
                partition_columns.push(name.clone());
            }
        }
    }
    let schema = match files.iter().find(|d| d.footer_ok) {
        Some(d) => Some(read_file_schema(vfs, &d.path)?),
        None => None,
    };
    Ok(DatasetInfo {
        file_count: files.len(),
        row_count: files.iter().map(|d| d.row_count).sum(),
        partition_columns,
        schema,
        files,
    })
}
