//! Merge orchestration: drives enumeration, analysis, pruning, confirmation,
//! validation, the streaming rewrite, new-file emission, and promotion, and
//! emits the final result. One merge runs as a single cooperative task; the
//! only parallel section is the footer fan-out in the metadata analyzer.

use color_eyre::eyre::Report;
use color_eyre::Result;
use log::debug;
use polars::prelude::{
    BrotliLevel, DataFrame, GzipLevel, IdxCa, IdxSize, NamedFrom, ParquetCompression,
    ParquetWriter, Schema, StatisticsOptions, ZstdLevel,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::dataset::enumerate_parquet_files;
use crate::error::MergeError;
use crate::keys::{dedup_last_write_wins, display_key, encode_row_keys};
use crate::memory::{MemoryLimits, MemoryPressure, MemoryProbe, SystemProbe};
use crate::metadata::{analyze_files, read_file_schema, FileDescriptor};
use crate::plan::{build_plan, split_source_rows, MergeStrategy};
use crate::prune::{partition_prune, partition_tokens, source_key_stat_values, stats_prune};
use crate::scan::{check_cancel, confirm_candidates, scan_parquet_slice, SourceKeys};
use crate::staging::{part_file_name, PromotionStep, Staging};
use crate::tracker::{KeyTracker, TrackerTier, DEFAULT_BLOOM_FPR};
use crate::vfs::Vfs;
use xxhash_rust::xxh3::xxh3_64;

const MIN_CHUNK_ROWS: usize = 1024;
const METADATA_POOL_MAX: usize = 8;

/// Progress observer: `(processed_rows, total_rows)`.
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Explicit options record; every recognized knob is a field.
#[derive(Clone)]
pub struct MergeOptions {
    /// Parquet codec name: `zstd`, `snappy`, `gzip`, `brotli`, `lz4`,
    /// `uncompressed`.
    pub compression: String,
    /// Row cap per newly created file.
    pub max_rows_per_file: usize,
    /// Parquet row-group size for all outputs.
    pub row_group_size: usize,
    /// Streaming chunk size in rows; adapts downward under memory pressure.
    pub merge_chunk_size_rows: usize,
    pub max_allocator_bytes: u64,
    pub max_process_bytes: Option<u64>,
    pub min_system_available_bytes: u64,
    /// False-positive rate of the probabilistic tracker tier.
    pub tracker_false_positive_rate: f64,
    pub progress_callback: Option<ProgressCallback>,
    pub cancel_token: Option<Arc<AtomicBool>>,
}

impl Default for MergeOptions {
    fn default() -> Self {
        MergeOptions {
            compression: "zstd".to_string(),
            max_rows_per_file: 1_000_000,
            row_group_size: 128 * 1024,
            merge_chunk_size_rows: 64 * 1024,
            max_allocator_bytes: 512 * 1024 * 1024,
            max_process_bytes: None,
            min_system_available_bytes: 128 * 1024 * 1024,
            tracker_false_positive_rate: DEFAULT_BLOOM_FPR,
            progress_callback: None,
            cancel_token: None,
        }
    }
}

impl MergeOptions {
    fn limits(&self) -> MemoryLimits {
        MemoryLimits {
            max_allocator_bytes: self.max_allocator_bytes,
            max_process_bytes: self.max_process_bytes,
            min_system_available_bytes: self.min_system_available_bytes,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.merge_chunk_size_rows == 0 {
            return Err(Report::new(MergeError::InvalidArgument(
                "merge_chunk_size_rows must be positive".to_string(),
            )));
        }
        if self.max_rows_per_file == 0 {
            return Err(Report::new(MergeError::InvalidArgument(
                "max_rows_per_file must be positive".to_string(),
            )));
        }
        if self.row_group_size == 0 {
            return Err(Report::new(MergeError::InvalidArgument(
                "row_group_size must be positive".to_string(),
            )));
        }
        if !(self.tracker_false_positive_rate > 0.0 && self.tracker_false_positive_rate < 1.0) {
            return Err(Report::new(MergeError::InvalidArgument(
                "tracker_false_positive_rate must be in (0, 1)".to_string(),
            )));
        }
        parquet_compression(&self.compression)?;
        Ok(())
    }
}

fn parquet_compression(name: &str) -> Result<ParquetCompression> {
    match name.to_ascii_lowercase().as_str() {
        "uncompressed" | "none" => Ok(ParquetCompression::Uncompressed),
        "snappy" => Ok(ParquetCompression::Snappy),
        "zstd" => Ok(ParquetCompression::Zstd(ZstdLevel::try_new(3).ok())),
        "gzip" => Ok(ParquetCompression::Gzip(GzipLevel::try_new(6).ok())),
        "brotli" => Ok(ParquetCompression::Brotli(BrotliLevel::try_new(4).ok())),
        "lz4" => Ok(ParquetCompression::Lz4Raw),
        other => Err(Report::new(MergeError::InvalidArgument(format!(
            "unknown compression codec '{}'",
            other
        )))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOperation {
    Rewritten,
    Inserted,
    Preserved,
}

impl FileOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileOperation::Rewritten => "rewritten",
            FileOperation::Inserted => "inserted",
            FileOperation::Preserved => "preserved",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MergeFileReport {
    pub path: String,
    pub row_count: usize,
    pub operation: FileOperation,
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct MergeResult {
    pub strategy: MergeStrategy,
    pub source_count: usize,
    pub target_count_before: usize,
    pub target_count_after: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Always zero for insert/update/upsert; kept for result-shape parity
    /// with deletion-capable tooling.
    pub deleted: usize,
    pub files: Vec<MergeFileReport>,
    pub tracker_tier: TrackerTier,
    pub tracker_evictions: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeState {
    Planning,
    Validating,
    Rewriting,
    Promoting,
    Done,
    Failed,
}

fn enter(state: &mut MergeState, next: MergeState) {
    debug!("merge state {:?} -> {:?}", *state, next);
    *state = next;
}

struct Progress {
    callback: Option<ProgressCallback>,
    total: usize,
    processed: usize,
}

impl Progress {
    fn new(callback: Option<ProgressCallback>, total: usize) -> Self {
        Progress {
            callback,
            total,
            processed: 0,
        }
    }

    fn add(&mut self, rows: usize) {
        self.processed = (self.processed + rows).min(self.total);
        if let Some(cb) = &self.callback {
            cb(self.processed, self.total);
        }
    }

    fn finish(&mut self) {
        self.processed = self.total;
        if let Some(cb) = &self.callback {
            cb(self.processed, self.total);
        }
    }
}

/// Merge `source` into the dataset at `target_root` with the default local
/// filesystem and system memory probe.
pub fn merge(
    vfs: &dyn Vfs,
    source: &DataFrame,
    target_root: &str,
    strategy: MergeStrategy,
    key_columns: &[String],
    partition_columns: &[String],
    options: &MergeOptions,
) -> Result<MergeResult> {
    let mut probe = SystemProbe::new(options.limits());
    merge_with_probe(
        vfs,
        &mut probe,
        source,
        target_root,
        strategy,
        key_columns,
        partition_columns,
        options,
    )
}

/// Merge with a caller-supplied memory probe.
#[allow(clippy::too_many_arguments)]
pub fn merge_with_probe(
    vfs: &dyn Vfs,
    probe: &mut dyn MemoryProbe,
    source: &DataFrame,
    target_root: &str,
    strategy: MergeStrategy,
    key_columns: &[String],
    partition_columns: &[String],
    options: &MergeOptions,
) -> Result<MergeResult> {
    options.validate()?;
    crate::validate::validate_request(source, strategy, key_columns, partition_columns)?;

    let mut staging_slot: Option<Staging<'_>> = None;
    let mut state = MergeState::Planning;
    let outcome = execute(
        vfs,
        probe,
        source,
        target_root,
        strategy,
        key_columns,
        partition_columns,
        options,
        &mut state,
        &mut staging_slot,
    );
    match outcome {
        Ok(result) => Ok(result),
        Err(err) => {
            enter(&mut state, MergeState::Failed);
            // A partial promotion left renames behind that operators must
            // reconcile; its staging files stay in place. Everything else is
            // cleaned up.
            let partial = matches!(
                crate::error::merge_error_kind(&err),
                Some(MergeError::PartialPromotion { .. })
            );
            if !partial {
                if let Some(staging) = &staging_slot {
                    let _ = staging.cleanup();
                }
            }
            Err(err)
        }
    }
}

fn empty_result(strategy: MergeStrategy, source_count: usize) -> MergeResult {
    MergeResult {
        strategy,
        source_count,
        target_count_before: 0,
        target_count_after: 0,
        inserted: 0,
        updated: 0,
        deleted: 0,
        files: Vec::new(),
        tracker_tier: TrackerTier::Exact,
        tracker_evictions: 0,
    }
}

/// Select and cast `df` to exactly the columns of `schema`, in order.
fn align_to_schema(df: &DataFrame, schema: &Schema) -> Result<DataFrame> {
    let mut columns = Vec::with_capacity(schema.len());
    for (name, dtype) in schema.iter() {
        let col = df.column(name.as_str()).map_err(Report::from)?;
        let col = if col.dtype() != dtype {
            col.cast(dtype).map_err(Report::from)?
        } else {
            col.clone()
        };
        columns.push(col);
    }
    DataFrame::new(columns).map_err(Report::from)
}

/// The schema new files are written with: the target file schema when the
/// dataset has one, otherwise the source schema minus partition columns.
fn new_file_schema(
    source: &DataFrame,
    target_schema: Option<&Schema>,
    partition_columns: &[String],
) -> Schema {
    if let Some(schema) = target_schema {
        return schema.clone();
    }
    let mut out = Schema::with_capacity(source.width());
    for (name, dtype) in source.schema().iter() {
        if !partition_columns.iter().any(|p| p == name.as_str()) {
            out.with_column(name.clone(), dtype.clone());
        }
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn execute<'a>(
    vfs: &'a dyn Vfs,
    probe: &mut dyn MemoryProbe,
    source: &DataFrame,
    target_root: &str,
    strategy: MergeStrategy,
    key_columns: &[String],
    partition_columns: &[String],
    options: &MergeOptions,
    state: &mut MergeState,
    staging_slot: &mut Option<Staging<'a>>,
) -> Result<MergeResult> {
    let cancel = options.cancel_token.as_ref();
    let source_count = source.height();
    if source_count == 0 {
        return Ok(empty_result(strategy, 0));
    }

    // ---- Planning: enumerate, analyze, prune. ----
    let paths = enumerate_parquet_files(vfs, target_root)?;
    let pool_width = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(METADATA_POOL_MAX);
    let descriptors = analyze_files(vfs, target_root, &paths, pool_width)?;
    check_cancel(cancel)?;

    let deduped = dedup_last_write_wins(source, key_columns)?;
    let source_hashes = if key_columns.is_empty() {
        Vec::new()
    } else {
        encode_row_keys(&deduped, key_columns)?
    };
    let hash_to_row: HashMap<u128, IdxSize> = source_hashes
        .iter()
        .enumerate()
        .map(|(i, &h)| (h, i as IdxSize))
        .collect();
    let source_tokens = if partition_columns.is_empty() {
        Vec::new()
    } else {
        partition_tokens(&deduped, partition_columns)?
    };

    let source_keys = {
        let all: HashSet<u128> = source_hashes.iter().copied().collect();
        let by_combo = if partition_columns.is_empty() || key_columns.is_empty() {
            None
        } else {
            let mut map: HashMap<Vec<String>, HashSet<u128>> = HashMap::new();
            for (hash, tokens) in source_hashes.iter().zip(&source_tokens) {
                map.entry(tokens.clone()).or_default().insert(*hash);
            }
            Some(map)
        };
        SourceKeys { all, by_combo }
    };

    let (matched, foreign) = {
        let combos: HashSet<Vec<String>> = source_tokens.iter().cloned().collect();
        partition_prune(&descriptors, &combos, partition_columns)
    };
    let candidates: Vec<usize> = if key_columns.is_empty() {
        Vec::new()
    } else {
        let stat_values = source_key_stat_values(&deduped, key_columns)?;
        let mut c = stats_prune(&descriptors, &matched, &stat_values);
        c.extend(stats_prune(&descriptors, &foreign, &stat_values));
        c
    };

    // ---- Validating: schema compatibility, then key confirmation with
    // partition-move detection. ----
    enter(state, MergeState::Validating);
    let target_schema = descriptors
        .iter()
        .find(|d| d.footer_ok)
        .map(|d| read_file_schema(vfs, &d.path))
        .transpose()?;
    if let Some(schema) = &target_schema {
        crate::validate::validate_schema(&source.schema(), schema, partition_columns)?;
    }

    let collect_matches = strategy == MergeStrategy::Insert && !key_columns.is_empty();
    let confirm = confirm_candidates(
        &descriptors,
        &candidates,
        &source_keys,
        key_columns,
        partition_columns,
        options.merge_chunk_size_rows,
        collect_matches,
        cancel,
    )?;
    if let Some(violation) = confirm.violation {
        let descriptor = &descriptors[candidates[violation.candidate_index]];
        return Err(partition_move_error(
            &deduped,
            key_columns,
            partition_columns,
            &source_tokens,
            &hash_to_row,
            violation.key_hash,
            descriptor,
        ));
    }

    let plan = build_plan(&descriptors, &candidates, &confirm.affected, strategy);
    check_cancel(cancel)?;

    // ---- Rewriting. ----
    enter(state, MergeState::Rewriting);
    let mut progress = Progress::new(
        options.progress_callback.clone(),
        plan.affected_row_count + deduped.height(),
    );
    let mut tracker = KeyTracker::for_estimate(
        deduped.height(),
        options.tracker_false_positive_rate,
    );
    let codec = parquet_compression(&options.compression)?;
    let data_schema = new_file_schema(&deduped, target_schema.as_ref(), partition_columns);

    let needs_staging = !plan.affected.is_empty() || strategy.inserts_new();
    if needs_staging {
        *staging_slot = Some(Staging::new(vfs, target_root));
    }

    let mut steps: Vec<PromotionStep> = Vec::new();
    let mut rewritten_reports: Vec<(String, usize)> = Vec::new();
    let mut staged_rewrites: Vec<(String, usize)> = Vec::new();
    let mut updated = 0usize;

    for &di in &plan.affected {
        check_cancel(cancel)?;
        let descriptor = &descriptors[di];
        let staging = staging_slot.as_ref().unwrap();
        let staged = staging.rewrite_path(&descriptor.path);
        let (rows, matches) = rewrite_file(
            vfs,
            probe,
            descriptor,
            &deduped,
            &hash_to_row,
            key_columns,
            &staged,
            codec,
            options,
            &mut tracker,
            &mut progress,
            cancel,
        )?;
        updated += matches;
        steps.push(PromotionStep {
            staged: staged.clone(),
            target: descriptor.path.clone(),
        });
        staged_rewrites.push((staged, rows));
        rewritten_reports.push((descriptor.path.clone(), rows));
    }

    // ---- New-file emission. ----
    let mut inserted = 0usize;
    let mut inserted_reports: Vec<(String, usize)> = Vec::new();
    if strategy.inserts_new() && deduped.height() > 0 {
        let applied: Box<dyn Fn(u128) -> bool + '_> = if key_columns.is_empty() {
            Box::new(|_| false)
        } else if strategy == MergeStrategy::Insert {
            let present = confirm.present_keys;
            Box::new(move |h| present.contains(&h))
        } else if tracker.is_exact() {
            Box::new(|h| tracker.contains(h))
        } else {
            // Second pass: the tracker only answers "possibly applied", so
            // re-derive the exact applied set from the staged rewrites.
            let exact = exact_applied_keys(
                &staged_rewrites,
                &source_keys.all,
                key_columns,
                options.merge_chunk_size_rows,
                cancel,
            )?;
            Box::new(move |h| exact.contains(&h))
        };

        let (_, unmatched) = if key_columns.is_empty() {
            (Vec::new(), (0..deduped.height() as IdxSize).collect())
        } else {
            split_source_rows(&source_hashes, |h| applied(h))
        };

        if !unmatched.is_empty() {
            let staging = staging_slot.as_ref().unwrap();
            inserted = emit_new_files(
                vfs,
                staging,
                target_root,
                &deduped,
                &source_hashes,
                &source_tokens,
                &unmatched,
                &data_schema,
                partition_columns,
                codec,
                options,
                &mut steps,
                &mut inserted_reports,
                &mut progress,
                cancel,
            )?;
        }
    }

    // ---- Promoting. ----
    check_cancel(cancel)?;
    if let Some(staging) = staging_slot.as_ref() {
        enter(state, MergeState::Promoting);
        staging.promote(&steps)?;
        staging.cleanup()?;
    }
    enter(state, MergeState::Done);
    progress.finish();

    // ---- Result assembly. ----
    let mut files = Vec::with_capacity(descriptors.len() + inserted_reports.len());
    for (path, rows) in rewritten_reports {
        let size_bytes = vfs.size(&path).unwrap_or(None);
        files.push(MergeFileReport {
            path,
            row_count: rows,
            operation: FileOperation::Rewritten,
            size_bytes,
        });
    }
    for (path, rows) in inserted_reports {
        let size_bytes = vfs.size(&path).unwrap_or(None);
        files.push(MergeFileReport {
            path,
            row_count: rows,
            operation: FileOperation::Inserted,
            size_bytes,
        });
    }
    for &di in &plan.preserved {
        let descriptor = &descriptors[di];
        files.push(MergeFileReport {
            path: descriptor.path.clone(),
            row_count: descriptor.row_count,
            operation: FileOperation::Preserved,
            size_bytes: descriptor.size_bytes,
        });
    }

    let rewritten_rows: usize = files
        .iter()
        .filter(|f| f.operation == FileOperation::Rewritten)
        .map(|f| f.row_count)
        .sum();
    let preserved_rows: usize = plan.preserved.iter().map(|&i| descriptors[i].row_count).sum();

    Ok(MergeResult {
        strategy,
        source_count,
        target_count_before: plan.target_row_count,
        target_count_after: preserved_rows + rewritten_rows + inserted,
        inserted,
        updated,
        deleted: 0,
        files,
        tracker_tier: tracker.tier(),
        tracker_evictions: tracker.evictions(),
    })
}

#[allow(clippy::too_many_arguments)]
fn partition_move_error(
    deduped: &DataFrame,
    key_columns: &[String],
    partition_columns: &[String],
    source_tokens: &[Vec<String>],
    hash_to_row: &HashMap<u128, IdxSize>,
    key_hash: u128,
    descriptor: &FileDescriptor,
) -> Report {
    let row = hash_to_row.get(&key_hash).map(|&i| i as usize).unwrap_or(0);
    let key = display_key(deduped, key_columns, row);
    for (pi, column) in partition_columns.iter().enumerate() {
        let source_value = source_tokens
            .get(row)
            .and_then(|tokens| tokens.get(pi))
            .cloned()
            .unwrap_or_default();
        let target_value = crate::dataset::partition_value(&descriptor.partition_values, column)
            .unwrap_or_default()
            .to_string();
        if source_value != target_value {
            return Report::new(MergeError::PartitionMove {
                key: key.clone(),
                column: column.clone(),
                source_value,
                target_value,
            });
        }
    }
    Report::new(MergeError::PartitionMove {
        key,
        column: partition_columns.first().cloned().unwrap_or_default(),
        source_value: String::new(),
        target_value: String::new(),
    })
}

/// Rewrite one affected file into staging: stream bounded chunks, replace
/// matched rows with their source row in place, pass everything else through.
/// Returns (rows written, rows replaced).
#[allow(clippy::too_many_arguments)]
fn rewrite_file(
    vfs: &dyn Vfs,
    probe: &mut dyn MemoryProbe,
    descriptor: &FileDescriptor,
    deduped: &DataFrame,
    hash_to_row: &HashMap<u128, IdxSize>,
    key_columns: &[String],
    staged_path: &str,
    codec: ParquetCompression,
    options: &MergeOptions,
    tracker: &mut KeyTracker,
    progress: &mut Progress,
    cancel: Option<&Arc<AtomicBool>>,
) -> Result<(usize, usize)> {
    // The first chunk fixes the output schema; the source is aligned to it so
    // replacement rows stack cleanly.
    let mut chunk_rows = options.merge_chunk_size_rows.max(MIN_CHUNK_ROWS);
    let mut source_aligned: Option<DataFrame> = None;
    let mut writer = None;
    let mut offset = 0usize;
    let mut rows_written = 0usize;
    let mut matches_total = 0usize;

    // The loop reads until the file is exhausted rather than trusting the
    // footer row count, so a file whose footer could not be read still fails
    // here (fatal) instead of slipping through as empty.
    loop {
        check_cancel(cancel)?;
        let chunk = scan_parquet_slice(&descriptor.path, None, offset, chunk_rows)?;
        if chunk.height() == 0 {
            break;
        }
        let len = chunk.height();
        if source_aligned.is_none() {
            source_aligned = Some(align_to_schema(deduped, &chunk.schema())?);
        }
        let aligned = source_aligned.as_ref().unwrap();

        let hashes = encode_row_keys(&chunk, key_columns)?;
        let mut matched: Vec<(IdxSize, IdxSize)> = Vec::new();
        for (i, hash) in hashes.iter().enumerate() {
            if let Some(&src) = hash_to_row.get(hash) {
                matched.push((i as IdxSize, src));
            }
        }

        let out = if matched.is_empty() {
            chunk.clone()
        } else {
            let src_idx: Vec<IdxSize> = matched.iter().map(|&(_, s)| s).collect();
            let replacement = aligned
                .take(&IdxCa::new("src".into(), src_idx))
                .map_err(Report::from)?;
            let combined = chunk.vstack(&replacement).map_err(Report::from)?;
            let chunk_height = chunk.height() as IdxSize;
            let mut order: Vec<IdxSize> = (0..chunk_height).collect();
            for (slot, &(chunk_row, _)) in matched.iter().enumerate() {
                order[chunk_row as usize] = chunk_height + slot as IdxSize;
            }
            combined
                .take(&IdxCa::new("order".into(), order))
                .map_err(Report::from)?
        };

        if writer.is_none() {
            let sink = vfs.open_write(staged_path)?;
            let batched = ParquetWriter::new(sink)
                .with_compression(codec)
                .with_row_group_size(Some(options.row_group_size))
                .with_statistics(StatisticsOptions::full())
                .batched(&out.schema())
                .map_err(Report::from)?;
            writer = Some(batched);
        }
        writer
            .as_mut()
            .unwrap()
            .write_batch(&out)
            .map_err(Report::from)?;

        for &(chunk_row, _) in &matched {
            tracker.mark(hashes[chunk_row as usize]);
        }
        matches_total += matched.len();
        rows_written += out.height();
        progress.add(len);
        offset += len;

        let estimate = (chunk.estimated_size()
            + out.estimated_size()
            + aligned.estimated_size()) as u64;
        probe.set_allocated(estimate);
        match probe.pressure() {
            MemoryPressure::Normal => {}
            MemoryPressure::Warning => {
                chunk_rows = (chunk_rows / 2).max(MIN_CHUNK_ROWS);
            }
            MemoryPressure::Critical => {
                chunk_rows = (chunk_rows / 4).max(MIN_CHUNK_ROWS);
                drop(out);
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            MemoryPressure::Emergency => {
                return Err(Report::new(MergeError::MemoryBudgetExceeded {
                    allocated_bytes: estimate,
                    limit_bytes: options.max_allocator_bytes,
                }));
            }
        }
    }

    match writer {
        Some(mut w) => {
            w.finish().map_err(Report::from)?;
        }
        // Zero rows survived enumeration; still stage a valid empty file so
        // promotion has something to rename.
        None => {
            let empty = scan_parquet_slice(&descriptor.path, None, 0, 0)?;
            let sink = vfs.open_write(staged_path)?;
            let mut w = ParquetWriter::new(sink)
                .with_compression(codec)
                .with_row_group_size(Some(options.row_group_size))
                .with_statistics(StatisticsOptions::full())
                .batched(&empty.schema())
                .map_err(Report::from)?;
            w.finish().map_err(Report::from)?;
        }
    }
    Ok((rows_written, matches_total))
}

/// Exact applied-key set, re-derived by scanning the key columns of the
/// staged rewrite outputs.
fn exact_applied_keys(
    staged_rewrites: &[(String, usize)],
    source_all: &HashSet<u128>,
    key_columns: &[String],
    batch_rows: usize,
    cancel: Option<&Arc<AtomicBool>>,
) -> Result<HashSet<u128>> {
    debug!("tracker is inexact; running second-pass confirmation over staged rewrites");
    let batch_rows = batch_rows.max(1);
    let mut applied = HashSet::new();
    for (path, rows) in staged_rewrites {
        let mut offset = 0usize;
        while offset < *rows {
            check_cancel(cancel)?;
            let len = batch_rows.min(rows - offset);
            let batch = scan_parquet_slice(path, Some(key_columns), offset, len)?;
            for hash in encode_row_keys(&batch, key_columns)? {
                if source_all.contains(&hash) {
                    applied.insert(hash);
                }
            }
            offset += len;
        }
    }
    Ok(applied)
}

/// Write the unmatched source rows as new partitioned files under staging,
/// grouped by partition combination and split by `max_rows_per_file`.
/// Returns the number of rows written.
#[allow(clippy::too_many_arguments)]
fn emit_new_files(
    vfs: &dyn Vfs,
    staging: &Staging<'_>,
    target_root: &str,
    deduped: &DataFrame,
    source_hashes: &[u128],
    source_tokens: &[Vec<String>],
    unmatched: &[IdxSize],
    data_schema: &Schema,
    partition_columns: &[String],
    codec: ParquetCompression,
    options: &MergeOptions,
    steps: &mut Vec<PromotionStep>,
    inserted_reports: &mut Vec<(String, usize)>,
    progress: &mut Progress,
    cancel: Option<&Arc<AtomicBool>>,
) -> Result<usize> {
    // Group rows by partition combination; sorted so output is deterministic.
    let mut groups: Vec<(Vec<String>, Vec<IdxSize>)> = Vec::new();
    {
        let mut index: HashMap<Vec<String>, usize> = HashMap::new();
        for &row in unmatched {
            let tokens = if partition_columns.is_empty() {
                Vec::new()
            } else {
                source_tokens[row as usize].clone()
            };
            match index.get(&tokens) {
                Some(&gi) => groups[gi].1.push(row),
                None => {
                    index.insert(tokens.clone(), groups.len());
                    groups.push((tokens, vec![row]));
                }
            }
        }
    }
    groups.sort_by(|a, b| a.0.cmp(&b.0));

    let root = target_root.trim_end_matches('/');
    let mut file_index = 0usize;
    let mut total_rows = 0usize;
    for (tokens, rows) in &groups {
        let rel_dir: String = partition_columns
            .iter()
            .zip(tokens)
            .map(|(col, tok)| format!("{}={}", col, tok))
            .collect::<Vec<_>>()
            .join("/");

        for part in rows.chunks(options.max_rows_per_file) {
            check_cancel(cancel)?;
            let idx = IdxCa::new("rows".into(), part.to_vec());
            let picked = deduped.take(&idx).map_err(Report::from)?;
            let mut df_part = align_to_schema(&picked, data_schema)?;

            let content_hash = if source_hashes.is_empty() {
                let seed = format!("{}/{}/{}", rel_dir, file_index, part.len());
                xxh3_64(seed.as_bytes())
            } else {
                let mut bytes = Vec::with_capacity(part.len() * 16);
                for &row in part {
                    bytes.extend_from_slice(&source_hashes[row as usize].to_le_bytes());
                }
                xxh3_64(&bytes)
            };
            // Bump the index past any name already taken in the partition so
            // promotion never overwrites a pre-existing data file.
            let (staged, target) = loop {
                let name = part_file_name(file_index, content_hash);
                let relative = if rel_dir.is_empty() {
                    name
                } else {
                    format!("{}/{}", rel_dir, name)
                };
                let target = format!("{}/{}", root, relative);
                if vfs.size(&target).unwrap_or(None).is_none() {
                    break (staging.new_file_path(&relative), target);
                }
                file_index += 1;
            };

            let sink = vfs.open_write(&staged)?;
            ParquetWriter::new(sink)
                .with_compression(codec)
                .with_row_group_size(Some(options.row_group_size))
                .with_statistics(StatisticsOptions::full())
                .finish(&mut df_part)
                .map_err(Report::from)?;

            steps.push(PromotionStep {
                staged,
                target: target.clone(),
            });
            inserted_reports.push((target, part.len()));
            progress.add(part.len());
            total_rows += part.len();
            file_index += 1;
        }
    }
    Ok(total_rows)
}
