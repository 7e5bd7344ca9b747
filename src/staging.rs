//! Staging and atomic replace: every output file is written under a hidden
//! `.staging-<uuid>/` prefix, then promoted by rename. Rewrites replace their
//! source file first, new files move into their Hive location second, and the
//! staging prefix is removed last. A target file is never deleted before its
//! replacement exists.

use color_eyre::eyre::Report;
use color_eyre::Result;
use log::debug;
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::MergeError;
use crate::vfs::Vfs;

/// Deterministic data-file name: zero-padded index plus a content-hash prefix.
pub fn part_file_name(index: usize, content_hash: u64) -> String {
    format!("part-{:05}-{:08x}.parquet", index, (content_hash >> 32) as u32)
}

/// One pending promotion rename.
#[derive(Debug, Clone)]
pub struct PromotionStep {
    pub staged: String,
    pub target: String,
}

/// A staging prefix under the dataset root for one merge.
pub struct Staging<'a> {
    vfs: &'a dyn Vfs,
    staging_root: String,
}

impl<'a> Staging<'a> {
    pub fn new(vfs: &'a dyn Vfs, dataset_root: &str) -> Self {
        let staging_root = format!(
            "{}/.staging-{}",
            dataset_root.trim_end_matches('/'),
            Uuid::new_v4()
        );
        Staging { vfs, staging_root }
    }

    pub fn root(&self) -> &str {
        &self.staging_root
    }

    /// Staged location for the rewrite of `target_path`: directly in the
    /// staging root, keyed by the intended target path.
    pub fn rewrite_path(&self, target_path: &str) -> String {
        let file_name = target_path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(target_path);
        format!(
            "{}/rw-{:016x}-{}",
            self.staging_root,
            xxh3_64(target_path.as_bytes()),
            file_name
        )
    }

    /// Staged location for a new file at `relative` under the dataset root;
    /// staging mirrors the final partition structure.
    pub fn new_file_path(&self, relative: &str) -> String {
        format!("{}/{}", self.staging_root, relative.trim_start_matches('/'))
    }

    /// Promote all staged outputs. Rewrite replacements must come first in
    /// `steps`. After the first rename has been attempted, later failures do
    /// not stop the remaining renames; the composite outcome is surfaced as
    /// `PartialPromotion` when some renames landed and some did not.
    pub fn promote(&self, steps: &[PromotionStep]) -> Result<()> {
        let mut completed: Vec<String> = Vec::new();
        let mut pending: Vec<String> = Vec::new();
        let mut first_failure: Option<String> = None;

        for step in steps {
            match self.vfs.rename(&step.staged, &step.target) {
                Ok(()) => {
                    debug!("promoted {} -> {}", step.staged, step.target);
                    completed.push(step.target.clone());
                }
                Err(e) => {
                    if first_failure.is_none() {
                        first_failure = Some(format!("{e:#}"));
                    }
                    pending.push(step.target.clone());
                }
            }
        }

        match first_failure {
            None => Ok(()),
            Some(message) if completed.is_empty() => {
                // Nothing was promoted; the dataset is untouched and staging
                // can be cleaned like any pre-promotion failure.
                Err(Report::new(MergeError::Filesystem {
                    op: "rename",
                    path: pending.first().cloned().unwrap_or_default(),
                    message,
                }))
            }
            Some(message) => Err(Report::new(MergeError::PartialPromotion {
                completed,
                pending,
                message,
            })),
        }
    }

    /// Remove the staging prefix and everything under it.
    pub fn cleanup(&self) -> Result<()> {
        self.vfs.remove_tree(&self.staging_root)
    }
}
