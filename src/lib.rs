//! Incremental merge engine for Hive-partitioned Parquet datasets.
//!
//! `merge` applies an insert, update, or upsert of a columnar source batch
//! against an existing dataset in a streaming, memory-bounded, crash-safe
//! way: footer metadata analysis narrows the candidate files, a key-column
//! confirmation scan pins down the affected set, affected files are rewritten
//! in bounded chunks with full-row replacement, new keys are routed to new
//! partitioned files, and all outputs go live through a staged atomic
//! replace.
//!
//! ```no_run
//! use parquetkit::{merge, LocalFs, MergeOptions, MergeStrategy};
//! use polars::prelude::*;
//!
//! # fn main() -> color_eyre::Result<()> {
//! let source = df!("id" => [1i64, 2], "day" => ["2024-01-01", "2024-01-01"], "v" => ["a", "b"])?;
//! let result = merge(
//!     &LocalFs,
//!     &source,
//!     "/data/events",
//!     MergeStrategy::Upsert,
//!     &["id".to_string()],
//!     &["day".to_string()],
//!     &MergeOptions::default(),
//! )?;
//! println!("inserted {} updated {}", result.inserted, result.updated);
//! # Ok(())
//! # }
//! ```

pub mod dataset;
pub mod error;
pub mod keys;
pub mod memory;
pub mod merge;
pub mod metadata;
pub mod plan;
pub mod prune;
mod scan;
pub mod staging;
pub mod tracker;
pub mod validate;
pub mod vfs;

pub use error::{merge_error_kind, MergeError};
pub use memory::{MemoryLimits, MemoryPressure, MemoryProbe, MemoryStatus, SystemProbe};
pub use merge::{
    merge, merge_with_probe, FileOperation, MergeFileReport, MergeOptions, MergeResult,
    ProgressCallback,
};
pub use metadata::{dataset_info, DatasetInfo, FileDescriptor};
pub use plan::MergeStrategy;
pub use tracker::TrackerTier;
pub use vfs::{LocalFs, Vfs};
