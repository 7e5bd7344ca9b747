use polars::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Write a parquet file at `rel` under `root`, creating partition dirs.
pub fn write_parquet_at(root: &Path, rel: &str, df: &mut DataFrame) -> PathBuf {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let file = File::create(&path).unwrap();
    ParquetWriter::new(file).finish(df).unwrap();
    path
}

fn visible_parquet_files(root: &Path, out: &mut Vec<PathBuf>) {
    for entry in std::fs::read_dir(root).unwrap() {
        let entry = entry.unwrap();
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        if path.is_dir() {
            visible_parquet_files(&path, out);
        } else if name.ends_with(".parquet") {
            out.push(path);
        }
    }
}

/// All non-hidden parquet files under `root`, sorted.
pub fn list_dataset_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    visible_parquet_files(root, &mut files);
    files.sort();
    files
}

/// Read every dataset file and collect `(id, v)` rows, sorted by id.
pub fn dataset_rows(root: &Path) -> Vec<(i64, String)> {
    let mut rows = Vec::new();
    for path in list_dataset_files(root) {
        let file = File::open(&path).unwrap();
        let df = ParquetReader::new(file).finish().unwrap();
        let ids = df.column("id").unwrap();
        let values = df.column("v").ok();
        for i in 0..df.height() {
            let id = match ids.get(i).unwrap() {
                AnyValue::Int64(v) => v,
                AnyValue::Int32(v) => v as i64,
                other => panic!("unexpected id value: {:?}", other),
            };
            let v = values
                .map(|c| match c.get(i).unwrap() {
                    AnyValue::String(s) => s.to_string(),
                    AnyValue::StringOwned(s) => s.to_string(),
                    other => other.to_string(),
                })
                .unwrap_or_default();
            rows.push((id, v));
        }
    }
    rows.sort();
    rows
}

/// True when a `.staging-*` directory is still present under `root`.
pub fn has_staging_dir(root: &Path) -> bool {
    std::fs::read_dir(root).unwrap().any(|entry| {
        entry
            .unwrap()
            .file_name()
            .to_string_lossy()
            .starts_with(".staging-")
    })
}
