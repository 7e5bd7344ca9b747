//! Dataset enumeration and Hive path parsing: find the parquet files under a
//! root and recover `key=value` partition tokens from their paths. String
//! parsing only; no filesystem calls outside `enumerate_parquet_files`.

use color_eyre::Result;

use crate::vfs::Vfs;

/// Replace backslash separators so all downstream path math sees `/`.
pub fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

/// Split a protocol-qualified path into its scheme+authority prefix and the
/// path portion. `s3://bucket/a/b` -> (`Some("s3://bucket")`, `/a/b`); plain
/// paths come back untouched.
pub fn split_protocol(path: &str) -> (Option<&str>, &str) {
    if let Some(idx) = path.find("://") {
        let after = &path[idx + 3..];
        match after.find('/') {
            Some(slash) => (Some(&path[..idx + 3 + slash]), &after[slash..]),
            None => (Some(path), ""),
        }
    } else {
        (None, path)
    }
}

/// Parse `key=value` partition tokens from the segments of `path` strictly
/// between `root` and the filename. Order follows directory depth; a key seen
/// twice keeps its first value.
pub fn partition_values_from_path(root: &str, path: &str) -> Vec<(String, String)> {
    let root_norm = normalize_separators(root);
    let path_norm = normalize_separators(path);
    let (_, root_part) = split_protocol(&root_norm);
    let (_, path_part) = split_protocol(&path_norm);

    let root_trimmed = root_part.trim_end_matches('/');
    let rel = match path_part.strip_prefix(root_trimmed) {
        Some(rest) => rest.trim_start_matches('/'),
        None => path_part.trim_start_matches('/'),
    };

    let mut values: Vec<(String, String)> = Vec::new();
    let mut segments: Vec<&str> = rel.split('/').filter(|s| !s.is_empty()).collect();
    // Last segment is the filename.
    segments.pop();
    for segment in segments {
        if let Some((key, value)) = segment.split_once('=') {
            if !key.is_empty() && !values.iter().any(|(k, _)| k == key) {
                values.push((key.to_string(), value.to_string()));
            }
        }
    }
    values
}

/// Look up a partition value by column name.
pub fn partition_value<'a>(values: &'a [(String, String)], column: &str) -> Option<&'a str> {
    values
        .iter()
        .find(|(k, _)| k == column)
        .map(|(_, v)| v.as_str())
}

fn is_parquet_path(path: &str) -> bool {
    std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("parquet"))
}

fn is_hidden_path(root: &str, path: &str) -> bool {
    let root_norm = normalize_separators(root);
    let path_norm = normalize_separators(path);
    let rel = path_norm
        .strip_prefix(root_norm.trim_end_matches('/'))
        .unwrap_or(&path_norm);
    rel.split('/').any(|seg| seg.starts_with('.'))
}

/// Enumerate the parquet files of a dataset, lexicographically sorted so
/// downstream planning is deterministic across runs. Hidden segments
/// (staging directories and the like) are skipped.
pub fn enumerate_parquet_files(vfs: &dyn Vfs, root: &str) -> Result<Vec<String>> {
    let mut files: Vec<String> = vfs
        .list(root)?
        .into_iter()
        .filter(|p| is_parquet_path(p) && !is_hidden_path(root, p))
        .collect();
    files.sort();
    Ok(files)
}
