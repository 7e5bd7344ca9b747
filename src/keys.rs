//! Canonical composite-key encoding: each row's key columns are reduced to a
//! 128-bit hash over length-prefixed per-column binary encodings. Equality is
//! preserved across source and target without per-row allocation in the hot
//! path.

use color_eyre::eyre::Report;
use color_eyre::Result;
use polars::prelude::{AnyValue, Column, DataFrame, IdxCa, IdxSize, NamedFrom};
use std::collections::{HashMap, HashSet};
use xxhash_rust::xxh3::xxh3_128;

use crate::error::MergeError;

/// Type tags keep equal byte patterns of different types from colliding.
const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_UINT: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_STR: u8 = 5;
const TAG_BYTES: u8 = 6;
const TAG_TEMPORAL: u8 = 7;
const TAG_OTHER: u8 = 255;

fn write_value(buf: &mut Vec<u8>, value: &AnyValue) {
    match value {
        AnyValue::Null => buf.push(TAG_NULL),
        AnyValue::Boolean(b) => {
            buf.push(TAG_BOOL);
            buf.push(*b as u8);
        }
        AnyValue::Int8(v) => write_int(buf, *v as i64),
        AnyValue::Int16(v) => write_int(buf, *v as i64),
        AnyValue::Int32(v) => write_int(buf, *v as i64),
        AnyValue::Int64(v) => write_int(buf, *v),
        AnyValue::UInt8(v) => write_uint(buf, *v as u64),
        AnyValue::UInt16(v) => write_uint(buf, *v as u64),
        AnyValue::UInt32(v) => write_uint(buf, *v as u64),
        AnyValue::UInt64(v) => write_uint(buf, *v),
        AnyValue::Float32(v) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&(*v as f64).to_bits().to_le_bytes());
        }
        AnyValue::Float64(v) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        AnyValue::String(s) => {
            buf.push(TAG_STR);
            buf.extend_from_slice(s.as_bytes());
        }
        AnyValue::StringOwned(s) => {
            buf.push(TAG_STR);
            buf.extend_from_slice(s.as_bytes());
        }
        AnyValue::Binary(b) => {
            buf.push(TAG_BYTES);
            buf.extend_from_slice(b);
        }
        AnyValue::BinaryOwned(b) => {
            buf.push(TAG_BYTES);
            buf.extend_from_slice(b);
        }
        AnyValue::Date(d) => {
            buf.push(TAG_TEMPORAL);
            buf.extend_from_slice(&(*d as i64).to_le_bytes());
        }
        AnyValue::Time(t) => {
            buf.push(TAG_TEMPORAL);
            buf.extend_from_slice(&t.to_le_bytes());
        }
        other => {
            // Datetime, Duration, Decimal, ...: the Display rendering is
            // stable within one polars version, which is all one merge needs.
            buf.push(TAG_OTHER);
            buf.extend_from_slice(other.to_string().as_bytes());
        }
    }
}

fn write_int(buf: &mut Vec<u8>, v: i64) {
    buf.push(TAG_INT);
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_uint(buf: &mut Vec<u8>, v: u64) {
    // Non-negative integers hash identically whether the column is signed or
    // unsigned, so schema-compatible int/uint pairs still match.
    if let Ok(signed) = i64::try_from(v) {
        write_int(buf, signed);
    } else {
        buf.push(TAG_UINT);
        buf.extend_from_slice(&v.to_le_bytes());
    }
}

/// Hash every row's key columns into a 128-bit canonical key.
pub fn encode_row_keys(df: &DataFrame, key_columns: &[String]) -> Result<Vec<u128>> {
    let columns: Vec<&Column> = key_columns
        .iter()
        .map(|name| df.column(name).map_err(Report::from))
        .collect::<Result<_>>()?;
    let height = df.height();
    let mut hashes = Vec::with_capacity(height);
    let mut buf: Vec<u8> = Vec::with_capacity(64);
    for i in 0..height {
        buf.clear();
        for col in &columns {
            let value = col.get(i).map_err(Report::from)?;
            let start = buf.len();
            // Length prefix placeholder, backfilled after the value is written.
            buf.extend_from_slice(&[0u8; 4]);
            write_value(&mut buf, &value);
            let len = (buf.len() - start - 4) as u32;
            buf[start..start + 4].copy_from_slice(&len.to_le_bytes());
        }
        hashes.push(xxh3_128(&buf));
    }
    Ok(hashes)
}

/// Distinct key hashes of a source batch.
pub fn key_hash_set(df: &DataFrame, key_columns: &[String]) -> Result<HashSet<u128>> {
    Ok(encode_row_keys(df, key_columns)?.into_iter().collect())
}

/// Deduplicate a source batch by key (last-write-wins): for each key only the
/// last occurrence survives, in its original position relative to other
/// surviving rows.
pub fn dedup_last_write_wins(df: &DataFrame, key_columns: &[String]) -> Result<DataFrame> {
    if key_columns.is_empty() || df.height() == 0 {
        return Ok(df.clone());
    }
    let hashes = encode_row_keys(df, key_columns)?;
    let mut last_idx: HashMap<u128, IdxSize> = HashMap::with_capacity(hashes.len());
    for (i, hash) in hashes.iter().enumerate() {
        last_idx.insert(*hash, i as IdxSize);
    }
    if last_idx.len() == df.height() {
        return Ok(df.clone());
    }
    let mut keep: Vec<IdxSize> = Vec::with_capacity(last_idx.len());
    for (i, hash) in hashes.iter().enumerate() {
        if last_idx[hash] == i as IdxSize {
            keep.push(i as IdxSize);
        }
    }
    let idx = IdxCa::new("keep".into(), keep);
    df.take(&idx).map_err(Report::from)
}

/// Render one row's key values for error messages, e.g. `id=2` or
/// `(id=2, region=eu)`.
pub fn display_key(df: &DataFrame, key_columns: &[String], row: usize) -> String {
    let parts: Vec<String> = key_columns
        .iter()
        .map(|name| match df.column(name).and_then(|c| c.get(row)) {
            Ok(value) => format!("{}={}", name, value),
            Err(_) => format!("{}=?", name),
        })
        .collect();
    if parts.len() == 1 {
        parts.into_iter().next().unwrap_or_default()
    } else {
        format!("({})", parts.join(", "))
    }
}

/// Null counts per key column; used by the validator to reject null keys.
pub fn null_key_columns(df: &DataFrame, key_columns: &[String]) -> Result<Vec<(String, usize)>> {
    let mut out = Vec::new();
    for name in key_columns {
        let col = df
            .column(name)
            .map_err(|_| Report::new(MergeError::Schema(format!(
                "key column '{}' not found in source",
                name
            ))))?;
        let nulls = col.null_count();
        if nulls > 0 {
            out.push((name.clone(), nulls));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::*;

    #[test]
    fn equal_rows_hash_equal_across_frames() {
        let a = df!("id" => [1i64, 2], "r" => ["x", "y"]).unwrap();
        let b = df!("r" => ["x", "y"], "id" => [1i64, 2]).unwrap();
        let keys = vec!["id".to_string(), "r".to_string()];
        assert_eq!(
            encode_row_keys(&a, &keys).unwrap(),
            encode_row_keys(&b, &keys).unwrap()
        );
    }

    #[test]
    fn int_widths_hash_identically() {
        let a = df!("id" => [7i32]).unwrap();
        let b = df!("id" => [7i64]).unwrap();
        let keys = vec!["id".to_string()];
        assert_eq!(
            encode_row_keys(&a, &keys).unwrap(),
            encode_row_keys(&b, &keys).unwrap()
        );
    }

    #[test]
    fn column_boundaries_do_not_collide() {
        // ("ab", "c") must not hash like ("a", "bc").
        let a = df!("x" => ["ab"], "y" => ["c"]).unwrap();
        let b = df!("x" => ["a"], "y" => ["bc"]).unwrap();
        let keys = vec!["x".to_string(), "y".to_string()];
        assert_ne!(
            encode_row_keys(&a, &keys).unwrap(),
            encode_row_keys(&b, &keys).unwrap()
        );
    }

    #[test]
    fn dedup_keeps_last_occurrence() {
        let df = df!("id" => [1i64, 2, 1], "v" => ["a", "b", "c"]).unwrap();
        let out = dedup_last_write_wins(&df, &["id".to_string()]).unwrap();
        assert_eq!(out.height(), 2);
        let v = out.column("v").unwrap();
        let vals: Vec<String> = (0..out.height())
            .map(|i| v.get(i).unwrap().to_string())
            .collect();
        assert!(vals[0].contains('b'));
        assert!(vals[1].contains('c'));
    }

    #[test]
    fn dedup_no_duplicates_is_identity() {
        let df = df!("id" => [1i64, 2, 3]).unwrap();
        let out = dedup_last_write_wins(&df, &["id".to_string()]).unwrap();
        assert_eq!(out.height(), 3);
    }

    #[test]
    fn null_key_columns_reports_counts() {
        let df = df!("id" => [Some(1i64), None, None], "v" => ["a", "b", "c"]).unwrap();
        let nulls = null_key_columns(&df, &["id".to_string()]).unwrap();
        assert_eq!(nulls, vec![("id".to_string(), 2)]);
    }

    #[test]
    fn display_key_composite() {
        let df = df!("id" => [2i64], "region" => ["eu"]).unwrap();
        let text = display_key(&df, &["id".to_string(), "region".to_string()], 0);
        assert!(text.contains("id=2") && text.contains("region="));
    }
}
