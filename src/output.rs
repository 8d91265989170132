//! Snapshot artifacts on disk.
//!
//! Sheets are written one CSV per sheet inside a directory named after the
//! workbook. Everything numeric passes through the 6-decimal rounding policy
//! before it is written or hashed.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{Result, SnapshotError};
use crate::table::{round_to, Table, ROUND_DECIMALS};

pub const SCALE_BOOK: &str = "scale_stats_snapshot_v1";
pub const STUDENT_BOOK: &str = "student_standard_scores_v1";
pub const VALIDATION_BOOK: &str = "type_level_validation_v1";
pub const MATRIX_FILE: &str = "student_item_matrix_v1.csv";
pub const METADATA_FILE: &str = "snapshot_metadata.json";
pub const VALIDATION_SUMMARY_FILE: &str = "type_level_validation_summary.json";
pub const FROZEN_INPUT_FILE: &str = "snapshot_input_frozen.csv";
pub const REPORT_FILE: &str = "snapshot_report.md";

/// Artifacts whose presence marks a version as already published.
pub const REQUIRED_OUTPUT_FILES: [&str; 3] = [SCALE_BOOK, STUDENT_BOOK, METADATA_FILE];

/// Missing-value marker used only for hashing.
pub const HASH_NA: &str = "__NA__";

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

pub fn ensure_output_dir(path: &Path) -> Result<PathBuf> {
    fs::create_dir_all(path)?;
    Ok(path.to_path_buf())
}

/// Refuse to overwrite a published snapshot unless `force` is set.
pub fn enforce_immutability(out_dir: &Path, snapshot_version: &str, force: bool) -> Result<()> {
    if force {
        return Ok(());
    }
    let existing: Vec<String> = REQUIRED_OUTPUT_FILES
        .iter()
        .filter(|name| out_dir.join(name).exists())
        .map(|name| name.to_string())
        .collect();
    if existing.is_empty() {
        Ok(())
    } else {
        Err(SnapshotError::Immutability {
            version: snapshot_version.to_string(),
            existing,
        })
    }
}

pub fn write_table(path: &Path, table: &Table) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    table.write_csv(writer, "")
}

/// One CSV per sheet under `out_dir/book`, in the given order.
pub fn write_book(out_dir: &Path, book: &str, sheets: &[(&str, Table)]) -> Result<PathBuf> {
    let dir = out_dir.join(book);
    fs::create_dir_all(&dir)?;
    for (name, table) in sheets {
        write_table(&dir.join(format!("{name}.csv")), table)?;
        debug!(book, sheet = name, rows = table.len(), "sheet written");
    }
    info!(path = %dir.display(), sheets = sheets.len(), "workbook written");
    Ok(dir)
}

/// Frozen copy of the prepared input, UTF-8 with a BOM for spreadsheet tools.
pub fn write_frozen_input(out_dir: &Path, table: &Table) -> Result<PathBuf> {
    let path = out_dir.join(FROZEN_INPUT_FILE);
    let mut writer = BufWriter::new(File::create(&path)?);
    writer.write_all(UTF8_BOM)?;
    table.write_csv(&mut writer, "")?;
    writer.flush()?;
    Ok(path)
}

/// Round every non-integer number in a JSON tree.
pub fn round_json(value: Value) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => n
            .as_f64()
            .map(|v| round_to(v, ROUND_DECIMALS))
            .and_then(serde_json::Number::from_f64)
            .map_or(Value::Null, Value::Number),
        Value::Array(items) => Value::Array(items.into_iter().map(round_json).collect()),
        Value::Object(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k, round_json(v))).collect())
        }
        other => other,
    }
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let value = round_json(serde_json::to_value(value)?);
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, &value)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

pub fn write_text(path: &Path, text: &str) -> Result<()> {
    fs::write(path, text)?;
    Ok(())
}

/// Content hash of a table: rounded CSV with `__NA__` for missing values and
/// `\n` line endings. Callers sort rows first.
pub fn table_sha256(table: &Table) -> Result<String> {
    let text = table.to_csv_string(HASH_NA)?;
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Cell;
    use serde_json::json;

    fn table(value: Option<f64>) -> Table {
        let mut table = Table::new(vec!["student_id".to_string(), "score".to_string()]);
        table.push(vec![Cell::from("s1"), Cell::from(value)]);
        table
    }

    #[test]
    fn published_snapshot_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        enforce_immutability(dir.path(), "v1.0", false).unwrap();

        fs::write(dir.path().join(METADATA_FILE), "{}").unwrap();
        let err = enforce_immutability(dir.path(), "v2.0", false).unwrap_err();
        match err {
            SnapshotError::Immutability { version, existing } => {
                assert_eq!(version, "v2.0");
                assert_eq!(existing, vec![METADATA_FILE.to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        enforce_immutability(dir.path(), "v2.0", true).unwrap();
    }

    #[test]
    fn books_are_directories_of_csv_sheets() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_book(
            dir.path(),
            SCALE_BOOK,
            &[("Scale_Stats", table(Some(1.0))), ("Scale_Items", table(None))],
        )
        .unwrap();
        let stats = fs::read_to_string(path.join("Scale_Stats.csv")).unwrap();
        assert_eq!(stats, "student_id,score\ns1,1\n");
        let items = fs::read_to_string(path.join("Scale_Items.csv")).unwrap();
        assert_eq!(items, "student_id,score\ns1,\n");
        assert!(enforce_immutability(dir.path(), "v1.0", false).is_err());
    }

    #[test]
    fn frozen_input_starts_with_bom() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_frozen_input(dir.path(), &table(Some(2.5))).unwrap();
        let bytes = fs::read(path).unwrap();
        assert!(bytes.starts_with(UTF8_BOM));
        assert_eq!(&bytes[3..], b"student_id,score\ns1,2.5\n");
    }

    #[test]
    fn hash_follows_rounded_content() {
        let a = table_sha256(&table(Some(1.000_000_01))).unwrap();
        let b = table_sha256(&table(Some(1.0))).unwrap();
        let c = table_sha256(&table(Some(1.1))).unwrap();
        let missing = table_sha256(&table(None)).unwrap();
        assert_eq!(a, b);
        assert_ne!(b, c);
        assert_ne!(b, missing);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn json_numbers_are_rounded() {
        let value = round_json(json!({"p": 0.123_456_789, "n": 3, "xs": [1.000_000_4]}));
        assert_eq!(value, json!({"p": 0.123457, "n": 3, "xs": [1.0]}));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(VALIDATION_SUMMARY_FILE);
        write_json(&path, &json!({"mae": 0.333_333_333})).unwrap();
        let text = fs::read_to_string(path).unwrap();
        assert!(text.contains("0.333333"));
    }
}
