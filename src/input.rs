//! Loading raw_answers.csv and scale_map.csv.
//!
//! Rows are deserialized with every column as an optional string and
//! normalised afterwards: strings trimmed, numbers parsed leniently (a value
//! that does not parse is missing), question types lowercased and reverse
//! flags uppercased.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, SnapshotError};
use crate::models::{AnalysisGroup, AxisTag, RawResponse, ScaleMapEntry};

pub const RAW_REQUIRED_COLUMNS: [&str; 13] = [
    "student_id",
    "item_id",
    "question_type",
    "round_no",
    "raw_score",
    "response_ms",
    "answered_at",
    "reverse_item",
    "min_score",
    "max_score",
    "weight",
    "current_level_grade",
    "current_math_percentile",
];

pub const SCALE_MAP_REQUIRED_COLUMNS: [&str; 4] =
    ["question_id", "scale_name", "include_in_alpha", "axis_tag"];

#[derive(Debug, Deserialize)]
struct RawAnswerRow {
    student_id: Option<String>,
    item_id: Option<String>,
    question_type: Option<String>,
    round_no: Option<String>,
    raw_score: Option<String>,
    response_ms: Option<String>,
    answered_at: Option<String>,
    reverse_item: Option<String>,
    min_score: Option<String>,
    max_score: Option<String>,
    weight: Option<String>,
    current_level_grade: Option<String>,
    current_math_percentile: Option<String>,
    #[serde(default)]
    response_id: Option<String>,
    #[serde(default)]
    item_text: Option<String>,
    #[serde(default, rename = "trait")]
    trait_name: Option<String>,
    #[serde(default)]
    round_label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScaleMapRow {
    question_id: Option<String>,
    scale_name: Option<String>,
    include_in_alpha: Option<String>,
    axis_tag: Option<String>,
    #[serde(default)]
    analysis_group: Option<String>,
}

fn text(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn number(value: Option<String>) -> Option<f64> {
    text(value)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Parse a timestamp in RFC 3339, `YYYY-MM-DD HH:MM:SS[.f][±zz]` or plain
/// date form; naive values are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(ts) = DateTime::parse_from_str(value, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(value, format) {
            return Some(ts.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
}

fn reader_from<R: Read>(source: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .flexible(true)
        .from_reader(source)
}

fn check_columns<R: Read>(
    reader: &mut csv::Reader<R>,
    required: &[&str],
    source_name: &str,
) -> Result<()> {
    let headers = reader.headers()?.clone();
    let present: HashSet<String> = headers
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();
    let missing: Vec<String> = required
        .iter()
        .filter(|c| !present.contains(**c))
        .map(|c| c.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(SnapshotError::Schema {
            source_name: source_name.to_string(),
            missing,
        });
    }
    // keep the BOM-free names so serde can match them
    let cleaned: csv::StringRecord = headers
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim())
        .collect();
    reader.set_headers(cleaned);
    Ok(())
}

pub fn read_raw_answers<R: Read>(source: R) -> Result<Vec<RawResponse>> {
    let mut reader = reader_from(source);
    check_columns(&mut reader, &RAW_REQUIRED_COLUMNS, "raw_answers.csv")?;

    let mut rows = Vec::new();
    for result in reader.deserialize::<RawAnswerRow>() {
        let row = result?;
        rows.push(RawResponse {
            student_id: text(row.student_id).unwrap_or_default(),
            item_id: text(row.item_id).unwrap_or_default(),
            question_type: text(row.question_type)
                .map(|v| v.to_lowercase())
                .unwrap_or_default(),
            round_no: number(row.round_no),
            raw_score: number(row.raw_score),
            response_ms: number(row.response_ms),
            answered_at: text(row.answered_at).and_then(|v| parse_timestamp(&v)),
            reverse_item: text(row.reverse_item).map(|v| v.to_uppercase()),
            min_score: number(row.min_score),
            max_score: number(row.max_score),
            weight: number(row.weight),
            current_level_grade: number(row.current_level_grade),
            current_math_percentile: number(row.current_math_percentile),
            response_id: text(row.response_id),
            item_text: text(row.item_text),
            trait_name: text(row.trait_name),
            round_label: text(row.round_label),
        });
    }
    debug!(rows = rows.len(), "loaded raw answers");
    Ok(rows)
}

pub fn read_scale_map<R: Read>(source: R) -> Result<Vec<ScaleMapEntry>> {
    let mut reader = reader_from(source);
    check_columns(&mut reader, &SCALE_MAP_REQUIRED_COLUMNS, "scale_map.csv")?;

    let mut entries = Vec::new();
    let mut invalid_alpha = Vec::new();
    for result in reader.deserialize::<ScaleMapRow>() {
        let row = result?;
        let question_id = text(row.question_id).unwrap_or_default();
        let include_in_alpha = match number(row.include_in_alpha) {
            None => false,
            Some(v) if v == 0.0 => false,
            Some(v) if v == 1.0 => true,
            Some(v) => {
                invalid_alpha.push(format!("{question_id}={v}"));
                false
            }
        };
        let axis_tag = text(row.axis_tag)
            .map(|tag| tag.parse::<AxisTag>())
            .transpose()?;
        let analysis_group = text(row.analysis_group)
            .map(|group| group.parse::<AnalysisGroup>())
            .transpose()?
            .unwrap_or(AnalysisGroup::CoreScale);

        entries.push(ScaleMapEntry {
            question_id,
            scale_name: text(row.scale_name).unwrap_or_default(),
            include_in_alpha,
            axis_tag,
            analysis_group,
        });
    }

    if !invalid_alpha.is_empty() {
        invalid_alpha.truncate(10);
        return Err(SnapshotError::Domain(format!(
            "include_in_alpha must be 0 or 1: {invalid_alpha:?}"
        )));
    }
    debug!(rows = entries.len(), "loaded scale map");
    Ok(entries)
}

pub fn load_raw_answers(path: &Path) -> Result<Vec<RawResponse>> {
    let file = std::fs::File::open(path)?;
    read_raw_answers(file)
}

pub fn load_scale_map(path: &Path) -> Result<Vec<ScaleMapEntry>> {
    let file = std::fs::File::open(path)?;
    read_scale_map(file)
}
