//! Input validation and preparation.
//!
//! Takes the loaded answer rows and scale map, enforces the value domains,
//! resolves duplicates and mapping gaps, and produces the per-response
//! records every later stage works from.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::{debug, info};

use crate::diagnostics::Diagnostics;
use crate::error::{Result, SnapshotError};
use crate::models::{
    reverse_code, AnalysisGroup, AxisConfig, AxisTag, EffectiveMapEntry, PreparedRecord,
    QuestionType, RawResponse, ScaleMapEntry,
};

const EXAMPLE_LIMIT: usize = 10;
const ID_EXAMPLE_LIMIT: usize = 20;

/// What to do with text items that have no scale_map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnmappedTextPolicy {
    /// Keep them as descriptive-only supplementary items.
    #[default]
    AdoptAsSupplementary,
    /// Treat them like unmapped scale items.
    Reject,
}

/// An axis requirement the typology cannot do without, satisfied by any of
/// its tags.
#[derive(Debug, Clone, Copy)]
pub struct CoverageRequirement {
    pub name: &'static str,
    pub tags: &'static [AxisTag],
}

pub const COVERAGE_REQUIREMENTS: [CoverageRequirement; 3] = [
    CoverageRequirement {
        name: "efficacy",
        tags: &[AxisTag::Efficacy, AxisTag::BeliefPos, AxisTag::Belief],
    },
    CoverageRequirement {
        name: "growth_mindset",
        tags: &[AxisTag::GrowthMindset, AxisTag::BeliefPos, AxisTag::Belief],
    },
    CoverageRequirement {
        name: "emotional_stability|anxiety",
        tags: &[
            AxisTag::EmotionalStability,
            AxisTag::EmotionPos,
            AxisTag::Interest,
            AxisTag::Anxiety,
            AxisTag::EmotionNeg,
            AxisTag::EmotionReactivity,
        ],
    },
];

#[derive(Debug, Clone)]
pub struct PreparedInputs {
    /// Every surviving response, sorted by (student_id, item_id).
    pub records: Vec<PreparedRecord>,
    pub effective_map: Vec<EffectiveMapEntry>,
    pub axis_config: AxisConfig,
}

impl PreparedInputs {
    pub fn core_records(&self) -> Vec<PreparedRecord> {
        self.records.iter().filter(|r| r.is_core()).cloned().collect()
    }

    pub fn supplementary_records(&self) -> Vec<PreparedRecord> {
        self.records.iter().filter(|r| !r.is_core()).cloned().collect()
    }
}

/// A raw row that passed the type and score filters.
#[derive(Debug, Clone)]
struct Candidate {
    source: RawResponse,
    question_type: QuestionType,
    raw_score: f64,
    reverse_item: Option<bool>,
}

pub fn prepare(
    raw: &[RawResponse],
    scale_map: &[ScaleMapEntry],
    round_no: u32,
    range_error_threshold: f64,
    diagnostics: &mut Diagnostics,
) -> Result<PreparedInputs> {
    prepare_with_policy(
        raw,
        scale_map,
        round_no,
        range_error_threshold,
        UnmappedTextPolicy::AdoptAsSupplementary,
        diagnostics,
    )
}

pub fn prepare_with_policy(
    raw: &[RawResponse],
    scale_map: &[ScaleMapEntry],
    round_no: u32,
    range_error_threshold: f64,
    text_policy: UnmappedTextPolicy,
    diagnostics: &mut Diagnostics,
) -> Result<PreparedInputs> {
    let candidates = filter_rows(raw, round_no)?;
    let mut candidates = parse_reverse_flags(candidates)?;
    null_invalid_levels(&mut candidates, diagnostics);
    let candidates = check_score_ranges(candidates, range_error_threshold, diagnostics)?;
    let candidates = dedupe_latest(candidates, diagnostics);
    let map = validate_scale_map(scale_map)?;
    check_scale_items_mapped(&candidates, &map)?;

    let mut records = attach_mapping(candidates, &map, round_no, text_policy, diagnostics)?;
    records.sort_by(|a, b| {
        a.student_id
            .cmp(&b.student_id)
            .then_with(|| a.item_id.cmp(&b.item_id))
    });

    let effective_map = build_effective_map(&records);
    let axis_config = build_axis_config(&effective_map)?;
    check_axis_coverage(&axis_config)?;

    info!(
        records = records.len(),
        core_items = effective_map.len(),
        axis_tags = axis_config.len(),
        "inputs prepared"
    );
    Ok(PreparedInputs {
        records,
        effective_map,
        axis_config,
    })
}

fn filter_rows(raw: &[RawResponse], round_no: u32) -> Result<Vec<RawResponse>> {
    let rows: Vec<RawResponse> = raw
        .iter()
        .filter(|r| !r.student_id.is_empty() && !r.item_id.is_empty())
        .cloned()
        .collect();
    if rows.is_empty() {
        return Err(SnapshotError::EmptyDataset(
            "no rows with a valid student_id/item_id".to_string(),
        ));
    }

    let rows: Vec<RawResponse> = rows
        .into_iter()
        .filter(|r| r.round_no == Some(f64::from(round_no)))
        .collect();
    if rows.is_empty() {
        return Err(SnapshotError::EmptyDataset(format!(
            "no rows for round_no={round_no}"
        )));
    }

    let rows: Vec<RawResponse> = rows
        .into_iter()
        .filter(|r| QuestionType::parse(&r.question_type).is_some())
        .collect();
    if rows.is_empty() {
        return Err(SnapshotError::EmptyDataset(
            "no rows with question_type scale/text".to_string(),
        ));
    }

    let rows: Vec<RawResponse> = rows.into_iter().filter(|r| r.raw_score.is_some()).collect();
    if rows.is_empty() {
        return Err(SnapshotError::EmptyDataset(
            "raw_score is missing on every row".to_string(),
        ));
    }
    debug!(rows = rows.len(), "rows after round/type/score filters");
    Ok(rows)
}

fn parse_reverse_flags(rows: Vec<RawResponse>) -> Result<Vec<Candidate>> {
    let mut invalid: BTreeSet<String> = BTreeSet::new();
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let reverse_item = match row.reverse_item.as_deref() {
            None => None,
            Some("Y") => Some(true),
            Some("N") => Some(false),
            Some(other) => {
                invalid.insert(format!("{}={other}", row.item_id));
                None
            }
        };
        let (Some(question_type), Some(raw_score)) =
            (QuestionType::parse(&row.question_type), row.raw_score)
        else {
            continue;
        };
        out.push(Candidate {
            source: row,
            question_type,
            raw_score,
            reverse_item,
        });
    }
    if !invalid.is_empty() {
        let examples: Vec<String> = invalid.into_iter().take(EXAMPLE_LIMIT).collect();
        return Err(SnapshotError::Domain(format!(
            "reverse_item must be Y or N, e.g. {examples:?}"
        )));
    }
    Ok(out)
}

fn is_valid_grade(value: f64) -> bool {
    (0.0..=6.0).contains(&value) && value.fract() == 0.0
}

fn null_invalid_levels(rows: &mut [Candidate], diagnostics: &mut Diagnostics) {
    let mut bad_grades = 0;
    let mut bad_percentiles = 0;
    for row in rows.iter_mut() {
        if row
            .source
            .current_level_grade
            .is_some_and(|g| !is_valid_grade(g))
        {
            row.source.current_level_grade = None;
            bad_grades += 1;
        }
        if row
            .source
            .current_math_percentile
            .is_some_and(|p| !(0.0..=100.0).contains(&p))
        {
            row.source.current_math_percentile = None;
            bad_percentiles += 1;
        }
    }
    if bad_grades > 0 {
        diagnostics.warn(format!(
            "set {bad_grades} current_level_grade values outside 0-6 to missing"
        ));
    }
    if bad_percentiles > 0 {
        diagnostics.warn(format!(
            "set {bad_percentiles} current_math_percentile values outside 0-100 to missing"
        ));
    }
}

fn check_score_ranges(
    rows: Vec<Candidate>,
    threshold: f64,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<Candidate>> {
    let inverted: Vec<String> = rows
        .iter()
        .filter(|r| r.question_type == QuestionType::Scale)
        .filter_map(|r| match (r.source.min_score, r.source.max_score) {
            (Some(min), Some(max)) if min > max => {
                Some(format!("{} (min={min}, max={max})", r.source.item_id))
            }
            _ => None,
        })
        .take(EXAMPLE_LIMIT)
        .collect();
    if !inverted.is_empty() {
        return Err(SnapshotError::Domain(format!(
            "min_score > max_score, e.g. {inverted:?}"
        )));
    }

    let out_of_range = |r: &Candidate| -> Option<bool> {
        if r.question_type != QuestionType::Scale {
            return None;
        }
        let (min, max) = (r.source.min_score?, r.source.max_score?);
        Some(r.raw_score < min || r.raw_score > max)
    };

    let checked = rows.iter().filter(|r| out_of_range(r).is_some()).count();
    if checked == 0 {
        diagnostics.warn("no scale rows with valid min/max bounds; skipped the raw_score range check");
        return Ok(rows);
    }

    let offending: Vec<&Candidate> = rows
        .iter()
        .filter(|r| out_of_range(r) == Some(true))
        .collect();
    let ratio = offending.len() as f64 / checked as f64;
    if ratio > threshold {
        let examples = offending
            .iter()
            .take(EXAMPLE_LIMIT)
            .map(|r| {
                format!(
                    "{}/{} raw={} range=[{}, {}]",
                    r.source.student_id,
                    r.source.item_id,
                    r.raw_score,
                    r.source.min_score.unwrap_or_default(),
                    r.source.max_score.unwrap_or_default()
                )
            })
            .collect();
        return Err(SnapshotError::RangeViolation {
            ratio,
            threshold,
            examples,
        });
    }

    let dropped = offending.len();
    if dropped == 0 {
        return Ok(rows);
    }
    diagnostics.warn(format!(
        "excluded {dropped} out-of-range raw_score rows ({:.2}%)",
        ratio * 100.0
    ));
    Ok(rows
        .into_iter()
        .filter(|r| out_of_range(r) != Some(true))
        .collect())
}

/// One row per (student_id, item_id): the latest answer wins, rows without a
/// timestamp count as oldest, and file order breaks remaining ties.
fn dedupe_latest(rows: Vec<Candidate>, diagnostics: &mut Diagnostics) -> Vec<Candidate> {
    let before = rows.len();
    let mut indexed: Vec<(usize, Candidate)> = rows.into_iter().enumerate().collect();
    indexed.sort_by(|(ia, a), (ib, b)| {
        a.source
            .student_id
            .cmp(&b.source.student_id)
            .then_with(|| a.source.item_id.cmp(&b.source.item_id))
            .then_with(|| a.source.answered_at.cmp(&b.source.answered_at))
            .then_with(|| {
                // a missing response_id sorts after every present one
                match (&a.source.response_id, &b.source.response_id) {
                    (Some(x), Some(y)) => x.cmp(y),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                }
            })
            .then_with(|| ia.cmp(ib))
    });

    let mut kept: Vec<Candidate> = Vec::with_capacity(indexed.len());
    for (_, row) in indexed {
        match kept.last_mut() {
            Some(last)
                if last.source.student_id == row.source.student_id
                    && last.source.item_id == row.source.item_id =>
            {
                *last = row;
            }
            _ => kept.push(row),
        }
    }

    let removed = before - kept.len();
    if removed > 0 {
        diagnostics.warn(format!(
            "resolved {removed} duplicate (student_id, item_id) rows by latest answered_at"
        ));
    }
    kept
}

/// Drop incomplete rows, reject conflicting duplicates and keep the first
/// occurrence of each question_id.
fn validate_scale_map(scale_map: &[ScaleMapEntry]) -> Result<HashMap<String, ScaleMapEntry>> {
    let usable: Vec<&ScaleMapEntry> = scale_map
        .iter()
        .filter(|e| !e.question_id.is_empty() && !e.scale_name.is_empty())
        .collect();

    let mut by_id: BTreeMap<&str, Vec<&ScaleMapEntry>> = BTreeMap::new();
    for entry in &usable {
        by_id.entry(entry.question_id.as_str()).or_default().push(entry);
    }
    let conflicts: Vec<String> = by_id
        .iter()
        .filter(|(_, entries)| {
            entries.iter().any(|e| {
                e.scale_name != entries[0].scale_name
                    || e.include_in_alpha != entries[0].include_in_alpha
                    || e.axis_tag != entries[0].axis_tag
                    || e.analysis_group != entries[0].analysis_group
            })
        })
        .map(|(id, _)| id.to_string())
        .take(ID_EXAMPLE_LIMIT)
        .collect();
    if !conflicts.is_empty() {
        return Err(SnapshotError::MappingConflict(conflicts));
    }

    let mut map = HashMap::new();
    for entry in usable {
        map.entry(entry.question_id.clone())
            .or_insert_with(|| entry.clone());
    }
    if map.is_empty() {
        return Err(SnapshotError::EmptyDataset(
            "scale_map has no rows with both question_id and scale_name".to_string(),
        ));
    }
    Ok(map)
}

fn check_scale_items_mapped(
    rows: &[Candidate],
    map: &HashMap<String, ScaleMapEntry>,
) -> Result<()> {
    let missing: BTreeSet<&str> = rows
        .iter()
        .filter(|r| r.question_type == QuestionType::Scale)
        .map(|r| r.source.item_id.as_str())
        .filter(|id| {
            map.get(*id)
                .map_or(true, |e| e.analysis_group == AnalysisGroup::SupplementaryNumeric)
        })
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(SnapshotError::UnmappedItem {
        count: missing.len(),
        examples: missing
            .into_iter()
            .take(ID_EXAMPLE_LIMIT)
            .map(String::from)
            .collect(),
    })
}

/// Scale name given to a text item that has no mapping.
pub fn adopted_scale_name(item_id: &str, item_text: Option<&str>) -> String {
    match item_text.map(str::trim).filter(|t| !t.is_empty()) {
        Some(text) => text.to_string(),
        None => {
            let prefix: String = item_id.chars().take(8).collect();
            format!("subjective_{prefix}")
        }
    }
}

fn attach_mapping(
    rows: Vec<Candidate>,
    map: &HashMap<String, ScaleMapEntry>,
    round_no: u32,
    text_policy: UnmappedTextPolicy,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<PreparedRecord>> {
    let unmapped_text: BTreeSet<&str> = rows
        .iter()
        .filter(|r| r.question_type == QuestionType::Text && !map.contains_key(&r.source.item_id))
        .map(|r| r.source.item_id.as_str())
        .collect();
    if text_policy == UnmappedTextPolicy::Reject && !unmapped_text.is_empty() {
        return Err(SnapshotError::UnmappedItem {
            count: unmapped_text.len(),
            examples: unmapped_text
                .iter()
                .take(ID_EXAMPLE_LIMIT)
                .map(|s| s.to_string())
                .collect(),
        });
    }

    let mut adopted = 0;
    let mut text_moved = 0;
    let mut scale_moved = 0;
    let mut records = Vec::with_capacity(rows.len());

    for row in rows {
        let Candidate {
            source,
            question_type,
            raw_score,
            reverse_item,
        } = row;

        let (scale_name, mut include_in_alpha, axis_tag, mut analysis_group) =
            match map.get(&source.item_id) {
                Some(entry) => (
                    entry.scale_name.clone(),
                    entry.include_in_alpha,
                    entry.axis_tag,
                    entry.analysis_group,
                ),
                None => {
                    adopted += 1;
                    (
                        adopted_scale_name(&source.item_id, source.item_text.as_deref()),
                        false,
                        None,
                        AnalysisGroup::SupplementaryNumeric,
                    )
                }
            };

        match (question_type, analysis_group) {
            (QuestionType::Text, AnalysisGroup::CoreScale) => {
                analysis_group = AnalysisGroup::SupplementaryNumeric;
                text_moved += 1;
            }
            (QuestionType::Scale, AnalysisGroup::SupplementaryNumeric) => {
                analysis_group = AnalysisGroup::CoreScale;
                scale_moved += 1;
            }
            _ => {}
        }
        if analysis_group == AnalysisGroup::SupplementaryNumeric {
            include_in_alpha = false;
        }

        let score_rc = reverse_code(
            question_type,
            reverse_item,
            raw_score,
            source.min_score,
            source.max_score,
        );
        records.push(PreparedRecord {
            response_time_sec: source.response_ms.map(|ms| ms / 1000.0),
            student_id: source.student_id,
            item_id: source.item_id,
            item_text: source.item_text,
            trait_name: source.trait_name,
            question_type,
            round_label: source.round_label,
            round_no,
            response_id: source.response_id,
            answered_at: source.answered_at,
            raw_score,
            score_rc,
            response_ms: source.response_ms,
            reverse_item,
            min_score: source.min_score,
            max_score: source.max_score,
            weight: source.weight,
            scale_name,
            include_in_alpha,
            axis_tag,
            analysis_group,
            current_level_grade: source.current_level_grade,
            current_math_percentile: source.current_math_percentile,
        });
    }

    if adopted > 0 {
        diagnostics.warn(format!(
            "adopted {adopted} text responses missing from scale_map as supplementary_numeric"
        ));
    }
    if text_moved > 0 {
        diagnostics.warn(format!(
            "moved {text_moved} text responses to analysis_group supplementary_numeric"
        ));
    }
    if scale_moved > 0 {
        diagnostics.warn(format!(
            "moved {scale_moved} scale responses to analysis_group core_scale"
        ));
    }
    Ok(records)
}

/// Distinct (item, scale, alpha flag, axis tag) rows of the core items that
/// actually occur in the responses.
fn build_effective_map(records: &[PreparedRecord]) -> Vec<EffectiveMapEntry> {
    records
        .iter()
        .filter(|r| r.is_core())
        .map(|r| EffectiveMapEntry {
            question_id: r.item_id.clone(),
            scale_name: r.scale_name.clone(),
            include_in_alpha: r.include_in_alpha,
            axis_tag: r.axis_tag,
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn build_axis_config(effective_map: &[EffectiveMapEntry]) -> Result<AxisConfig> {
    let mut tags_by_scale: BTreeMap<&str, BTreeSet<AxisTag>> = BTreeMap::new();
    for entry in effective_map {
        let tags = tags_by_scale.entry(entry.scale_name.as_str()).or_default();
        if let Some(tag) = entry.axis_tag {
            tags.insert(tag);
        }
    }

    let mut config = AxisConfig::new();
    for (scale_name, tags) in tags_by_scale {
        if tags.len() > 1 {
            return Err(SnapshotError::AxisConflict {
                scale_name: scale_name.to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
            });
        }
        if let Some(tag) = tags.into_iter().next() {
            config.entry(tag).or_default().push(scale_name.to_string());
        }
    }
    for scales in config.values_mut() {
        scales.sort();
        scales.dedup();
    }
    Ok(config)
}

pub fn check_axis_coverage(axis_config: &AxisConfig) -> Result<()> {
    let present: HashSet<AxisTag> = axis_config
        .iter()
        .filter(|(_, scales)| !scales.is_empty())
        .map(|(tag, _)| *tag)
        .collect();
    let missing: Vec<String> = COVERAGE_REQUIREMENTS
        .iter()
        .filter(|req| !req.tags.iter().any(|tag| present.contains(tag)))
        .map(|req| req.name.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(SnapshotError::AxisCoverage(missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::parse_timestamp;

    fn answer(student: &str, item: &str, score: f64) -> RawResponse {
        RawResponse {
            student_id: student.to_string(),
            item_id: item.to_string(),
            question_type: "scale".to_string(),
            round_no: Some(1.0),
            raw_score: Some(score),
            response_ms: Some(2000.0),
            reverse_item: Some("N".to_string()),
            min_score: Some(1.0),
            max_score: Some(5.0),
            ..RawResponse::default()
        }
    }

    fn text_answer(student: &str, item: &str, score: f64, text: Option<&str>) -> RawResponse {
        RawResponse {
            question_type: "text".to_string(),
            min_score: None,
            max_score: None,
            reverse_item: None,
            item_text: text.map(String::from),
            ..answer(student, item, score)
        }
    }

    fn entry(question_id: &str, scale: &str, tag: Option<AxisTag>) -> ScaleMapEntry {
        ScaleMapEntry {
            question_id: question_id.to_string(),
            scale_name: scale.to_string(),
            include_in_alpha: true,
            axis_tag: tag,
            analysis_group: AnalysisGroup::CoreScale,
        }
    }

    fn fixture_map() -> Vec<ScaleMapEntry> {
        vec![
            entry("q1", "Efficacy", Some(AxisTag::Efficacy)),
            entry("q2", "Growth", Some(AxisTag::GrowthMindset)),
            entry("q3", "Anxiety", Some(AxisTag::Anxiety)),
        ]
    }

    fn fixture_answers(students: usize) -> Vec<RawResponse> {
        let mut rows = Vec::new();
        for s in 0..students {
            for item in ["q1", "q2", "q3"] {
                rows.push(answer(&format!("s{s:02}"), item, 3.0));
            }
        }
        rows
    }

    /// 100 validly bounded scale rows, `bad` of them out of range.
    fn hundred_rows_with(bad: usize) -> Vec<RawResponse> {
        let mut rows = fixture_answers(32);
        for s in 32..36 {
            rows.push(answer(&format!("s{s:02}"), "q1", 2.0));
        }
        assert_eq!(rows.len(), 100);
        for row in rows.iter_mut().take(bad) {
            row.raw_score = Some(9.0);
        }
        rows
    }

    #[test]
    fn range_ratio_at_threshold_is_tolerated() {
        let mut diagnostics = Diagnostics::new();
        let prepared = prepare(&hundred_rows_with(1), &fixture_map(), 1, 0.01, &mut diagnostics)
            .unwrap();
        assert_eq!(prepared.records.len(), 99);
        assert!(diagnostics.contains("out-of-range"));
    }

    #[test]
    fn range_ratio_above_threshold_fails() {
        let mut diagnostics = Diagnostics::new();
        let err = prepare(&hundred_rows_with(2), &fixture_map(), 1, 0.01, &mut diagnostics)
            .unwrap_err();
        match err {
            SnapshotError::RangeViolation { ratio, .. } => assert!((ratio - 0.02).abs() < 1e-12),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn inverted_bounds_are_a_domain_error() {
        let mut rows = fixture_answers(2);
        rows[0].min_score = Some(6.0);
        let err = prepare(&rows, &fixture_map(), 1, 0.01, &mut Diagnostics::new()).unwrap_err();
        assert!(matches!(err, SnapshotError::Domain(_)));
    }

    #[test]
    fn reverse_flag_outside_y_n_is_rejected() {
        let mut rows = fixture_answers(2);
        rows[1].reverse_item = Some("MAYBE".to_string());
        let err = prepare(&rows, &fixture_map(), 1, 0.01, &mut Diagnostics::new()).unwrap_err();
        assert!(matches!(err, SnapshotError::Domain(_)));
    }

    #[test]
    fn filters_that_empty_the_data_fail() {
        let rows = fixture_answers(2);
        let err = prepare(&rows, &fixture_map(), 2, 0.01, &mut Diagnostics::new()).unwrap_err();
        assert!(matches!(err, SnapshotError::EmptyDataset(_)));

        let mut blank = fixture_answers(1);
        for row in blank.iter_mut() {
            row.student_id.clear();
        }
        let err = prepare(&blank, &fixture_map(), 1, 0.01, &mut Diagnostics::new()).unwrap_err();
        assert!(matches!(err, SnapshotError::EmptyDataset(_)));
    }

    #[test]
    fn out_of_domain_levels_become_missing() {
        let mut rows = fixture_answers(2);
        rows[0].current_level_grade = Some(9.0);
        rows[1].current_math_percentile = Some(140.0);
        rows[2].current_level_grade = Some(3.0);
        let mut diagnostics = Diagnostics::new();
        let prepared = prepare(&rows, &fixture_map(), 1, 0.01, &mut diagnostics).unwrap();
        let s00: Vec<&PreparedRecord> = prepared
            .records
            .iter()
            .filter(|r| r.student_id == "s00")
            .collect();
        assert_eq!(s00[0].current_level_grade, None);
        assert_eq!(s00[1].current_math_percentile, None);
        assert_eq!(s00[2].current_level_grade, Some(3.0));
        assert!(diagnostics.contains("current_level_grade"));
        assert!(diagnostics.contains("current_math_percentile"));
    }

    #[test]
    fn duplicates_keep_the_latest_answer() {
        let mut rows = fixture_answers(1);
        let mut early = answer("s00", "q1", 1.0);
        early.answered_at = parse_timestamp("2026-02-01 09:00:00");
        let mut late = answer("s00", "q1", 5.0);
        late.answered_at = parse_timestamp("2026-02-02 09:00:00");
        let undated = answer("s00", "q1", 2.0);
        // later in file order than the dated rows, but undated counts as oldest
        rows.push(late);
        rows.push(early);
        rows.push(undated);

        let mut diagnostics = Diagnostics::new();
        let prepared = prepare(&rows, &fixture_map(), 1, 0.01, &mut diagnostics).unwrap();
        let q1: Vec<&PreparedRecord> = prepared
            .records
            .iter()
            .filter(|r| r.item_id == "q1")
            .collect();
        assert_eq!(q1.len(), 1);
        assert_eq!(q1[0].raw_score, 5.0);
        assert!(diagnostics.contains("3 duplicate"));
    }

    #[test]
    fn undated_duplicates_fall_back_to_file_order() {
        let mut rows = fixture_answers(1);
        rows.push(answer("s00", "q2", 4.0));
        let prepared = prepare(&rows, &fixture_map(), 1, 0.01, &mut Diagnostics::new()).unwrap();
        let q2 = prepared
            .records
            .iter()
            .find(|r| r.item_id == "q2")
            .unwrap();
        assert_eq!(q2.raw_score, 4.0);
    }

    #[test]
    fn conflicting_map_rows_fail() {
        let mut map = fixture_map();
        map.push(entry("q1", "Other", Some(AxisTag::Efficacy)));
        let err = prepare(&fixture_answers(2), &map, 1, 0.01, &mut Diagnostics::new())
            .unwrap_err();
        assert!(matches!(err, SnapshotError::MappingConflict(ids) if ids == vec!["q1"]));

        let mut identical = fixture_map();
        identical.push(entry("q1", "Efficacy", Some(AxisTag::Efficacy)));
        assert!(prepare(&fixture_answers(2), &identical, 1, 0.01, &mut Diagnostics::new()).is_ok());
    }

    #[test]
    fn unmapped_scale_items_fail() {
        let mut rows = fixture_answers(2);
        rows.push(answer("s00", "q9", 3.0));
        let err = prepare(&rows, &fixture_map(), 1, 0.01, &mut Diagnostics::new()).unwrap_err();
        assert!(matches!(err, SnapshotError::UnmappedItem { count: 1, .. }));

        let mut map = fixture_map();
        let mut supplementary = entry("q9", "Extra", None);
        supplementary.analysis_group = AnalysisGroup::SupplementaryNumeric;
        map.push(supplementary);
        let err = prepare(&rows, &map, 1, 0.01, &mut Diagnostics::new()).unwrap_err();
        assert!(matches!(err, SnapshotError::UnmappedItem { .. }));
    }

    #[test]
    fn unmapped_text_items_are_adopted() {
        let mut rows = fixture_answers(2);
        rows.push(text_answer("s00", "t-1234567890", 7.0, Some("  Study hours ")));
        rows.push(text_answer("s01", "t-abcdefghij", 4.0, None));
        let mut diagnostics = Diagnostics::new();
        let prepared = prepare(&rows, &fixture_map(), 1, 0.01, &mut diagnostics).unwrap();

        let supplementary = prepared.supplementary_records();
        assert_eq!(supplementary.len(), 2);
        assert_eq!(supplementary[0].scale_name, "Study hours");
        assert_eq!(supplementary[1].scale_name, "subjective_t-abcdef");
        assert!(supplementary.iter().all(|r| !r.include_in_alpha && r.axis_tag.is_none()));
        assert!(diagnostics.contains("adopted 2 text"));
        assert_eq!(prepared.core_records().len(), 6);
    }

    #[test]
    fn reject_policy_refuses_unmapped_text() {
        let mut rows = fixture_answers(2);
        rows.push(text_answer("s00", "t1", 7.0, None));
        let err = prepare_with_policy(
            &rows,
            &fixture_map(),
            1,
            0.01,
            UnmappedTextPolicy::Reject,
            &mut Diagnostics::new(),
        )
        .unwrap_err();
        assert!(matches!(err, SnapshotError::UnmappedItem { count: 1, .. }));
    }

    #[test]
    fn text_items_mapped_as_core_are_moved() {
        let mut rows = fixture_answers(2);
        rows.push(text_answer("s00", "t1", 7.0, None));
        let mut map = fixture_map();
        map.push(entry("t1", "Hours", None));
        let mut diagnostics = Diagnostics::new();
        let prepared = prepare(&rows, &map, 1, 0.01, &mut diagnostics).unwrap();
        let t1 = prepared.records.iter().find(|r| r.item_id == "t1").unwrap();
        assert_eq!(t1.analysis_group, AnalysisGroup::SupplementaryNumeric);
        assert!(!t1.include_in_alpha);
        assert!(diagnostics.contains("moved 1 text"));
        assert!(prepared.effective_map.iter().all(|e| e.question_id != "t1"));
    }

    #[test]
    fn reverse_items_are_recoded() {
        let mut rows = fixture_answers(1);
        rows[0].reverse_item = Some("Y".to_string());
        rows[0].raw_score = Some(2.0);
        let prepared = prepare(&rows, &fixture_map(), 1, 0.01, &mut Diagnostics::new()).unwrap();
        let q1 = &prepared.records[0];
        assert_eq!(q1.item_id, "q1");
        assert_eq!(q1.score_rc, Some(4.0));
        assert_eq!(q1.reverse_item, Some(true));
        assert_eq!(q1.response_time_sec, Some(2.0));
    }

    #[test]
    fn scale_with_two_tags_is_an_axis_conflict() {
        let mut map = fixture_map();
        map.push(entry("q4", "Efficacy", Some(AxisTag::BeliefPos)));
        let mut rows = fixture_answers(2);
        rows.push(answer("s00", "q4", 3.0));
        let err = prepare(&rows, &map, 1, 0.01, &mut Diagnostics::new()).unwrap_err();
        assert!(matches!(err, SnapshotError::AxisConflict { ref scale_name, .. } if scale_name == "Efficacy"));
    }

    #[test]
    fn missing_axes_are_listed() {
        let map = vec![
            entry("q1", "Efficacy", Some(AxisTag::Efficacy)),
            entry("q2", "Growth", None),
            entry("q3", "Anxiety", None),
        ];
        let err = prepare(&fixture_answers(2), &map, 1, 0.01, &mut Diagnostics::new())
            .unwrap_err();
        match err {
            SnapshotError::AxisCoverage(missing) => assert_eq!(
                missing,
                vec!["growth_mindset".to_string(), "emotional_stability|anxiety".to_string()]
            ),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn axis_config_lists_sorted_core_scales() {
        let mut map = fixture_map();
        map.push(entry("q4", "Calm", Some(AxisTag::EmotionalStability)));
        map.push(entry("q5", "Acalm", Some(AxisTag::EmotionalStability)));
        let mut rows = fixture_answers(2);
        rows.push(answer("s00", "q4", 3.0));
        rows.push(answer("s00", "q5", 3.0));
        let prepared = prepare(&rows, &map, 1, 0.01, &mut Diagnostics::new()).unwrap();
        assert_eq!(
            prepared.axis_config[&AxisTag::EmotionalStability],
            vec!["Acalm".to_string(), "Calm".to_string()]
        );
        // map entries never answered do not contribute
        assert_eq!(prepared.effective_map.len(), 5);
    }
}
