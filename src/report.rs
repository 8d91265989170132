use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{PreparedRecord, ScaleStats, StudentScore, StudentType, TypeCode};
use crate::stats;
use crate::table::{Cell, Table, Tabular};
use crate::validation::ValidationSummary;

/// Sample sd with the single-value case pinned to zero.
fn spread(values: &[f64]) -> Option<f64> {
    match values.len() {
        0 => None,
        1 => Some(0.0),
        _ => stats::sample_sd(values),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LevelGroupSummary {
    pub scale_name: String,
    pub current_level_grade: f64,
    pub n_students: usize,
    pub mean_raw_score: Option<f64>,
    pub sd_raw_score: Option<f64>,
    pub mean_z_score: Option<f64>,
    pub mean_percentile: Option<f64>,
}

impl Tabular for LevelGroupSummary {
    fn columns() -> Vec<&'static str> {
        vec![
            "scale_name",
            "current_level_grade",
            "n_students",
            "mean_raw_score",
            "sd_raw_score",
            "mean_z_score",
            "mean_percentile",
        ]
    }

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::from(&self.scale_name),
            Cell::from(self.current_level_grade),
            Cell::from(self.n_students),
            Cell::from(self.mean_raw_score),
            Cell::from(self.sd_raw_score),
            Cell::from(self.mean_z_score),
            Cell::from(self.mean_percentile),
        ]
    }
}

/// Scale scores grouped by (scale, current level grade); students without a
/// grade are left out.
pub fn summarize_by_current_level(scores: &[StudentScore]) -> Vec<LevelGroupSummary> {
    let mut groups: BTreeMap<(&str, i64), Vec<&StudentScore>> = BTreeMap::new();
    for score in scores {
        if let Some(grade) = score.current_level_grade.filter(|g| g.is_finite()) {
            groups
                .entry((score.scale_name.as_str(), grade.round() as i64))
                .or_default()
                .push(score);
        }
    }

    groups
        .into_iter()
        .map(|((scale_name, grade), rows)| {
            let raw = stats::finite(rows.iter().map(|r| r.raw_score));
            let students: BTreeSet<&str> = rows.iter().map(|r| r.student_id.as_str()).collect();
            LevelGroupSummary {
                scale_name: scale_name.to_string(),
                current_level_grade: grade as f64,
                n_students: students.len(),
                mean_raw_score: stats::mean(&raw),
                sd_raw_score: spread(&raw),
                mean_z_score: stats::mean(&stats::finite(rows.iter().map(|r| r.z_score))),
                mean_percentile: stats::mean(&stats::finite(rows.iter().map(|r| r.percentile))),
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubjectiveItemSummary {
    pub item_id: String,
    pub item_text: Option<String>,
    pub scale_name: String,
    pub n_respondents: usize,
    pub mean: Option<f64>,
    pub sd: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub response_time_sec_mean: Option<f64>,
}

impl Tabular for SubjectiveItemSummary {
    fn columns() -> Vec<&'static str> {
        vec![
            "item_id",
            "item_text",
            "scale_name",
            "n_respondents",
            "mean",
            "sd",
            "min",
            "max",
            "response_time_sec_mean",
        ]
    }

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::from(&self.item_id),
            Cell::from(self.item_text.as_deref()),
            Cell::from(&self.scale_name),
            Cell::from(self.n_respondents),
            Cell::from(self.mean),
            Cell::from(self.sd),
            Cell::from(self.min),
            Cell::from(self.max),
            Cell::from(self.response_time_sec_mean),
        ]
    }
}

/// Descriptives for supplementary items, ordered by (scale, item).
pub fn summarize_subjective_items(
    supplementary: &[PreparedRecord],
) -> Vec<SubjectiveItemSummary> {
    let mut groups: BTreeMap<(&str, &str), Vec<&PreparedRecord>> = BTreeMap::new();
    for record in supplementary {
        groups
            .entry((record.scale_name.as_str(), record.item_id.as_str()))
            .or_default()
            .push(record);
    }

    groups
        .into_iter()
        .map(|((scale_name, item_id), rows)| {
            let scores = stats::finite(rows.iter().map(|r| r.score_rc));
            let students: BTreeSet<&str> = rows.iter().map(|r| r.student_id.as_str()).collect();
            SubjectiveItemSummary {
                item_id: item_id.to_string(),
                item_text: rows.iter().find_map(|r| r.item_text.clone()),
                scale_name: scale_name.to_string(),
                n_respondents: students.len(),
                mean: stats::mean(&scores),
                sd: spread(&scores),
                min: stats::min(&scores),
                max: stats::max(&scores),
                response_time_sec_mean: stats::mean(&stats::finite(
                    rows.iter().map(|r| r.response_time_sec),
                )),
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudentSubjectiveRow {
    pub student_id: String,
    pub item_id: String,
    pub item_text: Option<String>,
    pub scale_name: String,
    pub raw_score: f64,
    pub score_rc: Option<f64>,
    pub response_time_sec: Option<f64>,
    pub current_level_grade: Option<f64>,
    pub current_math_percentile: Option<f64>,
    pub snapshot_version: String,
}

impl Tabular for StudentSubjectiveRow {
    fn columns() -> Vec<&'static str> {
        vec![
            "student_id",
            "item_id",
            "item_text",
            "scale_name",
            "raw_score",
            "score_rc",
            "response_time_sec",
            "current_level_grade",
            "current_math_percentile",
            "snapshot_version",
        ]
    }

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::from(&self.student_id),
            Cell::from(&self.item_id),
            Cell::from(self.item_text.as_deref()),
            Cell::from(&self.scale_name),
            Cell::from(self.raw_score),
            Cell::from(self.score_rc),
            Cell::from(self.response_time_sec),
            Cell::from(self.current_level_grade),
            Cell::from(self.current_math_percentile),
            Cell::from(&self.snapshot_version),
        ]
    }
}

pub fn student_subjective(
    supplementary: &[PreparedRecord],
    snapshot_version: &str,
) -> Vec<StudentSubjectiveRow> {
    let mut rows: Vec<StudentSubjectiveRow> = supplementary
        .iter()
        .map(|r| StudentSubjectiveRow {
            student_id: r.student_id.clone(),
            item_id: r.item_id.clone(),
            item_text: r.item_text.clone(),
            scale_name: r.scale_name.clone(),
            raw_score: r.raw_score,
            score_rc: r.score_rc,
            response_time_sec: r.response_time_sec,
            current_level_grade: r.current_level_grade,
            current_math_percentile: r.current_math_percentile,
            snapshot_version: snapshot_version.to_string(),
        })
        .collect();
    rows.sort_by(|a, b| (&a.student_id, &a.item_id).cmp(&(&b.student_id, &b.item_id)));
    rows
}

/// Wide student x item table of `score_rc`; the last response wins.
pub fn student_item_matrix(records: &[PreparedRecord]) -> Table {
    let items: BTreeSet<&str> = records.iter().map(|r| r.item_id.as_str()).collect();
    let mut cells: BTreeMap<&str, BTreeMap<&str, f64>> = BTreeMap::new();
    for record in records {
        let row = cells.entry(record.student_id.as_str()).or_default();
        if let Some(score) = record.score_rc.filter(|v| v.is_finite()) {
            row.insert(record.item_id.as_str(), score);
        }
    }

    let mut columns = vec!["student_id".to_string()];
    columns.extend(items.iter().map(|item| item.to_string()));
    let mut table = Table::new(columns);
    for (student_id, scores) in cells {
        let mut row = vec![Cell::from(student_id)];
        row.extend(items.iter().map(|item| Cell::from(scores.get(item).copied())));
        table.push(row);
    }
    table
}

/// First recorded value per student; records must be grouped by student.
fn per_student_first<F>(records: &[PreparedRecord], field: F) -> Vec<Option<f64>>
where
    F: Fn(&PreparedRecord) -> Option<f64>,
{
    let mut seen: BTreeMap<&str, Option<f64>> = BTreeMap::new();
    for record in records {
        let slot = seen.entry(record.student_id.as_str()).or_insert(None);
        if slot.is_none() {
            *slot = field(record).filter(|v| v.is_finite());
        }
    }
    seen.into_values().collect()
}

/// Students per current level grade, with `null` for students without one.
pub fn level_distribution(core: &[PreparedRecord]) -> BTreeMap<String, usize> {
    let mut out = BTreeMap::new();
    for grade in per_student_first(core, |r| r.current_level_grade) {
        let key = grade.map_or_else(|| "null".to_string(), |g| (g.round() as i64).to_string());
        *out.entry(key).or_insert(0) += 1;
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PercentileSummary {
    pub count: usize,
    pub mean: Option<f64>,
    pub sd: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub p25: Option<f64>,
    pub p50: Option<f64>,
    pub p75: Option<f64>,
}

pub fn percentile_summary(core: &[PreparedRecord]) -> PercentileSummary {
    let values: Vec<f64> = per_student_first(core, |r| r.current_math_percentile)
        .into_iter()
        .flatten()
        .collect();
    if values.is_empty() {
        return PercentileSummary::default();
    }
    PercentileSummary {
        count: values.len(),
        mean: stats::mean(&values),
        sd: spread(&values),
        min: stats::min(&values),
        max: stats::max(&values),
        p25: stats::quantile(&values, 0.25),
        p50: stats::quantile(&values, 0.50),
        p75: stats::quantile(&values, 0.75),
    }
}

/// Baseline frozen into metadata for later rounds to score against.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FixedScaleStat {
    pub mean: Option<f64>,
    pub sd: Option<f64>,
    pub alpha: Option<f64>,
    pub item_count: usize,
    pub n_respondents: usize,
    pub alpha_n_complete: usize,
}

pub fn fixed_scale_stats(scale_stats: &[ScaleStats]) -> BTreeMap<String, FixedScaleStat> {
    scale_stats
        .iter()
        .map(|s| {
            (
                s.scale_name.clone(),
                FixedScaleStat {
                    mean: s.mean,
                    sd: s.sd,
                    alpha: s.cronbach_alpha,
                    item_count: s.item_count,
                    n_respondents: s.n_respondents,
                    alpha_n_complete: s.alpha_n_complete,
                },
            )
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotMetadata {
    pub version: String,
    pub snapshot_date: String,
    #[serde(rename = "total_N")]
    pub total_n: usize,
    pub used_item_ids: Vec<String>,
    pub core_item_ids: Vec<String>,
    pub supplementary_item_ids: Vec<String>,
    pub subjective_in_core: bool,
    pub survey_slug: String,
    pub snapshot_cutoff_at: String,
    pub round_no: u32,
    pub fixed_scale_stats: BTreeMap<String, FixedScaleStat>,
    pub level_distribution: BTreeMap<String, usize>,
    pub current_math_percentile_summary: PercentileSummary,
    pub supplementary_item_stats_count: usize,
    pub supplementary_student_rows: usize,
    pub logic_version: String,
    pub data_hash: String,
    pub scale_map_hash: String,
    pub warnings: Vec<String>,
    pub axis_config: BTreeMap<String, Vec<String>>,
    pub generated_at: DateTime<Utc>,
}

fn fmt_opt(value: Option<f64>, decimals: usize) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{v:.decimals$}"),
        _ => "n/a".to_string(),
    }
}

pub fn build_report(
    metadata: &SnapshotMetadata,
    scale_stats: &[ScaleStats],
    student_types: &[StudentType],
    validation: &ValidationSummary,
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Trait Snapshot {}", metadata.version);
    let _ = writeln!(
        output,
        "Survey {} round {} (cutoff {}), logic {}",
        metadata.survey_slug, metadata.round_no, metadata.snapshot_cutoff_at, metadata.logic_version
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Cohort");
    let _ = writeln!(output, "- Students (core): {}", metadata.total_n);
    let _ = writeln!(output, "- Core items: {}", metadata.core_item_ids.len());
    let _ = writeln!(
        output,
        "- Supplementary items: {}",
        metadata.supplementary_item_ids.len()
    );
    let _ = writeln!(output, "- Data hash: `{}`", metadata.data_hash);

    let _ = writeln!(output);
    let _ = writeln!(output, "## Scale Baselines");
    if scale_stats.is_empty() {
        let _ = writeln!(output, "No scales scored.");
    } else {
        for scale in scale_stats {
            let _ = writeln!(
                output,
                "- {}: mean {} sd {} alpha {} ({} items, {} respondents)",
                scale.scale_name,
                fmt_opt(scale.mean, 3),
                fmt_opt(scale.sd, 3),
                fmt_opt(scale.cronbach_alpha, 3),
                scale.item_count,
                scale.n_respondents
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Typology");
    let mut counts: BTreeMap<TypeCode, usize> = BTreeMap::new();
    for student in student_types {
        *counts.entry(student.type_code).or_insert(0) += 1;
    }
    if counts.is_empty() {
        let _ = writeln!(output, "No students classified.");
    } else {
        for (code, count) in &counts {
            let _ = writeln!(output, "- {}: {} students", code.label(), count);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Type-Level Validation");
    let _ = writeln!(
        output,
        "- Students with level / with type: {} / {}",
        validation.n_students_with_level, validation.n_students_with_type
    );
    let _ = writeln!(
        output,
        "- Kruskal-Wallis p {} (epsilon squared {})",
        fmt_opt(validation.kruskal_p_value, 4),
        fmt_opt(validation.kruskal_epsilon2, 3)
    );
    let _ = writeln!(
        output,
        "- Interaction LR test p {}",
        fmt_opt(validation.interaction_p_value, 4)
    );
    let _ = writeln!(
        output,
        "- Cross-validation ({}): MAE {} QWK {}",
        validation.cv_strategy.unwrap_or("not run"),
        fmt_opt(validation.cv_mae_mean, 3),
        fmt_opt(validation.cv_qwk_mean, 3)
    );
    let _ = writeln!(output);
    let _ = writeln!(
        output,
        "{}",
        validation.interpretation.type_explains_current_ability
    );
    let _ = writeln!(
        output,
        "{}",
        validation.interpretation.type_suggests_growth_potential
    );
    let _ = writeln!(
        output,
        "{}",
        validation.interpretation.type_as_independent_state
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "## Warnings");
    if metadata.warnings.is_empty() {
        let _ = writeln!(output, "None.");
    } else {
        for warning in &metadata.warnings {
            let _ = writeln!(output, "- {warning}");
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnalysisGroup, QuestionType};

    fn record(student: &str, item: &str, score: Option<f64>, grade: Option<f64>) -> PreparedRecord {
        PreparedRecord {
            student_id: student.to_string(),
            item_id: item.to_string(),
            item_text: Some(format!("text {item}")),
            trait_name: None,
            question_type: QuestionType::Text,
            round_label: None,
            round_no: 1,
            response_id: None,
            answered_at: None,
            raw_score: score.unwrap_or(0.0),
            score_rc: score,
            response_ms: Some(1500.0),
            response_time_sec: Some(1.5),
            reverse_item: None,
            min_score: None,
            max_score: None,
            weight: None,
            scale_name: "Mood".to_string(),
            include_in_alpha: false,
            axis_tag: None,
            analysis_group: AnalysisGroup::SupplementaryNumeric,
            current_level_grade: grade,
            current_math_percentile: grade.map(|g| g * 10.0),
        }
    }

    fn score(student: &str, scale: &str, raw: f64, grade: Option<f64>) -> StudentScore {
        StudentScore {
            student_id: student.to_string(),
            scale_name: scale.to_string(),
            raw_score: Some(raw),
            z_score: Some(raw - 3.0),
            axis_raw_score: Some(raw),
            axis_z_score: None,
            percentile: Some(50.0),
            answered_item_n: 1,
            total_item_n: 1,
            completion_rate: Some(1.0),
            current_level_grade: grade,
            current_math_percentile: None,
            response_time_sec_mean: None,
            snapshot_version: "v1.0".to_string(),
        }
    }

    #[test]
    fn level_groups_skip_students_without_grade() {
        let scores = vec![
            score("s1", "Calm", 2.0, Some(3.0)),
            score("s2", "Calm", 4.0, Some(3.0)),
            score("s3", "Calm", 5.0, Some(1.0)),
            score("s4", "Calm", 1.0, None),
        ];
        let groups = summarize_by_current_level(&scores);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].current_level_grade, 1.0);
        assert_eq!(groups[0].sd_raw_score, Some(0.0));
        assert_eq!(groups[1].n_students, 2);
        assert_eq!(groups[1].mean_raw_score, Some(3.0));
        assert!((groups[1].sd_raw_score.unwrap() - 2f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn subjective_items_are_summarized() {
        let supp = vec![
            record("s1", "t1", Some(7.0), Some(2.0)),
            record("s2", "t1", Some(9.0), Some(4.0)),
            record("s1", "t0", Some(3.0), Some(2.0)),
        ];
        let items = summarize_subjective_items(&supp);
        assert_eq!(items[0].item_id, "t0");
        assert_eq!(items[1].n_respondents, 2);
        assert_eq!(items[1].mean, Some(8.0));
        assert_eq!(items[1].min, Some(7.0));
        assert_eq!(items[1].item_text.as_deref(), Some("text t1"));

        let rows = student_subjective(&supp, "v1.0");
        let keys: Vec<(&str, &str)> = rows
            .iter()
            .map(|r| (r.student_id.as_str(), r.item_id.as_str()))
            .collect();
        assert_eq!(keys, vec![("s1", "t0"), ("s1", "t1"), ("s2", "t1")]);
    }

    #[test]
    fn matrix_has_one_row_per_student() {
        let records = vec![
            record("s1", "q2", Some(4.0), None),
            record("s1", "q1", Some(2.0), None),
            record("s2", "q2", None, None),
        ];
        let matrix = student_item_matrix(&records);
        assert_eq!(matrix.columns, vec!["student_id", "q1", "q2"]);
        assert_eq!(matrix.len(), 2);
        let csv = matrix.to_csv_string("").unwrap();
        assert_eq!(csv, "student_id,q1,q2\ns1,2,4\ns2,,\n");
    }

    #[test]
    fn level_distribution_counts_students_once() {
        let core = vec![
            record("s1", "q1", Some(1.0), Some(2.0)),
            record("s1", "q2", Some(1.0), Some(2.0)),
            record("s2", "q1", Some(1.0), Some(2.0)),
            record("s3", "q1", Some(1.0), None),
        ];
        let dist = level_distribution(&core);
        assert_eq!(dist.get("2"), Some(&2));
        assert_eq!(dist.get("null"), Some(&1));

        let summary = percentile_summary(&core);
        assert_eq!(summary.count, 2);
        assert_eq!(summary.mean, Some(20.0));
        assert_eq!(summary.sd, Some(0.0));
        assert_eq!(percentile_summary(&[]), PercentileSummary::default());
    }

    #[test]
    fn report_lists_sections_and_warnings() {
        let metadata = SnapshotMetadata {
            version: "v1.0".to_string(),
            snapshot_date: "2026-02-13T14:59:59+00:00".to_string(),
            total_n: 12,
            used_item_ids: vec!["q1".to_string()],
            core_item_ids: vec!["q1".to_string()],
            supplementary_item_ids: Vec::new(),
            subjective_in_core: false,
            survey_slug: "trait_v1".to_string(),
            snapshot_cutoff_at: "2026-02-13T14:59:59+00:00".to_string(),
            round_no: 1,
            fixed_scale_stats: BTreeMap::new(),
            level_distribution: BTreeMap::new(),
            current_math_percentile_summary: PercentileSummary::default(),
            supplementary_item_stats_count: 0,
            supplementary_student_rows: 0,
            logic_version: "v1.0.0".to_string(),
            data_hash: "abc".to_string(),
            scale_map_hash: "def".to_string(),
            warnings: vec!["sample is small".to_string()],
            axis_config: BTreeMap::new(),
            generated_at: Utc::now(),
        };
        let mut diagnostics = crate::diagnostics::Diagnostics::new();
        let (_, validation) = crate::validation::validate(&[], "v1.0", 5, 42, &mut diagnostics);
        let report = build_report(&metadata, &[], &[], &validation);
        assert!(report.starts_with("# Trait Snapshot v1.0"));
        assert!(report.contains("- Students (core): 12"));
        assert!(report.contains("No scales scored."));
        assert!(report.contains("Kruskal-Wallis p n/a"));
        assert!(report.contains("- sample is small"));
    }
}
