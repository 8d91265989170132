//! Does the typology relate to current ability?
//!
//! Students with a usable level grade are compared across type codes with a
//! Kruskal-Wallis omnibus test, Holm-corrected pairwise Mann-Whitney tests,
//! nested ordered-logit models (main effects vs. main effects plus
//! interaction) and a k-fold check of the interaction model's predictions.
//! Sub-analyses without enough data are skipped with a warning.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, info};

use crate::diagnostics::Diagnostics;
use crate::models::{StudentType, TypeCode};
use crate::stats::crossval::{self, FoldStrategy};
use crate::stats::nonparametric::{cliffs_delta, holm_adjust, kruskal_wallis, mann_whitney_u};
use crate::stats::ordinal::{fit_ordered_logit, OrdinalFit};
use crate::stats::{self, dist::chi2_sf};
use crate::table::{Cell, Table, Tabular};

pub const GRADE_LEVELS: usize = 7;
const SIGNIFICANCE: f64 = 0.05;
const BASE_FEATURES: [&str; 2] = ["emotion_z", "belief_z"];
const FULL_FEATURES: [&str; 3] = ["emotion_z", "belief_z", "interaction"];
const BASE_MODEL: &str = "ordinal_logit_base";
const FULL_MODEL: &str = "ordinal_logit_interaction";

/// Percentile to level grade (0 best, 6 lowest); `None` outside 0..=100.
pub fn percentile_to_level_grade(percentile: f64) -> Option<f64> {
    if !percentile.is_finite() || !(0.0..=100.0).contains(&percentile) {
        return None;
    }
    let grade = match percentile {
        p if p <= 1.0 => 0.0,
        p if p <= 4.0 => 1.0,
        p if p <= 11.0 => 2.0,
        p if p <= 23.0 => 3.0,
        p if p <= 40.0 => 4.0,
        p if p <= 60.0 => 5.0,
        _ => 6.0,
    };
    Some(grade)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelGradeSource {
    CurrentLevelGrade,
    CurrentMathPercentile,
    Missing,
}

impl LevelGradeSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CurrentLevelGrade => "current_level_grade",
            Self::CurrentMathPercentile => "current_math_percentile",
            Self::Missing => "missing",
        }
    }
}

/// Explicit grade first, then the percentile table.
pub fn derive_level_grade(
    grade: Option<f64>,
    percentile: Option<f64>,
) -> (Option<f64>, LevelGradeSource) {
    if let Some(g) = grade.filter(|g| g.is_finite()) {
        return (Some(g), LevelGradeSource::CurrentLevelGrade);
    }
    match percentile.and_then(percentile_to_level_grade) {
        Some(g) => (Some(g), LevelGradeSource::CurrentMathPercentile),
        None => (None, LevelGradeSource::Missing),
    }
}

/// A student that entered validation.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelRow {
    pub student_id: String,
    pub type_code: TypeCode,
    pub axis_x: Option<f64>,
    pub axis_y: Option<f64>,
    pub level_grade: i64,
    pub level_grade_source: LevelGradeSource,
    pub state_index: Option<f64>,
}

impl LevelRow {
    fn axes(&self) -> Option<(f64, f64)> {
        Some((self.axis_x?, self.axis_y?))
    }

    pub fn is_high_state(&self) -> bool {
        self.axes().is_some_and(|(x, y)| x >= 0.0 && y >= 0.0)
    }

    pub fn is_low_state(&self) -> bool {
        self.axes().is_some_and(|(x, y)| x < 0.0 && y < 0.0)
    }

    pub fn is_high_ability(&self) -> bool {
        self.level_grade <= 2
    }

    pub fn is_low_ability(&self) -> bool {
        self.level_grade >= 4
    }
}

/// Students with an id and a level grade in 0..=6, in input order.
pub fn build_level_base(student_types: &[StudentType]) -> Vec<LevelRow> {
    student_types
        .iter()
        .filter(|t| !t.student_id.trim().is_empty())
        .filter_map(|t| {
            let (grade, source) =
                derive_level_grade(t.current_level_grade, t.current_math_percentile);
            let grade = grade.filter(|g| (0.0..=6.0).contains(g))?;
            let axis_x = t.axis_x.filter(|v| v.is_finite());
            let axis_y = t.axis_y.filter(|v| v.is_finite());
            Some(LevelRow {
                student_id: t.student_id.trim().to_string(),
                type_code: t.type_code,
                axis_x,
                axis_y,
                level_grade: grade.round() as i64,
                level_grade_source: source,
                state_index: stats::mean(&stats::finite([axis_y, axis_x])),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeLevelStat {
    pub type_code: TypeCode,
    pub n_students: usize,
    pub mean_level_grade: Option<f64>,
    pub variance_level_grade: Option<f64>,
    pub median_level_grade: Option<f64>,
    pub iqr_level_grade: Option<f64>,
    pub mean_emotion_z: Option<f64>,
    pub mean_belief_z: Option<f64>,
    pub mean_state_index: Option<f64>,
    pub grade_counts: [usize; GRADE_LEVELS],
    pub snapshot_version: String,
}

impl Tabular for TypeLevelStat {
    fn columns() -> Vec<&'static str> {
        vec![
            "type_code",
            "n_students",
            "mean_level_grade",
            "variance_level_grade",
            "median_level_grade",
            "iqr_level_grade",
            "mean_emotion_z",
            "mean_belief_z",
            "mean_state_index",
            "grade_0_n",
            "grade_1_n",
            "grade_2_n",
            "grade_3_n",
            "grade_4_n",
            "grade_5_n",
            "grade_6_n",
            "snapshot_version",
        ]
    }

    fn cells(&self) -> Vec<Cell> {
        let mut cells = vec![
            Cell::from(self.type_code.as_str()),
            Cell::from(self.n_students),
            Cell::from(self.mean_level_grade),
            Cell::from(self.variance_level_grade),
            Cell::from(self.median_level_grade),
            Cell::from(self.iqr_level_grade),
            Cell::from(self.mean_emotion_z),
            Cell::from(self.mean_belief_z),
            Cell::from(self.mean_state_index),
        ];
        cells.extend(self.grade_counts.iter().map(|n| Cell::from(*n)));
        cells.push(Cell::from(&self.snapshot_version));
        cells
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupDifferenceTest {
    pub test: &'static str,
    pub comparison: String,
    pub group_count: usize,
    pub n_total: usize,
    pub n_group_a: Option<usize>,
    pub n_group_b: Option<usize>,
    pub statistic: f64,
    pub p_value: f64,
    pub p_adjusted_holm: Option<f64>,
    pub effect_size: Option<f64>,
    pub effect_size_name: &'static str,
    pub median_diff_a_minus_b: Option<f64>,
    pub method: Option<&'static str>,
    pub snapshot_version: String,
}

impl Tabular for GroupDifferenceTest {
    fn columns() -> Vec<&'static str> {
        vec![
            "test",
            "comparison",
            "group_count",
            "n_total",
            "n_group_a",
            "n_group_b",
            "statistic",
            "p_value",
            "p_adjusted_holm",
            "effect_size",
            "effect_size_name",
            "median_diff_a_minus_b",
            "method",
            "snapshot_version",
        ]
    }

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::from(self.test),
            Cell::from(&self.comparison),
            Cell::from(self.group_count),
            Cell::from(self.n_total),
            self.n_group_a.map_or(Cell::Null, Cell::from),
            self.n_group_b.map_or(Cell::Null, Cell::from),
            Cell::from(self.statistic),
            Cell::from(self.p_value),
            Cell::from(self.p_adjusted_holm),
            Cell::from(self.effect_size),
            Cell::from(self.effect_size_name),
            Cell::from(self.median_diff_a_minus_b),
            Cell::from(self.method),
            Cell::from(&self.snapshot_version),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegressionRow {
    pub model: &'static str,
    pub parameter: String,
    pub is_coefficient: bool,
    pub coef: f64,
    pub std_error: Option<f64>,
    pub ci_low: Option<f64>,
    pub ci_high: Option<f64>,
    pub p_value: Option<f64>,
    pub snapshot_version: String,
}

impl RegressionRow {
    /// Odds ratios are reported for coefficients only, never thresholds.
    pub fn odds_ratio(&self) -> Option<f64> {
        self.is_coefficient.then(|| self.coef.exp())
    }

    pub fn is_significant(&self) -> bool {
        self.p_value.is_some_and(|p| p.is_finite() && p < SIGNIFICANCE)
    }
}

impl Tabular for RegressionRow {
    fn columns() -> Vec<&'static str> {
        vec![
            "model",
            "parameter",
            "parameter_type",
            "coef",
            "std_error",
            "odds_ratio",
            "ci_low",
            "ci_high",
            "p_value",
            "is_significant_05",
            "snapshot_version",
        ]
    }

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::from(self.model),
            Cell::from(&self.parameter),
            Cell::from(if self.is_coefficient {
                "coefficient"
            } else {
                "threshold"
            }),
            Cell::from(self.coef),
            Cell::from(self.std_error),
            Cell::from(self.odds_ratio()),
            Cell::from(self.ci_low),
            Cell::from(self.ci_high),
            Cell::from(self.p_value),
            Cell::from(self.is_significant()),
            Cell::from(&self.snapshot_version),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InteractionRow {
    pub model: &'static str,
    pub n_students: usize,
    pub log_likelihood: Option<f64>,
    pub aic: Option<f64>,
    pub bic: Option<f64>,
    pub pseudo_r2_mcfadden: Option<f64>,
    pub lr_statistic: Option<f64>,
    pub df_diff: Option<usize>,
    pub p_value: Option<f64>,
    pub snapshot_version: String,
}

impl InteractionRow {
    fn for_model(model: &'static str, fit: &OrdinalFit, snapshot_version: &str) -> Self {
        Self {
            model,
            n_students: fit.n_obs,
            log_likelihood: Some(fit.log_likelihood),
            aic: Some(fit.aic()),
            bic: Some(fit.bic()),
            pseudo_r2_mcfadden: fit.pseudo_r2(),
            lr_statistic: None,
            df_diff: None,
            p_value: None,
            snapshot_version: snapshot_version.to_string(),
        }
    }
}

impl Tabular for InteractionRow {
    fn columns() -> Vec<&'static str> {
        vec![
            "model",
            "n_students",
            "log_likelihood",
            "aic",
            "bic",
            "pseudo_r2_mcfadden",
            "lr_statistic",
            "df_diff",
            "p_value",
            "snapshot_version",
        ]
    }

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::from(self.model),
            Cell::from(self.n_students),
            Cell::from(self.log_likelihood),
            Cell::from(self.aic),
            Cell::from(self.bic),
            Cell::from(self.pseudo_r2_mcfadden),
            Cell::from(self.lr_statistic),
            self.df_diff.map_or(Cell::Null, Cell::from),
            Cell::from(self.p_value),
            Cell::from(&self.snapshot_version),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MismatchRow {
    pub pattern: &'static str,
    pub n_students: usize,
    pub ratio: f64,
    pub mean_level_grade: Option<f64>,
    pub median_level_grade: Option<f64>,
    pub mean_emotion_z: Option<f64>,
    pub mean_belief_z: Option<f64>,
    pub type_mix_top3: String,
    pub snapshot_version: String,
}

impl Tabular for MismatchRow {
    fn columns() -> Vec<&'static str> {
        vec![
            "pattern",
            "n_students",
            "ratio",
            "mean_level_grade",
            "median_level_grade",
            "mean_emotion_z",
            "mean_belief_z",
            "type_mix_top3",
            "snapshot_version",
        ]
    }

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::from(self.pattern),
            Cell::from(self.n_students),
            Cell::from(self.ratio),
            Cell::from(self.mean_level_grade),
            Cell::from(self.median_level_grade),
            Cell::from(self.mean_emotion_z),
            Cell::from(self.mean_belief_z),
            Cell::from(&self.type_mix_top3),
            Cell::from(&self.snapshot_version),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrossValidationRow {
    /// Fold number, or `mean` for the summary row.
    pub fold: String,
    pub n_train: usize,
    pub n_test: usize,
    pub mae: f64,
    pub qwk: Option<f64>,
    pub within_one_rate: f64,
}

impl Tabular for CrossValidationRow {
    fn columns() -> Vec<&'static str> {
        vec!["fold", "n_train", "n_test", "mae", "qwk", "within_one_rate"]
    }

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::from(&self.fold),
            Cell::from(self.n_train),
            Cell::from(self.n_test),
            Cell::from(self.mae),
            Cell::from(self.qwk),
            Cell::from(self.within_one_rate),
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationSheets {
    pub type_level_stats: Vec<TypeLevelStat>,
    pub group_difference_tests: Vec<GroupDifferenceTest>,
    pub ordinal_regression: Vec<RegressionRow>,
    pub interaction_test: Vec<InteractionRow>,
    pub mismatch_patterns: Vec<MismatchRow>,
    pub cross_validation: Vec<CrossValidationRow>,
}

impl ValidationSheets {
    /// Sheets in workbook order.
    pub fn tables(&self) -> Vec<(&'static str, Table)> {
        vec![
            ("Type_Level_Stats", Table::from_rows(&self.type_level_stats)),
            (
                "Group_Difference_Tests",
                Table::from_rows(&self.group_difference_tests),
            ),
            ("Ordinal_Regression", Table::from_rows(&self.ordinal_regression)),
            ("Interaction_Test", Table::from_rows(&self.interaction_test)),
            ("Mismatch_Patterns", Table::from_rows(&self.mismatch_patterns)),
            ("Cross_Validation", Table::from_rows(&self.cross_validation)),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Interpretation {
    pub type_explains_current_ability: String,
    pub type_suggests_growth_potential: String,
    pub type_as_independent_state: String,
}

impl Default for Interpretation {
    fn default() -> Self {
        Self {
            type_explains_current_ability: "Not enough data for validation.".to_string(),
            type_suggests_growth_potential:
                "Growth potential cannot be established from a single cross-section."
                    .to_string(),
            type_as_independent_state: "More evidence is needed.".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationSummary {
    pub snapshot_version: String,
    pub status: &'static str,
    pub n_students_total: usize,
    pub n_students_with_level: usize,
    pub n_students_with_type: usize,
    pub kruskal_p_value: Option<f64>,
    pub kruskal_epsilon2: Option<f64>,
    pub interaction_p_value: Option<f64>,
    pub cv_strategy: Option<&'static str>,
    pub cv_mae_mean: Option<f64>,
    pub cv_qwk_mean: Option<f64>,
    pub spearman_emotion_vs_grade: Option<f64>,
    pub spearman_belief_vs_grade: Option<f64>,
    pub level_grade_sources: BTreeMap<&'static str, usize>,
    pub type_counts: BTreeMap<&'static str, usize>,
    pub interpretation: Interpretation,
}

impl ValidationSummary {
    fn empty(snapshot_version: &str, n_students_total: usize) -> Self {
        Self {
            snapshot_version: snapshot_version.to_string(),
            status: "no_data",
            n_students_total,
            n_students_with_level: 0,
            n_students_with_type: 0,
            kruskal_p_value: None,
            kruskal_epsilon2: None,
            interaction_p_value: None,
            cv_strategy: None,
            cv_mae_mean: None,
            cv_qwk_mean: None,
            spearman_emotion_vs_grade: None,
            spearman_belief_vs_grade: None,
            level_grade_sources: BTreeMap::new(),
            type_counts: BTreeMap::new(),
            interpretation: Interpretation::default(),
        }
    }
}

/// Reading of the omnibus result for the summary.
pub fn interpret_type_effect(p_value: Option<f64>, epsilon2: Option<f64>) -> &'static str {
    let Some(p) = p_value.filter(|p| p.is_finite()) else {
        return "Not enough data to test type differences in current ability.";
    };
    if p >= SIGNIFICANCE {
        return "No explanatory relationship: type does not significantly explain current ability.";
    }
    match epsilon2.filter(|e| e.is_finite()) {
        Some(e) if e >= 0.14 => "Type shows a large association with current ability.",
        Some(e) if e >= 0.06 => "Type shows a medium association with current ability.",
        _ => "Type differences in current ability are significant but small.",
    }
}

pub fn validate(
    student_types: &[StudentType],
    snapshot_version: &str,
    cv_splits: usize,
    random_state: u64,
    diagnostics: &mut Diagnostics,
) -> (ValidationSheets, ValidationSummary) {
    let mut sheets = ValidationSheets::default();
    let n_students_total = student_types
        .iter()
        .map(|t| t.student_id.as_str())
        .collect::<BTreeSet<_>>()
        .len();
    let mut summary = ValidationSummary::empty(snapshot_version, n_students_total);

    if student_types.is_empty() {
        diagnostics.warn("Student_Type is empty; skipped type-level validation");
        return (sheets, summary);
    }

    let base = build_level_base(student_types);
    if base.is_empty() {
        diagnostics.warn(
            "no valid current_level_grade/current_math_percentile; skipped type-level validation",
        );
        return (sheets, summary);
    }
    let classified: Vec<LevelRow> = base
        .iter()
        .filter(|r| r.type_code.is_classified())
        .cloned()
        .collect();
    summary.n_students_with_level = base.len();
    for row in &base {
        *summary
            .level_grade_sources
            .entry(row.level_grade_source.as_str())
            .or_insert(0) += 1;
    }
    summary.n_students_with_type = classified.len();
    if classified.is_empty() {
        diagnostics.warn("no student has a classified type_code; skipped type-level validation");
        return (sheets, summary);
    }

    sheets.type_level_stats = type_level_stats(&classified, snapshot_version);
    group_difference_tests(&classified, snapshot_version, &mut sheets, &mut summary, diagnostics);

    let complete: Vec<&LevelRow> = classified.iter().filter(|r| r.axes().is_some()).collect();
    let distinct_grades = complete
        .iter()
        .map(|r| r.level_grade)
        .collect::<BTreeSet<_>>()
        .len();
    if distinct_grades >= 2 {
        ordinal_models(
            &complete,
            snapshot_version,
            cv_splits,
            random_state,
            &mut sheets,
            &mut summary,
            diagnostics,
        );
    } else {
        diagnostics.warn(
            "level_grade has fewer than 2 distinct values; skipped regression and cross-validation",
        );
    }

    sheets.mismatch_patterns = mismatch_patterns(&complete, snapshot_version);

    if !complete.is_empty() {
        let grades: Vec<f64> = complete.iter().map(|r| r.level_grade as f64).collect();
        let emotion: Vec<f64> = complete.iter().filter_map(|r| r.axis_y).collect();
        let belief: Vec<f64> = complete.iter().filter_map(|r| r.axis_x).collect();
        summary.spearman_emotion_vs_grade = stats::spearman(&emotion, &grades);
        summary.spearman_belief_vs_grade = stats::spearman(&belief, &grades);
    }

    summary.status = "ok";
    summary.type_counts = TypeCode::CLASSIFIED
        .iter()
        .map(|code| {
            let n = classified.iter().filter(|r| r.type_code == *code).count();
            (code.as_str(), n)
        })
        .collect();
    summary.interpretation = Interpretation {
        type_explains_current_ability: interpret_type_effect(
            summary.kruskal_p_value,
            summary.kruskal_epsilon2,
        )
        .to_string(),
        type_suggests_growth_potential: "This analysis is cross-sectional; growth potential needs follow-up rounds to verify.".to_string(),
        type_as_independent_state: "Even where type relates to ability it should not be read as a cause; observe it as an independent emotion and belief state.".to_string(),
    };

    info!(
        with_level = summary.n_students_with_level,
        with_type = summary.n_students_with_type,
        kruskal_p = ?summary.kruskal_p_value,
        "type-level validation finished"
    );
    (sheets, summary)
}

fn grades_of(rows: &[LevelRow], code: TypeCode) -> Vec<f64> {
    rows.iter()
        .filter(|r| r.type_code == code)
        .map(|r| r.level_grade as f64)
        .collect()
}

fn type_level_stats(classified: &[LevelRow], snapshot_version: &str) -> Vec<TypeLevelStat> {
    TypeCode::CLASSIFIED
        .iter()
        .filter_map(|&code| {
            let rows: Vec<&LevelRow> = classified.iter().filter(|r| r.type_code == code).collect();
            if rows.is_empty() {
                return None;
            }
            let grades: Vec<f64> = rows.iter().map(|r| r.level_grade as f64).collect();
            let mut grade_counts = [0usize; GRADE_LEVELS];
            for row in &rows {
                if let Some(slot) = usize::try_from(row.level_grade)
                    .ok()
                    .and_then(|g| grade_counts.get_mut(g))
                {
                    *slot += 1;
                }
            }
            Some(TypeLevelStat {
                type_code: code,
                n_students: rows.len(),
                mean_level_grade: stats::mean(&grades),
                variance_level_grade: stats::sample_variance(&grades),
                median_level_grade: stats::median(&grades),
                iqr_level_grade: stats::iqr(&grades),
                mean_emotion_z: stats::mean(&stats::finite(rows.iter().map(|r| r.axis_y))),
                mean_belief_z: stats::mean(&stats::finite(rows.iter().map(|r| r.axis_x))),
                mean_state_index: stats::mean(&stats::finite(rows.iter().map(|r| r.state_index))),
                grade_counts,
                snapshot_version: snapshot_version.to_string(),
            })
        })
        .collect()
}

fn group_difference_tests(
    classified: &[LevelRow],
    snapshot_version: &str,
    sheets: &mut ValidationSheets,
    summary: &mut ValidationSummary,
    diagnostics: &mut Diagnostics,
) {
    let grouped: Vec<(TypeCode, Vec<f64>)> = TypeCode::CLASSIFIED
        .iter()
        .map(|&code| (code, grades_of(classified, code)))
        .collect();
    let non_empty: Vec<&[f64]> = grouped
        .iter()
        .filter(|(_, g)| !g.is_empty())
        .map(|(_, g)| g.as_slice())
        .collect();

    let mut rows = Vec::new();
    match (non_empty.len() >= 2)
        .then(|| kruskal_wallis(&non_empty))
        .flatten()
    {
        Some(kw) => {
            let epsilon2 = kw.epsilon_squared();
            summary.kruskal_p_value = Some(kw.p_value);
            summary.kruskal_epsilon2 = epsilon2;
            rows.push(GroupDifferenceTest {
                test: "kruskal_wallis",
                comparison: "all_types".to_string(),
                group_count: kw.group_count,
                n_total: kw.n_total,
                n_group_a: None,
                n_group_b: None,
                statistic: kw.h,
                p_value: kw.p_value,
                p_adjusted_holm: None,
                effect_size: epsilon2,
                effect_size_name: "epsilon_squared",
                median_diff_a_minus_b: None,
                method: None,
                snapshot_version: snapshot_version.to_string(),
            });
        }
        None if non_empty.len() < 2 => diagnostics
            .warn("fewer than 2 type groups with a level grade; Kruskal-Wallis not computed"),
        None => diagnostics.warn("every level grade is tied; Kruskal-Wallis not computed"),
    }

    let mut pairs = Vec::new();
    for (i, (code_a, group_a)) in grouped.iter().enumerate() {
        for (code_b, group_b) in grouped.iter().skip(i + 1) {
            let Some(test) = mann_whitney_u(group_a, group_b) else {
                continue;
            };
            pairs.push(GroupDifferenceTest {
                test: "mann_whitney_u",
                comparison: format!("{code_a}_vs_{code_b}"),
                group_count: 2,
                n_total: group_a.len() + group_b.len(),
                n_group_a: Some(group_a.len()),
                n_group_b: Some(group_b.len()),
                statistic: test.u,
                p_value: test.p_value,
                p_adjusted_holm: None,
                effect_size: cliffs_delta(group_a, group_b),
                effect_size_name: "cliffs_delta",
                median_diff_a_minus_b: stats::median(group_a)
                    .zip(stats::median(group_b))
                    .map(|(a, b)| a - b),
                method: Some(test.method.as_str()),
                snapshot_version: snapshot_version.to_string(),
            });
        }
    }
    let raw: Vec<Option<f64>> = pairs.iter().map(|p| Some(p.p_value)).collect();
    for (pair, adjusted) in pairs.iter_mut().zip(holm_adjust(&raw)) {
        pair.p_adjusted_holm = adjusted;
    }
    debug!(pairwise = pairs.len(), "group difference tests computed");
    rows.extend(pairs);
    sheets.group_difference_tests = rows;
}

fn design(rows: &[&LevelRow], with_interaction: bool) -> Vec<Vec<f64>> {
    rows.iter()
        .filter_map(|r| r.axes())
        .map(|(belief, emotion)| {
            let mut features = vec![emotion, belief];
            if with_interaction {
                features.push(emotion * belief);
            }
            features
        })
        .collect()
}

fn regression_rows(
    model: &'static str,
    fit: &OrdinalFit,
    snapshot_version: &str,
) -> Vec<RegressionRow> {
    fit.estimates()
        .into_iter()
        .map(|e| RegressionRow {
            model,
            parameter: e.name,
            is_coefficient: e.is_coefficient,
            coef: e.coef,
            std_error: e.std_error,
            ci_low: e.ci_low,
            ci_high: e.ci_high,
            p_value: e.p_value,
            snapshot_version: snapshot_version.to_string(),
        })
        .collect()
}

fn ordinal_models(
    rows: &[&LevelRow],
    snapshot_version: &str,
    cv_splits: usize,
    random_state: u64,
    sheets: &mut ValidationSheets,
    summary: &mut ValidationSummary,
    diagnostics: &mut Diagnostics,
) {
    let y: Vec<i64> = rows.iter().map(|r| r.level_grade).collect();
    let x_base = design(rows, false);
    let x_full = design(rows, true);

    let fits = fit_ordered_logit(&x_base, &y, &BASE_FEATURES)
        .and_then(|base| Ok((base, fit_ordered_logit(&x_full, &y, &FULL_FEATURES)?)));
    let (base, full) = match fits {
        Ok(fits) => fits,
        Err(err) => {
            diagnostics.warn(format!("ordinal regression fit failed: {err}"));
            return;
        }
    };

    debug!(
        base_iterations = base.iterations,
        full_iterations = full.iterations,
        "ordinal models converged"
    );

    let mut regression = regression_rows(BASE_MODEL, &base, snapshot_version);
    regression.extend(regression_rows(FULL_MODEL, &full, snapshot_version));
    sheets.ordinal_regression = regression;

    let lr_statistic = 2.0 * (full.log_likelihood - base.log_likelihood);
    let df_diff = full.n_params().saturating_sub(base.n_params());
    let lr_p = (df_diff > 0).then(|| chi2_sf(lr_statistic, df_diff as f64));
    summary.interaction_p_value = lr_p;
    sheets.interaction_test = vec![
        InteractionRow::for_model(BASE_MODEL, &base, snapshot_version),
        InteractionRow::for_model(FULL_MODEL, &full, snapshot_version),
        InteractionRow {
            model: "likelihood_ratio_test",
            n_students: rows.len(),
            log_likelihood: None,
            aic: None,
            bic: None,
            pseudo_r2_mcfadden: None,
            lr_statistic: Some(lr_statistic),
            df_diff: Some(df_diff),
            p_value: lr_p,
            snapshot_version: snapshot_version.to_string(),
        },
    ];

    cross_validate(&x_full, &y, cv_splits, random_state, sheets, summary, diagnostics);
}

fn cross_validate(
    x: &[Vec<f64>],
    y: &[i64],
    cv_splits: usize,
    random_state: u64,
    sheets: &mut ValidationSheets,
    summary: &mut ValidationSummary,
    diagnostics: &mut Diagnostics,
) {
    let n_splits = crossval::effective_splits(cv_splits, y.len());
    let strategy = crossval::choose_fold_strategy(y, n_splits);
    if strategy == FoldStrategy::Plain {
        diagnostics.warn(
            "too few members per grade for stratified folds; used plain k-fold, expect higher variance",
        );
    }
    summary.cv_strategy = Some(strategy.as_str());

    let mut rows = Vec::new();
    for (fold_no, fold) in crossval::make_folds(strategy, y, n_splits, random_state)
        .into_iter()
        .enumerate()
        .map(|(i, f)| (i + 1, f))
    {
        let pick_x = |idx: &[usize]| idx.iter().map(|&i| x[i].clone()).collect::<Vec<_>>();
        let pick_y = |idx: &[usize]| idx.iter().map(|&i| y[i]).collect::<Vec<_>>();
        let (x_train, y_train) = (pick_x(&fold.train), pick_y(&fold.train));
        let (x_test, y_test) = (pick_x(&fold.test), pick_y(&fold.test));

        let train_classes = y_train
            .iter()
            .collect::<BTreeSet<_>>()
            .len();
        if train_classes < 2 {
            diagnostics.warn(format!(
                "fold={fold_no} training data has a single class; skipped"
            ));
            continue;
        }
        let fit = match fit_ordered_logit(&x_train, &y_train, &FULL_FEATURES) {
            Ok(fit) => fit,
            Err(err) => {
                diagnostics.warn(format!("cross-validation fold={fold_no} fit failed: {err}"));
                continue;
            }
        };
        let predicted = fit.predict(&x_test);
        let (Some(mae), Some(within_one_rate)) = (
            crossval::mean_absolute_error(&y_test, &predicted),
            crossval::within_one_rate(&y_test, &predicted),
        ) else {
            continue;
        };
        rows.push(CrossValidationRow {
            fold: fold_no.to_string(),
            n_train: y_train.len(),
            n_test: y_test.len(),
            mae,
            qwk: crossval::quadratic_weighted_kappa(&y_test, &predicted),
            within_one_rate,
        });
    }

    if rows.is_empty() {
        diagnostics.warn("cross-validation produced no folds; no performance summary");
        return;
    }

    let count = rows.len();
    let mean_of =
        |f: fn(&CrossValidationRow) -> f64| rows.iter().map(f).sum::<f64>() / count as f64;
    let mae = mean_of(|r| r.mae);
    let within_one_rate = mean_of(|r| r.within_one_rate);
    let qwk = stats::mean(&stats::finite(rows.iter().map(|r| r.qwk)));
    let mean_row = CrossValidationRow {
        fold: "mean".to_string(),
        n_train: rows.iter().map(|r| r.n_train).sum::<usize>() / count,
        n_test: rows.iter().map(|r| r.n_test).sum::<usize>() / count,
        mae,
        qwk,
        within_one_rate,
    };
    summary.cv_mae_mean = Some(mae);
    summary.cv_qwk_mean = qwk;
    rows.push(mean_row);
    sheets.cross_validation = rows;
}

fn pattern_of(row: &LevelRow) -> &'static str {
    if row.is_high_ability() && row.is_low_state() {
        "high_ability_low_state"
    } else if row.is_low_ability() && row.is_high_state() {
        "low_ability_high_state"
    } else {
        "aligned_or_other"
    }
}

/// Top three type codes by share, e.g. `TYPE_A:50%, TYPE_C:30%`.
fn type_mix_top3(rows: &[&LevelRow]) -> String {
    let mut counts: BTreeMap<TypeCode, usize> = BTreeMap::new();
    for row in rows {
        *counts.entry(row.type_code).or_insert(0) += 1;
    }
    let mut ranked: Vec<(TypeCode, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked
        .iter()
        .take(3)
        .map(|(code, n)| {
            let share = *n as f64 / rows.len() as f64 * 100.0;
            format!("{code}:{share:.0}%")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn mismatch_patterns(rows: &[&LevelRow], snapshot_version: &str) -> Vec<MismatchRow> {
    let mut by_pattern: BTreeMap<&'static str, Vec<&LevelRow>> = BTreeMap::new();
    for row in rows.iter().copied().filter(|r| r.axes().is_some()) {
        by_pattern.entry(pattern_of(row)).or_default().push(row);
    }
    let total: usize = by_pattern.values().map(Vec::len).sum();

    by_pattern
        .into_iter()
        .map(|(pattern, group)| {
            let grades: Vec<f64> = group.iter().map(|r| r.level_grade as f64).collect();
            MismatchRow {
                pattern,
                n_students: group.len(),
                ratio: group.len() as f64 / total as f64,
                mean_level_grade: stats::mean(&grades),
                median_level_grade: stats::median(&grades),
                mean_emotion_z: stats::mean(&stats::finite(group.iter().map(|r| r.axis_y))),
                mean_belief_z: stats::mean(&stats::finite(group.iter().map(|r| r.axis_x))),
                type_mix_top3: type_mix_top3(&group),
                snapshot_version: snapshot_version.to_string(),
            }
        })
        .collect()
}
