//! Per-item and per-scale descriptive statistics with Cronbach's alpha.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::diagnostics::Diagnostics;
use crate::models::{EffectiveMapEntry, ItemStats, PreparedRecord, ScaleStats};
use crate::stats;
use crate::table::{Cell, Tabular};

/// Cronbach's alpha over complete-case rows (one row per respondent, one
/// column per item).
///
/// Undefined with fewer than two items or two rows, and when the variance
/// of the row totals is not positive.
pub fn cronbach_alpha(rows: &[Vec<f64>]) -> Option<f64> {
    let k = rows.first()?.len();
    if k < 2 || rows.len() < 2 || rows.iter().any(|r| r.len() != k) {
        return None;
    }

    let item_variance_sum: f64 = (0..k)
        .map(|j| {
            let column: Vec<f64> = rows.iter().map(|r| r[j]).collect();
            stats::sample_variance(&column)
        })
        .sum::<Option<f64>>()?;
    let totals: Vec<f64> = rows.iter().map(|r| r.iter().sum()).collect();
    let total_variance = stats::sample_variance(&totals)?;
    if !total_variance.is_finite() || total_variance <= 0.0 {
        return None;
    }

    let k = k as f64;
    let alpha = (k / (k - 1.0)) * (1.0 - item_variance_sum / total_variance);
    alpha.is_finite().then_some(alpha)
}

fn first_valid<'a, T: 'a + Clone>(values: impl IntoIterator<Item = &'a Option<T>>) -> Option<T> {
    values.into_iter().find_map(|v| v.clone())
}

/// Weight-normalised mean of the valid scores; missing weights count as 1.
fn weighted_mean(rows: &[&PreparedRecord]) -> Option<f64> {
    let pairs: Vec<(f64, f64)> = rows
        .iter()
        .filter_map(|r| {
            r.score_rc
                .filter(|s| s.is_finite())
                .map(|s| (s, r.weight.unwrap_or(1.0)))
        })
        .collect();
    if pairs.is_empty() {
        return None;
    }
    let weight_sum: f64 = pairs.iter().map(|(_, w)| w).sum();
    if weight_sum.abs() < 1e-8 {
        return None;
    }
    let value = pairs.iter().map(|(s, w)| s * w).sum::<f64>() / weight_sum;
    value.is_finite().then_some(value)
}

fn item_stats(
    scale_name: &str,
    item_id: &str,
    rows: &[&PreparedRecord],
    effective_map: &[EffectiveMapEntry],
) -> ItemStats {
    let scores = stats::finite(rows.iter().map(|r| r.score_rc));
    let times = stats::finite(rows.iter().map(|r| r.response_time_sec));
    let mapping = effective_map
        .iter()
        .find(|e| e.scale_name == scale_name && e.question_id == item_id);

    ItemStats {
        scale_name: scale_name.to_string(),
        item_id: item_id.to_string(),
        item_text: first_valid(rows.iter().map(|r| &r.item_text)),
        trait_name: first_valid(rows.iter().map(|r| &r.trait_name)),
        reverse_item: first_valid(rows.iter().map(|r| &r.reverse_item)),
        min_score: first_valid(rows.iter().map(|r| &r.min_score)),
        max_score: first_valid(rows.iter().map(|r| &r.max_score)),
        weight: first_valid(rows.iter().map(|r| &r.weight)),
        response_n: scores.len(),
        mean: stats::mean(&scores),
        sd: stats::sample_sd(&scores),
        min: stats::min(&scores),
        max: stats::max(&scores),
        response_time_sec_mean: stats::mean(&times),
        include_in_alpha: mapping.map(|e| e.include_in_alpha),
        axis_tag: mapping.and_then(|e| e.axis_tag),
    }
}

pub fn compute_scale_stats(
    core: &[PreparedRecord],
    effective_map: &[EffectiveMapEntry],
    snapshot_version: &str,
    snapshot_date: Option<&str>,
    diagnostics: &mut Diagnostics,
) -> (Vec<ScaleStats>, Vec<ItemStats>) {
    let mut by_item: BTreeMap<(&str, &str), Vec<&PreparedRecord>> = BTreeMap::new();
    for record in core {
        by_item
            .entry((record.scale_name.as_str(), record.item_id.as_str()))
            .or_default()
            .push(record);
    }
    let items: Vec<ItemStats> = by_item
        .iter()
        .map(|((scale, item), rows)| item_stats(scale, item, rows, effective_map))
        .collect();

    let mut items_by_scale: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut alpha_items_by_scale: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for entry in effective_map {
        items_by_scale
            .entry(entry.scale_name.as_str())
            .or_default()
            .insert(entry.question_id.as_str());
        if entry.include_in_alpha {
            alpha_items_by_scale
                .entry(entry.scale_name.as_str())
                .or_default()
                .insert(entry.question_id.as_str());
        }
    }

    let mut scales = Vec::new();
    for (scale_name, item_ids) in &items_by_scale {
        let rows: Vec<&PreparedRecord> = core
            .iter()
            .filter(|r| r.scale_name == *scale_name)
            .collect();
        if rows.is_empty() {
            continue;
        }

        let mut by_student: BTreeMap<&str, Vec<&PreparedRecord>> = BTreeMap::new();
        for row in rows.iter().copied() {
            by_student.entry(row.student_id.as_str()).or_default().push(row);
        }
        let student_means: Vec<f64> = by_student
            .values()
            .filter_map(|rs| stats::mean(&stats::finite(rs.iter().map(|r| r.score_rc))))
            .collect();
        let student_weighted: Vec<f64> = by_student
            .values()
            .filter_map(|rs| weighted_mean(rs))
            .collect();

        let alpha_items: Vec<&str> = alpha_items_by_scale
            .get(scale_name)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        let mut alpha_n_complete = 0;
        let mut alpha = None;
        if alpha_items.len() < 2 {
            diagnostics.warn(format!(
                "[{scale_name}] fewer than 2 include_in_alpha items; Cronbach alpha not computed"
            ));
        } else {
            let complete: Vec<Vec<f64>> = by_student
                .values()
                .filter_map(|rs| {
                    alpha_items
                        .iter()
                        .map(|item| {
                            rs.iter()
                                .rev()
                                .find(|r| r.item_id == *item)
                                .and_then(|r| r.score_rc)
                                .filter(|s| s.is_finite())
                        })
                        .collect::<Option<Vec<f64>>>()
                })
                .collect();
            alpha_n_complete = complete.len();
            alpha = cronbach_alpha(&complete);
            if alpha.is_none() {
                diagnostics.warn(format!(
                    "[{scale_name}] Cronbach alpha could not be computed (complete-case N={alpha_n_complete})"
                ));
            }
        }

        debug!(scale = %scale_name, respondents = student_means.len(), "scale aggregated");
        scales.push(ScaleStats {
            scale_name: scale_name.to_string(),
            item_count: item_ids.len(),
            mean: stats::mean(&student_means),
            sd: stats::sample_sd(&student_means),
            min: stats::min(&student_means),
            max: stats::max(&student_means),
            n_respondents: student_means.len(),
            cronbach_alpha: alpha,
            alpha_n_complete,
            weighted_mean: stats::mean(&student_weighted),
            snapshot_version: snapshot_version.to_string(),
            snapshot_date: snapshot_date.map(String::from),
        });
    }

    (scales, items)
}

pub(crate) fn reverse_flag(value: Option<bool>) -> Cell {
    match value {
        Some(true) => Cell::from("Y"),
        Some(false) => Cell::from("N"),
        None => Cell::Null,
    }
}

impl Tabular for ScaleStats {
    fn columns() -> Vec<&'static str> {
        vec![
            "scale_name",
            "item_count",
            "mean",
            "sd",
            "min",
            "max",
            "n_respondents",
            "cronbach_alpha",
            "alpha_n_complete",
            "weighted_mean",
            "snapshot_version",
            "snapshot_date",
        ]
    }

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::from(&self.scale_name),
            Cell::from(self.item_count),
            Cell::from(self.mean),
            Cell::from(self.sd),
            Cell::from(self.min),
            Cell::from(self.max),
            Cell::from(self.n_respondents),
            Cell::from(self.cronbach_alpha),
            Cell::from(self.alpha_n_complete),
            Cell::from(self.weighted_mean),
            Cell::from(&self.snapshot_version),
            Cell::from(self.snapshot_date.clone()),
        ]
    }
}

impl Tabular for ItemStats {
    fn columns() -> Vec<&'static str> {
        vec![
            "scale_name",
            "item_id",
            "item_text",
            "trait",
            "reverse_item",
            "min_score",
            "max_score",
            "weight",
            "response_n",
            "mean",
            "sd",
            "min",
            "max",
            "response_time_sec_mean",
            "include_in_alpha",
            "axis_tag",
        ]
    }

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::from(&self.scale_name),
            Cell::from(&self.item_id),
            Cell::from(self.item_text.clone()),
            Cell::from(self.trait_name.clone()),
            reverse_flag(self.reverse_item),
            Cell::from(self.min_score),
            Cell::from(self.max_score),
            Cell::from(self.weight),
            Cell::from(self.response_n),
            Cell::from(self.mean),
            Cell::from(self.sd),
            Cell::from(self.min),
            Cell::from(self.max),
            Cell::from(self.response_time_sec_mean),
            Cell::from(self.include_in_alpha.map(i64::from)),
            Cell::from(self.axis_tag.map(|t| t.as_str())),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnalysisGroup, AxisTag, QuestionType};

    fn record(student: &str, item: &str, scale: &str, score: f64) -> PreparedRecord {
        PreparedRecord {
            student_id: student.to_string(),
            item_id: item.to_string(),
            item_text: None,
            trait_name: None,
            question_type: QuestionType::Scale,
            round_label: None,
            round_no: 1,
            response_id: None,
            answered_at: None,
            raw_score: score,
            score_rc: Some(score),
            response_ms: Some(1500.0),
            response_time_sec: Some(1.5),
            reverse_item: Some(false),
            min_score: Some(1.0),
            max_score: Some(5.0),
            weight: None,
            scale_name: scale.to_string(),
            include_in_alpha: true,
            axis_tag: None,
            analysis_group: AnalysisGroup::CoreScale,
            current_level_grade: None,
            current_math_percentile: None,
        }
    }

    fn map_entry(item: &str, scale: &str, alpha: bool) -> EffectiveMapEntry {
        EffectiveMapEntry {
            question_id: item.to_string(),
            scale_name: scale.to_string(),
            include_in_alpha: alpha,
            axis_tag: Some(AxisTag::Efficacy),
        }
    }

    #[test]
    fn alpha_needs_two_items_and_two_rows() {
        assert_eq!(cronbach_alpha(&[]), None);
        assert_eq!(cronbach_alpha(&[vec![1.0], vec![2.0], vec![3.0]]), None);
        assert_eq!(cronbach_alpha(&[vec![1.0, 2.0]]), None);
    }

    #[test]
    fn anti_correlated_items_give_negative_alpha() {
        let alpha = cronbach_alpha(&[vec![1.0, 4.0], vec![2.0, 2.0], vec![3.0, 0.0]]).unwrap();
        assert!((alpha - -8.0).abs() < 1e-12);
    }

    #[test]
    fn constant_totals_leave_alpha_undefined() {
        assert_eq!(cronbach_alpha(&[vec![5.0, 1.0], vec![1.0, 5.0]]), None);
    }

    #[test]
    fn two_students_at_the_extremes() {
        let core = vec![
            record("s1", "q1", "Efficacy", 5.0),
            record("s1", "q2", "Efficacy", 5.0),
            record("s2", "q1", "Efficacy", 1.0),
            record("s2", "q2", "Efficacy", 1.0),
        ];
        let map = vec![
            map_entry("q1", "Efficacy", true),
            map_entry("q2", "Efficacy", true),
        ];
        let mut diagnostics = Diagnostics::new();
        let (scales, items) =
            compute_scale_stats(&core, &map, "v1.0", Some("2026-02-13"), &mut diagnostics);

        assert_eq!(scales.len(), 1);
        let scale = &scales[0];
        assert_eq!(scale.mean, Some(3.0));
        assert!((scale.sd.unwrap() - 8f64.sqrt()).abs() < 1e-12);
        assert_eq!(scale.n_respondents, 2);
        assert_eq!(scale.item_count, 2);
        assert_eq!(scale.alpha_n_complete, 2);
        assert!((scale.cronbach_alpha.unwrap() - 1.0).abs() < 1e-12);
        assert_eq!(scale.weighted_mean, Some(3.0));
        assert!(diagnostics.is_empty());

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].response_n, 2);
        assert_eq!(items[0].mean, Some(3.0));
        assert_eq!(items[0].include_in_alpha, Some(true));
        assert_eq!(items[0].response_time_sec_mean, Some(1.5));
    }

    #[test]
    fn missing_alpha_items_are_warned() {
        let core = vec![
            record("s1", "q1", "Calm", 4.0),
            record("s2", "q1", "Calm", 2.0),
            record("s1", "q2", "Calm", 3.0),
        ];
        let map = vec![map_entry("q1", "Calm", true), map_entry("q2", "Calm", false)];
        let mut diagnostics = Diagnostics::new();
        let (scales, _) = compute_scale_stats(&core, &map, "v1.0", None, &mut diagnostics);
        assert_eq!(scales[0].cronbach_alpha, None);
        assert!(diagnostics.contains("fewer than 2 include_in_alpha"));

        let map = vec![map_entry("q1", "Calm", true), map_entry("q2", "Calm", true)];
        let mut diagnostics = Diagnostics::new();
        let (scales, _) = compute_scale_stats(&core, &map, "v1.0", None, &mut diagnostics);
        assert_eq!(scales[0].alpha_n_complete, 1);
        assert!(diagnostics.contains("complete-case N=1"));
    }

    #[test]
    fn item_sd_edge_cases() {
        let core = vec![record("s1", "q1", "Calm", 4.0)];
        let map = vec![map_entry("q1", "Calm", true)];
        let (scales, items) = compute_scale_stats(&core, &map, "v1.0", None, &mut Diagnostics::new());
        assert_eq!(items[0].sd, Some(0.0));
        assert_eq!(scales[0].sd, Some(0.0));
    }

    #[test]
    fn weights_shift_the_weighted_mean() {
        let mut heavy = record("s1", "q1", "Calm", 5.0);
        heavy.weight = Some(3.0);
        let core = vec![heavy, record("s1", "q2", "Calm", 1.0)];
        let map = vec![map_entry("q1", "Calm", true), map_entry("q2", "Calm", true)];
        let (scales, _) = compute_scale_stats(&core, &map, "v1.0", None, &mut Diagnostics::new());
        assert_eq!(scales[0].mean, Some(3.0));
        assert_eq!(scales[0].weighted_mean, Some(4.0));
    }
}
