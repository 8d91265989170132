//! Per-student scale scores: z against the scale baseline, within-scale
//! percentile and an independently standardized axis score.

use std::collections::{BTreeMap, HashMap};

use crate::models::{PreparedRecord, ScaleStats, StudentScore};
use crate::stats;
use crate::table::{Cell, Tabular};

/// Hazen percentile `100 * (rank - 0.5) / n` with average ranks for ties.
pub fn hazen_percentiles(values: &[f64]) -> Vec<f64> {
    let n = values.len() as f64;
    stats::average_ranks(values)
        .into_iter()
        .map(|rank| 100.0 * (rank - 0.5) / n)
        .collect()
}

fn z_against(value: Option<f64>, baseline: Option<&ScaleStats>) -> Option<f64> {
    let value = value.filter(|v| v.is_finite())?;
    let baseline = baseline?;
    let mean = baseline.mean?;
    let sd = baseline.sd.filter(|sd| sd.is_finite() && *sd > 0.0)?;
    Some((value - mean) / sd)
}

pub fn compute_standard_scores(
    core: &[PreparedRecord],
    scale_stats: &[ScaleStats],
    snapshot_version: &str,
) -> Vec<StudentScore> {
    let baselines: HashMap<&str, &ScaleStats> = scale_stats
        .iter()
        .map(|s| (s.scale_name.as_str(), s))
        .collect();

    let mut groups: BTreeMap<(&str, &str), Vec<&PreparedRecord>> = BTreeMap::new();
    for record in core {
        groups
            .entry((record.student_id.as_str(), record.scale_name.as_str()))
            .or_default()
            .push(record);
    }

    let mut scores: Vec<StudentScore> = groups
        .into_iter()
        .map(|((student_id, scale_name), rows)| {
            let valid = stats::finite(rows.iter().map(|r| r.score_rc));
            let raw_score = stats::mean(&valid);
            let baseline = baselines.get(scale_name).copied();
            let total_item_n = baseline.map_or(0, |b| b.item_count);
            let times = stats::finite(rows.iter().map(|r| r.response_time_sec));

            StudentScore {
                student_id: student_id.to_string(),
                scale_name: scale_name.to_string(),
                raw_score,
                z_score: z_against(raw_score, baseline),
                axis_raw_score: raw_score,
                axis_z_score: None,
                percentile: None,
                answered_item_n: valid.len(),
                total_item_n,
                completion_rate: (total_item_n > 0)
                    .then(|| valid.len() as f64 / total_item_n as f64),
                current_level_grade: rows.iter().find_map(|r| r.current_level_grade),
                current_math_percentile: rows.iter().find_map(|r| r.current_math_percentile),
                response_time_sec_mean: stats::mean(&times),
                snapshot_version: snapshot_version.to_string(),
            }
        })
        .collect();

    let mut by_scale: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, score) in scores.iter().enumerate() {
        by_scale.entry(score.scale_name.clone()).or_default().push(idx);
    }

    for indices in by_scale.values() {
        let ranked: Vec<(usize, f64)> = indices
            .iter()
            .filter_map(|&i| scores[i].raw_score.filter(|v| v.is_finite()).map(|v| (i, v)))
            .collect();
        if !ranked.is_empty() {
            let values: Vec<f64> = ranked.iter().map(|(_, v)| *v).collect();
            for ((i, _), pct) in ranked.iter().zip(hazen_percentiles(&values)) {
                scores[*i].percentile = Some(pct);
            }
        }

        let axis: Vec<(usize, f64)> = indices
            .iter()
            .filter_map(|&i| {
                scores[i]
                    .axis_raw_score
                    .filter(|v| v.is_finite())
                    .map(|v| (i, v))
            })
            .collect();
        if axis.len() <= 1 {
            continue;
        }
        let values: Vec<f64> = axis.iter().map(|(_, v)| *v).collect();
        let (Some(mean), Some(sd)) = (stats::mean(&values), stats::sample_sd(&values)) else {
            continue;
        };
        if !sd.is_finite() || sd <= 0.0 {
            continue;
        }
        for (i, v) in axis {
            scores[i].axis_z_score = Some((v - mean) / sd);
        }
    }

    // groups were keyed (student, scale) so the order is already final
    scores
}

impl Tabular for StudentScore {
    fn columns() -> Vec<&'static str> {
        vec![
            "student_id",
            "scale_name",
            "raw_score",
            "z_score",
            "axis_raw_score",
            "axis_z_score",
            "percentile",
            "answered_item_n",
            "total_item_n",
            "completion_rate",
            "current_level_grade",
            "current_math_percentile",
            "response_time_sec_mean",
            "snapshot_version",
        ]
    }

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::from(&self.student_id),
            Cell::from(&self.scale_name),
            Cell::from(self.raw_score),
            Cell::from(self.z_score),
            Cell::from(self.axis_raw_score),
            Cell::from(self.axis_z_score),
            Cell::from(self.percentile),
            Cell::from(self.answered_item_n),
            Cell::from(self.total_item_n),
            Cell::from(self.completion_rate),
            Cell::from(self.current_level_grade),
            Cell::from(self.current_math_percentile),
            Cell::from(self.response_time_sec_mean),
            Cell::from(&self.snapshot_version),
        ]
    }
}
