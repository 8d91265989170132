//! Two-axis typology: a belief axis and an emotion axis per student, and the
//! quadrant they fall in.

use std::collections::{BTreeMap, BTreeSet};

use crate::models::{Axis, AxisConfig, StudentScore, StudentType, TypeCode};
use crate::stats;
use crate::table::{Cell, Tabular};

/// Scales whose tag resolves to `axis`.
pub fn scales_for_axis(axis_config: &AxisConfig, axis: Axis) -> BTreeSet<String> {
    axis_config
        .iter()
        .filter(|(tag, _)| tag.axis() == axis)
        .flat_map(|(_, scales)| scales.iter().cloned())
        .collect()
}

/// Skip-missing mean; `None` when nothing is present.
fn mean_present(values: &[Option<f64>]) -> Option<f64> {
    stats::mean(&stats::finite(values.iter().copied()))
}

/// Per-student axis value: the mean over the axis's scales of each scale's
/// standardized score, negated on negative axes.
fn axis_values(
    scores: &[StudentScore],
    axis_config: &AxisConfig,
    axis: Axis,
) -> BTreeMap<String, f64> {
    let scales = scales_for_axis(axis_config, axis);
    let sign = if axis.is_negative() { -1.0 } else { 1.0 };

    let mut per_student: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for score in scores.iter().filter(|s| scales.contains(&s.scale_name)) {
        let value = score
            .axis_z_score
            .or(score.z_score)
            .filter(|v| v.is_finite());
        if let Some(value) = value {
            per_student
                .entry(score.student_id.clone())
                .or_default()
                .push(value * sign);
        }
    }
    per_student
        .into_iter()
        .filter_map(|(student, values)| stats::mean(&values).map(|m| (student, m)))
        .collect()
}

fn y_source(pos: Option<f64>, neg: Option<f64>) -> &'static str {
    match (pos.is_some(), neg.is_some()) {
        (true, true) => "emotion_pos+emotion_neg",
        (true, false) => "emotion_pos",
        (false, true) => "emotion_neg",
        (false, false) => "missing",
    }
}

pub fn classify_type(
    student_scores: &[StudentScore],
    axis_config: &AxisConfig,
    snapshot_version: &str,
) -> Vec<StudentType> {
    let belief_pos = axis_values(student_scores, axis_config, Axis::BeliefPos);
    let belief_neg = axis_values(student_scores, axis_config, Axis::BeliefNeg);
    let emotion_pos = axis_values(student_scores, axis_config, Axis::EmotionPos);
    let emotion_neg = axis_values(student_scores, axis_config, Axis::EmotionNeg);

    let mut meta: BTreeMap<&str, (Option<f64>, Option<f64>)> = BTreeMap::new();
    for score in student_scores {
        let entry = meta.entry(score.student_id.as_str()).or_insert((None, None));
        entry.0 = entry.0.or(score.current_level_grade);
        entry.1 = entry.1.or(score.current_math_percentile);
    }

    meta.into_iter()
        .filter(|(student_id, _)| !student_id.is_empty())
        .map(|(student_id, (grade, percentile))| {
            let x_pos = belief_pos.get(student_id).copied();
            let x_neg = belief_neg.get(student_id).copied();
            let y_pos = emotion_pos.get(student_id).copied();
            let y_neg = emotion_neg.get(student_id).copied();
            let axis_x = mean_present(&[x_pos, x_neg]);
            let axis_y = mean_present(&[y_pos, y_neg]);

            StudentType {
                student_id: student_id.to_string(),
                axis_x,
                axis_y,
                type_code: TypeCode::from_axes(axis_x, axis_y),
                x_belief_pos_z: x_pos,
                x_belief_neg_z: x_neg,
                y_source: y_source(y_pos, y_neg),
                y_emotion_pos_z: y_pos,
                y_emotion_neg_z: y_neg,
                current_level_grade: grade,
                current_math_percentile: percentile,
                snapshot_version: snapshot_version.to_string(),
            }
        })
        .collect()
}

impl Tabular for StudentType {
    fn columns() -> Vec<&'static str> {
        vec![
            "student_id",
            "axis_x",
            "axis_y",
            "type_code",
            "type_label",
            "x_belief_pos_z",
            "x_belief_neg_z",
            "y_source",
            "y_value_z",
            "y_emotion_pos_z",
            "y_emotion_neg_z",
            "current_level_grade",
            "current_math_percentile",
            "snapshot_version",
        ]
    }

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::from(&self.student_id),
            Cell::from(self.axis_x),
            Cell::from(self.axis_y),
            Cell::from(self.type_code.as_str()),
            Cell::from(self.type_code.label()),
            Cell::from(self.x_belief_pos_z),
            Cell::from(self.x_belief_neg_z),
            Cell::from(self.y_source),
            Cell::from(self.axis_y),
            Cell::from(self.y_emotion_pos_z),
            Cell::from(self.y_emotion_neg_z),
            Cell::from(self.current_level_grade),
            Cell::from(self.current_math_percentile),
            Cell::from(&self.snapshot_version),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AxisTag;

    fn score(student: &str, scale: &str, z: Option<f64>, axis_z: Option<f64>) -> StudentScore {
        StudentScore {
            student_id: student.to_string(),
            scale_name: scale.to_string(),
            raw_score: Some(3.0),
            z_score: z,
            axis_raw_score: Some(3.0),
            axis_z_score: axis_z,
            percentile: None,
            answered_item_n: 1,
            total_item_n: 1,
            completion_rate: Some(1.0),
            current_level_grade: None,
            current_math_percentile: None,
            response_time_sec_mean: None,
            snapshot_version: "v1.0".to_string(),
        }
    }

    fn config() -> AxisConfig {
        let mut config = AxisConfig::new();
        config.insert(AxisTag::Efficacy, vec!["Efficacy".to_string()]);
        config.insert(AxisTag::GrowthMindset, vec!["Growth".to_string()]);
        config.insert(AxisTag::ExternalAttribution, vec!["Luck".to_string()]);
        config.insert(AxisTag::EmotionalStability, vec!["Calm".to_string()]);
        config.insert(AxisTag::Anxiety, vec!["Anxiety".to_string()]);
        config
    }

    #[test]
    fn aliases_resolve_to_their_axis() {
        let scales = scales_for_axis(&config(), Axis::BeliefPos);
        assert_eq!(
            scales.into_iter().collect::<Vec<_>>(),
            vec!["Efficacy".to_string(), "Growth".to_string()]
        );
        assert!(scales_for_axis(&AxisConfig::new(), Axis::EmotionNeg).is_empty());
    }

    #[test]
    fn axes_average_oriented_scale_scores() {
        let scores = vec![
            score("s1", "Efficacy", Some(1.0), Some(1.0)),
            score("s1", "Growth", Some(0.0), Some(0.5)),
            score("s1", "Luck", Some(0.5), Some(0.5)),
            score("s1", "Calm", Some(-1.0), Some(-1.0)),
            score("s1", "Anxiety", Some(1.0), None),
        ];
        let types = classify_type(&scores, &config(), "v1.0");
        let s1 = &types[0];
        assert_eq!(s1.x_belief_pos_z, Some(0.75));
        assert_eq!(s1.x_belief_neg_z, Some(-0.5));
        assert_eq!(s1.axis_x, Some(0.125));
        // anxiety falls back to z_score and is negated
        assert_eq!(s1.y_emotion_neg_z, Some(-1.0));
        assert_eq!(s1.axis_y, Some(-1.0));
        assert_eq!(s1.y_source, "emotion_pos+emotion_neg");
        assert_eq!(s1.type_code, TypeCode::TypeD);
    }

    #[test]
    fn one_scale_per_axis_is_enough() {
        let mut config = AxisConfig::new();
        config.insert(AxisTag::Efficacy, vec!["Efficacy".to_string()]);
        config.insert(AxisTag::EmotionalStability, vec!["Calm".to_string()]);
        let scores = vec![
            score("s1", "Efficacy", Some(-0.4), Some(-0.4)),
            score("s1", "Calm", Some(0.7), Some(0.7)),
        ];
        let types = classify_type(&scores, &config, "v1.0");
        assert_eq!(types[0].axis_x, Some(-0.4));
        assert_eq!(types[0].axis_y, Some(0.7));
        assert_eq!(types[0].y_source, "emotion_pos");
        assert_eq!(types[0].type_code, TypeCode::TypeB);
    }

    #[test]
    fn missing_axis_is_unclassified() {
        let mut first = score("s1", "Efficacy", Some(0.2), Some(0.2));
        first.current_level_grade = Some(3.0);
        let mut second = score("s2", "Calm", Some(0.2), Some(0.2));
        second.current_math_percentile = Some(42.0);
        let types = classify_type(&[first, second], &config(), "v1.0");
        assert_eq!(types.len(), 2);
        assert_eq!(types[0].type_code, TypeCode::Unclassified);
        assert_eq!(types[0].y_source, "missing");
        assert_eq!(types[0].current_level_grade, Some(3.0));
        assert_eq!(types[1].type_code, TypeCode::Unclassified);
        assert_eq!(types[1].current_math_percentile, Some(42.0));
    }
}
