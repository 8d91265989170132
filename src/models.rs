use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::SnapshotError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    Scale,
    Text,
}

impl QuestionType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scale" => Some(Self::Scale),
            "text" => Some(Self::Text),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scale => "scale",
            Self::Text => "text",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisGroup {
    CoreScale,
    SupplementaryNumeric,
}

impl AnalysisGroup {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CoreScale => "core_scale",
            Self::SupplementaryNumeric => "supplementary_numeric",
        }
    }
}

impl FromStr for AnalysisGroup {
    type Err = SnapshotError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "" | "core_scale" => Ok(Self::CoreScale),
            "supplementary_numeric" => Ok(Self::SupplementaryNumeric),
            other => Err(SnapshotError::Domain(format!(
                "analysis_group must be core_scale or supplementary_numeric, got {other:?}"
            ))),
        }
    }
}

/// Canonical typology axes. Every accepted `axis_tag` spelling resolves to
/// exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    BeliefPos,
    BeliefNeg,
    EmotionPos,
    EmotionNeg,
}

impl Axis {
    /// Scores on negative axes are sign-flipped before averaging.
    pub fn is_negative(self) -> bool {
        matches!(self, Axis::BeliefNeg | Axis::EmotionNeg)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Axis::BeliefPos => "belief_pos",
            Axis::BeliefNeg => "belief_neg",
            Axis::EmotionPos => "emotion_pos",
            Axis::EmotionNeg => "emotion_neg",
        }
    }
}

/// Closed set of `axis_tag` spellings accepted in scale_map.csv.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisTag {
    BeliefPos,
    Efficacy,
    GrowthMindset,
    Belief,
    BeliefNeg,
    ExternalAttribution,
    ExternalAttributionBelief,
    EmotionPos,
    EmotionalStability,
    Interest,
    EmotionNeg,
    Anxiety,
    EmotionReactivity,
}

impl AxisTag {
    pub const ALL: [AxisTag; 13] = [
        AxisTag::BeliefPos,
        AxisTag::Efficacy,
        AxisTag::GrowthMindset,
        AxisTag::Belief,
        AxisTag::BeliefNeg,
        AxisTag::ExternalAttribution,
        AxisTag::ExternalAttributionBelief,
        AxisTag::EmotionPos,
        AxisTag::EmotionalStability,
        AxisTag::Interest,
        AxisTag::EmotionNeg,
        AxisTag::Anxiety,
        AxisTag::EmotionReactivity,
    ];

    pub fn axis(self) -> Axis {
        match self {
            AxisTag::BeliefPos | AxisTag::Efficacy | AxisTag::GrowthMindset | AxisTag::Belief => {
                Axis::BeliefPos
            }
            AxisTag::BeliefNeg
            | AxisTag::ExternalAttribution
            | AxisTag::ExternalAttributionBelief => Axis::BeliefNeg,
            AxisTag::EmotionPos | AxisTag::EmotionalStability | AxisTag::Interest => {
                Axis::EmotionPos
            }
            AxisTag::EmotionNeg | AxisTag::Anxiety | AxisTag::EmotionReactivity => {
                Axis::EmotionNeg
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AxisTag::BeliefPos => "belief_pos",
            AxisTag::Efficacy => "efficacy",
            AxisTag::GrowthMindset => "growth_mindset",
            AxisTag::Belief => "belief",
            AxisTag::BeliefNeg => "belief_neg",
            AxisTag::ExternalAttribution => "external_attribution",
            AxisTag::ExternalAttributionBelief => "external_attribution_belief",
            AxisTag::EmotionPos => "emotion_pos",
            AxisTag::EmotionalStability => "emotional_stability",
            AxisTag::Interest => "interest",
            AxisTag::EmotionNeg => "emotion_neg",
            AxisTag::Anxiety => "anxiety",
            AxisTag::EmotionReactivity => "emotion_reactivity",
        }
    }
}

impl FromStr for AxisTag {
    type Err = SnapshotError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        AxisTag::ALL
            .iter()
            .copied()
            .find(|tag| tag.as_str() == normalized)
            .ok_or_else(|| {
                SnapshotError::Domain(format!("unknown axis_tag {value:?}"))
            })
    }
}

impl fmt::Display for AxisTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Axis tag -> sorted, de-duplicated scale names (core scales only).
pub type AxisConfig = BTreeMap<AxisTag, Vec<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum TypeCode {
    #[serde(rename = "TYPE_A")]
    TypeA,
    #[serde(rename = "TYPE_B")]
    TypeB,
    #[serde(rename = "TYPE_C")]
    TypeC,
    #[serde(rename = "TYPE_D")]
    TypeD,
    #[serde(rename = "UNCLASSIFIED")]
    Unclassified,
}

impl TypeCode {
    pub const CLASSIFIED: [TypeCode; 4] = [
        TypeCode::TypeA,
        TypeCode::TypeB,
        TypeCode::TypeC,
        TypeCode::TypeD,
    ];

    /// Quadrant of a point; zero counts as non-negative.
    pub fn from_axes(axis_x: Option<f64>, axis_y: Option<f64>) -> Self {
        match (axis_x, axis_y) {
            (Some(x), Some(y)) if x.is_finite() && y.is_finite() => match (x >= 0.0, y >= 0.0) {
                (true, true) => TypeCode::TypeA,
                (false, true) => TypeCode::TypeB,
                (false, false) => TypeCode::TypeC,
                (true, false) => TypeCode::TypeD,
            },
            _ => TypeCode::Unclassified,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TypeCode::TypeA => "TYPE_A",
            TypeCode::TypeB => "TYPE_B",
            TypeCode::TypeC => "TYPE_C",
            TypeCode::TypeD => "TYPE_D",
            TypeCode::Unclassified => "UNCLASSIFIED",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TypeCode::TypeA => "TYPE_A (x>=0, y>=0)",
            TypeCode::TypeB => "TYPE_B (x<0, y>=0)",
            TypeCode::TypeC => "TYPE_C (x<0, y<0)",
            TypeCode::TypeD => "TYPE_D (x>=0, y<0)",
            TypeCode::Unclassified => "UNCLASSIFIED (missing axis value)",
        }
    }

    pub fn is_classified(self) -> bool {
        self != TypeCode::Unclassified
    }
}

impl fmt::Display for TypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of raw_answers.csv after column normalisation. Numeric columns
/// that fail to parse are `None`.
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    pub student_id: String,
    pub item_id: String,
    pub question_type: String,
    pub round_no: Option<f64>,
    pub raw_score: Option<f64>,
    pub response_ms: Option<f64>,
    pub answered_at: Option<DateTime<Utc>>,
    pub reverse_item: Option<String>,
    pub min_score: Option<f64>,
    pub max_score: Option<f64>,
    pub weight: Option<f64>,
    pub current_level_grade: Option<f64>,
    pub current_math_percentile: Option<f64>,
    pub response_id: Option<String>,
    pub item_text: Option<String>,
    pub trait_name: Option<String>,
    pub round_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScaleMapEntry {
    pub question_id: String,
    pub scale_name: String,
    pub include_in_alpha: bool,
    pub axis_tag: Option<AxisTag>,
    pub analysis_group: AnalysisGroup,
}

/// Mapping actually used for core scoring, one row per core item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct EffectiveMapEntry {
    pub question_id: String,
    pub scale_name: String,
    pub include_in_alpha: bool,
    pub axis_tag: Option<AxisTag>,
}

#[derive(Debug, Clone)]
pub struct PreparedRecord {
    pub student_id: String,
    pub item_id: String,
    pub item_text: Option<String>,
    pub trait_name: Option<String>,
    pub question_type: QuestionType,
    pub round_label: Option<String>,
    pub round_no: u32,
    pub response_id: Option<String>,
    pub answered_at: Option<DateTime<Utc>>,
    pub raw_score: f64,
    pub score_rc: Option<f64>,
    pub response_ms: Option<f64>,
    pub response_time_sec: Option<f64>,
    pub reverse_item: Option<bool>,
    pub min_score: Option<f64>,
    pub max_score: Option<f64>,
    pub weight: Option<f64>,
    pub scale_name: String,
    pub include_in_alpha: bool,
    pub axis_tag: Option<AxisTag>,
    pub analysis_group: AnalysisGroup,
    pub current_level_grade: Option<f64>,
    pub current_math_percentile: Option<f64>,
}

impl PreparedRecord {
    pub fn is_core(&self) -> bool {
        self.analysis_group == AnalysisGroup::CoreScale
    }
}

/// Reverse-coded score: `min + max - raw` for reverse-keyed scale items.
pub fn reverse_code(
    question_type: QuestionType,
    reverse_item: Option<bool>,
    raw_score: f64,
    min_score: Option<f64>,
    max_score: Option<f64>,
) -> Option<f64> {
    if question_type == QuestionType::Scale && reverse_item == Some(true) {
        match (min_score, max_score) {
            (Some(min), Some(max)) => Some(min + max - raw_score),
            _ => None,
        }
    } else {
        Some(raw_score)
    }
}

#[derive(Debug, Clone)]
pub struct ItemStats {
    pub scale_name: String,
    pub item_id: String,
    pub item_text: Option<String>,
    pub trait_name: Option<String>,
    pub reverse_item: Option<bool>,
    pub min_score: Option<f64>,
    pub max_score: Option<f64>,
    pub weight: Option<f64>,
    pub response_n: usize,
    pub mean: Option<f64>,
    pub sd: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub response_time_sec_mean: Option<f64>,
    pub include_in_alpha: Option<bool>,
    pub axis_tag: Option<AxisTag>,
}

#[derive(Debug, Clone)]
pub struct ScaleStats {
    pub scale_name: String,
    pub item_count: usize,
    pub mean: Option<f64>,
    pub sd: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub n_respondents: usize,
    pub cronbach_alpha: Option<f64>,
    pub alpha_n_complete: usize,
    pub weighted_mean: Option<f64>,
    pub snapshot_version: String,
    pub snapshot_date: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StudentScore {
    pub student_id: String,
    pub scale_name: String,
    pub raw_score: Option<f64>,
    pub z_score: Option<f64>,
    pub axis_raw_score: Option<f64>,
    pub axis_z_score: Option<f64>,
    pub percentile: Option<f64>,
    pub answered_item_n: usize,
    pub total_item_n: usize,
    pub completion_rate: Option<f64>,
    pub current_level_grade: Option<f64>,
    pub current_math_percentile: Option<f64>,
    pub response_time_sec_mean: Option<f64>,
    pub snapshot_version: String,
}

#[derive(Debug, Clone)]
pub struct StudentType {
    pub student_id: String,
    pub axis_x: Option<f64>,
    pub axis_y: Option<f64>,
    pub type_code: TypeCode,
    pub x_belief_pos_z: Option<f64>,
    pub x_belief_neg_z: Option<f64>,
    pub y_source: &'static str,
    pub y_emotion_pos_z: Option<f64>,
    pub y_emotion_neg_z: Option<f64>,
    pub current_level_grade: Option<f64>,
    pub current_math_percentile: Option<f64>,
    pub snapshot_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_coding_sums_to_bounds() {
        let rc = reverse_code(QuestionType::Scale, Some(true), 2.0, Some(1.0), Some(5.0));
        assert_eq!(rc, Some(4.0));
        assert_eq!(rc.unwrap() + 2.0, 1.0 + 5.0);
    }

    #[test]
    fn reverse_coding_is_identity_without_flag() {
        let once = reverse_code(QuestionType::Scale, Some(false), 2.0, Some(1.0), Some(5.0));
        let twice =
            reverse_code(QuestionType::Scale, Some(false), once.unwrap(), Some(1.0), Some(5.0));
        assert_eq!(once, Some(2.0));
        assert_eq!(twice, once);
    }

    #[test]
    fn text_items_are_never_reverse_coded() {
        let rc = reverse_code(QuestionType::Text, Some(true), 7.0, Some(1.0), Some(10.0));
        assert_eq!(rc, Some(7.0));
    }

    #[test]
    fn quadrant_ties_go_to_non_negative_side() {
        assert_eq!(TypeCode::from_axes(Some(0.0), Some(0.0)), TypeCode::TypeA);
        assert_eq!(TypeCode::from_axes(Some(-0.1), Some(0.0)), TypeCode::TypeB);
        assert_eq!(TypeCode::from_axes(Some(-0.1), Some(-0.1)), TypeCode::TypeC);
        assert_eq!(TypeCode::from_axes(Some(0.0), Some(-0.1)), TypeCode::TypeD);
        assert_eq!(TypeCode::from_axes(None, Some(1.0)), TypeCode::Unclassified);
        assert_eq!(TypeCode::from_axes(Some(1.0), None), TypeCode::Unclassified);
    }

    #[test]
    fn axis_tags_parse_from_closed_set() {
        assert_eq!(" Anxiety ".parse::<AxisTag>().unwrap(), AxisTag::Anxiety);
        assert_eq!(AxisTag::Efficacy.axis(), Axis::BeliefPos);
        assert_eq!(AxisTag::EmotionReactivity.axis(), Axis::EmotionNeg);
        assert!("optimism".parse::<AxisTag>().is_err());
        assert_eq!(
            AxisTag::ALL.iter().filter(|t| t.axis() == Axis::BeliefNeg).count(),
            3
        );
    }
}
