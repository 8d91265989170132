//! Turning survey tables into raw_answers.csv and scale_map.csv.
//!
//! The database side lives in `db`; everything here is a pure function of
//! the fetched rows so the mapping rules can be tested without Postgres.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Result, SnapshotError};
use crate::models::{AnalysisGroup, AxisTag, QuestionType};
use crate::prepare::adopted_scale_name;

const DEFAULT_MIN_SCORE: f64 = 1.0;
const DEFAULT_MAX_SCORE: f64 = 10.0;
const DEFAULT_WEIGHT: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct Participant {
    pub id: Uuid,
    pub current_level_grade: Option<f64>,
    pub current_math_percentile: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct Question {
    pub id: Uuid,
    pub text: Option<String>,
    pub trait_name: Option<String>,
    /// Raw tag column as text: comma separated, a Postgres array literal or
    /// a JSON array.
    pub tags: Option<String>,
    pub question_type: Option<String>,
    pub round_label: Option<String>,
    pub min_score: Option<f64>,
    pub max_score: Option<f64>,
    pub reverse: Option<String>,
    pub weight: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Answer {
    pub response_id: Uuid,
    pub participant_id: Uuid,
    pub question_id: Uuid,
    pub answer_number: Option<f64>,
    pub answer_text: Option<String>,
    pub response_ms: Option<f64>,
    pub answered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawAnswerExport {
    pub student_id: String,
    pub item_id: String,
    pub question_type: &'static str,
    pub round_no: u32,
    pub raw_score: f64,
    pub response_ms: Option<f64>,
    pub answered_at: Option<String>,
    pub reverse_item: String,
    pub min_score: f64,
    pub max_score: f64,
    pub weight: f64,
    pub current_level_grade: Option<f64>,
    pub current_math_percentile: Option<f64>,
    pub response_id: String,
    pub item_text: String,
    #[serde(rename = "trait")]
    pub trait_name: String,
    pub round_label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScaleMapExport {
    pub question_id: String,
    pub scale_name: String,
    pub include_in_alpha: u8,
    pub axis_tag: String,
    pub analysis_group: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct ExportRows {
    pub raw_answers: Vec<RawAnswerExport>,
    pub scale_map: Vec<ScaleMapExport>,
}

/// Round number of a question: position in the active round order, else
/// the first integer in the label, else 1. Unnamed rounds keep their slot
/// but never match.
pub fn resolve_round_no(round_label: &str, active_rounds: &[String]) -> u32 {
    let label = round_label.trim();
    if let Some(pos) = active_rounds
        .iter()
        .map(|name| name.trim())
        .position(|name| !name.is_empty() && name == label)
    {
        return u32::try_from(pos + 1).unwrap_or(u32::MAX);
    }
    let digits: String = label
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(1)
}

/// Numeric answer, or for text questions an answer made only of digits.
pub fn to_raw_score(
    question_type: QuestionType,
    answer_number: Option<f64>,
    answer_text: Option<&str>,
) -> Option<f64> {
    if let Some(n) = answer_number.filter(|n| n.is_finite()) {
        return Some(n);
    }
    if question_type != QuestionType::Text {
        return None;
    }
    let text = answer_text?.trim();
    if !text.is_empty() && text.chars().all(|c| c.is_ascii_digit()) {
        text.parse().ok()
    } else {
        None
    }
}

pub fn parse_tags(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    raw.trim()
        .trim_start_matches(['{', '['])
        .trim_end_matches(['}', ']'])
        .split(',')
        .map(|tag| tag.trim().trim_matches('"').trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect()
}

fn normalize_key(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .collect()
}

// Checked in order; the first table with a hit wins.
const BELIEF_NEG_KEYWORDS: &[&str] = &[
    "외적귀인",
    "외부귀인",
    "귀인",
    "운",
    "난이도",
    "환경",
    "externalattribution",
    "luck",
    "environment",
];
const BELIEF_POS_KEYWORDS: &[&str] = &[
    "growth",
    "mindset",
    "성장신념",
    "능력관",
    "efficacy",
    "효능",
    "자기효능",
    "통제",
    "주도",
    "노력성과",
    "회복기대",
    "실패해석",
    "자기개념",
    "정체성",
    "질문",
    "이해",
];
const EMOTION_NEG_KEYWORDS: &[&str] = &[
    "anxiety",
    "불안",
    "긴장",
    "위협",
    "스트레스",
    "반응성",
    "fear",
    "threat",
    "reactiv",
];
const EMOTION_POS_KEYWORDS: &[&str] = &[
    "정서안정",
    "안정성",
    "흥미",
    "몰입",
    "재미",
    "enjoy",
    "stability",
    "interest",
];

/// Axis tag guessed from a question's tags, trait and text.
pub fn infer_axis_tag(question: &Question) -> Option<AxisTag> {
    let mut candidates = parse_tags(question.tags.as_deref());
    candidates.extend(question.trait_name.clone());
    candidates.extend(question.text.clone());
    let keys: Vec<String> = candidates
        .iter()
        .map(|c| normalize_key(c))
        .filter(|k| !k.is_empty())
        .collect();

    let hit = |keywords: &[&str]| keys.iter().any(|k| keywords.iter().any(|w| k.contains(w)));
    [
        (BELIEF_NEG_KEYWORDS, AxisTag::BeliefNeg),
        (BELIEF_POS_KEYWORDS, AxisTag::BeliefPos),
        (EMOTION_NEG_KEYWORDS, AxisTag::EmotionNeg),
        (EMOTION_POS_KEYWORDS, AxisTag::EmotionPos),
    ]
    .into_iter()
    .find(|(keywords, _)| hit(*keywords))
    .map(|(_, tag)| tag)
}

fn reverse_flag(value: Option<&str>) -> String {
    match value.map(|v| v.trim().to_uppercase()).as_deref() {
        Some("Y" | "TRUE" | "T" | "1") => "Y".to_string(),
        Some("N" | "FALSE" | "F" | "0") | Some("") | None => "N".to_string(),
        Some(other) => other.to_string(),
    }
}

fn question_type(question: &Question) -> Option<QuestionType> {
    QuestionType::parse(&question.question_type.as_deref()?.trim().to_lowercase())
}

fn short_id(id: &Uuid) -> String {
    id.simple().to_string().chars().take(8).collect()
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Ensure some core row carries belief_pos, and emotion_neg when no core row
/// has an emotion tag, overwriting core rows in turn.
pub fn backfill_axis_tags(scale_map: &mut [ScaleMapExport]) {
    let core: Vec<usize> = scale_map
        .iter()
        .enumerate()
        .filter(|(_, row)| row.analysis_group == AnalysisGroup::CoreScale.as_str())
        .map(|(idx, _)| idx)
        .collect();
    if core.is_empty() {
        return;
    }
    let mut present: BTreeSet<String> =
        core.iter().map(|&i| scale_map[i].axis_tag.clone()).collect();

    let mut required = vec![AxisTag::BeliefPos];
    let has_emotion = present.contains(AxisTag::EmotionNeg.as_str())
        || present.contains(AxisTag::EmotionPos.as_str());
    if !has_emotion {
        required.push(AxisTag::EmotionNeg);
    }

    let mut cursor = 0;
    for tag in required {
        if present.contains(tag.as_str()) {
            continue;
        }
        let idx = core[cursor % core.len()];
        scale_map[idx].axis_tag = tag.as_str().to_string();
        present.insert(tag.as_str().to_string());
        cursor += 1;
    }
}

/// Rows of `round_no` from the fetched tables.
pub fn build_export(
    participants: &[Participant],
    questions: &[Question],
    active_rounds: &[String],
    answers: &[Answer],
    round_no: u32,
) -> Result<ExportRows> {
    let participants: HashMap<Uuid, &Participant> =
        participants.iter().map(|p| (p.id, p)).collect();
    let questions: HashMap<Uuid, &Question> = questions.iter().map(|q| (q.id, q)).collect();

    let mut raw_answers = Vec::new();
    let mut used: BTreeSet<(String, Uuid)> = BTreeSet::new();
    for answer in answers {
        let (Some(participant), Some(question)) = (
            participants.get(&answer.participant_id),
            questions.get(&answer.question_id),
        ) else {
            continue;
        };
        let Some(question_type) = question_type(question) else {
            continue;
        };
        let Some(raw_score) = to_raw_score(
            question_type,
            answer.answer_number,
            answer.answer_text.as_deref(),
        ) else {
            continue;
        };
        let round_label = non_empty(&question.round_label).unwrap_or_default();
        if resolve_round_no(round_label, active_rounds) != round_no {
            continue;
        }

        used.insert((question.id.to_string(), question.id));
        raw_answers.push(RawAnswerExport {
            student_id: participant.id.to_string(),
            item_id: question.id.to_string(),
            question_type: question_type.as_str(),
            round_no,
            raw_score,
            response_ms: answer.response_ms,
            answered_at: answer
                .answered_at
                .map(|ts| ts.to_rfc3339_opts(SecondsFormat::AutoSi, false)),
            reverse_item: reverse_flag(question.reverse.as_deref()),
            min_score: question.min_score.unwrap_or(DEFAULT_MIN_SCORE),
            max_score: question.max_score.unwrap_or(DEFAULT_MAX_SCORE),
            weight: question.weight.unwrap_or(DEFAULT_WEIGHT),
            current_level_grade: participant.current_level_grade,
            current_math_percentile: participant.current_math_percentile,
            response_id: answer.response_id.to_string(),
            item_text: non_empty(&question.text).unwrap_or_default().to_string(),
            trait_name: non_empty(&question.trait_name).unwrap_or_default().to_string(),
            round_label: round_label.to_string(),
        });
    }

    if raw_answers.is_empty() {
        return Err(SnapshotError::EmptyDataset(format!(
            "no answers exported for round_no={round_no}"
        )));
    }

    let mut scale_map: Vec<ScaleMapExport> = used
        .iter()
        .filter_map(|(question_id, id)| {
            let question = questions.get(id)?;
            Some(match question_type(question)? {
                QuestionType::Text => ScaleMapExport {
                    question_id: question_id.clone(),
                    scale_name: adopted_scale_name(question_id, question.text.as_deref()),
                    include_in_alpha: 0,
                    axis_tag: String::new(),
                    analysis_group: AnalysisGroup::SupplementaryNumeric.as_str(),
                },
                QuestionType::Scale => ScaleMapExport {
                    question_id: question_id.clone(),
                    scale_name: non_empty(&question.trait_name)
                        .map(String::from)
                        .unwrap_or_else(|| format!("scale_{}", short_id(id))),
                    include_in_alpha: 1,
                    axis_tag: infer_axis_tag(question)
                        .map(|t| t.as_str().to_string())
                        .unwrap_or_default(),
                    analysis_group: AnalysisGroup::CoreScale.as_str(),
                },
            })
        })
        .collect();
    backfill_axis_tags(&mut scale_map);

    Ok(ExportRows {
        raw_answers,
        scale_map,
    })
}

fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = BufWriter::new(File::create(path)?);
    file.write_all(b"\xEF\xBB\xBF")?;
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(file);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write raw_answers.csv and scale_map.csv into `out_dir`.
pub fn write_export(out_dir: &Path, rows: &ExportRows) -> Result<()> {
    write_rows(&out_dir.join("raw_answers.csv"), &rows.raw_answers)?;
    write_rows(&out_dir.join("scale_map.csv"), &rows.scale_map)?;
    Ok(())
}
