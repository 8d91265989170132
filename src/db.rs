use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::export::{self, Answer, ExportRows, Participant, Question};

pub async fn fetch_survey_id(pool: &PgPool, survey_slug: &str) -> anyhow::Result<Uuid> {
    let row = sqlx::query("SELECT id FROM surveys WHERE slug = $1 LIMIT 1")
        .bind(survey_slug)
        .fetch_optional(pool)
        .await?
        .with_context(|| format!("survey_slug={survey_slug} not found"))?;
    Ok(row.get("id"))
}

pub async fn fetch_participants(
    pool: &PgPool,
    survey_id: Uuid,
) -> anyhow::Result<Vec<Participant>> {
    let records = sqlx::query(
        r#"
        SELECT id,
               current_level_grade::float8 AS current_level_grade,
               current_math_percentile::float8 AS current_math_percentile
        FROM survey_participants
        WHERE survey_id = $1
        ORDER BY created_at
        "#,
    )
    .bind(survey_id)
    .fetch_all(pool)
    .await?;

    let mut participants = Vec::new();
    for row in records {
        participants.push(Participant {
            id: row.get("id"),
            current_level_grade: row.get("current_level_grade"),
            current_math_percentile: row.get("current_math_percentile"),
        });
    }

    Ok(participants)
}

pub async fn fetch_questions(pool: &PgPool) -> anyhow::Result<Vec<Question>> {
    let records = sqlx::query(
        r#"
        SELECT id, text, "trait" AS trait_name, tags::text AS tags, type,
               round_label,
               min_score::float8 AS min_score,
               max_score::float8 AS max_score,
               reverse::text AS reverse,
               weight::float8 AS weight
        FROM questions
        ORDER BY created_at
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut questions = Vec::new();
    for row in records {
        questions.push(Question {
            id: row.get("id"),
            text: row.get("text"),
            trait_name: row.get("trait_name"),
            tags: row.get("tags"),
            question_type: row.get("type"),
            round_label: row.get("round_label"),
            min_score: row.get("min_score"),
            max_score: row.get("max_score"),
            reverse: row.get("reverse"),
            weight: row.get("weight"),
        });
    }

    Ok(questions)
}

/// Names of active rounds in display order; unnamed rounds are kept as empty
/// strings so positions stay aligned.
pub async fn fetch_active_rounds(pool: &PgPool) -> anyhow::Result<Vec<String>> {
    let records = sqlx::query(
        "SELECT name FROM trait_rounds WHERE is_active ORDER BY order_index, created_at",
    )
    .fetch_all(pool)
    .await?;

    Ok(records
        .into_iter()
        .map(|row| row.get::<Option<String>, _>("name").unwrap_or_default())
        .collect())
}

/// Answers of the survey's participants, optionally up to `cutoff`
/// (answers without a timestamp are then excluded).
pub async fn fetch_answers(
    pool: &PgPool,
    survey_id: Uuid,
    cutoff: Option<DateTime<Utc>>,
) -> anyhow::Result<Vec<Answer>> {
    let records = sqlx::query(
        r#"
        SELECT a.response_id, r.participant_id, a.question_id,
               a.answer_number::float8 AS answer_number,
               a.answer_text,
               a.response_ms::float8 AS response_ms,
               a.answered_at
        FROM question_answers a
        JOIN question_responses r ON r.id = a.response_id
        JOIN survey_participants p ON p.id = r.participant_id
        WHERE p.survey_id = $1
          AND ($2::timestamptz IS NULL OR a.answered_at <= $2)
        ORDER BY r.participant_id, a.question_id, a.answered_at NULLS FIRST
        "#,
    )
    .bind(survey_id)
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    let mut answers = Vec::new();
    for row in records {
        answers.push(Answer {
            response_id: row.get("response_id"),
            participant_id: row.get("participant_id"),
            question_id: row.get("question_id"),
            answer_number: row.get("answer_number"),
            answer_text: row.get("answer_text"),
            response_ms: row.get("response_ms"),
            answered_at: row.get("answered_at"),
        });
    }

    Ok(answers)
}

pub async fn export_round(
    pool: &PgPool,
    survey_slug: &str,
    cutoff: Option<DateTime<Utc>>,
    round_no: u32,
) -> anyhow::Result<ExportRows> {
    let survey_id = fetch_survey_id(pool, survey_slug).await?;
    let participants = fetch_participants(pool, survey_id).await?;
    if participants.is_empty() {
        anyhow::bail!("survey {survey_slug} has no participants");
    }
    let questions = fetch_questions(pool).await?;
    let rounds = fetch_active_rounds(pool).await?;
    let answers = fetch_answers(pool, survey_id, cutoff).await?;
    if answers.is_empty() {
        anyhow::bail!("survey {survey_slug} has no answers");
    }
    info!(
        participants = participants.len(),
        questions = questions.len(),
        answers = answers.len(),
        "survey tables fetched"
    );

    export::build_export(&participants, &questions, &rounds, &answers, round_no)
        .context("failed to build export rows")
}
