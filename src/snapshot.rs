//! One snapshot run: load, prepare, score, classify, validate, write.
//!
//! Every fatal check happens before the first artifact is written, so a
//! failed run leaves the output directory as it was.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::Utc;
use tracing::info;

use crate::config::SnapshotConfig;
use crate::diagnostics::Diagnostics;
use crate::error::{Result, SnapshotError};
use crate::input;
use crate::models::{PreparedRecord, ScaleMapEntry};
use crate::output;
use crate::prepare::prepare_with_policy;
use crate::report::{self, SnapshotMetadata};
use crate::scale_stats::{compute_scale_stats, reverse_flag};
use crate::standardize::compute_standard_scores;
use crate::table::{Cell, Table, Tabular};
use crate::typology::classify_type;
use crate::validation::validate;

const SMALL_SAMPLE: usize = 30;

/// What `run` reports back to the CLI.
#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    pub out_dir: PathBuf,
    pub total_n: usize,
    pub scale_count: usize,
    pub student_score_rows: usize,
    pub supplementary_items: usize,
    pub warning_count: usize,
    pub written: Vec<PathBuf>,
}

struct FrozenInputRow<'a>(&'a PreparedRecord);

impl Tabular for FrozenInputRow<'_> {
    fn columns() -> Vec<&'static str> {
        vec![
            "student_id",
            "item_id",
            "question_type",
            "scale_name",
            "axis_tag",
            "analysis_group",
            "raw_score",
            "score_rc",
            "response_ms",
            "response_time_sec",
            "reverse_item",
            "min_score",
            "max_score",
            "weight",
            "current_level_grade",
            "current_math_percentile",
            "answered_at",
        ]
    }

    fn cells(&self) -> Vec<Cell> {
        let r = self.0;
        vec![
            Cell::from(&r.student_id),
            Cell::from(&r.item_id),
            Cell::from(r.question_type.as_str()),
            Cell::from(&r.scale_name),
            Cell::from(r.axis_tag.map(|t| t.as_str())),
            Cell::from(r.analysis_group.as_str()),
            Cell::from(r.raw_score),
            Cell::from(r.score_rc),
            Cell::from(r.response_ms),
            Cell::from(r.response_time_sec),
            reverse_flag(r.reverse_item),
            Cell::from(r.min_score),
            Cell::from(r.max_score),
            Cell::from(r.weight),
            Cell::from(r.current_level_grade),
            Cell::from(r.current_math_percentile),
            Cell::from(r.answered_at),
        ]
    }
}

impl Tabular for ScaleMapEntry {
    fn columns() -> Vec<&'static str> {
        vec![
            "question_id",
            "scale_name",
            "include_in_alpha",
            "axis_tag",
            "analysis_group",
        ]
    }

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::from(&self.question_id),
            Cell::from(&self.scale_name),
            Cell::from(i64::from(self.include_in_alpha)),
            Cell::from(self.axis_tag.map(|t| t.as_str())),
            Cell::from(self.analysis_group.as_str()),
        ]
    }
}

/// Frozen input in (student, item, answered_at) order.
pub fn frozen_input_table(records: &[PreparedRecord]) -> Table {
    let mut sorted: Vec<&PreparedRecord> = records.iter().collect();
    sorted.sort_by(|a, b| {
        (&a.student_id, &a.item_id, a.answered_at).cmp(&(&b.student_id, &b.item_id, b.answered_at))
    });
    let rows: Vec<FrozenInputRow> = sorted.into_iter().map(FrozenInputRow).collect();
    Table::from_rows(&rows)
}

pub fn scale_map_table(scale_map: &[ScaleMapEntry]) -> Table {
    let mut sorted = scale_map.to_vec();
    sorted.sort_by(|a, b| a.question_id.cmp(&b.question_id));
    Table::from_rows(&sorted)
}

fn item_ids(records: &[PreparedRecord]) -> Vec<String> {
    records
        .iter()
        .map(|r| r.item_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn run(config: &SnapshotConfig) -> Result<SnapshotOutcome> {
    config.validate()?;
    let round_no = config.round()?;
    let cutoff = config.cutoff_iso()?;
    let version = config.snapshot_version.as_str();

    let out_dir = output::ensure_output_dir(&config.out)?;
    output::enforce_immutability(&out_dir, version, config.force)?;

    info!(raw = %config.raw.display(), scale_map = %config.scale_map.display(), "loading inputs");
    let raw = input::load_raw_answers(&config.raw)?;
    let scale_map = input::load_scale_map(&config.scale_map)?;
    info!(raw_rows = raw.len(), scale_map_rows = scale_map.len(), "inputs loaded");

    let mut diagnostics = Diagnostics::new();
    let prepared = prepare_with_policy(
        &raw,
        &scale_map,
        round_no,
        config.range_error_threshold,
        config.text_policy(),
        &mut diagnostics,
    )?;
    let core = prepared.core_records();
    let supplementary = prepared.supplementary_records();
    if core.is_empty() {
        return Err(SnapshotError::EmptyDataset(
            "no core_scale responses; cannot compute a baseline".to_string(),
        ));
    }
    let total_n = core
        .iter()
        .map(|r| r.student_id.as_str())
        .collect::<BTreeSet<_>>()
        .len();
    info!(
        rows = prepared.records.len(),
        core_rows = core.len(),
        supplementary_rows = supplementary.len(),
        students = total_n,
        "inputs prepared"
    );

    let (scale_stats, item_stats) = compute_scale_stats(
        &core,
        &prepared.effective_map,
        version,
        Some(&cutoff),
        &mut diagnostics,
    );
    let student_scores = compute_standard_scores(&core, &scale_stats, version);
    let student_types = classify_type(&student_scores, &prepared.axis_config, version);
    let (validation_sheets, validation_summary) = validate(
        &student_types,
        version,
        config.cv_splits,
        config.random_state,
        &mut diagnostics,
    );

    let by_level = report::summarize_by_current_level(&student_scores);
    let subjective_items = report::summarize_subjective_items(&supplementary);
    let student_subjective = report::student_subjective(&supplementary, version);
    let matrix = report::student_item_matrix(&prepared.records);

    let frozen = frozen_input_table(&prepared.records);
    let data_hash = output::table_sha256(&frozen)?;
    let scale_map_hash = output::table_sha256(&scale_map_table(&scale_map))?;

    if total_n < SMALL_SAMPLE {
        diagnostics.warn(format!(
            "sample size total_N={total_n} is below {SMALL_SAMPLE}; interpret with care"
        ));
    }
    if supplementary.is_empty() {
        diagnostics.warn("no supplementary_numeric items");
    }

    let core_item_ids = item_ids(&core);
    let metadata = SnapshotMetadata {
        version: version.to_string(),
        snapshot_date: cutoff.clone(),
        total_n,
        used_item_ids: core_item_ids.clone(),
        core_item_ids,
        supplementary_item_ids: item_ids(&supplementary),
        subjective_in_core: false,
        survey_slug: config.survey_slug.clone(),
        snapshot_cutoff_at: cutoff,
        round_no,
        fixed_scale_stats: report::fixed_scale_stats(&scale_stats),
        level_distribution: report::level_distribution(&core),
        current_math_percentile_summary: report::percentile_summary(&core),
        supplementary_item_stats_count: subjective_items.len(),
        supplementary_student_rows: student_subjective.len(),
        logic_version: config.logic_version.clone(),
        data_hash,
        scale_map_hash,
        warnings: diagnostics.unique(),
        axis_config: prepared
            .axis_config
            .iter()
            .map(|(tag, scales)| (tag.to_string(), scales.clone()))
            .collect::<BTreeMap<_, _>>(),
        generated_at: Utc::now(),
    };

    let mut written = vec![
        output::write_book(
            &out_dir,
            output::SCALE_BOOK,
            &[
                ("Scale_Stats", Table::from_rows(&scale_stats)),
                ("Scale_Items", Table::from_rows(&item_stats)),
                ("By_Current_Level", Table::from_rows(&by_level)),
                ("Subjective_Numeric_Items", Table::from_rows(&subjective_items)),
            ],
        )?,
        output::write_book(
            &out_dir,
            output::STUDENT_BOOK,
            &[
                ("Student_Standard_Scores", Table::from_rows(&student_scores)),
                ("Student_Type", Table::from_rows(&student_types)),
                ("Student_Subjective", Table::from_rows(&student_subjective)),
            ],
        )?,
        output::write_book(
            &out_dir,
            output::VALIDATION_BOOK,
            &validation_sheets.tables(),
        )?,
    ];

    let matrix_path = out_dir.join(output::MATRIX_FILE);
    output::write_table(&matrix_path, &matrix)?;
    written.push(matrix_path);

    let metadata_path = out_dir.join(output::METADATA_FILE);
    output::write_json(&metadata_path, &metadata)?;
    written.push(metadata_path);

    let summary_path = out_dir.join(output::VALIDATION_SUMMARY_FILE);
    output::write_json(&summary_path, &validation_summary)?;
    written.push(summary_path);

    written.push(output::write_frozen_input(&out_dir, &frozen)?);

    let report_path = out_dir.join(output::REPORT_FILE);
    let markdown = report::build_report(
        &metadata,
        &scale_stats,
        &student_types,
        &validation_summary,
    );
    output::write_text(&report_path, &markdown)?;
    written.push(report_path);

    info!(
        students = total_n,
        scales = scale_stats.len(),
        warnings = metadata.warnings.len(),
        "snapshot written"
    );

    Ok(SnapshotOutcome {
        out_dir,
        total_n,
        scale_count: scale_stats.len(),
        student_score_rows: student_scores.len(),
        supplementary_items: subjective_items.len(),
        warning_count: metadata.warnings.len(),
        written,
    })
}
