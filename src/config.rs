use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use clap::Args;
use serde::Serialize;

use crate::error::{Result, SnapshotError};
use crate::input::parse_timestamp;
use crate::prepare::UnmappedTextPolicy;

/// Parameters of one snapshot run.
#[derive(Args, Debug, Clone, Serialize)]
pub struct SnapshotConfig {
    /// raw_answers.csv
    #[arg(long)]
    pub raw: PathBuf,

    /// scale_map.csv
    #[arg(long)]
    pub scale_map: PathBuf,

    /// Output directory
    #[arg(long)]
    pub out: PathBuf,

    /// Survey identifier, e.g. trait_v1
    #[arg(long)]
    pub survey_slug: String,

    /// Answers after this instant are not part of the snapshot
    #[arg(long)]
    pub snapshot_cutoff_at: String,

    #[arg(long, default_value_t = 1)]
    pub round_no: i64,

    #[arg(long, default_value = "v1.0.0")]
    pub logic_version: String,

    #[arg(long, default_value = "v1.0")]
    pub snapshot_version: String,

    /// Largest tolerated share of out-of-range raw scores
    #[arg(long, default_value_t = 0.01)]
    pub range_error_threshold: f64,

    #[arg(long, default_value_t = 5)]
    pub cv_splits: usize,

    /// Seed for cross-validation shuffling
    #[arg(long, default_value_t = 42)]
    pub random_state: u64,

    /// Fail on text items missing from scale_map instead of adopting them
    #[arg(long)]
    pub reject_unmapped_text: bool,

    /// Overwrite an existing snapshot in --out
    #[arg(long)]
    pub force: bool,
}

impl SnapshotConfig {
    pub fn validate(&self) -> Result<()> {
        if self.round_no < 1 || u32::try_from(self.round_no).is_err() {
            return Err(SnapshotError::Config(format!(
                "--round-no must be a positive integer, got {}",
                self.round_no
            )));
        }
        if !(0.0..=1.0).contains(&self.range_error_threshold) {
            return Err(SnapshotError::Config(format!(
                "--range-error-threshold must be within [0, 1], got {}",
                self.range_error_threshold
            )));
        }
        if self.cv_splits < 2 {
            return Err(SnapshotError::Config(format!(
                "--cv-splits must be at least 2, got {}",
                self.cv_splits
            )));
        }
        if self.survey_slug.trim().is_empty() || self.snapshot_version.trim().is_empty() {
            return Err(SnapshotError::Config(
                "--survey-slug and --snapshot-version must not be empty".to_string(),
            ));
        }
        self.cutoff()?;
        Ok(())
    }

    pub fn round(&self) -> Result<u32> {
        u32::try_from(self.round_no)
            .ok()
            .filter(|r| *r >= 1)
            .ok_or_else(|| SnapshotError::Config(format!("invalid --round-no {}", self.round_no)))
    }

    /// Cutoff as UTC; values without an offset are taken as UTC.
    pub fn cutoff(&self) -> Result<DateTime<Utc>> {
        parse_timestamp(&self.snapshot_cutoff_at).ok_or_else(|| {
            SnapshotError::Config(format!(
                "could not parse --snapshot-cutoff-at {:?}",
                self.snapshot_cutoff_at
            ))
        })
    }

    pub fn cutoff_iso(&self) -> Result<String> {
        Ok(self.cutoff()?.to_rfc3339_opts(SecondsFormat::Secs, false))
    }

    pub fn text_policy(&self) -> UnmappedTextPolicy {
        if self.reject_unmapped_text {
            UnmappedTextPolicy::Reject
        } else {
            UnmappedTextPolicy::AdoptAsSupplementary
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_config(out: PathBuf) -> SnapshotConfig {
    SnapshotConfig {
        raw: PathBuf::from("raw_answers.csv"),
        scale_map: PathBuf::from("scale_map.csv"),
        out,
        survey_slug: "trait_v1".to_string(),
        snapshot_cutoff_at: "2026-02-13T23:59:59+09:00".to_string(),
        round_no: 1,
        logic_version: "v1.0.0".to_string(),
        snapshot_version: "v1.0".to_string(),
        range_error_threshold: 0.01,
        cv_splits: 5,
        random_state: 42,
        reject_unmapped_text: false,
        force: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SnapshotConfig {
        sample_config(PathBuf::from("out"))
    }

    #[test]
    fn defaults_are_valid() {
        let config = config();
        config.validate().unwrap();
        assert_eq!(config.round().unwrap(), 1);
        assert_eq!(config.cutoff_iso().unwrap(), "2026-02-13T14:59:59+00:00");
        assert_eq!(config.text_policy(), UnmappedTextPolicy::AdoptAsSupplementary);
    }

    #[test]
    fn out_of_range_parameters_are_rejected() {
        let mut bad_round = config();
        bad_round.round_no = 0;
        assert!(matches!(bad_round.validate(), Err(SnapshotError::Config(_))));

        let mut bad_threshold = config();
        bad_threshold.range_error_threshold = 1.5;
        assert!(bad_threshold.validate().is_err());

        let mut bad_splits = config();
        bad_splits.cv_splits = 1;
        assert!(bad_splits.validate().is_err());

        let mut bad_cutoff = config();
        bad_cutoff.snapshot_cutoff_at = "yesterday".to_string();
        assert!(bad_cutoff.validate().is_err());
    }

    #[test]
    fn naive_cutoff_is_utc() {
        let mut config = config();
        config.snapshot_cutoff_at = "2026-02-13 23:59:59".to_string();
        assert_eq!(config.cutoff_iso().unwrap(), "2026-02-13T23:59:59+00:00");
        config.reject_unmapped_text = true;
        assert_eq!(config.text_policy(), UnmappedTextPolicy::Reject);
    }
}
