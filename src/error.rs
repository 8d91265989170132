use thiserror::Error;

pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Fatal conditions that abort a snapshot run before anything is written.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// A required column is missing from an input file
    #[error("[{source_name}] missing required columns: {missing:?}")]
    Schema {
        source_name: String,
        missing: Vec<String>,
    },

    /// A filter step left no rows to work with
    #[error("empty dataset: {0}")]
    EmptyDataset(String),

    /// A value outside its allowed enum or domain
    #[error("domain error: {0}")]
    Domain(String),

    #[error("raw_score out-of-range ratio {ratio:.4} exceeds threshold {threshold:.4}; examples: {examples:?}")]
    RangeViolation {
        ratio: f64,
        threshold: f64,
        examples: Vec<String>,
    },

    #[error("scale_map has conflicting mappings for question_id: {0:?}")]
    MappingConflict(Vec<String>),

    #[error("scale_name={scale_name} has more than one axis_tag: {tags:?}")]
    AxisConflict { scale_name: String, tags: Vec<String> },

    #[error("required axis tags missing from scale_map: {0:?}")]
    AxisCoverage(Vec<String>),

    #[error("raw_answers contains {count} scale items missing from scale_map, e.g. {examples:?}")]
    UnmappedItem { count: usize, examples: Vec<String> },

    /// Regression or cross-validation fold could not be fitted
    #[error("statistical fit failed: {0}")]
    StatisticalFit(String),

    #[error("snapshot {version} already exists in output directory (existing: {existing:?}); pass --force to overwrite")]
    Immutability {
        version: String,
        existing: Vec<String>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
