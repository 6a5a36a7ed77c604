use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconError {
    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Conflicting classification for '{series_id}': row {row} disagrees with row {first_row}")]
    ConflictingClassification {
        series_id: String,
        first_row: usize,
        row: usize,
    },

    #[error("Invalid aggregate key: {0}")]
    InvalidKey(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl From<polars::error::PolarsError> for ReconError {
    fn from(err: polars::error::PolarsError) -> Self {
        ReconError::Polars(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReconError>;
