// error.rs

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the analysis stages. The binary wraps these in `anyhow`.
#[derive(Error, Debug)]
pub(crate) enum ScmetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Delimited text error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing column '{column}' in {}", path.display())]
    MissingColumn { column: String, path: PathBuf },

    #[error("Malformed record in {} at line {line}: {reason}", path.display())]
    MalformedRecord {
        path: PathBuf,
        line: u64,
        reason: String,
    },

    #[error("No records with annotation '{0}'")]
    EmptyAnnotation(String),

    #[error("Ambiguous pivot for annotation '{annotation}': sample '{sample}' has more than one rate for feature '{id}'")]
    AmbiguousPivot {
        annotation: String,
        sample: String,
        id: String,
    },

    #[error("Degenerate reduction: {0}")]
    DegenerateReduction(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Render error: {0}")]
    Render(String),
}

pub(crate) type Result<T> = std::result::Result<T, ScmetError>;
