use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the scoring engine.
///
/// Every variant is recoverable at the call site: a view that gets one of
/// these skips its dataset and shows a message, nothing else is affected.
/// Rows whose score columns fail coercion never produce an error, they are
/// dropped during normalization and only counted.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Declared input file does not exist.
    #[error("source not found: '{}'", path.display())]
    SourceNotFound { path: PathBuf },

    /// The delimited file could not be decoded.
    #[error("failed to parse '{}': {detail}", path.display())]
    Parse { path: PathBuf, detail: String },

    /// Expected columns are absent, or values fall outside the declared domain.
    #[error("schema mismatch: {detail}")]
    SchemaMismatch { detail: String },

    /// An aggregate was requested over zero records.
    #[error("no records in {scope}")]
    EmptyCohort { scope: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn parse(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub fn schema(detail: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            detail: detail.into(),
        }
    }

    pub fn empty(scope: impl Into<String>) -> Self {
        Self::EmptyCohort {
            scope: scope.into(),
        }
    }

    /// True when the caller should render a "no data" state rather than an error.
    pub fn is_empty_cohort(&self) -> bool {
        matches!(self, Self::EmptyCohort { .. })
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
