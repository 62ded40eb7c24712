//! Failure classes the operator has to tell apart.
//!
//! Everything else flows through `anyhow` with context; these variants are
//! matched on by `main` and by tests.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("required input file not found: {}", path.display())]
    MissingInput { path: PathBuf },

    #[error("input '{}' has no '{column}' column", path.display())]
    MissingColumn { path: PathBuf, column: String },

    #[error("malformed input '{}': {reason}", path.display())]
    MalformedInput { path: PathBuf, reason: String },

    #[error("authentication with the lookup service failed: {0}")]
    Authentication(String),

    #[error("merge produced {actual} rows for {expected} base rows")]
    MergeCardinality { expected: usize, actual: usize },

    #[error("metadata key '{key}' still duplicated after dedup")]
    DuplicateMergeKey { key: String },
}

/// Wrap a CSV read failure as `MalformedInput` for `path`.
pub fn malformed_csv(path: &std::path::Path, err: csv::Error) -> PipelineError {
    PipelineError::MalformedInput {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

/// Fail with `MissingInput` unless `path` exists.
pub fn require_input(path: &std::path::Path) -> Result<(), PipelineError> {
    if path.exists() {
        Ok(())
    } else {
        Err(PipelineError::MissingInput {
            path: path.to_path_buf(),
        })
    }
}
