//! CLI error types

use thiserror::Error;

/// Errors surfaced by CLI commands
#[derive(Debug, Error)]
pub enum CliError {
    #[error("cannot read config {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    #[error(transparent)]
    Storage(#[from] freighter_core::storage::StorageError),

    #[error(transparent)]
    Pipeline(#[from] freighter_core::PipelineError),
}

pub type Result<T> = std::result::Result<T, CliError>;
