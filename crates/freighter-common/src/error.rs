//! Error types for Freighter

use thiserror::Error;

/// Result type alias for Freighter operations
pub type Result<T> = std::result::Result<T, FreighterError>;

/// Main error type for Freighter
///
/// Component-specific failures carry their own error enums next to the code
/// that produces them; this type covers the cross-cutting categories shared
/// by every workspace member.
#[derive(Error, Debug)]
pub enum FreighterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Record error: {0}")]
    Record(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}
