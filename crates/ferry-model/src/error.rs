//! Error types for model operations

use crate::Stage;
use thiserror::Error;

/// Errors that can occur when working with model types
#[derive(Debug, Error)]
pub enum ModelError {
    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Invalid field value
    #[error("Invalid value for field '{field}': {message}")]
    InvalidFieldValue { field: String, message: String },

    /// Stage change that would move backwards or leave a terminal stage
    #[error("Invalid stage transition from {from} to {to}")]
    InvalidStageTransition { from: Stage, to: Stage },

    /// Unknown stage name
    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration file could not be read
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for model operations
pub type Result<T> = std::result::Result<T, ModelError>;
