//! Error types for capability calls
//!
//! Every error maps onto one of three classes that decide what the stage
//! controller does next: retry, abort before mutating, or roll back.

use ferry_model::ErrorKind;
use std::time::Duration;
use thiserror::Error;

/// Exit code a command uses to report a temporary condition (EX_TEMPFAIL)
pub const EXIT_TRANSIENT: i32 = 75;

/// Exit code a command uses to report an unusable environment (EX_CONFIG)
pub const EXIT_ENVIRONMENT: i32 = 78;

/// How the stage controller reacts to a capability error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Network blip or throttling; retry within the stage's attempt budget
    Transient,
    /// Missing privilege or unsupported platform; nothing was mutated
    EnvironmentFatal,
    /// A call failed mid-stage; roll back
    StepFailure,
}

impl ErrorClass {
    /// Classify a command exit code
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(EXIT_TRANSIENT) => ErrorClass::Transient,
            Some(EXIT_ENVIRONMENT) => ErrorClass::EnvironmentFatal,
            _ => ErrorClass::StepFailure,
        }
    }
}

impl From<ErrorClass> for ErrorKind {
    fn from(class: ErrorClass) -> Self {
        match class {
            ErrorClass::Transient => ErrorKind::Transient,
            ErrorClass::EnvironmentFatal => ErrorKind::EnvironmentFatal,
            ErrorClass::StepFailure => ErrorKind::StepFailure,
        }
    }
}

/// Error type for capability calls
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// Temporary failure reported by a collaborator
    #[error("transient failure in {operation}: {message}")]
    Transient { operation: String, message: String },

    /// The device cannot be migrated in its current environment
    #[error("environment check failed: {0}")]
    EnvironmentFatal(String),

    /// A capability call failed
    #[error("{operation} failed: {message}")]
    StepFailed { operation: String, message: String },

    /// No implementation is configured for an operation
    #[error("capability not configured: {0}")]
    NotConfigured(String),

    /// An external command exited unsuccessfully
    #[error("{operation} exited with {}: {message}", display_code(*code))]
    Command {
        operation: String,
        code: Option<i32>,
        message: String,
    },

    /// A call ran past its deadline
    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// I/O error while running a call
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn display_code(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code".to_string(),
    }
}

impl CapabilityError {
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        CapabilityError::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn step_failed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        CapabilityError::StepFailed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Build an error of the given class
    pub fn of_class(class: ErrorClass, operation: &str, message: impl Into<String>) -> Self {
        match class {
            ErrorClass::Transient => Self::transient(operation, message),
            ErrorClass::EnvironmentFatal => {
                CapabilityError::EnvironmentFatal(format!("{}: {}", operation, message.into()))
            }
            ErrorClass::StepFailure => Self::step_failed(operation, message),
        }
    }

    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            CapabilityError::Transient { .. } | CapabilityError::Timeout { .. } => {
                ErrorClass::Transient
            }
            CapabilityError::EnvironmentFatal(_) | CapabilityError::NotConfigured(_) => {
                ErrorClass::EnvironmentFatal
            }
            CapabilityError::Command { code, .. } => ErrorClass::from_exit_code(*code),
            CapabilityError::StepFailed { .. }
            | CapabilityError::Io(_)
            | CapabilityError::Serialization(_) => ErrorClass::StepFailure,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Result type for capability calls
pub type Result<T> = std::result::Result<T, CapabilityError>;
