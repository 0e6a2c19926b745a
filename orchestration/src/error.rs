//! Harness error types
//!
//! Structured error handling for the engine components. Child-process
//! facing modules (session runner, reviewers, issue store) return typed
//! results instead of raw process errors; this taxonomy covers everything
//! that still needs to cross a `?`.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Errors that can occur during harness operations
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Git operation failed
    #[error("Git operation failed: {operation} - {message}")]
    GitError { operation: String, message: String },

    /// Run-level error (scheduler, run state)
    #[error("Run error: {message}")]
    RunError { message: String },

    /// Invalid state transition
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Spec file could not be read
    #[error("Spec file not found at {path}")]
    SpecNotFound { path: PathBuf },

    /// Spec validation failed; each entry is a field-path/message pair
    #[error("Spec validation failed: {}", format_spec_errors(.errors))]
    SpecInvalid { errors: Vec<(String, String)> },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Saga terminated without completing
    #[error("Saga '{saga}' failed at step '{step}': {message}")]
    SagaFailed {
        saga: String,
        step: String,
        message: String,
    },

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn format_spec_errors(errors: &[(String, String)]) -> String {
    errors
        .iter()
        .map(|(path, msg)| format!("{path}: {msg}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl HarnessError {
    /// Create a git error
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::GitError {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a run error
    pub fn run(message: impl Into<String>) -> Self {
        Self::RunError {
            message: message.into(),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Check if this error is retryable (transient failure)
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::GitError { message, .. } => {
                let lower = message.to_lowercase();
                lower.contains("lock")
                    || lower.contains("timeout")
                    || lower.contains("connection")
                    || lower.contains("another git process")
            }
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HarnessError::git("commit", "nothing to commit");
        assert!(err.to_string().contains("commit"));
        assert!(err.to_string().contains("nothing to commit"));

        let err = HarnessError::InvalidStateTransition {
            from: "completed".into(),
            to: "running".into(),
        };
        assert!(err.to_string().contains("completed"));
    }

    #[test]
    fn test_spec_errors_format() {
        let err = HarnessError::SpecInvalid {
            errors: vec![
                ("title".into(), "must not be empty".into()),
                ("features[2].priority".into(), "out of range".into()),
            ],
        };
        let s = err.to_string();
        assert!(s.contains("title: must not be empty"));
        assert!(s.contains("features[2].priority"));
    }

    #[test]
    fn test_is_retryable() {
        assert!(HarnessError::git("add", "unable to create lock file").is_retryable());
        assert!(HarnessError::git("fetch", "connection timed out").is_retryable());
        assert!(!HarnessError::git("commit", "nothing to commit").is_retryable());
        assert!(!HarnessError::run("bad").is_retryable());

        let io = std::io::Error::new(std::io::ErrorKind::Interrupted, "interrupted");
        assert!(HarnessError::from(io).is_retryable());
    }
}
