//! Error handling module for provisionctl
//!
//! Provides the error taxonomy shared by every component using thiserror.
//! Which variants are fatal is decided by the caller: persistence failures are
//! logged and swallowed by the orchestrator, configuration failures stop the
//! binary before any step runs.

use thiserror::Error;

/// Main error type for provisionctl
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Network stayed unreachable after the retry primitives gave up
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// A step exited with a non-success code
    #[error("Step execution failed: {0}")]
    StepExecution(String),

    /// Every source and fallback for a dependency failed
    #[error("Dependency unsatisfied: {0}")]
    DependencyUnsatisfied(String),

    /// Status store read/write failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Invalid policy or pipeline values
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO errors (file operations, process spawning)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for provisionctl operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

impl ProvisionError {
    /// Create a transient network error
    pub fn transient_network(msg: impl Into<String>) -> Self {
        Self::TransientNetwork(msg.into())
    }

    /// Create a step execution error
    pub fn step_execution(msg: impl Into<String>) -> Self {
        Self::StepExecution(msg.into())
    }

    /// Create a dependency unsatisfied error
    pub fn dependency_unsatisfied(msg: impl Into<String>) -> Self {
        Self::DependencyUnsatisfied(msg.into())
    }

    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProvisionError::configuration("max_retries must be at least 1");
        assert_eq!(
            err.to_string(),
            "Configuration error: max_retries must be at least 1"
        );

        let err = ProvisionError::persistence("access denied");
        assert_eq!(err.to_string(), "Persistence error: access denied");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: ProvisionError = io_err.into();
        assert!(matches!(err, ProvisionError::Io(_)));
    }
}
