//! Error types and handling
//!
//! The error taxonomy is structured with specific error enums for each domain
//! (validation, container runtime, state store, readiness) that are then
//! wrapped in the main `ProtomanError` enum for unified error handling.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Minimum number of characters accepted for a container handle.
pub const MIN_HANDLE_LEN: usize = 12;

/// Minimum number of characters accepted for an image name.
pub const MIN_IMAGE_NAME_LEN: usize = 3;

/// Malformed or empty input (image name, handle id, credential value)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Validation failed for {field} ('{value}'): {reason}")]
pub struct ValidationError {
    /// Name of the offending field
    pub field: String,
    /// Why the value was rejected
    pub reason: String,
    /// The rejected value
    pub value: String,
}

impl ValidationError {
    pub fn new(field: &str, reason: &str, value: &str) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.to_string(),
            value: value.to_string(),
        }
    }
}

/// Container runtime (docker CLI) errors
#[derive(Error, Debug)]
pub enum DockerError {
    /// Runtime binary could not be located
    #[error("Container runtime is not installed or not accessible: {message}")]
    NotInstalled { message: String },

    /// External command exited non-zero; captured output is attached
    #[error("docker {operation} failed with exit code {code}: {output}")]
    CommandFailed {
        operation: String,
        code: i32,
        output: String,
    },

    /// External command could not be spawned or awaited
    #[error("Failed to run docker {operation}")]
    Spawn {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Reading the output of a streaming command failed
    #[error("Failed to process docker output: {message}")]
    Stream { message: String },
}

impl DockerError {
    /// Captured command output, if this error carries any
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::CommandFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Persistent state store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// File could not be read, written or removed
    #[error("State file I/O failed for {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File exists but holds no usable content
    #[error("State file {} is corrupted: {reason}", .path.display())]
    Corrupted { path: PathBuf, reason: String },

    /// Settings file could not be parsed
    #[error("Failed to parse settings file {}: {message}", .path.display())]
    Settings { path: PathBuf, message: String },
}

/// Readiness orchestration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadinessError {
    /// Activation requested while the persisted instance is running
    #[error("Container {handle} is already running")]
    AlreadyRunning { handle: String },

    /// Reachability probing exceeded its bound
    #[error("Timed out after {}s waiting for the service to respond", .elapsed.as_secs())]
    Timeout { elapsed: Duration },

    /// A single poll failed; retried internally
    #[error("Transient failure while polling: {message}")]
    Transient { message: String },

    /// Another activation or deactivation holds the single-flight guard
    #[error("Another activation or deactivation is already in progress")]
    OperationInProgress,

    /// No persisted handle to act on
    #[error("No container handle found")]
    NoHandle,

    /// Both graceful and forced stop failed
    #[error("Failed to stop container (graceful: {graceful}, force: {force})")]
    StopFailed { graceful: String, force: String },
}

/// Main error enum wrapping all domain-specific errors
#[derive(Error, Debug)]
pub enum ProtomanError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("Docker error: {0}")]
    Docker(#[from] DockerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Readiness(#[from] ReadinessError),

    /// Failure wrapped with the operation that produced it
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ProtomanError>,
    },
}

impl ProtomanError {
    /// Wrap this error with operation context before bubbling it up
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with all context layers removed
    pub fn root(&self) -> &ProtomanError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self.root(), Self::Validation(_))
    }

    pub fn is_already_running(&self) -> bool {
        matches!(
            self.root(),
            Self::Readiness(ReadinessError::AlreadyRunning { .. })
        )
    }
}

/// Convenience type alias for Results with ProtomanError
pub type Result<T> = std::result::Result<T, ProtomanError>;

/// Extension for attaching operation context to any core result
pub trait ResultExt<T> {
    fn op_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E: Into<ProtomanError>> ResultExt<T> for std::result::Result<T, E> {
    fn op_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.into().context(f()))
    }
}

/// Reject empty values
pub fn validate_not_empty(field: &str, value: &str) -> std::result::Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::new(field, "cannot be empty", value));
    }
    Ok(())
}

/// Validate a container handle: non-empty and at least [`MIN_HANDLE_LEN`] characters
pub fn validate_handle(handle: &str) -> std::result::Result<(), ValidationError> {
    validate_not_empty("containerID", handle)?;
    if handle.chars().count() < MIN_HANDLE_LEN {
        return Err(ValidationError::new(
            "containerID",
            &format!("too short (minimum {} characters)", MIN_HANDLE_LEN),
            handle,
        ));
    }
    Ok(())
}

/// Validate an image name: non-empty and at least [`MIN_IMAGE_NAME_LEN`] characters
pub fn validate_image_name(name: &str) -> std::result::Result<(), ValidationError> {
    validate_not_empty("imageName", name)?;
    if name.chars().count() < MIN_IMAGE_NAME_LEN {
        return Err(ValidationError::new("imageName", "too short", name));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_validation_error_display() {
        let error = ValidationError::new("containerID", "cannot be empty", "");
        assert_eq!(
            format!("{}", error),
            "Validation failed for containerID (''): cannot be empty"
        );
    }

    #[test]
    fn test_docker_error_display_includes_output() {
        let error = DockerError::CommandFailed {
            operation: "stop".to_string(),
            code: 1,
            output: "No such container".to_string(),
        };
        assert_eq!(
            format!("{}", error),
            "docker stop failed with exit code 1: No such container"
        );
        assert_eq!(error.output(), Some("No such container"));
    }

    #[test]
    fn test_readiness_error_display() {
        let error = ReadinessError::Timeout {
            elapsed: Duration::from_secs(600),
        };
        assert_eq!(
            format!("{}", error),
            "Timed out after 600s waiting for the service to respond"
        );

        let error = ReadinessError::StopFailed {
            graceful: "a".to_string(),
            force: "b".to_string(),
        };
        assert_eq!(
            format!("{}", error),
            "Failed to stop container (graceful: a, force: b)"
        );
    }

    #[test]
    fn test_validate_handle() {
        assert!(validate_handle("").is_err());
        assert!(validate_handle("abc123").is_err());
        assert!(validate_handle("0123456789ab").is_ok());
        assert!(validate_handle(&"f".repeat(64)).is_ok());
    }

    #[test]
    fn test_validate_image_name() {
        assert!(validate_image_name("").is_err());
        assert!(validate_image_name("ab").is_err());
        assert!(validate_image_name("wenkhairu/moodle-prototype:502-stable").is_ok());
    }

    #[test]
    fn test_context_wrapping_preserves_root() {
        let error: ProtomanError = ReadinessError::AlreadyRunning {
            handle: "0123456789ab".to_string(),
        }
        .into();
        let wrapped = error.context("activate").context("up");

        assert!(wrapped.is_already_running());
        assert!(!wrapped.is_validation());
        assert!(wrapped.to_string().starts_with("up: activate: "));
        assert!(wrapped.source().is_some());
    }

    #[test]
    fn test_op_context_on_result() {
        let result: std::result::Result<(), ValidationError> =
            Err(ValidationError::new("imageName", "too short", "ab"));
        let err = result.op_context(|| "create container").unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("create container"));
    }

    #[test]
    fn test_anyhow_conversions() {
        let error = ProtomanError::Docker(DockerError::NotInstalled {
            message: "docker".to_string(),
        });
        let anyhow_error = anyhow::Error::from(error);
        assert!(anyhow_error.to_string().contains("Docker error"));
    }
}
