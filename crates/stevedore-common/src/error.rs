//! Common error types for Stevedore.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`StevedoreError`].
pub type StevedoreResult<T> = Result<T, StevedoreError>;

/// Errors shared by every Stevedore crate.
#[derive(Error, Diagnostic, Debug)]
pub enum StevedoreError {
    /// The container runtime could not be reached or did not answer in time.
    #[error("Container runtime unavailable: {reason}")]
    #[diagnostic(
        code(stevedore::runtime::unavailable),
        help("Make sure the container runtime is installed and running")
    )]
    RuntimeUnavailable {
        /// Why the runtime was considered unavailable.
        reason: String,
    },

    /// The runtime answered but rejected the request.
    #[error("Container runtime error: {message}")]
    #[diagnostic(code(stevedore::runtime::failed))]
    Runtime {
        /// The runtime's error message.
        message: String,
    },

    /// A resource or record does not exist.
    #[error("{kind} not found: {id}")]
    #[diagnostic(code(stevedore::not_found))]
    NotFound {
        /// What kind of thing was looked up.
        kind: &'static str,
        /// The missing identifier.
        id: String,
    },

    /// Install was requested for a resource that is already installed.
    #[error("Resource already installed: {id}")]
    #[diagnostic(
        code(stevedore::lifecycle::already_installed),
        help("Uninstall the resource first to recreate it")
    )]
    AlreadyInstalled {
        /// The resource identifier.
        id: String,
    },

    /// A lifecycle operation requires an installed resource.
    #[error("Resource not installed: {id}")]
    #[diagnostic(code(stevedore::lifecycle::not_installed))]
    NotInstalled {
        /// The resource identifier.
        id: String,
    },

    /// Another lifecycle operation is running for the same resource.
    #[error("Operation {running} already in progress for {id}")]
    #[diagnostic(code(stevedore::lifecycle::in_progress))]
    OperationInProgress {
        /// The resource identifier.
        id: String,
        /// The operation currently holding the resource.
        running: String,
    },

    /// The health check did not report healthy before retries ran out.
    #[error("Health check for {id} did not pass after {attempts} attempts")]
    #[diagnostic(code(stevedore::lifecycle::health_timeout))]
    HealthCheckTimeout {
        /// The resource identifier.
        id: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled for {id}")]
    #[diagnostic(code(stevedore::lifecycle::cancelled))]
    Cancelled {
        /// The resource identifier.
        id: String,
    },

    /// Malformed input.
    #[error("Validation error: {message}")]
    #[diagnostic(code(stevedore::validation))]
    Validation {
        /// Description of the problem.
        message: String,
    },

    /// Elevation was declined by the user.
    #[error("Permission denied: {operation}")]
    #[diagnostic(
        code(stevedore::permission_denied),
        help("The privileged helper was cancelled or refused")
    )]
    PermissionDenied {
        /// The operation that was denied.
        operation: String,
    },

    /// A state file could not be decoded. Recovered locally, never surfaced.
    #[error("Corrupt state file {path}: {reason}")]
    #[diagnostic(code(stevedore::store::corrupt))]
    StorageCorrupt {
        /// Path of the corrupt file.
        path: String,
        /// Decode failure.
        reason: String,
    },

    /// The store was used before `initialize`.
    #[error("Store not initialized: {store}")]
    #[diagnostic(code(stevedore::store::not_initialized))]
    NotInitialized {
        /// Name of the store.
        store: String,
    },

    /// A post-install hook failed.
    #[error("Post-install hook for {id} failed: {message}")]
    #[diagnostic(code(stevedore::hook::failed))]
    HookFailed {
        /// The resource identifier.
        id: String,
        /// The hook's error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(stevedore::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(stevedore::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(stevedore::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(stevedore::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl StevedoreError {
    /// Stable machine-readable code used on the control channel.
    #[must_use]
    pub const fn api_code(&self) -> &'static str {
        match self {
            Self::RuntimeUnavailable { .. } => "RUNTIME_UNAVAILABLE",
            Self::Runtime { .. } => "RUNTIME_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyInstalled { .. } => "ALREADY_INSTALLED",
            Self::NotInstalled { .. } => "NOT_INSTALLED",
            Self::OperationInProgress { .. } => "OPERATION_IN_PROGRESS",
            Self::HealthCheckTimeout { .. } => "HEALTH_CHECK_TIMEOUT",
            Self::Cancelled { .. } => "CANCELLED",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::PermissionDenied { .. } => "PERMISSION_DENIED",
            Self::StorageCorrupt { .. } => "STORAGE_CORRUPT",
            Self::NotInitialized { .. } => "NOT_INITIALIZED",
            Self::HookFailed { .. } => "HOOK_FAILED",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Config { .. } => "CONFIG_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Shorthand for a [`StevedoreError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Shorthand for a [`StevedoreError::RuntimeUnavailable`].
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::RuntimeUnavailable {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`StevedoreError::Runtime`].
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Returns true if the runtime could not be reached.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::RuntimeUnavailable { .. })
    }
}

impl From<serde_json::Error> for StevedoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StevedoreError::NotFound {
            kind: "Resource",
            id: "redis".to_string(),
        };
        assert_eq!(err.to_string(), "Resource not found: redis");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: StevedoreError = io_err.into();
        assert!(matches!(err, StevedoreError::Io(_)));
        assert_eq!(err.api_code(), "IO_ERROR");
    }

    #[test]
    fn api_codes_are_stable() {
        let err = StevedoreError::OperationInProgress {
            id: "redis".into(),
            running: "install".into(),
        };
        assert_eq!(err.api_code(), "OPERATION_IN_PROGRESS");
        assert!(StevedoreError::unavailable("timeout").is_unavailable());
    }
}
