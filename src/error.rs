//! Error kinds surfaced by the router configuration store

use std::path::PathBuf;

/// Broad category of a [`RouterError`], used for logging and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or conflicting input
    Validation,
    /// Target route or fragment does not exist
    NotFound,
    /// Generated proxy configuration rejected by the syntax check
    ConfigInvalid,
    /// An external command failed or timed out
    ExternalCommand,
    /// Filesystem failure
    Io,
    /// Persisted state file could not be parsed
    State,
}

impl ErrorKind {
    /// Get the kind as a stable string for log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::ConfigInvalid => "CONFIG_INVALID",
            ErrorKind::ExternalCommand => "EXTERNAL_COMMAND_ERROR",
            ErrorKind::Io => "IO_ERROR",
            ErrorKind::State => "STATE_ERROR",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("proxy configuration rejected by syntax check:\n{diagnostic}")]
    ConfigInvalid { diagnostic: String },

    #[error("command `{command}` failed: {message}")]
    ExternalCommand { command: String, message: String },

    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed state file {} (line {line}): {message}", path.display())]
    State {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

impl RouterError {
    pub fn validation(message: impl Into<String>) -> Self {
        RouterError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        RouterError::NotFound(message.into())
    }

    /// Wrap an I/O error with the action and path it happened on
    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RouterError::Io {
            action,
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RouterError::Validation(_) => ErrorKind::Validation,
            RouterError::NotFound(_) => ErrorKind::NotFound,
            RouterError::ConfigInvalid { .. } => ErrorKind::ConfigInvalid,
            RouterError::ExternalCommand { .. } => ErrorKind::ExternalCommand,
            RouterError::Io { .. } => ErrorKind::Io,
            RouterError::State { .. } => ErrorKind::State,
        }
    }
}

pub type Result<T, E = RouterError> = std::result::Result<T, E>;
