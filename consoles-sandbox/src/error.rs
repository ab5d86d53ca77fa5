//! Error types for the sandbox layer

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while building, extending or running a sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Invalid setup: name collisions, duplicate libraries, bad config files.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A function pool already holds a binding under this name.
    #[error("duplicate binding in function pool: {name}")]
    DuplicateBinding { name: String },

    /// A capability library or program that was never published.
    #[error("not found: {0}")]
    NotFound(String),

    /// A host function binding failed while a script was calling it.
    #[error("host function failed: {0}")]
    Host(String),

    /// Malformed or failing script code, including syntax errors at load time.
    #[error("script error: {0}")]
    ScriptRuntime(String),

    /// The interrupt controller aborted the run.
    #[error("program stopped: exceeded limits")]
    Terminated,

    /// The operation is not valid for the instance's current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Machine-readable classification of a [`SandboxError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    NotFound,
    Host,
    ScriptRuntime,
    Terminated,
    InvalidState,
    Io,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "configuration"),
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Host => write!(f, "host"),
            ErrorKind::ScriptRuntime => write!(f, "script_runtime"),
            ErrorKind::Terminated => write!(f, "terminated"),
            ErrorKind::InvalidState => write!(f, "invalid_state"),
            ErrorKind::Io => write!(f, "io"),
        }
    }
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Configuration(_) | SandboxError::DuplicateBinding { .. } => {
                ErrorKind::Configuration
            }
            SandboxError::NotFound(_) => ErrorKind::NotFound,
            SandboxError::Host(_) => ErrorKind::Host,
            SandboxError::ScriptRuntime(_) => ErrorKind::ScriptRuntime,
            SandboxError::Terminated => ErrorKind::Terminated,
            SandboxError::InvalidState(_) => ErrorKind::InvalidState,
            SandboxError::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether the run was aborted by the interrupt controller rather than crashing.
    pub fn is_termination(&self) -> bool {
        matches!(self, SandboxError::Terminated)
    }

    pub fn to_failure(&self) -> ScriptFailure {
        ScriptFailure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Structured failure reported to hosts instead of printed text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&SandboxError> for ScriptFailure {
    fn from(err: &SandboxError) -> Self {
        err.to_failure()
    }
}

impl std::fmt::Display for ScriptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;
