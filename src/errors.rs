//! Typed error hierarchy for the Foreman service.
//!
//! One domain enum covers every subsystem boundary. Operations return
//! `Result<T, Error>` and never let a panic or an untyped error cross a
//! subsystem seam; the HTTP layer maps each variant to a status code.

use thiserror::Error;

/// Detail payload for a child process that exited non-zero.
#[derive(Debug, Clone)]
pub struct ProcessExecutionError {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub command: String,
}

impl std::fmt::Display for ProcessExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "command `{}` exited with {:?}: {}",
            self.command,
            self.exit_code,
            self.stderr.trim()
        )
    }
}

/// Detail payload for an invalid state-machine transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: String,
    pub to: String,
    pub label: String,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid {} transition: {} -> {}",
            self.label, self.from, self.to
        )
    }
}

/// Domain errors for every Foreman subsystem.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("{0}")]
    Process(ProcessExecutionError),

    #[error("Timed out after {timeout_ms}ms running `{command}`")]
    Timeout {
        command: String,
        timeout_ms: u64,
        partial_stdout: String,
        partial_stderr: String,
    },

    #[error("{0}")]
    Transition(TransitionError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short machine-readable kind, used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::BadRequest(_) => "bad_request",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Forbidden(_) => "forbidden",
            Error::Process(_) => "process",
            Error::Timeout { .. } => "timeout",
            Error::Transition(_) => "transition",
            Error::Internal(_) => "internal",
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(format!("{:#}", err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
