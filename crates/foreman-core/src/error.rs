use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A convenience `Result` alias using [`ForemanError`].
pub type ForemanResult<T> = Result<T, ForemanError>;

/// Top-level error type for the foreman engine.
///
/// The first five variants are caller-facing outcomes of an operation's
/// precondition checks. The remaining variants are infrastructure failures.
#[derive(Error, Debug)]
pub enum ForemanError {
    /// Unknown task, agent, bug or decision reference.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A precondition failed: lost claim race, illegal transition,
    /// unresolved tie, vote after resolution.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The caller is not authorized for the operation.
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    /// Malformed input payload.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The record changed between the caller's read and this write.
    #[error("Stale state: {0}")]
    StaleState(String),

    /// The persisted store is unreadable. Never repaired automatically.
    #[error("Corrupt store: {0}")]
    Corrupt(String),

    /// Invalid or unreadable policy document.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForemanError {
    /// Classify this error for transport to the caller.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ForemanError::NotFound(_) => ErrorKind::NotFound,
            ForemanError::Conflict(_) => ErrorKind::Conflict,
            ForemanError::PolicyViolation(_) => ErrorKind::PolicyViolation,
            ForemanError::Validation(_) => ErrorKind::ValidationError,
            ForemanError::StaleState(_) => ErrorKind::StaleStateError,
            ForemanError::Corrupt(_) => ErrorKind::CorruptStore,
            ForemanError::Config(_) => ErrorKind::ConfigError,
            ForemanError::Json(_) | ForemanError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Structured form of this error.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Serializable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`ForemanError::NotFound`].
    NotFound,
    /// See [`ForemanError::Conflict`].
    Conflict,
    /// See [`ForemanError::PolicyViolation`].
    PolicyViolation,
    /// See [`ForemanError::Validation`].
    ValidationError,
    /// See [`ForemanError::StaleState`].
    StaleStateError,
    /// See [`ForemanError::Corrupt`].
    CorruptStore,
    /// See [`ForemanError::Config`].
    ConfigError,
    /// I/O or serialization failure inside the engine.
    Internal,
}

impl ErrorKind {
    /// Whether the caller should retry. Only expected contention qualifies.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Conflict | ErrorKind::StaleStateError)
    }
}

/// Structured error returned across the operation boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error classification.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}
