//! Recovery error types.

use thiserror::Error;

pub type RecoveryResult<T> = Result<T, RecoveryError>;

/// Caller and configuration mistakes.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("duplicate recovery rule: {0}")]
    DuplicateRule(String),

    #[error("unknown recovery rule: {0}")]
    UnknownRule(String),

    #[error("recovery rule {0} is disabled")]
    RuleDisabled(String),

    #[error("{rule}: unknown action kind `{kind}`")]
    UnknownActionKind { rule: String, kind: String },

    #[error("{rule}: failed to build action `{kind}`: {source:#}")]
    ActionFactory {
        rule: String,
        kind: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Config(#[from] vigil_core::ConfigError),
}

/// Why one action step did not succeed. Recorded on the execution, never
/// returned to callers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActionFailure {
    #[error("action {action} reported failure")]
    Rejected { action: String },

    #[error("action {action} failed: {message}")]
    Error { action: String, message: String },

    #[error("action {action} timed out after {timeout}")]
    Timeout { action: String, timeout: String },

    #[error("action {action} panicked: {message}")]
    Panicked { action: String, message: String },
}
