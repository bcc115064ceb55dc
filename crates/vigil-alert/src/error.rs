//! Alert error types.

use thiserror::Error;

pub type AlertResult<T> = Result<T, AlertError>;

/// Caller mistakes when building or driving the evaluator.
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("duplicate alert rule: {0}")]
    DuplicateRule(String),

    #[error("unknown alert rule: {0}")]
    UnknownRule(String),

    #[error("alert rule {0} has no active alert")]
    NotActive(String),

    #[error(transparent)]
    Config(#[from] vigil_core::ConfigError),
}

/// Why a rule could not be evaluated this cycle.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConditionError {
    #[error("metric {0} is not in the snapshot")]
    MissingMetric(String),

    #[error("metric {0} is NaN")]
    NotANumber(String),
}
