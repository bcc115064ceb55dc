//! Engine error types.

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Failures while assembling the engine. A running engine does not fail;
/// probe, rule, and action problems are recorded as data.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] vigil_core::ConfigError),

    #[error(transparent)]
    Health(#[from] vigil_health::HealthError),

    #[error(transparent)]
    Alert(#[from] vigil_alert::AlertError),

    #[error(transparent)]
    Recovery(#[from] vigil_recovery::RecoveryError),
}
