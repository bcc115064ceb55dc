//! Health subsystem error types.
//!
//! These cover configuration mistakes only. Probe failures are reported as
//! critical `HealthCheckResult`s, never as errors.

use thiserror::Error;

/// Errors raised while building or querying the health manager.
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("duplicate health check: {0}")]
    DuplicateCheck(String),

    #[error("health check not found: {0}")]
    UnknownCheck(String),

    #[error("{check}: no probe registered for kind `{kind}`")]
    UnknownProbeKind { check: String, kind: String },

    #[error("{check}: failed to build probe: {source}")]
    ProbeFactory {
        check: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Config(#[from] vigil_core::ConfigError),
}

pub type HealthResult<T> = Result<T, HealthError>;
