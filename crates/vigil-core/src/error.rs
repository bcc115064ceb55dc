//! Configuration error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for configuration loading and validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating `vigil.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("duplicate {section} name: {name}")]
    Duplicate { section: &'static str, name: String },

    #[error("{entry}: invalid duration for `{field}`: {value:?}")]
    InvalidDuration {
        entry: String,
        field: &'static str,
        value: String,
    },

    #[error("{entry}: {reason}")]
    Invalid { entry: String, reason: String },
}
