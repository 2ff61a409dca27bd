//! Error types for bumpkit-core

use thiserror::Error;

/// Errors that can occur when working with configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error("invalid configuration: {0}")]
    Deserialize(#[from] Box<figment::Error>),

    /// A configured value is present but unusable.
    #[error("invalid configuration value for `{key}`: {message}")]
    InvalidValue {
        /// Dotted key path (e.g., `backup.retention_days`).
        key: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

/// Result type alias using [`ConfigError`].
pub type ConfigResult<T> = Result<T, ConfigError>;
