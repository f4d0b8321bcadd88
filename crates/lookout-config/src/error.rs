//! Error types for lookout-config.

use thiserror::Error;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file '{path}': {reason}")]
    Read {
        /// The file path.
        path: String,
        /// The underlying I/O error.
        reason: String,
    },

    /// The configuration is not valid TOML or does not fit the model.
    #[error("invalid TOML: {reason}")]
    Parse {
        /// Parser message.
        reason: String,
    },

    /// A value failed validation.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field, e.g. `targets[0].timeout_secs`.
        field: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Reload was requested but the handle was not created from a file.
    #[error("no config file to reload from")]
    NoSource,
}

impl ConfigError {
    /// Shorthand for an `Invalid` error.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
