//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or preparing configuration.
///
/// Every variant is fatal: the server must not start with a configuration
/// it could not fully understand.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("failed to read configuration {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration document is not valid YAML or has unknown fields
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A domain or managed-certificate pattern failed to compile
    #[error("failed to compile {context} pattern {pattern:?}: {source}")]
    InvalidPattern {
        context: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A value is present but unusable
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
