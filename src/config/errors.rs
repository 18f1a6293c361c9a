//! Configuration error types.

use thiserror::Error;

use crate::storage::StoreError;

/// Errors raised while reading or applying configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The relational store could not be read.
    #[error("config store error: {0}")]
    Store(#[from] StoreError),

    /// A stored value is not valid JSON (after placeholder expansion).
    #[error("failed to parse config '{key}': {reason}")]
    Parse { key: String, reason: String },

    /// A parsed value is missing required fields or violates a constraint.
    #[error("invalid config '{key}': {reason}")]
    Invalid { key: String, reason: String },

    /// The bootstrap settings file could not be read.
    #[error("failed to read {path}: {reason}")]
    Io { path: String, reason: String },

    /// A registered component failed to apply new configuration.
    #[error("reload of '{component}' failed: {reason}")]
    Reload { component: String, reason: String },
}
