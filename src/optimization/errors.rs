//! Optimization error types.

use thiserror::Error;

use crate::config::ConfigError;
use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum OptimizationError {
    /// A config blob parsed but its values are unusable.
    #[error("invalid {config_type} config: {reason}")]
    InvalidConfig {
        config_type: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("optimization store error: {0}")]
    Store(#[from] StoreError),

    /// A fan-out work unit panicked or was aborted.
    #[error("work unit {index} failed: {reason}")]
    TaskFailed { index: usize, reason: String },

    /// The token fired before the unit got a concurrency slot, so it never ran.
    #[error("work unit {index} cancelled before it started")]
    NotStarted { index: usize },
}
