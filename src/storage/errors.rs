//! Storage error types.

use thiserror::Error;

/// Errors raised by the key-value store and the relational store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store cannot be reached.
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },

    /// A key holds a value of a different shape than the operation expects.
    #[error("wrong type for key '{key}': expected {expected}")]
    WrongType { key: String, expected: &'static str },

    /// A stored value could not be parsed as a number.
    #[error("value at '{key}' is not a number")]
    NotANumber { key: String },

    /// Relational database operation failed.
    #[error("database error: {reason}")]
    Database { reason: String },

    /// A row referenced by id or name does not exist.
    #[error("{entity} not found: '{key}'")]
    NotFound { entity: &'static str, key: String },

    /// Row content failed to (de)serialize.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },
}

impl StoreError {
    /// Whether this error means the store is unreachable (as opposed to a bad request).
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization {
            reason: e.to_string(),
        }
    }
}
