//! Session store error types.

use thiserror::Error;

use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The key-value store failed. Session writes never degrade silently.
    #[error("session store error: {0}")]
    Store(#[from] StoreError),

    #[error("session not found: '{session_id}'")]
    NotFound { session_id: String },

    #[error("session '{session_id}' belongs to another user")]
    NotOwner { session_id: String },

    /// A stored session or message could not be decoded.
    #[error("corrupt session data at '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}
