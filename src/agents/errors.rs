//! Agent registry error types.

use thiserror::Error;

use crate::storage::StoreError;

/// Errors raised while loading, validating or routing agents.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Relational store failed while loading or saving agents.
    #[error("agent store error: {0}")]
    Store(#[from] StoreError),

    /// An agent row failed validation.
    #[error("invalid agent '{name}': {reason}")]
    Invalid { name: String, reason: String },

    /// No agent with this name is loaded.
    #[error("agent not found: '{name}'")]
    NotFound { name: String },

    /// No agent could be selected, not even the defaults.
    #[error("no agent available to handle the request")]
    NoAgentAvailable,
}
