//! Knowledge provider error types.

use thiserror::Error;

use crate::storage::StoreError;

/// Errors raised by knowledge providers and their registry.
///
/// Domain-level "nothing found" is not an error; providers report it through
/// `KnowledgeResponse::status`.
#[derive(Debug, Error)]
pub enum KnowledgeError {
    /// Transport failure (`status = None`) or a non-2xx response.
    #[error("provider '{provider}' http error{}: {body}", .status.map(|s| format!(" {s}")).unwrap_or_default())]
    Http {
        provider: String,
        status: Option<u16>,
        body: String,
    },

    /// The provider answered with something we could not parse.
    #[error("provider '{provider}' returned an invalid response: {reason}")]
    InvalidResponse { provider: String, reason: String },

    /// The provider's stored config is unusable.
    #[error("provider '{provider}' has invalid config: {reason}")]
    InvalidConfig { provider: String, reason: String },

    /// No client implementation exists for this provider type.
    #[error("unknown provider type '{provider_type}'")]
    UnknownType { provider_type: String },

    /// No provider is loaded under this id.
    #[error("knowledge provider {id} not loaded")]
    NotFound { id: i64 },

    /// The caller cancelled the request.
    #[error("knowledge query cancelled")]
    Cancelled,

    #[error("knowledge store error: {0}")]
    Store(#[from] StoreError),
}
