//! Remote tool-server client error types.

use thiserror::Error;

use crate::storage::StoreError;

/// Errors that can occur while talking to a remote tool server.
#[derive(Debug, Error)]
pub enum McpError {
    /// Connection refused, DNS failure, TLS failure and similar.
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// The server answered with a non-2xx HTTP status.
    #[error("server '{server}' returned HTTP {status}: {body}")]
    HttpStatus {
        server: String,
        status: u16,
        body: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The body was not a JSON-RPC response we understand.
    #[error("invalid response from server '{server}': {reason}")]
    InvalidResponse { server: String, reason: String },

    /// A request did not finish within the server's timeout.
    #[error("'{method}' on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    #[error("request to server '{server}' cancelled")]
    Cancelled { server: String },

    /// No client is connected under this id.
    #[error("remote server {server_id} is not connected")]
    NotConnected { server_id: i64 },

    /// The client exists but its last health probe failed.
    #[error("remote server '{name}' is unhealthy")]
    Unhealthy { name: String },

    /// Configuration error (bad endpoint, unsupported transport).
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    #[error("remote server store error: {0}")]
    Store(#[from] StoreError),
}
