//! Remote tool-server client.
//!
//! Talks JSON-RPC 2.0 over HTTP to external tool servers:
//! - `client`: one connection, `tools/list` and `tools/call`
//! - `manager`: handshake, health tickers, lookup by server id, allow-lists

pub mod client;
pub mod errors;
pub mod manager;
pub mod types;

pub use client::RemoteToolClient;
pub use errors::McpError;
pub use manager::{check_access, RemoteServerManager, ServerStatus};
pub use types::{CallToolResult, ContentBlock, RemoteServerRecord, RemoteToolDefinition};
