//! Tool dispatch error types.

use thiserror::Error;

/// Errors raised while validating or executing a tool call.
///
/// Every variant maps to a stable machine code via [`ToolError::code`], which
/// is what ends up in the `tool.error.code` field of a chat response.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    /// The LLM's arguments were not valid JSON or failed the schema.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// The back end ran but reported failure.
    #[error("tool '{tool}' failed: {reason}")]
    ExecutionFailed { tool: String, reason: String },

    /// No enabled tool is registered under this name.
    #[error("unknown tool: '{name}'")]
    NotFound { name: String },

    /// A native tool points at a handler nobody registered.
    #[error("native handler not registered: '{handler}'")]
    HandlerNotRegistered { handler: String },

    /// HTTP transport failure (`status = None`) or a non-2xx response.
    #[error("http call for '{tool}' failed{}: {body}", .status.map(|s| format!(" with status {s}")).unwrap_or_default())]
    Http {
        tool: String,
        status: Option<u16>,
        body: String,
    },

    /// The remote tool server is not connected or not healthy.
    #[error("remote tool server {server_id} unavailable: {reason}")]
    RemoteServerUnavailable { server_id: i64, reason: String },

    /// The remote tool server answered with an error.
    #[error("remote tool '{tool}' returned an error: {message}")]
    RemoteTool { tool: String, message: String },

    /// The knowledge provider could not answer.
    #[error("knowledge query via '{provider}' failed: {reason}")]
    KnowledgeQueryFailed { provider: String, reason: String },

    /// An allow-list rejected the caller.
    #[error("access to '{tool}' denied: {reason}")]
    AccessDenied { tool: String, reason: String },

    /// The request was cancelled before the tool finished.
    #[error("tool '{tool}' cancelled")]
    Cancelled { tool: String },

    /// The tool did not finish within its deadline.
    #[error("tool '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    /// A tool row is malformed (admin surface only).
    #[error("invalid tool definition '{tool}': {reason}")]
    InvalidDefinition { tool: String, reason: String },
}

impl ToolError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::InvalidArguments { .. } => "INVALID_TOOL_ARGUMENTS",
            ToolError::ExecutionFailed { .. } => "TOOL_EXECUTION_FAILED",
            ToolError::NotFound { .. } => "TOOL_NOT_FOUND",
            ToolError::HandlerNotRegistered { .. } => "HANDLER_NOT_REGISTERED",
            ToolError::Http { .. } => "HTTP_ERROR",
            ToolError::RemoteServerUnavailable { .. } => "REMOTE_SERVER_UNAVAILABLE",
            ToolError::RemoteTool { .. } => "REMOTE_TOOL_ERROR",
            ToolError::KnowledgeQueryFailed { .. } => "KNOWLEDGE_QUERY_FAILED",
            ToolError::AccessDenied { .. } => "ACCESS_DENIED",
            ToolError::Cancelled { .. } => "CANCELLED",
            ToolError::Timeout { .. } => "TIMEOUT",
            ToolError::InvalidDefinition { .. } => "INVALID_TOOL_DEFINITION",
        }
    }

    /// Whether the retry handler should try again.
    ///
    /// Transport failures, 5xx/429 responses, timeouts and generic back-end
    /// failures are retried. Anything caused by the request itself, by
    /// configuration, or by cancellation is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ToolError::ExecutionFailed { .. }
            | ToolError::Timeout { .. }
            | ToolError::KnowledgeQueryFailed { .. } => true,
            ToolError::Http { status, .. } => match status {
                None => true,
                Some(s) => *s >= 500 || *s == 429,
            },
            _ => false,
        }
    }

    /// Back-end payload worth surfacing as `error.raw`, if any.
    pub fn raw(&self) -> Option<String> {
        match self {
            ToolError::Http { body, .. } if !body.is_empty() => Some(body.clone()),
            ToolError::RemoteTool { message, .. } => Some(message.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        let err = ToolError::InvalidArguments {
            tool: "t".into(),
            reason: "bad json".into(),
        };
        assert_eq!(err.code(), "INVALID_TOOL_ARGUMENTS");
        assert_eq!(
            ToolError::Cancelled { tool: "t".into() }.code(),
            "CANCELLED"
        );
    }

    #[test]
    fn test_retryable_classification() {
        let server_err = ToolError::Http {
            tool: "t".into(),
            status: Some(503),
            body: String::new(),
        };
        assert!(server_err.is_retryable());

        let client_err = ToolError::Http {
            tool: "t".into(),
            status: Some(400),
            body: "bad".into(),
        };
        assert!(!client_err.is_retryable());
        assert_eq!(client_err.raw().as_deref(), Some("bad"));

        assert!(!ToolError::NotFound { name: "t".into() }.is_retryable());
        assert!(!ToolError::Cancelled { tool: "t".into() }.is_retryable());
    }

    #[test]
    fn test_http_message_includes_status() {
        let err = ToolError::Http {
            tool: "t".into(),
            status: Some(404),
            body: "missing".into(),
        };
        assert_eq!(
            err.to_string(),
            "http call for 't' failed with status 404: missing"
        );
    }
}
