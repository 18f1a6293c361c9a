//! Chat orchestration error types.

use thiserror::Error;

use crate::agents::AgentError;
use crate::inference::InferenceError;
use crate::session::SessionError;
use crate::storage::StoreError;

/// Errors raised while handling a chat turn.
///
/// Most of these never escape `handle_chat`: they are folded into a
/// structured `status: "error"` response. [`ChatError::user_message`] is the
/// text shown in that case.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("llm call failed: {0}")]
    Inference(#[from] InferenceError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Over the per-minute request budget.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The confirm-id is unknown, expired, already used or owned by someone else.
    #[error("confirmation '{confirm_id}' rejected: {reason}")]
    Confirmation { confirm_id: String, reason: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("request cancelled")]
    Cancelled,
}

impl ChatError {
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Session(_) => "SESSION_ERROR",
            ChatError::Agent(_) => "AGENT_ERROR",
            ChatError::Inference(_) => "LLM_ERROR",
            ChatError::Store(_) => "STORE_ERROR",
            ChatError::RateLimited { .. } => "RATE_LIMITED",
            ChatError::Confirmation { .. } => "CONFIRMATION_INVALID",
            ChatError::InvalidRequest { .. } => "INVALID_REQUEST",
            ChatError::Cancelled => "CANCELLED",
        }
    }

    /// Friendly text for the response body. Internals stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            ChatError::RateLimited { retry_after_secs } => {
                format!("请求过于频繁，请在 {retry_after_secs} 秒后重试")
            }
            ChatError::Confirmation { .. } => "确认请求无效或已过期，操作已取消".to_string(),
            ChatError::InvalidRequest { reason } => format!("请求无效: {reason}"),
            ChatError::Cancelled => "请求已取消".to_string(),
            ChatError::Inference(_) => "AI 服务暂时不可用，请稍后重试".to_string(),
            _ => "处理请求时出错，请稍后重试".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_hides_internals() {
        let err = ChatError::Inference(InferenceError::HttpError {
            status: 500,
            body: "stack trace at line 42".into(),
        });
        assert_eq!(err.code(), "LLM_ERROR");
        assert!(!err.user_message().contains("stack"));
    }

    #[test]
    fn test_rate_limited_mentions_retry_after() {
        let err = ChatError::RateLimited {
            retry_after_secs: 17,
        };
        assert!(err.user_message().contains("17"));
    }
}
