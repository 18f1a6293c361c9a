//! Request and response envelope for one chat turn.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::{RiskLevel, ToolError};

// ─── Request ────────────────────────────────────────────────────────────────

/// Where the request came from. Fed into the system prompt and tool access checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientContext {
    pub busi_group_id: Option<String>,
    pub user_timezone: Option<String>,
    pub ui_language: Option<String>,
    pub env: Option<String>,
    pub caller_ip: Option<String>,
}

/// The user's answer to a pending confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationInput {
    pub confirm_id: String,
    /// `approve` or `reject`. Anything else is refused without consuming the slot.
    pub action: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub attachments: Vec<Value>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub client_context: ClientContext,
    #[serde(default)]
    pub confirmation: Option<ConfirmationInput>,
}

impl ChatRequest {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn in_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }
}

// ─── Response ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatStatus {
    Completed,
    PendingConfirmation,
    Error,
}

/// Which back end produced the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    KnowledgeBase,
    McpTool,
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    Markdown,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantReply {
    pub format: MessageFormat,
    pub content: String,
}

impl AssistantReply {
    pub fn markdown(content: impl Into<String>) -> Self {
        Self {
            format: MessageFormat::Markdown,
            content: content.into(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self {
            format: MessageFormat::Text,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub raw: Option<String>,
}

impl From<&ToolError> for ToolErrorInfo {
    fn from(e: &ToolError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
            raw: e.raw(),
        }
    }
}

/// Outcome of one tool call as reported to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub called: bool,
    pub name: String,
    pub status: ToolStatus,
    pub request: Value,
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorInfo>,
    pub cache_hit: bool,
}

impl ToolInfo {
    pub fn success(name: &str, request: Value, result: Value, cache_hit: bool) -> Self {
        Self {
            called: true,
            name: name.to_string(),
            status: ToolStatus::Success,
            request,
            result,
            error: None,
            cache_hit,
        }
    }

    pub fn failed(name: &str, request: Value, error: &ToolError) -> Self {
        Self {
            called: true,
            name: name.to_string(),
            status: ToolStatus::Failed,
            request,
            result: Value::Null,
            error: Some(error.into()),
            cache_hit: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedTool {
    pub name: String,
    pub request: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub confirm_id: String,
    pub risk_level: RiskLevel,
    pub summary: String,
    pub proposed_tool: ProposedTool,
    /// Unix seconds.
    pub expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

/// The uniform envelope returned for every turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub trace_id: String,
    pub session_id: String,
    pub status: ChatStatus,
    pub source: ResponseSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub assistant_message: AssistantReply,
    /// First tool of the turn, for clients that only read one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolInfo>,
    /// Every tool of the turn in the order the model requested them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_confirmation: Option<PendingConfirmation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Seconds to wait before retrying a rate-limited request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ChatResponse {
    pub fn completed(
        trace_id: &str,
        session_id: &str,
        source: ResponseSource,
        reply: AssistantReply,
    ) -> Self {
        Self {
            trace_id: trace_id.to_string(),
            session_id: session_id.to_string(),
            status: ChatStatus::Completed,
            source,
            conversation_id: None,
            assistant_message: reply,
            tool: None,
            tools: Vec::new(),
            pending_confirmation: None,
            error: None,
            retry_after: None,
        }
    }

    pub fn error(trace_id: &str, session_id: &str, code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status: ChatStatus::Error,
            error: Some(ErrorInfo {
                code: code.to_string(),
                message: message.clone(),
            }),
            ..Self::completed(
                trace_id,
                session_id,
                ResponseSource::Direct,
                AssistantReply::text(message),
            )
        }
    }

    /// Attach tool outcomes. `tool` mirrors the first entry.
    pub fn with_tools(mut self, tools: Vec<ToolInfo>) -> Self {
        self.tool = tools.first().cloned();
        self.tools = tools;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_accepts_minimal_body() {
        let req: ChatRequest = serde_json::from_str(r#"{"message":"hi"}"#).unwrap();
        assert_eq!(req.message, "hi");
        assert!(req.session_id.is_none());
        assert!(req.confirmation.is_none());

        let req: ChatRequest = serde_json::from_value(json!({
            "message": "",
            "client_context": {"env": "prod", "user_timezone": "Asia/Shanghai"},
            "confirmation": {"confirm_id": "c1", "action": "approve"}
        }))
        .unwrap();
        assert_eq!(req.client_context.env.as_deref(), Some("prod"));
        assert_eq!(req.confirmation.unwrap().action, "approve");
    }

    #[test]
    fn test_response_envelope_shape() {
        let resp = ChatResponse::completed("t", "s", ResponseSource::KnowledgeBase, AssistantReply::markdown("x"))
            .with_tools(vec![ToolInfo::success("kb", json!({"query": "q"}), json!({}), true)]);
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["status"], "completed");
        assert_eq!(v["source"], "knowledge_base");
        assert_eq!(v["assistant_message"]["format"], "markdown");
        assert_eq!(v["tool"]["name"], "kb");
        assert_eq!(v["tool"]["cache_hit"], true);
        assert_eq!(v["tools"].as_array().unwrap().len(), 1);
        assert!(v.get("pending_confirmation").is_none());
        assert!(v.get("retry_after").is_none());
    }

    #[test]
    fn test_failed_tool_carries_code() {
        let err = ToolError::NotFound { name: "x".into() };
        let info = ToolInfo::failed("x", json!({}), &err);
        assert_eq!(info.status, ToolStatus::Failed);
        assert_eq!(info.error.unwrap().code, "TOOL_NOT_FOUND");
    }

    #[test]
    fn test_error_envelope() {
        let resp = ChatResponse::error("t", "s", "RATE_LIMITED", "slow down");
        assert_eq!(resp.status, ChatStatus::Error);
        assert_eq!(resp.assistant_message.content, "slow down");
        assert_eq!(resp.error.unwrap().code, "RATE_LIMITED");
    }
}
