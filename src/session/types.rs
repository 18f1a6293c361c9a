//! Session and message shapes stored in the key-value store.

use serde::{Deserialize, Serialize};

use crate::inference::types::{ChatMessage, Role, ToolCallResponse};

/// Session metadata (`<prefix>session:<id>:meta`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    /// Free-form mode tag, e.g. `chat` or the agent the session was pinned to.
    #[serde(default)]
    pub mode: String,
    /// Unix milliseconds.
    pub created_at: i64,
    pub last_active_at: i64,
    #[serde(default)]
    pub message_count: u64,
}

/// One stored message. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// Unix milliseconds; non-decreasing within a session.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallResponse>>,
}

impl Message {
    /// A message not yet appended. Id and timestamp are assigned on append.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            role,
            content: content.into(),
            timestamp: 0,
            trace_id: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn with_trace(mut self, trace_id: &str) -> Self {
        self.trace_id = Some(trace_id.to_string());
        self
    }

    /// History entry for the LLM.
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: Some(self.content.clone()),
            tool_call_id: self.tool_call_id.clone(),
            tool_calls: self.tool_calls.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub user_id: String,
    pub message_count: u64,
    /// Messages currently retained after trimming.
    pub stored_messages: u64,
    pub user_messages: u64,
    pub assistant_messages: u64,
    pub created_at: i64,
    pub last_active_at: i64,
    pub duration_secs: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_json_roundtrip() {
        let mut msg = Message::new(Role::Assistant, "done").with_trace("t-1");
        msg.id = "m1".into();
        msg.timestamp = 42;
        let raw = serde_json::to_string(&msg).unwrap();
        assert!(!raw.contains("tool_calls"));
        let back: Message = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_to_chat_message() {
        let chat = Message::new(Role::User, "hi").to_chat_message();
        assert_eq!(chat.role, Role::User);
        assert_eq!(chat.content.as_deref(), Some("hi"));
    }
}
