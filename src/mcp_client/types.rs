//! Shared types for the remote tool-server client.
//!
//! JSON-RPC 2.0 envelopes, the `tools/list` and `tools/call` payloads, and the
//! persisted server row.

use serde::{Deserialize, Serialize};

use crate::storage::HealthRecord;

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Methods spoken to remote tool servers.
pub mod methods {
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
}

// ─── Tool payloads ───────────────────────────────────────────────────────────

/// A tool advertised by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<RemoteToolDefinition>,
}

/// One content block of a `tools/call` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, rename = "isError", alias = "is_error")]
    pub is_error: bool,
}

impl CallToolResult {
    /// Collapse the blocks into a single JSON value.
    ///
    /// Exactly one text block yields its text; anything else yields the block list.
    pub fn into_value(self) -> serde_json::Value {
        match self.content.as_slice() {
            [ContentBlock {
                kind,
                text: Some(text),
                ..
            }] if kind == "text" => serde_json::Value::String(text.clone()),
            _ => serde_json::to_value(&self.content).unwrap_or(serde_json::Value::Null),
        }
    }

    /// Concatenated text of every text block (used for error messages).
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ─── Server row ──────────────────────────────────────────────────────────────

/// A persisted remote tool server row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteServerRecord {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    /// Only `http` is supported.
    #[serde(default = "default_transport")]
    pub transport: String,
    pub endpoint: String,
    /// Probed instead of `tools/list` when set.
    #[serde(default)]
    pub health_check_url: Option<String>,
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Deployment environments allowed to call this server. Empty allows all.
    #[serde(default)]
    pub allowed_envs: Vec<String>,
    /// Tool-name prefixes that may be called. Empty allows all.
    #[serde(default)]
    pub allowed_prefixes: Vec<String>,
    /// Caller IPs allowed to call. Empty allows all.
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub health: HealthRecord,
    #[serde(default)]
    pub updated_at: i64,
}

fn default_transport() -> String {
    "http".into()
}
fn default_health_interval() -> u64 {
    60
}
fn default_timeout() -> u64 {
    30
}
fn default_enabled() -> bool {
    true
}

impl RemoteServerRecord {
    pub fn new(name: &str, endpoint: &str) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            transport: default_transport(),
            endpoint: endpoint.to_string(),
            health_check_url: None,
            health_check_interval_secs: default_health_interval(),
            timeout_secs: default_timeout(),
            allowed_envs: Vec::new(),
            allowed_prefixes: Vec::new(),
            allowed_ips: Vec::new(),
            enabled: true,
            health: HealthRecord::default(),
            updated_at: 0,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_omits_empty_params() {
        let req = JsonRpcRequest::new(1, methods::TOOLS_LIST, None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"tools/list\""));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_error_response() {
        let json = r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"Method not found"}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.error.unwrap().code, -32601);
        assert!(resp.result.is_none());
    }

    #[test]
    fn test_single_text_block_collapses() {
        let result: CallToolResult = serde_json::from_str(
            r#"{"content":[{"type":"text","text":"3 pods running"}],"isError":false}"#,
        )
        .unwrap();
        assert_eq!(result.into_value(), serde_json::json!("3 pods running"));
    }

    #[test]
    fn test_multiple_blocks_stay_a_list() {
        let result: CallToolResult = serde_json::from_str(
            r#"{"content":[{"type":"text","text":"a"},{"type":"text","text":"b"}]}"#,
        )
        .unwrap();
        assert!(!result.is_error);
        let value = result.into_value();
        assert_eq!(value.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn test_server_record_defaults() {
        let rec: RemoteServerRecord =
            serde_json::from_str(r#"{"name":"k8s","endpoint":"http://k8s:9000/rpc"}"#).unwrap();
        assert_eq!(rec.transport, "http");
        assert_eq!(rec.timeout_secs, 30);
        assert!(rec.enabled);
    }
}
