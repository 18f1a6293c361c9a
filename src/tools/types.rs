//! Tool definitions and per-call types.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::ToolError;

// ─── RiskLevel ───────────────────────────────────────────────────────────────

/// Declared or detected risk of running a tool. Ordered `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = ToolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            other => Err(ToolError::InvalidDefinition {
                tool: String::new(),
                reason: format!("unknown risk level '{other}'"),
            }),
        }
    }
}

// ─── Implementation kinds ────────────────────────────────────────────────────

/// HTTP method for API-backed tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    /// Whether arguments travel as a JSON body (otherwise as query parameters).
    pub fn sends_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put)
    }
}

/// Where a tool's work actually happens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolImplementation {
    /// A handler registered in-process under `handler`.
    Native { handler: String },
    /// An HTTP endpoint at `base_url` + `path`.
    Api {
        method: HttpMethod,
        base_url: String,
        #[serde(default)]
        path: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// A tool exposed by a remote JSON-RPC tool server.
    RemoteServer {
        server_id: i64,
        /// Name on the remote side; defaults to the local tool name.
        #[serde(default)]
        remote_name: Option<String>,
    },
    /// A query against a knowledge provider.
    Knowledge { provider_id: i64 },
}

impl ToolImplementation {
    pub fn kind(&self) -> &'static str {
        match self {
            ToolImplementation::Native { .. } => "native",
            ToolImplementation::Api { .. } => "api",
            ToolImplementation::RemoteServer { .. } => "remote_server",
            ToolImplementation::Knowledge { .. } => "knowledge",
        }
    }

    pub fn is_knowledge(&self) -> bool {
        matches!(self, ToolImplementation::Knowledge { .. })
    }
}

// ─── ToolConfig ──────────────────────────────────────────────────────────────

/// A persisted tool row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    /// What the LLM reads when deciding whether to call the tool.
    #[serde(default)]
    pub description: String,
    pub implementation: ToolImplementation,
    /// JSON Schema for the arguments. `None` means a single `query` string.
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub updated_at: i64,
}

fn default_enabled() -> bool {
    true
}

impl ToolConfig {
    pub fn new(name: &str, description: &str, implementation: ToolImplementation) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            description: description.to_string(),
            implementation,
            parameters: None,
            risk_level: RiskLevel::Low,
            enabled: true,
            updated_at: 0,
        }
    }

    /// The parameter schema presented to the LLM.
    pub fn parameter_schema(&self) -> Value {
        self.parameters.clone().unwrap_or_else(default_query_schema)
    }

    /// Name used on the remote side for remote-server tools.
    pub fn remote_name(&self) -> &str {
        match &self.implementation {
            ToolImplementation::RemoteServer {
                remote_name: Some(n),
                ..
            } if !n.is_empty() => n,
            _ => &self.name,
        }
    }

    pub fn validate(&self) -> Result<(), ToolError> {
        let invalid = |reason: String| ToolError::InvalidDefinition {
            tool: self.name.clone(),
            reason,
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".into()));
        }
        match &self.implementation {
            ToolImplementation::Native { handler } if handler.is_empty() => {
                Err(invalid("native tool needs a handler name".into()))
            }
            ToolImplementation::Api { base_url, .. } if base_url.is_empty() => {
                Err(invalid("api tool needs a base_url".into()))
            }
            _ => match &self.parameters {
                Some(schema) if !schema.is_object() => {
                    Err(invalid("parameters must be a JSON object schema".into()))
                }
                _ => Ok(()),
            },
        }
    }
}

/// Schema used for tools that declare no parameters.
pub fn default_query_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": "The user's question or search query"
            }
        },
        "required": ["query"]
    })
}

// ─── Call context and outcomes ───────────────────────────────────────────────

/// Caller metadata carried with every dispatch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolCallContext {
    pub trace_id: String,
    pub user_id: String,
    pub session_id: String,
    /// Knowledge providers that support multi-turn use this.
    pub conversation_id: Option<String>,
    /// Deployment environment from the client context (e.g. "prod").
    pub env: Option<String>,
    pub caller_ip: Option<String>,
}

/// Instrumentation for one dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct ToolExecution {
    pub tool_name: String,
    pub kind: &'static str,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub duration_ms: u64,
    pub success: bool,
}
