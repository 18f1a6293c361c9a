//! Routes one tool invocation to its back end by implementation kind.
//!
//! - native: handler looked up by name in the process-local table
//! - api: HTTP call, JSON body for POST/PUT, query string otherwise
//! - remote_server: `tools/call` on a connected JSON-RPC server
//! - knowledge: the tool registry's knowledge path

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::errors::ToolError;
use super::native::NativeHandlerRegistry;
use super::registry::ToolRegistry;
use super::types::{HttpMethod, ToolCallContext, ToolConfig, ToolExecution, ToolImplementation};
use crate::mcp_client::{check_access, McpError, RemoteServerManager};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Request timeout for API-kind tools.
const API_TIMEOUT: Duration = Duration::from_secs(30);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Knowledge seam ──────────────────────────────────────────────────────────

/// Executes knowledge-kind tools. The tool registry implements this so the
/// dispatcher never holds the registry's concrete type.
#[async_trait]
pub trait KnowledgeExecutor: Send + Sync {
    async fn execute_knowledge(
        &self,
        token: &CancellationToken,
        ctx: &ToolCallContext,
        tool: &ToolConfig,
        args: &Value,
    ) -> Result<Value, ToolError>;
}

#[async_trait]
impl KnowledgeExecutor for ToolRegistry {
    async fn execute_knowledge(
        &self,
        token: &CancellationToken,
        ctx: &ToolCallContext,
        tool: &ToolConfig,
        args: &Value,
    ) -> Result<Value, ToolError> {
        ToolRegistry::execute_knowledge(self, token, ctx, tool, args).await
    }
}

// ─── ToolDispatcher ──────────────────────────────────────────────────────────

pub struct ToolDispatcher {
    http: HttpClient,
    natives: Arc<NativeHandlerRegistry>,
    servers: Arc<RemoteServerManager>,
    knowledge: Arc<dyn KnowledgeExecutor>,
}

impl ToolDispatcher {
    pub fn new(
        natives: Arc<NativeHandlerRegistry>,
        servers: Arc<RemoteServerManager>,
        knowledge: Arc<dyn KnowledgeExecutor>,
    ) -> Result<Self, ToolError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(API_TIMEOUT)
            .build()
            .map_err(|e| ToolError::ExecutionFailed {
                tool: "*".into(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            natives,
            servers,
            knowledge,
        })
    }

    pub fn natives(&self) -> &Arc<NativeHandlerRegistry> {
        &self.natives
    }

    /// Validate and run one call.
    pub async fn dispatch(
        &self,
        token: &CancellationToken,
        ctx: &ToolCallContext,
        tool: &ToolConfig,
        args: &Value,
    ) -> Result<Value, ToolError> {
        self.execute(token, ctx, tool, args).await.0
    }

    /// Like [`dispatch`](Self::dispatch) but also returns timing.
    pub async fn execute(
        &self,
        token: &CancellationToken,
        ctx: &ToolCallContext,
        tool: &ToolConfig,
        args: &Value,
    ) -> (Result<Value, ToolError>, ToolExecution) {
        let started_at = chrono::Utc::now();
        let start = Instant::now();

        let result = match validate_arguments(tool, args) {
            Ok(()) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(ToolError::Cancelled { tool: tool.name.clone() }),
                    r = self.route(token, ctx, tool, args) => r,
                }
            }
            Err(e) => Err(e),
        };

        let execution = ToolExecution {
            tool_name: tool.name.clone(),
            kind: tool.implementation.kind(),
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            success: result.is_ok(),
        };
        match &result {
            Ok(_) => tracing::info!(
                trace_id = %ctx.trace_id,
                tool = %tool.name,
                kind = execution.kind,
                elapsed_ms = execution.duration_ms,
                "tool executed"
            ),
            Err(e) => tracing::warn!(
                trace_id = %ctx.trace_id,
                tool = %tool.name,
                kind = execution.kind,
                elapsed_ms = execution.duration_ms,
                code = e.code(),
                error = %e,
                "tool failed"
            ),
        }
        (result, execution)
    }

    async fn route(
        &self,
        token: &CancellationToken,
        ctx: &ToolCallContext,
        tool: &ToolConfig,
        args: &Value,
    ) -> Result<Value, ToolError> {
        match &tool.implementation {
            ToolImplementation::Native { handler } => {
                let handler = self.natives.get(handler)?;
                handler.call(token, ctx, args.clone()).await
            }
            ToolImplementation::Api {
                method,
                base_url,
                path,
                headers,
            } => {
                self.call_api(&tool.name, *method, base_url, path, headers, args)
                    .await
            }
            ToolImplementation::RemoteServer { server_id, .. } => {
                self.call_remote(token, ctx, tool, *server_id, args).await
            }
            ToolImplementation::Knowledge { .. } => {
                self.knowledge.execute_knowledge(token, ctx, tool, args).await
            }
        }
    }

    async fn call_api(
        &self,
        tool: &str,
        method: HttpMethod,
        base_url: &str,
        path: &str,
        headers: &HashMap<String, String>,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let url = if path.is_empty() {
            base_url.to_string()
        } else {
            format!(
                "{}/{}",
                base_url.trim_end_matches('/'),
                path.trim_start_matches('/')
            )
        };

        let mut request = match method {
            HttpMethod::Get => self.http.get(&url),
            HttpMethod::Post => self.http.post(&url),
            HttpMethod::Put => self.http.put(&url),
            HttpMethod::Delete => self.http.delete(&url),
        };
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request = if method.sends_body() {
            request.json(args)
        } else {
            request.query(&query_pairs(args))
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ToolError::Timeout {
                    tool: tool.to_string(),
                    timeout_ms: API_TIMEOUT.as_millis() as u64,
                }
            } else {
                ToolError::Http {
                    tool: tool.to_string(),
                    status: None,
                    body: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| ToolError::Http {
            tool: tool.to_string(),
            status: Some(status.as_u16()),
            body: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(ToolError::Http {
                tool: tool.to_string(),
                status: Some(status.as_u16()),
                body,
            });
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }

    async fn call_remote(
        &self,
        token: &CancellationToken,
        ctx: &ToolCallContext,
        tool: &ToolConfig,
        server_id: i64,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let client = self
            .servers
            .client(server_id)
            .map_err(|e| ToolError::RemoteServerUnavailable {
                server_id,
                reason: e.to_string(),
            })?;
        let remote_name = tool.remote_name();

        if let Some(record) = self.servers.record(server_id) {
            check_access(
                &record,
                remote_name,
                ctx.env.as_deref(),
                ctx.caller_ip.as_deref(),
            )
            .map_err(|reason| ToolError::AccessDenied {
                tool: tool.name.clone(),
                reason,
            })?;
        }

        let result = client
            .call_tool(token, remote_name, args.clone())
            .await
            .map_err(|e| map_remote_error(&tool.name, server_id, e))?;
        if result.is_error {
            return Err(ToolError::RemoteTool {
                tool: tool.name.clone(),
                message: result.text(),
            });
        }
        Ok(result.into_value())
    }
}

fn map_remote_error(tool: &str, server_id: i64, err: McpError) -> ToolError {
    match err {
        McpError::Cancelled { .. } => ToolError::Cancelled {
            tool: tool.to_string(),
        },
        McpError::Timeout { timeout_ms, .. } => ToolError::Timeout {
            tool: tool.to_string(),
            timeout_ms,
        },
        McpError::ServerError { code, message, .. } => ToolError::RemoteTool {
            tool: tool.to_string(),
            message: format!("[{code}] {message}"),
        },
        McpError::NotConnected { .. } | McpError::Unhealthy { .. } => {
            ToolError::RemoteServerUnavailable {
                server_id,
                reason: err.to_string(),
            }
        }
        other => ToolError::ExecutionFailed {
            tool: tool.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Arguments flattened to string query parameters.
fn query_pairs(args: &Value) -> Vec<(String, String)> {
    let Some(map) = args.as_object() else {
        return Vec::new();
    };
    map.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), value)
        })
        .collect()
}

/// Arguments must be an object carrying every `required` field of the schema.
pub fn validate_arguments(tool: &ToolConfig, args: &Value) -> Result<(), ToolError> {
    let invalid = |reason: String| ToolError::InvalidArguments {
        tool: tool.name.clone(),
        reason,
    };
    let Some(obj) = args.as_object() else {
        return Err(invalid("arguments must be a JSON object".into()));
    };
    let schema = tool.parameter_schema();
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            match obj.get(field) {
                None | Some(Value::Null) => {
                    return Err(invalid(format!("missing required field '{field}'")));
                }
                _ => {}
            }
        }
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
