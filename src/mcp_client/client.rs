//! JSON-RPC 2.0 over HTTP client for one remote tool server.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::Client as HttpClient;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::errors::McpError;
use super::types::{
    methods, CallToolResult, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
    RemoteServerRecord, RemoteToolDefinition,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout for server calls.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// JSON-RPC "internal error" code used when a response has neither field.
const INTERNAL_ERROR: i32 = -32603;

// ─── RemoteToolClient ────────────────────────────────────────────────────────

pub struct RemoteToolClient {
    server: String,
    endpoint: String,
    http: HttpClient,
    timeout: Duration,
    next_id: AtomicU64,
}

impl RemoteToolClient {
    pub fn new(record: &RemoteServerRecord) -> Result<Self, McpError> {
        if record.transport != "http" {
            return Err(McpError::ConfigError {
                reason: format!(
                    "server '{}' uses unsupported transport '{}'",
                    record.name, record.transport
                ),
            });
        }
        if record.endpoint.trim().is_empty() {
            return Err(McpError::ConfigError {
                reason: format!("server '{}' has no endpoint", record.name),
            });
        }
        let timeout = Duration::from_secs(record.timeout_secs.max(1));
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()
            .map_err(|e| McpError::ConfigError {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            server: record.name.clone(),
            endpoint: record.endpoint.clone(),
            http,
            timeout,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn server_name(&self) -> &str {
        &self.server
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send one JSON-RPC request and return its `result`.
    pub async fn request(
        &self,
        token: &CancellationToken,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, McpError> {
        let id = self.next_request_id();
        let request = JsonRpcRequest::new(id, method, params);

        let send = async {
            let response = self
                .http
                .post(&self.endpoint)
                .json(&request)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        McpError::Timeout {
                            server: self.server.clone(),
                            method: method.to_string(),
                            timeout_ms: self.timeout.as_millis() as u64,
                        }
                    } else {
                        McpError::TransportError {
                            server: self.server.clone(),
                            reason: e.to_string(),
                        }
                    }
                })?;

            let status = response.status();
            let body = response.text().await.map_err(|e| McpError::TransportError {
                server: self.server.clone(),
                reason: e.to_string(),
            })?;
            if !status.is_success() {
                return Err(McpError::HttpStatus {
                    server: self.server.clone(),
                    status: status.as_u16(),
                    body,
                });
            }
            serde_json::from_str::<JsonRpcResponse>(&body).map_err(|e| {
                McpError::InvalidResponse {
                    server: self.server.clone(),
                    reason: e.to_string(),
                }
            })
        };

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(McpError::Cancelled { server: self.server.clone() }),
            r = send => r?,
        };

        if response.id.is_some_and(|rid| rid != id) {
            tracing::warn!(
                server = %self.server,
                expected = id,
                got = ?response.id,
                "json-rpc response id mismatch"
            );
        }
        extract_result(response)
    }

    /// `tools/list`, used as the connection handshake.
    pub async fn list_tools(
        &self,
        token: &CancellationToken,
    ) -> Result<Vec<RemoteToolDefinition>, McpError> {
        let result = self.request(token, methods::TOOLS_LIST, None).await?;
        let parsed: ListToolsResult =
            serde_json::from_value(result).map_err(|e| McpError::InvalidResponse {
                server: self.server.clone(),
                reason: format!("bad tools/list result: {e}"),
            })?;
        Ok(parsed.tools)
    }

    /// `tools/call` with `{name, arguments}`.
    pub async fn call_tool(
        &self,
        token: &CancellationToken,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolResult, McpError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        let result = self.request(token, methods::TOOLS_CALL, Some(params)).await?;
        serde_json::from_value(result).map_err(|e| McpError::InvalidResponse {
            server: self.server.clone(),
            reason: format!("bad tools/call result: {e}"),
        })
    }

    /// Probe the server. A dedicated health URL gets a plain GET; otherwise
    /// `tools/list` doubles as the probe.
    pub async fn health(
        &self,
        token: &CancellationToken,
        health_url: Option<&str>,
    ) -> Result<(), McpError> {
        let Some(url) = health_url.filter(|u| !u.is_empty()) else {
            return self.list_tools(token).await.map(|_| ());
        };
        let probe = async {
            let response = self.http.get(url).send().await.map_err(|e| {
                McpError::TransportError {
                    server: self.server.clone(),
                    reason: e.to_string(),
                }
            })?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(McpError::HttpStatus {
                    server: self.server.clone(),
                    status: response.status().as_u16(),
                    body: response.text().await.unwrap_or_default(),
                })
            }
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(McpError::Cancelled { server: self.server.clone() }),
            r = probe => r,
        }
    }
}

/// Extract the result from a JSON-RPC response, converting errors.
pub fn extract_result(response: JsonRpcResponse) -> Result<Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client(url: &str) -> RemoteToolClient {
        RemoteToolClient::new(&RemoteServerRecord::new("ops", &format!("{url}/rpc"))).unwrap()
    }

    #[test]
    fn test_rejects_unsupported_transport() {
        let mut record = RemoteServerRecord::new("ops", "http://x/rpc");
        record.transport = "stdio".into();
        assert!(matches!(
            RemoteToolClient::new(&record),
            Err(McpError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_request_ids_increase() {
        let c = client("http://localhost:1");
        let a = c.next_request_id();
        let b = c.next_request_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_list_tools() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/rpc")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "jsonrpc": "2.0",
                "method": "tools/list"
            })))
            .with_status(200)
            .with_body(
                r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[
                    {"name":"pod_list","description":"List pods","inputSchema":{"type":"object"}}
                ]}}"#,
            )
            .create_async()
            .await;

        let tools = client(&server.url())
            .list_tools(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "pod_list");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_call_tool_sends_name_and_arguments() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/rpc")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "method": "tools/call",
                "params": {"name": "pod_list", "arguments": {"namespace": "prod"}}
            })))
            .with_status(200)
            .with_body(
                r#"{"jsonrpc":"2.0","id":1,"result":{"content":[{"type":"text","text":"3 pods"}],"isError":false}}"#,
            )
            .create_async()
            .await;

        let result = client(&server.url())
            .call_tool(
                &CancellationToken::new(),
                "pod_list",
                serde_json::json!({"namespace": "prod"}),
            )
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.into_value(), serde_json::json!("3 pods"));
    }

    #[tokio::test]
    async fn test_json_rpc_error_surfaces() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/rpc")
            .with_status(200)
            .with_body(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"no such tool"}}"#)
            .create_async()
            .await;

        let err = client(&server.url())
            .call_tool(&CancellationToken::new(), "nope", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServerError { code: -32601, .. }));
    }

    #[tokio::test]
    async fn test_http_status_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/rpc")
            .with_status(503)
            .with_body("down")
            .create_async()
            .await;

        let err = client(&server.url())
            .list_tools(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::HttpStatus { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let token = CancellationToken::new();
        token.cancel();
        let err = client("http://localhost:1")
            .list_tools(&token)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Cancelled { .. }));
    }

    #[test]
    fn test_extract_result_missing_both() {
        let response = JsonRpcResponse {
            id: Some(1),
            result: None,
            error: None,
        };
        assert!(matches!(
            extract_result(response),
            Err(McpError::ServerError { code: INTERNAL_ERROR, .. })
        ));
    }
}
