//! OpenAI-compatible chat-completion client.
//!
//! Sends batch (non-streaming) chat completion requests with bearer auth,
//! honouring the configured proxy and TLS-verification switch. The streaming
//! hook exists on [`ChatModel`] but is not implemented.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::config::LlmSettings;
use super::errors::InferenceError;
use super::types::{
    AssistantMessage, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice,
    StreamDelta, ToolCall, Usage,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Receiving end of a streamed completion.
pub type ChatStream = mpsc::Receiver<Result<StreamDelta, InferenceError>>;

// ─── ChatModel ───────────────────────────────────────────────────────────────

/// The one capability the core needs from an LLM provider.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Run a batch chat completion.
    async fn chat_completion(
        &self,
        token: &CancellationToken,
        request: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, InferenceError>;

    /// Streamed chat completion. Reserved; the default reports it as unimplemented.
    async fn chat_completion_stream(
        &self,
        _token: &CancellationToken,
        _request: ChatCompletionRequest,
    ) -> Result<ChatStream, InferenceError> {
        Err(InferenceError::NotImplemented {
            feature: "streaming chat completion",
        })
    }
}

// ─── OpenAiCompatibleClient ──────────────────────────────────────────────────

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiCompatibleClient {
    http: HttpClient,
    settings: LlmSettings,
}

impl OpenAiCompatibleClient {
    pub fn new(settings: LlmSettings) -> Result<Self, InferenceError> {
        let mut builder = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(settings.timeout())
            .danger_accept_invalid_certs(settings.insecure_skip_verify);

        if let Some(proxy) = settings.proxy.as_deref().filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy).map_err(|e| InferenceError::ConfigError {
                reason: format!("invalid proxy '{proxy}': {e}"),
            })?;
            builder = builder.proxy(proxy);
        }

        let http = builder.build().map_err(|e| InferenceError::ConfigError {
            reason: format!("failed to build HTTP client: {e}"),
        })?;

        Ok(Self { http, settings })
    }

    pub fn settings(&self) -> &LlmSettings {
        &self.settings
    }

    async fn send(&self, body: &Value) -> Result<ChatCompletionResponse, InferenceError> {
        let url = self.settings.completions_url();
        let mut request = self.http.post(&url).json(body);
        if let Some(key) = self.settings.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: self.settings.timeout_secs,
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let body_text = response
            .text()
            .await
            .map_err(|e| InferenceError::InvalidResponse {
                reason: format!("failed to read response body: {e}"),
            })?;

        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default();
        parse_completion_response(&body_text, model)
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatibleClient {
    async fn chat_completion(
        &self,
        token: &CancellationToken,
        request: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, InferenceError> {
        let body = build_request_body(&request);
        let start = Instant::now();

        tracing::info!(
            model = %request.model,
            message_count = request.messages.len(),
            tool_count = request.tools.len(),
            max_tokens = request.max_tokens,
            "llm request"
        );

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(InferenceError::Cancelled),
            result = self.send(&body) => result,
        };

        match &result {
            Ok(resp) => tracing::info!(
                model = %resp.model,
                prompt_tokens = resp.usage.prompt_tokens,
                completion_tokens = resp.usage.completion_tokens,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "llm response"
            ),
            Err(e) => tracing::warn!(
                model = %request.model,
                error = %e,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "llm request failed"
            ),
        }
        result
    }
}

// ─── Wire format ─────────────────────────────────────────────────────────────

/// Build the JSON body for `POST /chat/completions`.
///
/// Custom params are written first so the core fields always win.
pub fn build_request_body(request: &ChatCompletionRequest) -> Value {
    let mut body = Map::new();
    for (key, value) in &request.custom_params {
        body.insert(key.clone(), value.clone());
    }

    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(prompt) = request
        .system_prompt
        .as_deref()
        .filter(|p| !p.trim().is_empty())
    {
        messages.push(ChatMessage::system(prompt));
    }
    messages.extend(request.messages.iter().cloned());

    body.insert("model".into(), Value::String(request.model.clone()));
    body.insert(
        "messages".into(),
        serde_json::to_value(&messages).unwrap_or(Value::Array(Vec::new())),
    );
    body.insert("temperature".into(), serde_json::json!(request.temperature));
    body.insert("max_tokens".into(), serde_json::json!(request.max_tokens));
    body.insert("stream".into(), Value::Bool(false));

    if !request.tools.is_empty() {
        body.insert(
            "tools".into(),
            serde_json::to_value(&request.tools).unwrap_or(Value::Array(Vec::new())),
        );
        body.insert(
            "tool_choice".into(),
            Value::String(
                request
                    .tool_choice
                    .clone()
                    .unwrap_or_else(|| "auto".to_string()),
            ),
        );
    }

    Value::Object(body)
}

/// Parse a non-streaming chat-completion response body.
///
/// Tool calls without an id get a generated `call_<uuid>`. Arguments are kept
/// as the raw string; an endpoint that returns an object has it re-serialized.
pub fn parse_completion_response(
    body: &str,
    requested_model: &str,
) -> Result<ChatCompletionResponse, InferenceError> {
    #[derive(Deserialize)]
    struct WireResponse {
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        choices: Vec<WireChoice>,
        #[serde(default)]
        usage: Option<Usage>,
    }

    #[derive(Deserialize)]
    struct WireChoice {
        message: WireMessage,
        #[serde(default)]
        finish_reason: Option<String>,
    }

    #[derive(Deserialize)]
    struct WireMessage {
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        tool_calls: Option<Vec<WireToolCall>>,
    }

    #[derive(Deserialize)]
    struct WireToolCall {
        #[serde(default)]
        id: Option<String>,
        function: WireFunction,
    }

    #[derive(Deserialize)]
    struct WireFunction {
        name: String,
        #[serde(default)]
        arguments: Value,
    }

    let resp: WireResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::InvalidResponse {
            reason: format!("failed to parse chat completion: {e}"),
        })?;

    if resp.choices.is_empty() {
        return Err(InferenceError::InvalidResponse {
            reason: "empty choices array".into(),
        });
    }

    let choices = resp
        .choices
        .into_iter()
        .map(|choice| {
            let tool_calls = choice
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|tc| ToolCall {
                    id: tc
                        .id
                        .filter(|id| !id.is_empty())
                        .unwrap_or_else(|| format!("call_{}", Uuid::new_v4())),
                    name: tc.function.name,
                    arguments: match tc.function.arguments {
                        Value::String(s) => s,
                        Value::Null => String::new(),
                        other => other.to_string(),
                    },
                })
                .collect();
            Choice {
                message: AssistantMessage {
                    content: choice.message.content.filter(|c| !c.is_empty()),
                    tool_calls,
                },
                finish_reason: choice.finish_reason,
            }
        })
        .collect();

    let mut usage = resp.usage.unwrap_or_default();
    if usage.total_tokens == 0 {
        usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
    }

    Ok(ChatCompletionResponse {
        model: resp
            .model
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| requested_model.to_string()),
        choices,
        usage,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::ToolDefinition;
    use mockito::Matcher;

    fn request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "qwen-plus".into(),
            messages: vec![ChatMessage::user("hello")],
            system_prompt: Some("be brief".into()),
            temperature: 0.2,
            max_tokens: 256,
            ..Default::default()
        }
    }

    fn settings(base_url: String) -> LlmSettings {
        LlmSettings {
            base_url,
            api_key: Some("sk-test".into()),
            ..LlmSettings::default()
        }
    }

    #[test]
    fn test_body_prepends_system_prompt() {
        let body = build_request_body(&request());
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "be brief");
        assert_eq!(body["messages"][1]["role"], "user");
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn test_body_merges_custom_params_without_overriding() {
        let mut req = request();
        req.custom_params.insert("top_p".into(), serde_json::json!(0.8));
        req.custom_params.insert("model".into(), serde_json::json!("sneaky"));
        req.tools = vec![ToolDefinition::function(
            "kb",
            "search",
            serde_json::json!({"type": "object"}),
        )];
        let body = build_request_body(&req);
        assert_eq!(body["top_p"], 0.8);
        assert_eq!(body["model"], "qwen-plus");
        assert_eq!(body["tool_choice"], "auto");
    }

    #[test]
    fn test_parse_text_response() {
        let body = r#"{
            "model": "qwen-plus",
            "choices": [{"message": {"role": "assistant", "content": "Hi!"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }"#;
        let resp = parse_completion_response(body, "fallback").unwrap();
        assert_eq!(resp.text(), "Hi!");
        assert_eq!(resp.usage.total_tokens, 15);
        assert_eq!(resp.model, "qwen-plus");
    }

    #[test]
    fn test_parse_tool_calls_keeps_raw_arguments() {
        let body = r#"{
            "choices": [{"message": {"content": null, "tool_calls": [
                {"id": "call_a", "type": "function", "function": {"name": "kb", "arguments": "{\"query\":\"x\"}"}},
                {"type": "function", "function": {"name": "sql", "arguments": {"sql": "SELECT 1"}}}
            ]}, "finish_reason": "tool_calls"}]
        }"#;
        let resp = parse_completion_response(body, "m").unwrap();
        let msg = resp.message();
        assert!(msg.content.is_none());
        assert_eq!(msg.tool_calls.len(), 2);
        assert_eq!(msg.tool_calls[0].arguments, r#"{"query":"x"}"#);
        assert!(msg.tool_calls[1].id.starts_with("call_"));
        assert_eq!(
            msg.tool_calls[1].parse_arguments().unwrap()["sql"],
            "SELECT 1"
        );
        assert_eq!(resp.model, "m");
    }

    #[test]
    fn test_parse_empty_choices_fails() {
        assert!(parse_completion_response(r#"{"choices": []}"#, "m").is_err());
        assert!(parse_completion_response("not json", "m").is_err());
    }

    #[tokio::test]
    async fn test_chat_completion_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "model": "qwen-plus",
                "stream": false
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"choices":[{"message":{"content":"pong"},"finish_reason":"stop"}],
                    "usage":{"prompt_tokens":5,"completion_tokens":1}}"#,
            )
            .create_async()
            .await;

        let client = OpenAiCompatibleClient::new(settings(server.url())).unwrap();
        let resp = client
            .chat_completion(&CancellationToken::new(), request())
            .await
            .unwrap();
        assert_eq!(resp.text(), "pong");
        assert_eq!(resp.usage.total_tokens, 6);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_chat_completion_http_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_body("invalid api key")
            .create_async()
            .await;

        let client = OpenAiCompatibleClient::new(settings(server.url())).unwrap();
        let err = client
            .chat_completion(&CancellationToken::new(), request())
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::HttpError { status: 401, .. }));
        assert_eq!(err.error_body(), Some("invalid api key"));
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let client =
            OpenAiCompatibleClient::new(settings("http://10.255.255.1:9".into())).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let err = client.chat_completion(&token, request()).await.unwrap_err();
        assert!(matches!(err, InferenceError::Cancelled));
    }

    #[tokio::test]
    async fn test_streaming_hook_not_implemented() {
        let client = OpenAiCompatibleClient::new(LlmSettings::default()).unwrap();
        let err = client
            .chat_completion_stream(&CancellationToken::new(), request())
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::NotImplemented { .. }));
    }
}
