//! Scripted in-process chat model for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::client::ChatModel;
use super::errors::InferenceError;
use super::types::{
    AssistantMessage, ChatCompletionRequest, ChatCompletionResponse, Choice, ToolCall, Usage,
};

/// Replays queued responses in order and records every request it receives.
///
/// When the queue runs dry it answers with the fallback text.
pub struct ScriptedChatModel {
    replies: Mutex<VecDeque<Result<ChatCompletionResponse, InferenceError>>>,
    requests: Mutex<Vec<ChatCompletionRequest>>,
    fallback: String,
}

impl ScriptedChatModel {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            fallback: "ok".to_string(),
        }
    }

    pub fn push_text(&self, text: &str) -> &Self {
        self.push(Ok(response(Some(text.to_string()), Vec::new())))
    }

    /// Queue a reply that requests tool calls, given as `(name, raw_arguments)`.
    pub fn push_tool_calls(&self, calls: &[(&str, &str)]) -> &Self {
        let calls = calls
            .iter()
            .enumerate()
            .map(|(i, (name, args))| ToolCall {
                id: format!("call_{i}"),
                name: name.to_string(),
                arguments: args.to_string(),
            })
            .collect();
        self.push(Ok(response(None, calls)))
    }

    pub fn push_error(&self, error: InferenceError) -> &Self {
        self.push(Err(error))
    }

    fn push(&self, reply: Result<ChatCompletionResponse, InferenceError>) -> &Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
        self
    }

    pub fn requests(&self) -> Vec<ChatCompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

impl Default for ScriptedChatModel {
    fn default() -> Self {
        Self::new()
    }
}

fn response(content: Option<String>, tool_calls: Vec<ToolCall>) -> ChatCompletionResponse {
    ChatCompletionResponse {
        model: String::new(),
        choices: vec![Choice {
            message: AssistantMessage {
                content,
                tool_calls,
            },
            finish_reason: Some("stop".into()),
        }],
        usage: Usage {
            prompt_tokens: 100,
            completion_tokens: 20,
            total_tokens: 120,
        },
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    async fn chat_completion(
        &self,
        token: &CancellationToken,
        request: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, InferenceError> {
        if token.is_cancelled() {
            return Err(InferenceError::Cancelled);
        }
        let model = request.model.clone();
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let next = self.replies.lock().ok().and_then(|mut r| r.pop_front());
        match next {
            Some(Ok(mut resp)) => {
                resp.model = model;
                Ok(resp)
            }
            Some(Err(e)) => Err(e),
            None => {
                let mut resp = response(Some(self.fallback.clone()), Vec::new());
                resp.model = model;
                Ok(resp)
            }
        }
    }
}
