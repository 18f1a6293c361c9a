//! Inference client: OpenAI-compatible chat completions.
//!
//! The core talks to LLMs only through [`ChatModel`]. The HTTP implementation
//! speaks the OpenAI Chat Completions API, so switching providers is a
//! settings change, not a code change.

pub mod client;
pub mod config;
pub mod errors;
#[cfg(test)]
pub mod scripted;
pub mod types;

// Re-exports for convenience
pub use client::{ChatModel, ChatStream, OpenAiCompatibleClient};
pub use config::LlmSettings;
pub use errors::InferenceError;
pub use types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Role, ToolCall, ToolDefinition,
    Usage,
};
