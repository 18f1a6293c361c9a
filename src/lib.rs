//! AI assistant core for a monitoring platform.
//!
//! A chat turn enters through [`services::Services::handle_chat`], is routed
//! to an agent, answered by an OpenAI-compatible model that may call tools,
//! and comes back as a uniform [`agent_core::ChatResponse`] envelope. Agents,
//! tools, knowledge providers, remote tool servers and the optimization
//! policies all live in the relational store and hot-reload.

pub mod agent_core;
pub mod agents;
pub mod config;
pub mod inference;
pub mod knowledge;
pub mod logging;
pub mod mcp_client;
pub mod optimization;
pub mod services;
pub mod session;
pub mod storage;
pub mod tools;

pub use agent_core::{ChatRequest, ChatResponse};
pub use services::{ServiceError, Services};

/// Platform data directory for the assistant, used when settings give none.
///
/// Falls back to `~/.ai-assistant/` when the platform directory cannot be resolved.
pub fn data_dir() -> std::path::PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("ai-assistant");
    }
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".ai-assistant")
}
