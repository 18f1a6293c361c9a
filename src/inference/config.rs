//! LLM endpoint settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection settings for the OpenAI-compatible endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Base URL up to (not including) `/chat/completions`.
    pub base_url: String,
    /// Bearer token. Omitted from the request when unset.
    #[serde(default)]
    pub api_key: Option<String>,
    /// HTTP(S) proxy URL.
    #[serde(default)]
    pub proxy: Option<String>,
    /// Accept invalid TLS certificates (internal gateways with self-signed certs).
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Used when neither the agent nor the model router names a model.
    #[serde(default = "default_model")]
    pub default_model: String,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            api_key: None,
            proxy: None,
            insecure_skip_verify: false,
            timeout_secs: default_timeout_secs(),
            default_model: default_model(),
        }
    }
}

impl LlmSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// Full URL of the chat-completions endpoint.
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}
