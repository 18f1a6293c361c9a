//! Bootstrap settings read from a YAML file at startup.
//!
//! Everything that can change at runtime lives in the relational store; this
//! file only says where the store is and how to reach the LLM.

use std::path::Path;

use serde::Deserialize;

use super::env::{expand_env_vars, expand_tilde};
use super::errors::ConfigError;
use crate::inference::LlmSettings;

// ─── Public Types ────────────────────────────────────────────────────────────

/// Session store tuning.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Prepended to every session key (`<prefix>session:<id>:meta`).
    pub key_prefix: String,
    /// Messages kept per session; older ones are trimmed on append.
    pub max_messages: usize,
    /// Idle TTL refreshed on every write.
    pub ttl_secs: u64,
    /// How many recent messages are sent to the LLM as history.
    pub history_limit: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            key_prefix: "ai:".to_string(),
            max_messages: 100,
            ttl_secs: 24 * 3600,
            history_limit: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AssistantSettings {
    /// SQLite file holding agents, tools, providers and config rows.
    pub database_path: String,
    /// Rotated log files go here. `None` logs to stderr.
    pub log_dir: Option<String>,
    pub llm: LlmSettings,
    pub session: SessionSettings,
    /// Cadence of the config change poller.
    pub reload_interval_secs: u64,
    /// Lifetime of a pending confirmation slot.
    pub confirmation_ttl_secs: u64,
    /// Array arguments longer than this make a call high risk.
    pub batch_risk_threshold: usize,
}

impl Default for AssistantSettings {
    fn default() -> Self {
        Self {
            database_path: "~/.ai-assistant/assistant.db".to_string(),
            log_dir: None,
            llm: LlmSettings::default(),
            session: SessionSettings::default(),
            reload_interval_secs: 60,
            confirmation_ttl_secs: 300,
            batch_risk_threshold: 10,
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

impl AssistantSettings {
    /// Read and parse a settings file. `${VAR}` placeholders are expanded first.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let mut settings: Self =
            serde_yaml::from_str(&expand_env_vars(raw)).map_err(|e| ConfigError::Parse {
                key: "settings".into(),
                reason: e.to_string(),
            })?;
        settings.database_path = expand_tilde(&settings.database_path);
        settings.log_dir = settings.log_dir.as_deref().map(expand_tilde);
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, reason: &str| ConfigError::Invalid {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        if self.database_path.trim().is_empty() {
            return Err(invalid("database_path", "must not be empty"));
        }
        if self.llm.base_url.trim().is_empty() {
            return Err(invalid("llm.base_url", "must not be empty"));
        }
        if self.session.max_messages == 0 {
            return Err(invalid("session.max_messages", "must be at least 1"));
        }
        if self.reload_interval_secs == 0 {
            return Err(invalid("reload_interval_secs", "must be at least 1"));
        }
        Ok(())
    }
}
