//! Agent definitions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::AgentError;
use crate::tools::types::ToolConfig;

// ─── Reserved names ──────────────────────────────────────────────────────────

/// Picks an agent when rules are inconclusive. Never exposed to users.
pub const ROUTER_AGENT: &str = "router";
/// Turns tool output into the final answer. Never exposed to users.
pub const SUMMARY_AGENT: &str = "summary";
/// Fallback when `general` is missing.
pub const KNOWLEDGE_AGENT: &str = "knowledge";
/// Default handler for anything nothing else claims.
pub const GENERAL_AGENT: &str = "general";

/// All four reserved system agent names.
pub const SYSTEM_AGENTS: [&str; 4] = [ROUTER_AGENT, SUMMARY_AGENT, KNOWLEDGE_AGENT, GENERAL_AGENT];

// ─── AgentType ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    System,
    Expert,
    Knowledge,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::System => "system",
            AgentType::Expert => "expert",
            AgentType::Knowledge => "knowledge",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(AgentType::System),
            "expert" => Ok(AgentType::Expert),
            "knowledge" => Ok(AgentType::Knowledge),
            other => Err(AgentError::Invalid {
                name: String::new(),
                reason: format!("unknown agent type '{other}'"),
            }),
        }
    }
}

// ─── Agent ───────────────────────────────────────────────────────────────────

/// Per-agent model tier override. Unset fields fall back to the model router.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOverride {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// A persisted agent row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Assigned by the store; `0` for an agent not yet saved.
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub model: ModelOverride,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    pub agent_type: AgentType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub updated_at: i64,
}

fn default_enabled() -> bool {
    true
}

impl Agent {
    /// Build a new, unsaved agent.
    pub fn new(name: &str, agent_type: AgentType) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            description: String::new(),
            system_prompt: String::new(),
            model: ModelOverride::default(),
            keywords: Vec::new(),
            priority: 0,
            agent_type,
            enabled: true,
            updated_at: 0,
        }
    }

    /// Reject rows the router and LLM client cannot use.
    pub fn validate(&self) -> Result<(), AgentError> {
        let invalid = |reason: &str| AgentError::Invalid {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.name.chars().any(char::is_whitespace) {
            return Err(invalid("name must not contain whitespace"));
        }
        if let Some(t) = self.model.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(invalid("temperature must be within [0, 2]"));
            }
        }
        if self.model.max_tokens == Some(0) {
            return Err(invalid("max_tokens must be at least 1"));
        }
        Ok(())
    }

    pub fn is_system(&self) -> bool {
        self.agent_type == AgentType::System
    }

    /// Whether users may address this agent with `@name`.
    pub fn is_mentionable(&self) -> bool {
        self.name != ROUTER_AGENT && self.name != SUMMARY_AGENT
    }
}

/// Runtime view of an agent: the row plus its bound, enabled tools.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub agent: Agent,
    pub tools: Vec<ToolConfig>,
}

impl AgentConfig {
    pub fn name(&self) -> &str {
        &self.agent.name
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }
}

// ─── Seeds ───────────────────────────────────────────────────────────────────

/// Default definitions for the reserved system agents.
pub fn system_agent_seeds() -> Vec<Agent> {
    let seed = |name: &str, description: &str, prompt: &str, temperature: f32| Agent {
        description: description.to_string(),
        system_prompt: prompt.to_string(),
        model: ModelOverride {
            model: None,
            temperature: Some(temperature),
            max_tokens: None,
        },
        ..Agent::new(name, AgentType::System)
    };

    vec![
        seed(
            ROUTER_AGENT,
            "Selects the best agent for a request",
            "You route user requests. Reply with exactly one agent name from the list and nothing else.",
            0.0,
        ),
        seed(
            SUMMARY_AGENT,
            "Summarises tool results into an answer",
            "Summarise the tool results for the user. Be accurate and concise, and say so when a tool failed.",
            0.3,
        ),
        seed(
            KNOWLEDGE_AGENT,
            "Answers questions from the knowledge base",
            "Answer using the knowledge base tools. Pass the user's question to the tool unchanged.",
            0.2,
        ),
        seed(
            GENERAL_AGENT,
            "General-purpose operations assistant",
            "You are an operations assistant for a monitoring platform. Use tools when they help.",
            0.7,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_temperature_range() {
        let mut agent = Agent::new("dba", AgentType::Expert);
        agent.model.temperature = Some(2.5);
        assert!(agent.validate().is_err());
        agent.model.temperature = Some(2.0);
        assert!(agent.validate().is_ok());
    }

    #[test]
    fn test_validate_max_tokens() {
        let mut agent = Agent::new("dba", AgentType::Expert);
        agent.model.max_tokens = Some(0);
        assert!(agent.validate().is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(Agent::new("", AgentType::Expert).validate().is_err());
        assert!(Agent::new("two words", AgentType::Expert).validate().is_err());
    }

    #[test]
    fn test_router_and_summary_not_mentionable() {
        assert!(!Agent::new(ROUTER_AGENT, AgentType::System).is_mentionable());
        assert!(!Agent::new(SUMMARY_AGENT, AgentType::System).is_mentionable());
        assert!(Agent::new(GENERAL_AGENT, AgentType::System).is_mentionable());
    }

    #[test]
    fn test_seeds_cover_reserved_names() {
        let seeds = system_agent_seeds();
        let names: Vec<&str> = seeds.iter().map(|a| a.name.as_str()).collect();
        for name in SYSTEM_AGENTS {
            assert!(names.contains(&name));
        }
        assert!(seeds.iter().all(|a| a.validate().is_ok()));
    }

    #[test]
    fn test_agent_type_roundtrip() {
        assert_eq!("expert".parse::<AgentType>().unwrap(), AgentType::Expert);
        assert!("robot".parse::<AgentType>().is_err());
    }
}
