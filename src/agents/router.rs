//! Agent selection for an incoming message.
//!
//! Four tiers, first hit wins: `@mention`, keyword, LLM (only when more than
//! [`LLM_ROUTING_THRESHOLD`] agents are loaded), then the default agent.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::errors::AgentError;
use super::registry::{AgentRegistry, AgentSnapshot};
use super::types::{AgentConfig, GENERAL_AGENT, KNOWLEDGE_AGENT, ROUTER_AGENT};
use crate::inference::{ChatCompletionRequest, ChatMessage, ChatModel, Usage};
use crate::optimization::ModelSpec;

/// The LLM tier runs only above this many loaded agents.
pub const LLM_ROUTING_THRESHOLD: usize = 5;

const ROUTER_MAX_TOKENS: u32 = 32;

static MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@([\w\-]+)").expect("valid mention regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchTier {
    Mention,
    Keyword,
    Llm,
    Default,
}

#[derive(Debug, Clone)]
pub struct RouteResult {
    pub agent: Arc<AgentConfig>,
    pub tier: MatchTier,
    /// The message with any `@mention` removed.
    pub query: String,
    pub is_mention: bool,
    /// Tokens spent by the LLM tier, whether or not it picked an agent.
    pub llm_usage: Option<RoutingUsage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutingUsage {
    pub model: String,
    pub usage: Usage,
}

pub struct AgentRouter {
    registry: Arc<AgentRegistry>,
    llm: Arc<dyn ChatModel>,
}

impl AgentRouter {
    pub fn new(registry: Arc<AgentRegistry>, llm: Arc<dyn ChatModel>) -> Self {
        Self { registry, llm }
    }

    /// Pick an agent for `message`. `routing_model` is used by the LLM tier
    /// when the router agent has no model override.
    pub async fn route(
        &self,
        token: &CancellationToken,
        message: &str,
        routing_model: &ModelSpec,
    ) -> Result<RouteResult, AgentError> {
        let snapshot = self.registry.snapshot();

        if let Some(hit) = match_mention(&snapshot, message) {
            tracing::debug!(agent = %hit.agent.agent.name, "routed by mention");
            return Ok(hit);
        }
        if let Some(agent) = match_keyword(&snapshot, message) {
            tracing::debug!(agent = %agent.agent.name, "routed by keyword");
            return Ok(RouteResult {
                agent,
                tier: MatchTier::Keyword,
                query: message.to_string(),
                is_mention: false,
                llm_usage: None,
            });
        }
        let mut llm_usage = None;
        if snapshot.len() > LLM_ROUTING_THRESHOLD {
            let (picked, usage) = self.match_llm(token, &snapshot, message, routing_model).await;
            llm_usage = usage;
            match picked {
                Some(agent) => {
                    tracing::debug!(agent = %agent.agent.name, "routed by llm");
                    return Ok(RouteResult {
                        agent,
                        tier: MatchTier::Llm,
                        query: message.to_string(),
                        is_mention: false,
                        llm_usage,
                    });
                }
                None => tracing::debug!("llm routing inconclusive, using default"),
            }
        }

        let agent = snapshot
            .get(GENERAL_AGENT)
            .or_else(|| snapshot.get(KNOWLEDGE_AGENT))
            .ok_or(AgentError::NoAgentAvailable)?;
        Ok(RouteResult {
            agent,
            tier: MatchTier::Default,
            query: message.to_string(),
            is_mention: false,
            llm_usage,
        })
    }

    async fn match_llm(
        &self,
        token: &CancellationToken,
        snapshot: &AgentSnapshot,
        message: &str,
        routing_model: &ModelSpec,
    ) -> (Option<Arc<AgentConfig>>, Option<RoutingUsage>) {
        let candidates = snapshot.for_mention();
        if candidates.is_empty() {
            return (None, None);
        }
        let listing = candidates
            .iter()
            .map(|a| format!("{}: {}", a.agent.name, a.agent.description))
            .collect::<Vec<_>>()
            .join("\n");

        let router = snapshot.get(ROUTER_AGENT);
        let overrides = router.as_ref().map(|r| r.agent.model.clone()).unwrap_or_default();
        let request = ChatCompletionRequest {
            model: overrides
                .model
                .unwrap_or_else(|| routing_model.model.clone()),
            messages: vec![ChatMessage::user(format!(
                "Agents:\n{listing}\n\nRequest: {message}\n\nReply with one agent name."
            ))],
            system_prompt: router
                .as_ref()
                .map(|r| r.agent.system_prompt.clone())
                .filter(|p| !p.is_empty()),
            temperature: overrides
                .temperature
                .or(routing_model.temperature)
                .unwrap_or(0.0),
            max_tokens: overrides.max_tokens.unwrap_or(ROUTER_MAX_TOKENS),
            ..Default::default()
        };

        let requested_model = request.model.clone();
        let response = match self.llm.chat_completion(token, request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "llm routing call failed");
                return (None, None);
            }
        };
        let usage = RoutingUsage {
            model: if response.model.is_empty() {
                requested_model
            } else {
                response.model.clone()
            },
            usage: response.usage,
        };
        let picked = parse_agent_name(&response.text()).and_then(|name| {
            candidates
                .into_iter()
                .find(|a| a.agent.name.eq_ignore_ascii_case(&name))
        });
        (picked, Some(usage))
    }
}

/// First `@name` in the message resolved against mentionable agents.
fn match_mention(snapshot: &AgentSnapshot, message: &str) -> Option<RouteResult> {
    let captures = MENTION_RE.captures(message)?;
    let token = captures.get(0)?;
    let mention = captures.get(1)?.as_str();

    let candidates = snapshot.for_mention();
    let lowered = mention.to_lowercase();
    let agent = candidates
        .iter()
        .find(|a| a.agent.name == mention)
        .or_else(|| {
            candidates
                .iter()
                .find(|a| a.agent.name.to_lowercase().contains(&lowered))
        })?
        .clone();

    let mut query = String::with_capacity(message.len());
    query.push_str(&message[..token.start()]);
    query.push_str(&message[token.end()..]);
    Some(RouteResult {
        agent,
        tier: MatchTier::Mention,
        query: query.split_whitespace().collect::<Vec<_>>().join(" "),
        is_mention: true,
        llm_usage: None,
    })
}

/// Highest-priority agent with a keyword found in the message.
fn match_keyword(snapshot: &AgentSnapshot, message: &str) -> Option<Arc<AgentConfig>> {
    let lowered = message.to_lowercase();
    // for_mention() is ordered by priority then name, so the first hit wins ties
    snapshot.for_mention().into_iter().find(|a| {
        a.agent
            .keywords
            .iter()
            .filter(|k| !k.trim().is_empty())
            .any(|k| lowered.contains(&k.to_lowercase()))
    })
}

/// Pull a bare agent name out of an LLM reply.
fn parse_agent_name(reply: &str) -> Option<String> {
    let first = reply.split_whitespace().next()?;
    let name = first.trim_matches(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'));
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::types::{Agent, AgentType};
    use crate::inference::scripted::ScriptedChatModel;
    use crate::storage::AssistantDatabase;

    fn setup(extra: &[(&str, &[&str], i32)]) -> (Arc<ScriptedChatModel>, AgentRouter) {
        let db = Arc::new(AssistantDatabase::open_in_memory().unwrap());
        for (name, keywords, priority) in extra {
            let mut agent = Agent::new(name, AgentType::Expert);
            agent.description = format!("{name} expert");
            agent.keywords = keywords.iter().map(|k| k.to_string()).collect();
            agent.priority = *priority;
            db.upsert_agent(&agent).unwrap();
        }
        let registry = Arc::new(AgentRegistry::new(db));
        registry.init().unwrap();
        let llm = Arc::new(ScriptedChatModel::new());
        (llm.clone(), AgentRouter::new(registry, llm))
    }

    fn model() -> ModelSpec {
        ModelSpec::named("router-model")
    }

    #[tokio::test]
    async fn test_mention_exact_and_stripped() {
        let (_llm, router) = setup(&[("dba", &[], 0)]);
        let r = router
            .route(&CancellationToken::new(), "@dba why is   the db slow", &model())
            .await
            .unwrap();
        assert_eq!(r.agent.agent.name, "dba");
        assert_eq!(r.tier, MatchTier::Mention);
        assert!(r.is_mention);
        assert_eq!(r.query, "why is the db slow");
    }

    #[tokio::test]
    async fn test_mention_fuzzy_case_insensitive() {
        let (_llm, router) = setup(&[("k8s_expert", &[], 0)]);
        let r = router
            .route(&CancellationToken::new(), "hi @K8S pods?", &model())
            .await
            .unwrap();
        assert_eq!(r.agent.agent.name, "k8s_expert");
    }

    #[tokio::test]
    async fn test_router_agent_not_mentionable() {
        let (_llm, router) = setup(&[]);
        let r = router
            .route(&CancellationToken::new(), "@router hello", &model())
            .await
            .unwrap();
        assert_eq!(r.tier, MatchTier::Default);
    }

    #[tokio::test]
    async fn test_keyword_priority_tiebreak() {
        let (_llm, router) = setup(&[("low", &["mysql"], 1), ("high", &["MySQL"], 5)]);
        let r = router
            .route(&CancellationToken::new(), "mysql replication lag", &model())
            .await
            .unwrap();
        assert_eq!(r.agent.agent.name, "high");
        assert_eq!(r.tier, MatchTier::Keyword);
    }

    #[tokio::test]
    async fn test_keyword_deterministic() {
        let (_llm, router) = setup(&[("jumpserver", &["jumpserver"], 0)]);
        for _ in 0..3 {
            let r = router
                .route(&CancellationToken::new(), "jumpserver地址是什么", &model())
                .await
                .unwrap();
            assert_eq!(r.agent.agent.name, "jumpserver");
        }
    }

    #[tokio::test]
    async fn test_default_without_llm_when_few_agents() {
        let (llm, router) = setup(&[("dba", &["mysql"], 0)]);
        let r = router
            .route(&CancellationToken::new(), "hello there", &model())
            .await
            .unwrap();
        assert_eq!(r.agent.agent.name, GENERAL_AGENT);
        assert_eq!(r.tier, MatchTier::Default);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_llm_tier_with_many_agents() {
        let (llm, router) = setup(&[("dba", &[], 0), ("k8s", &[], 0)]);
        llm.push_text("dba");
        let r = router
            .route(&CancellationToken::new(), "my query is slow", &model())
            .await
            .unwrap();
        assert_eq!(r.agent.agent.name, "dba");
        assert_eq!(r.tier, MatchTier::Llm);
        let request = &llm.requests()[0];
        assert_eq!(request.model, "router-model");
        assert_eq!(request.temperature, 0.0);
        let spent = r.llm_usage.unwrap();
        assert_eq!(spent.model, "router-model");
        assert_eq!(spent.usage.prompt_tokens, 100);
    }

    #[tokio::test]
    async fn test_llm_tier_unknown_answer_falls_through() {
        let (llm, router) = setup(&[("dba", &[], 0), ("k8s", &[], 0)]);
        llm.push_text("nobody");
        let r = router
            .route(&CancellationToken::new(), "something", &model())
            .await
            .unwrap();
        assert_eq!(r.tier, MatchTier::Default);
        // the call still cost tokens
        assert!(r.llm_usage.is_some());
    }

    #[test]
    fn test_parse_agent_name() {
        assert_eq!(parse_agent_name(" `dba`.\n").as_deref(), Some("dba"));
        assert_eq!(parse_agent_name("   "), None);
    }
}
