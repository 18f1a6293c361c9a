//! Agents: persisted personas, the hot-reloadable registry and the router
//! that picks one per message.

pub mod errors;
pub mod registry;
pub mod router;
pub mod types;

pub use errors::AgentError;
pub use registry::{AgentRegistry, AgentSnapshot};
pub use router::{AgentRouter, MatchTier, RouteResult, RoutingUsage, LLM_ROUTING_THRESHOLD};
pub use types::{
    Agent, AgentConfig, AgentType, ModelOverride, GENERAL_AGENT, KNOWLEDGE_AGENT, ROUTER_AGENT,
    SUMMARY_AGENT, SYSTEM_AGENTS,
};
