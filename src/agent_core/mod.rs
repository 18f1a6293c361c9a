//! Agent Core: the per-turn chat pipeline.
//!
//! Submodules:
//! - `orchestrator`: admit, route, call the LLM, run tools, summarise
//! - `risk`: SQL, Kubernetes and batch risk assessment of proposed calls
//! - `confirmation`: one-shot confirmation slots for high-risk calls
//! - `prompt`: system and summary prompt assembly
//! - `types`: request and response envelope
//! - `errors`: turn-level error type and client-facing codes

pub mod confirmation;
pub mod errors;
pub mod orchestrator;
pub mod prompt;
pub mod risk;
pub mod types;

// Re-exports for convenience
pub use confirmation::{ConfirmAction, ConfirmationManager, ConfirmationSlot, DEFAULT_CONFIRMATION_TTL};
pub use errors::ChatError;
pub use orchestrator::{ChatOrchestrator, OrchestratorDeps, NO_KNOWLEDGE_REPLY, OPERATION_CANCELLED};
pub use risk::{RiskAssessment, RiskChecker};
pub use types::{
    AssistantReply, ChatRequest, ChatResponse, ChatStatus, ClientContext, ConfirmationInput,
    PendingConfirmation, ResponseSource, ToolInfo, ToolStatus,
};
