//! Chat orchestrator: one call per user turn.
//!
//! Pipeline:
//! 1. **Admit**: trace id, rate limit, session resolution
//! 2. **Confirm**: a turn carrying a confirmation consumes its slot and stops there
//! 3. **Route**: pick an agent, append the user message, assemble history
//! 4. **Call**: one LLM call with the agent's tool catalogue
//! 5. **Act**: no tool calls is a direct answer; a high-risk call is parked
//!    behind a confirmation; everything else is dispatched (fanned out when
//!    there are several) and summarised by a second LLM call
//!
//! Failures never escape as errors. They become a `status: "error"` envelope
//! whose text carries no internals.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::confirmation::{ConfirmAction, ConfirmationManager};
use super::errors::ChatError;
use super::prompt::{build_summary_prompt, build_system_prompt, confirmation_summary};
use super::risk::RiskChecker;
use super::types::{
    AssistantReply, ChatRequest, ChatResponse, ChatStatus, ConfirmationInput, PendingConfirmation,
    ProposedTool, ResponseSource, ToolInfo,
};
use crate::agents::{AgentRegistry, AgentRouter, SUMMARY_AGENT};
use crate::inference::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatModel, InferenceError, Role,
    ToolCall,
};
use crate::knowledge::KnowledgeResponse;
use crate::optimization::{OptimizationError, OptimizationManager, TaskType, UsageRecord};
use crate::session::{Message, SessionError, SessionManager};
use crate::tools::{ToolCallContext, ToolConfig, ToolDispatcher, ToolError, ToolRegistry};

// ─── Constants ──────────────────────────────────────────────────────────────

const CHAT_MODE: &str = "chat";

const DEFAULT_TEMPERATURE: f32 = 0.7;

const DEFAULT_MAX_TOKENS: u32 = 2048;

pub const NO_KNOWLEDGE_REPLY: &str = "知识库中没有找到相关信息";

pub const OPERATION_CANCELLED: &str = "操作已取消";

// ─── Wiring ─────────────────────────────────────────────────────────────────

/// Everything the orchestrator talks to.
pub struct OrchestratorDeps {
    pub sessions: Arc<SessionManager>,
    pub agents: Arc<AgentRegistry>,
    pub tools: Arc<ToolRegistry>,
    pub dispatcher: Arc<ToolDispatcher>,
    pub optimization: Arc<OptimizationManager>,
    pub llm: Arc<dyn ChatModel>,
    pub confirmations: ConfirmationManager,
    pub risk: RiskChecker,
}

pub struct ChatOrchestrator {
    sessions: Arc<SessionManager>,
    agents: Arc<AgentRegistry>,
    router: AgentRouter,
    tools: Arc<ToolRegistry>,
    dispatcher: Arc<ToolDispatcher>,
    optimization: Arc<OptimizationManager>,
    llm: Arc<dyn ChatModel>,
    confirmations: ConfirmationManager,
    risk: RiskChecker,
}

/// Per-turn identifiers threaded through the helpers.
struct Turn<'a> {
    trace_id: &'a str,
    user_id: &'a str,
    session_id: &'a str,
    request: &'a ChatRequest,
    ctx: ToolCallContext,
}

/// A tool call after name and argument resolution.
enum PlannedCall {
    Ready { tool: Arc<ToolConfig>, args: Value },
    Rejected(ToolInfo),
}

/// Tool calls of one turn with their outcomes, ready for the summary step.
struct ToolRound {
    content: Option<String>,
    calls: Vec<ToolCall>,
    infos: Vec<ToolInfo>,
    source: ResponseSource,
    /// Every call went to a knowledge provider.
    knowledge_only: bool,
}

impl ChatOrchestrator {
    pub fn new(deps: OrchestratorDeps) -> Self {
        let router = AgentRouter::new(Arc::clone(&deps.agents), Arc::clone(&deps.llm));
        Self {
            sessions: deps.sessions,
            agents: deps.agents,
            router,
            tools: deps.tools,
            dispatcher: deps.dispatcher,
            optimization: deps.optimization,
            llm: deps.llm,
            confirmations: deps.confirmations,
            risk: deps.risk,
        }
    }

    /// Handle one chat turn. Always returns an envelope.
    pub async fn handle_chat(
        &self,
        token: &CancellationToken,
        request: ChatRequest,
        user_id: &str,
    ) -> ChatResponse {
        let trace_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "chat_turn",
            trace_id = %trace_id,
            user_id = %user_id,
            session_id = tracing::field::Empty,
        );

        async {
            let started = Instant::now();
            let mut session_id = request
                .session_id
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

            let response = match self
                .run_turn(token, &trace_id, &request, user_id, &mut session_id)
                .await
            {
                Ok(response) => response,
                Err(e) => self.error_response(&trace_id, &session_id, e),
            };
            tracing::info!(
                status = ?response.status,
                source = ?response.source,
                tools = response.tools.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "chat turn finished"
            );
            response
        }
        .instrument(span)
        .await
    }

    async fn run_turn(
        &self,
        token: &CancellationToken,
        trace_id: &str,
        request: &ChatRequest,
        user_id: &str,
        session_id: &mut String,
    ) -> Result<ChatResponse, ChatError> {
        if token.is_cancelled() {
            return Err(ChatError::Cancelled);
        }
        if request.confirmation.is_none() && request.message.trim().is_empty() {
            return Err(ChatError::InvalidRequest {
                reason: "message must not be empty".into(),
            });
        }

        let group = request.client_context.busi_group_id.as_deref();
        let decision = self.optimization.check_rate_limit(user_id, group).await;
        if !decision.allowed {
            let retry_after_secs = decision
                .retry_after
                .map(|d| d.as_secs().max(1))
                .unwrap_or(60);
            return Err(ChatError::RateLimited { retry_after_secs });
        }

        let session = match self
            .sessions
            .get_or_create(user_id, CHAT_MODE, request.session_id.as_deref())
            .await
        {
            Ok(session) => session,
            Err(SessionError::NotOwner { session_id }) => {
                tracing::warn!(%session_id, "session owned by another user");
                return Err(ChatError::InvalidRequest {
                    reason: "session belongs to another user".into(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        *session_id = session.id.clone();
        tracing::Span::current().record("session_id", session.id.as_str());

        let turn = Turn {
            trace_id,
            user_id,
            session_id: &session.id,
            request,
            ctx: ToolCallContext {
                trace_id: trace_id.to_string(),
                user_id: user_id.to_string(),
                session_id: session.id.clone(),
                conversation_id: request.conversation_id.clone(),
                env: request.client_context.env.clone(),
                caller_ip: request.client_context.caller_ip.clone(),
            },
        };

        if let Some(confirmation) = &request.confirmation {
            return self.handle_confirmation(token, &turn, confirmation).await;
        }
        self.handle_message(token, &turn).await
    }

    // ─── Message path ───────────────────────────────────────────────────

    async fn handle_message(
        &self,
        token: &CancellationToken,
        turn: &Turn<'_>,
    ) -> Result<ChatResponse, ChatError> {
        let request = turn.request;
        let routing = self.optimization.model_for(TaskType::Routing);
        let route = self.router.route(token, &request.message, &routing).await?;
        let agent = Arc::clone(&route.agent);
        tracing::info!(agent = %agent.name(), tier = ?route.tier, "agent selected");
        if let Some(spent) = &route.llm_usage {
            self.optimization
                .record_usage(&UsageRecord {
                    model: spent.model.clone(),
                    user_id: turn.user_id.to_string(),
                    prompt_tokens: spent.usage.prompt_tokens,
                    completion_tokens: spent.usage.completion_tokens,
                })
                .await;
        }

        self.sessions
            .add_message(
                turn.session_id,
                Message::new(Role::User, request.message.clone()).with_trace(turn.trace_id),
            )
            .await?;
        let mut history = self.chat_history(turn.session_id).await?;
        if route.is_mention {
            if let Some(last) = history.last_mut().filter(|m| m.role == Role::User) {
                last.content = Some(route.query.clone());
            }
        }

        let definitions = if agent.tools.is_empty() {
            self.tools.definitions()
        } else {
            self.tools.definitions_for(&agent.tool_names())
        };
        let overrides = &agent.agent.model;
        let llm_request = ChatCompletionRequest {
            model: overrides.model.clone().unwrap_or_else(|| routing.model.clone()),
            messages: history.clone(),
            tool_choice: (!definitions.is_empty()).then(|| "auto".to_string()),
            tools: definitions,
            system_prompt: Some(build_system_prompt(
                &agent.agent.system_prompt,
                &request.client_context,
            )),
            temperature: overrides
                .temperature
                .or(routing.temperature)
                .unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: overrides
                .max_tokens
                .or(routing.max_tokens)
                .unwrap_or(DEFAULT_MAX_TOKENS),
            ..Default::default()
        };

        let response = self
            .complete(token, TaskType::Routing, llm_request, turn.user_id)
            .await?;
        let message = response.message();

        if message.tool_calls.is_empty() {
            let content = message.content.unwrap_or_default().trim().to_string();
            self.persist_assistant(turn, &content).await?;
            let mut reply = ChatResponse::completed(
                turn.trace_id,
                turn.session_id,
                ResponseSource::Direct,
                AssistantReply::markdown(content),
            );
            reply.conversation_id = request.conversation_id.clone();
            return Ok(reply);
        }

        tracing::info!(calls = message.tool_calls.len(), "model requested tools");
        let planned = self.plan_calls(&message.tool_calls);
        if let Some(pending) = self.park_high_risk(turn, agent.name(), &planned).await? {
            return Ok(pending);
        }

        let (source, knowledge_only) = classify(&planned);
        let infos = self.execute_calls(token, &turn.ctx, planned).await;
        let round = ToolRound {
            content: message.content,
            calls: message.tool_calls,
            infos,
            source,
            knowledge_only,
        };
        self.finish_round(token, turn, &agent.agent.system_prompt, history, round)
            .await
    }

    /// Resolve names and parse arguments. Failures are kept in place so the
    /// outcome list lines up with the model's calls.
    fn plan_calls(&self, calls: &[ToolCall]) -> Vec<PlannedCall> {
        calls
            .iter()
            .map(|call| {
                let args = match call.parse_arguments() {
                    Ok(map) => Value::Object(map),
                    Err(reason) => {
                        let err = ToolError::InvalidArguments {
                            tool: call.name.clone(),
                            reason,
                        };
                        return PlannedCall::Rejected(ToolInfo::failed(
                            &call.name,
                            Value::String(call.arguments.clone()),
                            &err,
                        ));
                    }
                };
                match self.tools.get(&call.name) {
                    Some(tool) => PlannedCall::Ready { tool, args },
                    None => {
                        let err = ToolError::NotFound {
                            name: call.name.clone(),
                        };
                        PlannedCall::Rejected(ToolInfo::failed(&call.name, args, &err))
                    }
                }
            })
            .collect()
    }

    /// Stage a confirmation for the first high-risk call. Nothing in the
    /// round runs until the user answers.
    async fn park_high_risk(
        &self,
        turn: &Turn<'_>,
        agent: &str,
        planned: &[PlannedCall],
    ) -> Result<Option<ChatResponse>, ChatError> {
        for call in planned {
            let PlannedCall::Ready { tool, args } = call else {
                continue;
            };
            let assessment = self.risk.assess(tool, args);
            if !assessment.is_high() {
                continue;
            }
            tracing::warn!(
                tool = %tool.name,
                reasons = ?assessment.reasons,
                "high-risk call requires confirmation"
            );

            let summary = confirmation_summary(&tool.name, args, &assessment.reasons);
            let slot = self
                .confirmations
                .stage(
                    turn.session_id,
                    turn.user_id,
                    &tool.name,
                    args.clone(),
                    assessment.level,
                    summary.clone(),
                    agent,
                    &turn.request.message,
                )
                .await?;
            self.persist_assistant(turn, &summary).await?;

            let mut response = ChatResponse::completed(
                turn.trace_id,
                turn.session_id,
                source_for(tool),
                AssistantReply::text(summary.clone()),
            );
            response.status = ChatStatus::PendingConfirmation;
            response.pending_confirmation = Some(PendingConfirmation {
                confirm_id: slot.confirm_id,
                risk_level: slot.risk_level,
                summary,
                proposed_tool: ProposedTool {
                    name: tool.name.clone(),
                    request: args.clone(),
                },
                expires_at: slot.expires_at,
            });
            return Ok(Some(response));
        }
        Ok(None)
    }

    /// Run the planned calls. More than one runnable call fans out through
    /// the concurrent executor; outcomes keep the model's order.
    async fn execute_calls(
        &self,
        token: &CancellationToken,
        ctx: &ToolCallContext,
        planned: Vec<PlannedCall>,
    ) -> Vec<ToolInfo> {
        let runnable = planned
            .iter()
            .filter(|c| matches!(c, PlannedCall::Ready { .. }))
            .count();

        if runnable <= 1 {
            let mut infos = Vec::with_capacity(planned.len());
            for call in planned {
                infos.push(match call {
                    PlannedCall::Ready { tool, args } => {
                        run_tool(&self.dispatcher, &self.optimization, token, ctx, &tool, args).await
                    }
                    PlannedCall::Rejected(info) => info,
                });
            }
            return infos;
        }

        let names: Vec<String> = planned
            .iter()
            .map(|c| match c {
                PlannedCall::Ready { tool, .. } => tool.name.clone(),
                PlannedCall::Rejected(info) => info.name.clone(),
            })
            .collect();
        let units: Vec<_> = planned
            .into_iter()
            .map(|call| {
                let dispatcher = Arc::clone(&self.dispatcher);
                let optimization = Arc::clone(&self.optimization);
                let ctx = ctx.clone();
                move |child: CancellationToken| async move {
                    match call {
                        PlannedCall::Ready { tool, args } => {
                            run_tool(&dispatcher, &optimization, &child, &ctx, &tool, args).await
                        }
                        PlannedCall::Rejected(info) => info,
                    }
                }
            })
            .collect();

        let executor = self.optimization.concurrent();
        tracing::debug!(
            calls = names.len(),
            max_concurrency = executor.max_concurrency(),
            "fanning out tool calls"
        );
        executor
            .run_all(token, units)
            .await
            .into_iter()
            .zip(names)
            .map(|(result, name)| {
                result.unwrap_or_else(|e| {
                    let err = match e {
                        OptimizationError::NotStarted { .. } => ToolError::Cancelled {
                            tool: name.clone(),
                        },
                        other => ToolError::ExecutionFailed {
                            tool: name.clone(),
                            reason: other.to_string(),
                        },
                    };
                    ToolInfo::failed(&name, Value::Null, &err)
                })
            })
            .collect()
    }

    /// Feed tool outcomes back to the model and build the final envelope.
    async fn finish_round(
        &self,
        token: &CancellationToken,
        turn: &Turn<'_>,
        agent_prompt: &str,
        history: Vec<ChatMessage>,
        round: ToolRound,
    ) -> Result<ChatResponse, ChatError> {
        let conversation_id = round
            .infos
            .iter()
            .filter(|i| i.is_success())
            .find_map(|i| i.result.get("conversation_id").and_then(Value::as_str))
            .map(str::to_string)
            .or_else(|| turn.request.conversation_id.clone());

        if round.knowledge_only && knowledge_came_back_empty(&round.infos) {
            tracing::info!("knowledge base returned nothing, skipping summary");
            self.persist_assistant(turn, NO_KNOWLEDGE_REPLY).await?;
            let mut response = ChatResponse::completed(
                turn.trace_id,
                turn.session_id,
                round.source,
                AssistantReply::markdown(NO_KNOWLEDGE_REPLY),
            )
            .with_tools(round.infos);
            response.conversation_id = conversation_id;
            return Ok(response);
        }

        let mut messages = history;
        messages.push(ChatMessage::assistant_tool_calls(round.content, &round.calls));
        for (call, info) in round.calls.iter().zip(&round.infos) {
            messages.push(ChatMessage::tool_result(&call.id, tool_message(info)));
        }

        let spec = self.optimization.model_for(TaskType::Summary);
        let overrides = self
            .agents
            .get(SUMMARY_AGENT)
            .map(|a| a.agent.model.clone())
            .unwrap_or_default();
        let summary_request = ChatCompletionRequest {
            model: overrides.model.unwrap_or_else(|| spec.model.clone()),
            messages,
            system_prompt: Some(build_summary_prompt(
                agent_prompt,
                &turn.request.client_context,
            )),
            temperature: overrides
                .temperature
                .or(spec.temperature)
                .unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: overrides
                .max_tokens
                .or(spec.max_tokens)
                .unwrap_or(DEFAULT_MAX_TOKENS),
            ..Default::default()
        };

        let summary = match self
            .complete(token, TaskType::Summary, summary_request, turn.user_id)
            .await
        {
            Ok(response) => response.text(),
            Err(e) => {
                let mut response =
                    self.error_response(turn.trace_id, turn.session_id, ChatError::Inference(e));
                response.source = round.source;
                return Ok(response.with_tools(round.infos));
            }
        };
        self.persist_assistant(turn, &summary).await?;

        let mut response = ChatResponse::completed(
            turn.trace_id,
            turn.session_id,
            round.source,
            AssistantReply::markdown(summary),
        )
        .with_tools(round.infos);
        response.conversation_id = conversation_id;
        Ok(response)
    }

    // ─── Confirmation path ──────────────────────────────────────────────

    async fn handle_confirmation(
        &self,
        token: &CancellationToken,
        turn: &Turn<'_>,
        input: &ConfirmationInput,
    ) -> Result<ChatResponse, ChatError> {
        let (action, slot) = self
            .confirmations
            .consume(&input.confirm_id, &input.action, turn.user_id, turn.session_id)
            .await?;

        if action == ConfirmAction::Reject {
            self.persist_assistant(turn, OPERATION_CANCELLED).await?;
            return Ok(ChatResponse::completed(
                turn.trace_id,
                turn.session_id,
                ResponseSource::Direct,
                AssistantReply::text(OPERATION_CANCELLED),
            ));
        }

        let agent_prompt = self
            .agents
            .get(&slot.agent)
            .map(|a| a.agent.system_prompt.clone())
            .unwrap_or_default();
        let call = ToolCall {
            id: format!("confirm_{}", slot.confirm_id),
            name: slot.tool_name.clone(),
            arguments: slot.arguments.to_string(),
        };
        let planned = match self.tools.get(&slot.tool_name) {
            Some(tool) => PlannedCall::Ready {
                tool,
                args: slot.arguments.clone(),
            },
            None => PlannedCall::Rejected(ToolInfo::failed(
                &slot.tool_name,
                slot.arguments.clone(),
                &ToolError::NotFound {
                    name: slot.tool_name.clone(),
                },
            )),
        };
        let (source, knowledge_only) = classify(std::slice::from_ref(&planned));
        tracing::info!(tool = %slot.tool_name, "running confirmed tool call");
        let infos = self.execute_calls(token, &turn.ctx, vec![planned]).await;

        let history = self.chat_history(turn.session_id).await?;
        let round = ToolRound {
            content: None,
            calls: vec![call],
            infos,
            source,
            knowledge_only,
        };
        self.finish_round(token, turn, &agent_prompt, history, round)
            .await
    }

    // ─── Helpers ────────────────────────────────────────────────────────

    /// Call the model, walking the task's fallback chain on transient
    /// failures. Usage of the successful call is recorded.
    async fn complete(
        &self,
        token: &CancellationToken,
        task: TaskType,
        request: ChatCompletionRequest,
        user_id: &str,
    ) -> Result<ChatCompletionResponse, InferenceError> {
        let mut candidates = vec![request.model.clone()];
        for model in self.optimization.fallback_chain(task) {
            if !candidates.contains(&model) {
                candidates.push(model);
            }
        }

        let mut last_error = None;
        for model in candidates {
            let mut attempt = request.clone();
            attempt.model = model.clone();
            let started = Instant::now();
            match self.llm.chat_completion(token, attempt).await {
                Ok(response) => {
                    tracing::info!(
                        task = %task,
                        model = %model,
                        prompt_tokens = response.usage.prompt_tokens,
                        completion_tokens = response.usage.completion_tokens,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "llm call completed"
                    );
                    let answered_by = if response.model.is_empty() {
                        model
                    } else {
                        response.model.clone()
                    };
                    self.optimization
                        .record_usage(&UsageRecord {
                            model: answered_by,
                            user_id: user_id.to_string(),
                            prompt_tokens: response.usage.prompt_tokens,
                            completion_tokens: response.usage.completion_tokens,
                        })
                        .await;
                    return Ok(response);
                }
                Err(e) if e.is_fallback_candidate() => {
                    tracing::warn!(task = %task, model = %model, error = %e, "llm call failed, trying next model");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or(InferenceError::ConfigError {
            reason: format!("no model configured for task '{task}'"),
        }))
    }

    async fn chat_history(&self, session_id: &str) -> Result<Vec<ChatMessage>, ChatError> {
        let limit = self.sessions.settings().history_limit;
        Ok(self
            .sessions
            .get_messages(session_id, limit)
            .await?
            .iter()
            .map(Message::to_chat_message)
            .collect())
    }

    async fn persist_assistant(&self, turn: &Turn<'_>, content: &str) -> Result<(), ChatError> {
        self.sessions
            .add_message(
                turn.session_id,
                Message::new(Role::Assistant, content).with_trace(turn.trace_id),
            )
            .await?;
        Ok(())
    }

    fn error_response(&self, trace_id: &str, session_id: &str, error: ChatError) -> ChatResponse {
        tracing::warn!(code = error.code(), error = %error, "chat turn failed");
        let mut response =
            ChatResponse::error(trace_id, session_id, error.code(), error.user_message());
        if let ChatError::RateLimited { retry_after_secs } = error {
            response.retry_after = Some(retry_after_secs);
        }
        response
    }
}

// ─── Free helpers ───────────────────────────────────────────────────────────

/// Cache lookup, then dispatch under the retry policy, then cache fill.
async fn run_tool(
    dispatcher: &ToolDispatcher,
    optimization: &OptimizationManager,
    token: &CancellationToken,
    ctx: &ToolCallContext,
    tool: &ToolConfig,
    args: Value,
) -> ToolInfo {
    let cacheable = optimization.is_cacheable(&tool.name);
    if cacheable {
        if let Some(hit) = optimization.cache_get(&tool.name, &args).await {
            tracing::debug!(tool = %tool.name, "tool result served from cache");
            return ToolInfo::success(&tool.name, args, hit, true);
        }
    }

    let args_ref = &args;
    let result = optimization
        .retry(token, &tool.name, move |_attempt| {
            dispatcher.dispatch(token, ctx, tool, args_ref)
        })
        .await;

    match result {
        Ok(value) => {
            if cacheable {
                optimization.cache_set(&tool.name, &args, &value).await;
            }
            ToolInfo::success(&tool.name, args, value, false)
        }
        Err(e) => {
            tracing::warn!(tool = %tool.name, code = e.code(), error = %e, "tool call failed");
            ToolInfo::failed(&tool.name, args, &e)
        }
    }
}

fn source_for(tool: &ToolConfig) -> ResponseSource {
    if tool.implementation.is_knowledge() {
        ResponseSource::KnowledgeBase
    } else {
        ResponseSource::McpTool
    }
}

/// Response source for a round plus whether every call is a runnable knowledge call.
fn classify(planned: &[PlannedCall]) -> (ResponseSource, bool) {
    let mut any_knowledge = false;
    let mut knowledge_only = !planned.is_empty();
    for call in planned {
        match call {
            PlannedCall::Ready { tool, .. } if tool.implementation.is_knowledge() => {
                any_knowledge = true;
            }
            _ => knowledge_only = false,
        }
    }
    let source = if any_knowledge {
        ResponseSource::KnowledgeBase
    } else {
        ResponseSource::McpTool
    };
    (source, knowledge_only)
}

fn knowledge_came_back_empty(infos: &[ToolInfo]) -> bool {
    infos.iter().all(|info| {
        info.is_success()
            && serde_json::from_value::<KnowledgeResponse>(info.result.clone())
                .map(|r| r.is_empty())
                .unwrap_or(false)
    })
}

/// Content of the `tool` role message fed to the summary call.
fn tool_message(info: &ToolInfo) -> String {
    if info.is_success() {
        serde_json::to_string(&info.result).unwrap_or_default()
    } else {
        serde_json::json!({ "status": "failed", "error": info.error }).to_string()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use crate::agents::{Agent, AgentType};
    use crate::config::{ConfigLoader, SessionSettings, DEFAULT_CONFIG_KEY};
    use crate::inference::scripted::ScriptedChatModel;
    use crate::knowledge::{KnowledgeDocument, QueryStatus};
    use crate::mcp_client::RemoteServerManager;
    use crate::optimization::config::CACHE;
    use crate::optimization::Clock;
    use crate::storage::{AssistantDatabase, KvStore, MemoryKvStore};
    use crate::tools::native::{BoxedFuture, FnHandler};
    use crate::tools::registry::tests::StubKnowledge;
    use crate::tools::{NativeHandlerRegistry, ToolImplementation};

    use super::super::confirmation::DEFAULT_CONFIRMATION_TTL;
    use super::super::types::ToolStatus;

    struct Harness {
        orchestrator: ChatOrchestrator,
        llm: Arc<ScriptedChatModel>,
        knowledge: Arc<StubKnowledge>,
        natives: Arc<NativeHandlerRegistry>,
        optimization: Arc<OptimizationManager>,
        token: CancellationToken,
    }

    impl Harness {
        fn new(setup: impl FnOnce(&AssistantDatabase), knowledge: StubKnowledge) -> Self {
            Self::build(setup, knowledge, None)
        }

        /// Harness whose rate-limit windows are pinned to `now_secs`.
        fn at_time(
            setup: impl FnOnce(&AssistantDatabase),
            knowledge: StubKnowledge,
            now_secs: u64,
        ) -> Self {
            let clock: Clock = Arc::new(move || now_secs);
            Self::build(setup, knowledge, Some(clock))
        }

        fn build(
            setup: impl FnOnce(&AssistantDatabase),
            knowledge: StubKnowledge,
            clock: Option<Clock>,
        ) -> Self {
            let db = Arc::new(AssistantDatabase::open_in_memory().unwrap());
            setup(&db);

            let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
            let loader = Arc::new(ConfigLoader::new(Arc::clone(&db)));
            let mut optimization =
                OptimizationManager::new(loader, Arc::clone(&kv), "test-model").unwrap();
            if let Some(clock) = clock {
                optimization = optimization.with_rate_clock(clock);
            }
            let optimization = Arc::new(optimization);

            let agents = Arc::new(AgentRegistry::new(Arc::clone(&db)));
            agents.init().unwrap();

            let knowledge = Arc::new(knowledge);
            let tools = Arc::new(ToolRegistry::new(Arc::clone(&db), knowledge.clone()));
            tools.load().unwrap();

            let natives = Arc::new(NativeHandlerRegistry::with_builtins());
            let servers = Arc::new(RemoteServerManager::new(
                Arc::clone(&db),
                CancellationToken::new(),
            ));
            let dispatcher =
                Arc::new(ToolDispatcher::new(natives.clone(), servers, tools.clone()).unwrap());

            let llm = Arc::new(ScriptedChatModel::new());
            let orchestrator = ChatOrchestrator::new(OrchestratorDeps {
                sessions: Arc::new(SessionManager::new(Arc::clone(&kv), SessionSettings::default())),
                agents,
                tools,
                dispatcher,
                optimization: optimization.clone(),
                llm: llm.clone(),
                confirmations: ConfirmationManager::new(kv, DEFAULT_CONFIRMATION_TTL),
                risk: RiskChecker::new(10),
            });

            Self {
                orchestrator,
                llm,
                knowledge,
                natives,
                optimization,
                token: CancellationToken::new(),
            }
        }

        async fn chat(&self, request: ChatRequest) -> ChatResponse {
            self.orchestrator.handle_chat(&self.token, request, "u1").await
        }

        /// Register a native handler that counts calls and returns `result`.
        fn native(&self, name: &str, result: Result<Value, ToolError>) -> Arc<AtomicUsize> {
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = calls.clone();
            self.natives.register(
                name,
                Arc::new(FnHandler(move |_ctx: ToolCallContext, _args: Value| -> BoxedFuture {
                    let counter = counter.clone();
                    let result = result.clone();
                    Box::pin(async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        result
                    })
                })),
            );
            calls
        }
    }

    fn native_tool(db: &AssistantDatabase, name: &str, params: Value) {
        let mut tool = ToolConfig::new(
            name,
            &format!("{name} tool"),
            ToolImplementation::Native {
                handler: name.into(),
            },
        );
        tool.parameters = Some(params);
        db.upsert_tool(&tool).unwrap();
    }

    fn kb_answer() -> KnowledgeResponse {
        KnowledgeResponse {
            status: QueryStatus::Success,
            answer: None,
            documents: vec![
                KnowledgeDocument {
                    title: "JumpServer".into(),
                    content: "https://jump.example.com".into(),
                    url: None,
                    score: Some(0.92),
                },
                KnowledgeDocument {
                    title: "Access".into(),
                    content: "Login with SSO".into(),
                    url: None,
                    score: Some(0.81),
                },
            ],
            conversation_id: Some("conv-1".into()),
            error: None,
        }
    }

    fn jumpserver_setup(db: &AssistantDatabase) {
        db.upsert_tool(&ToolConfig::new(
            "kb_jumpserver",
            "Search the JumpServer knowledge base",
            ToolImplementation::Knowledge { provider_id: 1 },
        ))
        .unwrap();
        let mut agent = Agent::new("jumpserver", AgentType::Knowledge);
        agent.keywords = vec!["jumpserver".into()];
        db.upsert_agent(&agent).unwrap();
        db.bind_agent_tools("jumpserver", &["kb_jumpserver".to_string()])
            .unwrap();
        db.upsert_optimization_config(
            CACHE,
            DEFAULT_CONFIG_KEY,
            r#"{"idempotent_tools":["kb_jumpserver"]}"#,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_direct_answer_creates_session_and_records_usage() {
        let h = Harness::new(|_| {}, StubKnowledge::default());
        h.llm.push_text("Hi! How can I help?");

        let resp = h.chat(ChatRequest::text("Hello")).await;
        assert_eq!(resp.status, ChatStatus::Completed);
        assert_eq!(resp.source, ResponseSource::Direct);
        assert!(!resp.trace_id.is_empty());
        assert!(!resp.session_id.is_empty());
        assert!(resp.tool.is_none());
        assert_eq!(resp.assistant_message.content, "Hi! How can I help?");

        let stats = h
            .optimization
            .cost_daily(chrono::Utc::now().date_naive())
            .await
            .unwrap();
        assert_eq!(stats.total_calls, 1);

        let request = &h.llm.requests()[0];
        assert_eq!(request.model, "test-model");
        assert!(request.tools.is_empty());
        assert!(request.system_prompt.is_some());
    }

    #[tokio::test]
    async fn test_history_carries_previous_turns() {
        let h = Harness::new(|_| {}, StubKnowledge::default());
        h.llm.push_text("first answer").push_text("second answer");

        let first = h.chat(ChatRequest::text("one")).await;
        h.chat(ChatRequest::text("two").in_session(&first.session_id))
            .await;

        let messages = &h.llm.requests()[1].messages;
        let texts: Vec<&str> = messages
            .iter()
            .filter_map(|m| m.content.as_deref())
            .collect();
        assert_eq!(texts, vec!["one", "first answer", "two"]);
    }

    #[tokio::test]
    async fn test_keyword_routed_knowledge_hit_then_cache_hit() {
        let h = Harness::new(jumpserver_setup, StubKnowledge::with(1, kb_answer()));
        let args = r#"{"query":"jumpserver地址是什么"}"#;
        h.llm
            .push_tool_calls(&[("kb_jumpserver", args)])
            .push_text("JumpServer 地址是 https://jump.example.com");

        let resp = h.chat(ChatRequest::text("jumpserver地址是什么")).await;
        assert_eq!(resp.status, ChatStatus::Completed);
        assert_eq!(resp.source, ResponseSource::KnowledgeBase);
        let tool = resp.tool.as_ref().unwrap();
        assert_eq!(tool.name, "kb_jumpserver");
        assert_eq!(tool.status, ToolStatus::Success);
        assert!(!tool.cache_hit);
        assert_eq!(tool.request["query"], "jumpserver地址是什么");
        assert_eq!(resp.conversation_id.as_deref(), Some("conv-1"));
        assert_eq!(h.knowledge.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.llm.call_count(), 2);

        // only the agent's bound tool is offered
        let first = &h.llm.requests()[0];
        assert_eq!(first.tools.len(), 1);
        assert_eq!(first.tools[0].function.name, "kb_jumpserver");

        h.llm
            .push_tool_calls(&[("kb_jumpserver", args)])
            .push_text("同上");
        let again = h
            .chat(ChatRequest::text("jumpserver地址是什么").in_session(&resp.session_id))
            .await;
        assert!(again.tool.unwrap().cache_hit);
        assert_eq!(h.knowledge.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_knowledge_no_results_skips_summary() {
        let h = Harness::new(
            jumpserver_setup,
            StubKnowledge::with(1, KnowledgeResponse::no_results(None)),
        );
        h.llm
            .push_tool_calls(&[("kb_jumpserver", r#"{"query":"jumpserver vpn"}"#)]);

        let resp = h.chat(ChatRequest::text("jumpserver vpn")).await;
        assert_eq!(resp.status, ChatStatus::Completed);
        assert_eq!(resp.assistant_message.content, NO_KNOWLEDGE_REPLY);
        assert_eq!(h.llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_fan_out_keeps_order_and_reports_failure() {
        let h = Harness::new(
            |db| {
                native_tool(db, "host_info", json!({"type": "object"}));
                native_tool(db, "host_metrics", json!({"type": "object"}));
            },
            StubKnowledge::default(),
        );
        h.native("host_info", Ok(json!({"hostname": "web-1"})));
        h.native(
            "host_metrics",
            Err(ToolError::AccessDenied {
                tool: "host_metrics".into(),
                reason: "no permission on host".into(),
            }),
        );
        h.llm
            .push_tool_calls(&[
                ("host_info", r#"{"host":"web-1"}"#),
                ("host_metrics", r#"{"host":"web-1"}"#),
            ])
            .push_text("web-1 is up; metrics unavailable");

        let resp = h.chat(ChatRequest::text("check web-1")).await;
        assert_eq!(resp.status, ChatStatus::Completed);
        assert_eq!(resp.source, ResponseSource::McpTool);
        let names: Vec<&str> = resp.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["host_info", "host_metrics"]);
        assert_eq!(resp.tools[0].status, ToolStatus::Success);
        assert_eq!(resp.tools[1].status, ToolStatus::Failed);
        assert_eq!(resp.tools[1].error.as_ref().unwrap().code, "ACCESS_DENIED");
        assert_eq!(resp.tool.as_ref().unwrap().name, "host_info");

        let summary = &h.llm.requests()[1];
        let tool_msgs: Vec<&ChatMessage> = summary
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .collect();
        assert_eq!(tool_msgs.len(), 2);
        assert_eq!(tool_msgs[0].tool_call_id.as_deref(), Some("call_0"));
        assert_eq!(tool_msgs[1].tool_call_id.as_deref(), Some("call_1"));
        assert!(tool_msgs[1].content.as_deref().unwrap().contains("ACCESS_DENIED"));
    }

    #[tokio::test]
    async fn test_unknown_tool_and_bad_arguments_are_reported() {
        let h = Harness::new(
            |db| native_tool(db, "host_info", json!({"type": "object"})),
            StubKnowledge::default(),
        );
        h.llm
            .push_tool_calls(&[("ghost", "{}"), ("host_info", "{not json")])
            .push_text("nothing worked");

        let resp = h.chat(ChatRequest::text("do things")).await;
        assert_eq!(resp.status, ChatStatus::Completed);
        assert_eq!(resp.tools[0].error.as_ref().unwrap().code, "TOOL_NOT_FOUND");
        assert_eq!(
            resp.tools[1].error.as_ref().unwrap().code,
            "INVALID_TOOL_ARGUMENTS"
        );
    }

    #[tokio::test]
    async fn test_rate_limited_after_default_rpm() {
        // 20 seconds into a minute window, so all 61 requests share it
        let h = Harness::at_time(|_| {}, StubKnowledge::default(), 1_700_000_060);
        for _ in 0..60 {
            let resp = h.chat(ChatRequest::text("ping")).await;
            assert_eq!(resp.status, ChatStatus::Completed);
        }
        let resp = h.chat(ChatRequest::text("ping")).await;
        assert_eq!(resp.status, ChatStatus::Error);
        assert_eq!(resp.error.as_ref().unwrap().code, "RATE_LIMITED");
        assert_eq!(resp.retry_after, Some(40));
        assert!(!resp.session_id.is_empty());
        assert_eq!(h.llm.call_count(), 60);
    }

    fn sql_setup(db: &AssistantDatabase) {
        native_tool(
            db,
            "run_sql",
            json!({
                "type": "object",
                "properties": {"sql": {"type": "string"}},
                "required": ["sql"]
            }),
        );
    }

    #[tokio::test]
    async fn test_high_risk_sql_reject_then_reuse_fails() {
        let h = Harness::new(sql_setup, StubKnowledge::default());
        let calls = h.native("run_sql", Ok(json!({"affected": 0})));
        h.llm
            .push_tool_calls(&[("run_sql", r#"{"sql":"DROP TABLE t;"}"#)]);

        let first = h.chat(ChatRequest::text("drop table t")).await;
        assert_eq!(first.status, ChatStatus::PendingConfirmation);
        let pending = first.pending_confirmation.clone().unwrap();
        assert!(!pending.confirm_id.is_empty());
        assert_eq!(pending.proposed_tool.name, "run_sql");
        let now = chrono::Utc::now().timestamp();
        assert!((pending.expires_at - (now + 300)).abs() <= 2);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let confirm = |action: &str| ChatRequest {
            session_id: Some(first.session_id.clone()),
            confirmation: Some(ConfirmationInput {
                confirm_id: pending.confirm_id.clone(),
                action: action.into(),
            }),
            ..Default::default()
        };

        let rejected = h.chat(confirm("reject")).await;
        assert_eq!(rejected.status, ChatStatus::Completed);
        assert_eq!(rejected.assistant_message.content, OPERATION_CANCELLED);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let reused = h.chat(confirm("approve")).await;
        assert_eq!(reused.status, ChatStatus::Error);
        assert_eq!(
            reused.error.as_ref().unwrap().code,
            "CONFIRMATION_INVALID"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_high_risk_approve_runs_stored_call() {
        let h = Harness::new(sql_setup, StubKnowledge::default());
        let calls = h.native("run_sql", Ok(json!({"affected": 0})));
        h.llm
            .push_tool_calls(&[("run_sql", r#"{"sql":"DELETE FROM t WHERE id = 1"}"#)])
            .push_text("Row deleted.");

        let first = h.chat(ChatRequest::text("delete row 1")).await;
        let pending = first.pending_confirmation.unwrap();

        let approved = h
            .chat(ChatRequest {
                session_id: Some(first.session_id.clone()),
                confirmation: Some(ConfirmationInput {
                    confirm_id: pending.confirm_id,
                    action: "approve".into(),
                }),
                ..Default::default()
            })
            .await;
        assert_eq!(approved.status, ChatStatus::Completed);
        assert_eq!(approved.assistant_message.content, "Row deleted.");
        assert_eq!(approved.tool.unwrap().request["sql"], "DELETE FROM t WHERE id = 1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_low_risk_sql_runs_without_confirmation() {
        let h = Harness::new(sql_setup, StubKnowledge::default());
        let calls = h.native("run_sql", Ok(json!({"rows": []})));
        h.llm
            .push_tool_calls(&[("run_sql", r#"{"sql":"SELECT * FROM t LIMIT 5"}"#)])
            .push_text("No rows.");

        let resp = h.chat(ChatRequest::text("show t")).await;
        assert_eq!(resp.status, ChatStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_confirmation_from_other_session_not_consumed() {
        let h = Harness::new(sql_setup, StubKnowledge::default());
        h.native("run_sql", Ok(json!({})));
        h.llm
            .push_tool_calls(&[("run_sql", r#"{"sql":"TRUNCATE t"}"#)]);
        let first = h.chat(ChatRequest::text("truncate t")).await;
        let confirm_id = first.pending_confirmation.unwrap().confirm_id;

        let wrong = h
            .chat(ChatRequest {
                session_id: Some("another-session".into()),
                confirmation: Some(ConfirmationInput {
                    confirm_id: confirm_id.clone(),
                    action: "reject".into(),
                }),
                ..Default::default()
            })
            .await;
        assert_eq!(wrong.status, ChatStatus::Error);

        let right = h
            .chat(ChatRequest {
                session_id: Some(first.session_id),
                confirmation: Some(ConfirmationInput {
                    confirm_id,
                    action: "reject".into(),
                }),
                ..Default::default()
            })
            .await;
        assert_eq!(right.assistant_message.content, OPERATION_CANCELLED);
    }

    #[tokio::test]
    async fn test_llm_failure_becomes_error_envelope() {
        let h = Harness::new(|_| {}, StubKnowledge::default());
        h.llm.push_error(InferenceError::HttpError {
            status: 400,
            body: "bad request: internal detail".into(),
        });

        let resp = h.chat(ChatRequest::text("Hello")).await;
        assert_eq!(resp.status, ChatStatus::Error);
        assert_eq!(resp.error.as_ref().unwrap().code, "LLM_ERROR");
        assert!(!resp.assistant_message.content.contains("internal detail"));
        assert!(!resp.session_id.is_empty());
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let h = Harness::new(|_| {}, StubKnowledge::default());
        let resp = h.chat(ChatRequest::text("   ")).await;
        assert_eq!(resp.status, ChatStatus::Error);
        assert_eq!(resp.error.unwrap().code, "INVALID_REQUEST");
        assert_eq!(h.llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_llm_routing_call_is_costed() {
        let h = Harness::new(
            |db| {
                for name in ["dba", "k8s"] {
                    db.upsert_agent(&Agent::new(name, AgentType::Expert)).unwrap();
                }
            },
            StubKnowledge::default(),
        );
        h.llm.push_text("dba").push_text("check the slow log");

        let resp = h.chat(ChatRequest::text("my query is slow")).await;
        assert_eq!(resp.status, ChatStatus::Completed);
        assert_eq!(h.llm.call_count(), 2);

        let today = chrono::Utc::now().date_naive();
        let daily = h.optimization.cost_daily(today).await.unwrap();
        assert_eq!(daily.total_calls, 2);
        let user = h.optimization.cost_user("u1", today).await.unwrap();
        assert_eq!(user.prompt_tokens, 200);
    }

    #[tokio::test]
    async fn test_foreign_session_rejected_without_touching_it() {
        let h = Harness::new(|_| {}, StubKnowledge::default());
        let owned = h
            .orchestrator
            .sessions
            .create("someone-else", CHAT_MODE, Some("theirs"))
            .await
            .unwrap();

        let resp = h.chat(ChatRequest::text("hi").in_session("theirs")).await;
        assert_eq!(resp.status, ChatStatus::Error);
        assert_eq!(resp.error.unwrap().code, "INVALID_REQUEST");
        assert_eq!(h.llm.call_count(), 0);

        let stored = h.orchestrator.sessions.get("theirs").await.unwrap().unwrap();
        assert_eq!(stored, owned);
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let h = Harness::new(|_| {}, StubKnowledge::default());
        h.token.cancel();
        let resp = h.chat(ChatRequest::text("Hello")).await;
        assert_eq!(resp.status, ChatStatus::Error);
        assert_eq!(h.llm.call_count(), 0);
    }
}
