//! Service wiring: builds every component from bootstrap settings and exposes
//! the chat entry point plus the administrative surface.
//!
//! Boot order matters. The relational store comes first, then the config
//! loader, then the registries that read from it. Components that hot-reload
//! are registered with the loader before the poller starts.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent_core::{
    ChatOrchestrator, ChatRequest, ChatResponse, ConfirmationManager, OrchestratorDeps, RiskChecker,
};
use crate::agents::{Agent, AgentConfig, AgentError, AgentRegistry};
use crate::config::{AssistantSettings, ConfigError, ConfigLoader, Reloadable};
use crate::inference::{ChatModel, InferenceError, OpenAiCompatibleClient};
use crate::knowledge::{build_provider, KnowledgeError, KnowledgeRegistry, ProviderRecord};
use crate::mcp_client::{McpError, RemoteServerManager, RemoteServerRecord, ServerStatus};
use crate::optimization::{CostStats, OptimizationError, OptimizationManager, RateStatus};
use crate::session::{Message, Session, SessionError, SessionManager, SessionStats};
use crate::storage::{AssistantDatabase, KvStore, MemoryKvStore, StoreError};
use crate::tools::{NativeHandlerRegistry, ToolConfig, ToolDispatcher, ToolError, ToolRegistry};

/// Cadence of the knowledge provider health probe.
const KNOWLEDGE_HEALTH_INTERVAL: Duration = Duration::from_secs(300);

/// Cadence of the inactive-session sweep.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Failure of a boot step or an administrative operation.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Knowledge(#[from] KnowledgeError),

    #[error(transparent)]
    RemoteServer(#[from] McpError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Optimization(#[from] OptimizationError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("Failed to prepare data directory {path}: {reason}")]
    Io { path: String, reason: String },
}

// ─── Services ────────────────────────────────────────────────────────────────

pub struct Services {
    db: Arc<AssistantDatabase>,
    loader: Arc<ConfigLoader>,
    agents: Arc<AgentRegistry>,
    tools: Arc<ToolRegistry>,
    knowledge: Arc<KnowledgeRegistry>,
    servers: Arc<RemoteServerManager>,
    sessions: Arc<SessionManager>,
    optimization: Arc<OptimizationManager>,
    orchestrator: ChatOrchestrator,
    reload_interval: Duration,
    session_idle: Duration,
    root: CancellationToken,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Services {
    /// Build everything from bootstrap settings with the HTTP model client.
    pub async fn start(settings: &AssistantSettings) -> Result<Self, ServiceError> {
        let llm: Arc<dyn ChatModel> = Arc::new(OpenAiCompatibleClient::new(settings.llm.clone())?);
        let db = open_database(&settings.database_path)?;
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        Self::build(settings, db, kv, llm, NativeHandlerRegistry::with_builtins()).await
    }

    /// Build from already-opened stores. Used by `start` and by tests.
    pub async fn build(
        settings: &AssistantSettings,
        db: Arc<AssistantDatabase>,
        kv: Arc<dyn KvStore>,
        llm: Arc<dyn ChatModel>,
        natives: NativeHandlerRegistry,
    ) -> Result<Self, ServiceError> {
        let root = CancellationToken::new();
        let loader = Arc::new(ConfigLoader::new(Arc::clone(&db)));

        let agents = Arc::new(AgentRegistry::new(Arc::clone(&db)));
        agents.init()?;

        let knowledge = Arc::new(KnowledgeRegistry::new(Arc::clone(&db)));
        knowledge.load()?;

        let tools = Arc::new(ToolRegistry::new(Arc::clone(&db), knowledge.clone()));
        tools.load()?;

        let servers = Arc::new(RemoteServerManager::new(Arc::clone(&db), root.child_token()));
        for (server, e) in servers.start_all().await {
            tracing::warn!(server = %server, error = %e, "remote server unavailable at startup");
        }

        let optimization = Arc::new(OptimizationManager::new(
            Arc::clone(&loader),
            Arc::clone(&kv),
            &settings.llm.default_model,
        )?);

        let dispatcher = Arc::new(ToolDispatcher::new(
            Arc::new(natives),
            Arc::clone(&servers),
            tools.clone(),
        )?);
        let sessions = Arc::new(SessionManager::new(Arc::clone(&kv), settings.session.clone()));

        let orchestrator = ChatOrchestrator::new(OrchestratorDeps {
            sessions: Arc::clone(&sessions),
            agents: Arc::clone(&agents),
            tools: Arc::clone(&tools),
            dispatcher,
            optimization: Arc::clone(&optimization),
            llm,
            confirmations: ConfirmationManager::new(
                kv,
                Duration::from_secs(settings.confirmation_ttl_secs.max(1)),
            ),
            risk: RiskChecker::new(settings.batch_risk_threshold),
        });

        // knowledge providers reload before tools so new provider ids resolve
        let components: [Arc<dyn Reloadable>; 5] = [
            knowledge.clone(),
            tools.clone(),
            agents.clone(),
            optimization.clone(),
            servers.clone(),
        ];
        for component in components {
            loader.register(component);
        }

        tracing::info!(
            agents = agents.len(),
            tools = tools.len(),
            knowledge_providers = knowledge.len(),
            remote_servers = servers.connected_count(),
            "services started"
        );

        Ok(Self {
            db,
            loader,
            agents,
            tools,
            knowledge,
            servers,
            sessions,
            optimization,
            orchestrator,
            reload_interval: Duration::from_secs(settings.reload_interval_secs.max(1)),
            session_idle: Duration::from_secs(settings.session.ttl_secs.max(1)),
            root,
            workers: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Start the config poller, the knowledge health probe and the session sweeper.
    pub fn spawn_background(&self) {
        let mut handles = vec![
            Arc::clone(&self.loader).spawn_poller(self.reload_interval, self.root.child_token()),
            Arc::clone(&self.knowledge)
                .spawn_health_checker(KNOWLEDGE_HEALTH_INTERVAL, self.root.child_token()),
        ];

        let sessions = Arc::clone(&self.sessions);
        let idle = self.session_idle;
        let token = self.root.child_token();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = sessions.sweep_inactive(idle).await {
                            tracing::warn!(error = %e, "session sweep failed");
                        }
                    }
                }
            }
        }));

        if let Ok(mut workers) = self.workers.lock() {
            workers.extend(handles);
        }
        tracing::info!(
            reload_interval_secs = self.reload_interval.as_secs(),
            "background workers started"
        );
    }

    /// Root token; cancelling it stops every worker and in-flight turn.
    pub fn token(&self) -> &CancellationToken {
        &self.root
    }

    // ─── Chat ───────────────────────────────────────────────────────────

    pub async fn handle_chat(
        &self,
        token: &CancellationToken,
        request: ChatRequest,
        user_id: &str,
    ) -> ChatResponse {
        self.orchestrator.handle_chat(token, request, user_id).await
    }

    // ─── Configuration ──────────────────────────────────────────────────

    /// Reload every registered component. Returns the failures.
    pub async fn reload_all(&self) -> Vec<ConfigError> {
        self.loader.reload_all().await
    }

    pub fn reload_optimization(&self) -> Result<(), ServiceError> {
        self.loader.clear_cache();
        self.optimization.reload_configs()?;
        Ok(())
    }

    // ─── Agents ─────────────────────────────────────────────────────────

    pub fn list_agents(&self) -> Vec<Arc<AgentConfig>> {
        self.agents.all()
    }

    pub fn upsert_agent(&self, agent: &Agent) -> Result<i64, ServiceError> {
        agent.validate()?;
        let id = self.db.upsert_agent(agent)?;
        self.agents.load()?;
        tracing::info!(agent = %agent.name, id, "agent saved");
        Ok(id)
    }

    pub fn delete_agent(&self, name: &str) -> Result<(), ServiceError> {
        if self.agents.get(name).is_some_and(|a| a.agent.is_system()) {
            return Err(AgentError::Invalid {
                name: name.to_string(),
                reason: "system agents cannot be deleted".into(),
            }
            .into());
        }
        self.db.delete_agent(name)?;
        self.agents.load()?;
        tracing::info!(agent = %name, "agent deleted");
        Ok(())
    }

    pub fn bind_agent_tools(&self, agent: &str, tools: &[String]) -> Result<(), ServiceError> {
        self.db.bind_agent_tools(agent, tools)?;
        self.agents.load()?;
        tracing::info!(agent = %agent, tools = tools.len(), "agent tools bound");
        Ok(())
    }

    // ─── Tools ──────────────────────────────────────────────────────────

    pub fn list_tools(&self) -> Vec<Arc<ToolConfig>> {
        self.tools.all()
    }

    pub fn upsert_tool(&self, tool: &ToolConfig) -> Result<i64, ServiceError> {
        tool.validate()?;
        let id = self.db.upsert_tool(tool)?;
        self.tools.load()?;
        // agents carry their bound tool rows
        self.agents.load()?;
        tracing::info!(tool = %tool.name, id, "tool saved");
        Ok(id)
    }

    pub fn delete_tool(&self, name: &str) -> Result<(), ServiceError> {
        self.db.delete_tool(name)?;
        self.tools.load()?;
        self.agents.load()?;
        tracing::info!(tool = %name, "tool deleted");
        Ok(())
    }

    pub async fn clear_tool_cache(&self, tool: Option<&str>) -> Result<u64, ServiceError> {
        let removed = match tool {
            Some(name) => self.optimization.cache_invalidate(name).await?,
            None => self.optimization.cache_clear().await?,
        };
        tracing::info!(tool = tool.unwrap_or("*"), removed, "tool cache cleared");
        Ok(removed)
    }

    // ─── Knowledge providers and remote servers ─────────────────────────

    /// Validate by building a client first, then persist and reload.
    pub fn upsert_knowledge_provider(&self, record: &ProviderRecord) -> Result<i64, ServiceError> {
        build_provider(record)?;
        let id = self.db.upsert_knowledge_provider(record)?;
        self.knowledge.load()?;
        tracing::info!(provider = %record.name, id, "knowledge provider saved");
        Ok(id)
    }

    pub async fn upsert_remote_server(&self, record: &RemoteServerRecord) -> Result<i64, ServiceError> {
        let id = self.db.upsert_remote_server(record)?;
        self.servers.reload().await?;
        tracing::info!(server = %record.name, id, "remote server saved");
        Ok(id)
    }

    pub fn remote_server_status(&self) -> Result<Vec<ServerStatus>, ServiceError> {
        Ok(self.servers.status()?)
    }

    pub async fn reconnect_remote_server(&self, server_id: i64) -> Result<(), ServiceError> {
        Ok(self.servers.reconnect(server_id).await?)
    }

    // ─── Cost and rate limits ───────────────────────────────────────────

    pub async fn cost_daily(&self, date: NaiveDate) -> Result<CostStats, ServiceError> {
        Ok(self.optimization.cost_daily(date).await?)
    }

    pub async fn cost_user(&self, user_id: &str, date: NaiveDate) -> Result<CostStats, ServiceError> {
        Ok(self.optimization.cost_user(user_id, date).await?)
    }

    pub async fn rate_limit_status(
        &self,
        user_id: &str,
        group: Option<&str>,
    ) -> Result<RateStatus, ServiceError> {
        Ok(self.optimization.rate_limit_status(user_id, group).await?)
    }

    // ─── Sessions ───────────────────────────────────────────────────────

    /// Full stored history of a session.
    pub async fn session_history(&self, session_id: &str) -> Result<Vec<Message>, ServiceError> {
        Ok(self.sessions.get_messages(session_id, 0).await?)
    }

    pub async fn user_sessions(&self, user_id: &str) -> Result<Vec<Session>, ServiceError> {
        Ok(self.sessions.list_user_sessions(user_id).await?)
    }

    pub async fn session_stats(&self, session_id: &str) -> Result<SessionStats, ServiceError> {
        Ok(self.sessions.get_stats(session_id).await?)
    }

    // ─── Shutdown ───────────────────────────────────────────────────────

    /// Cancel every worker, close remote connections and wait for the workers.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down services");
        self.root.cancel();
        self.servers.shutdown();
        let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("services stopped");
    }
}

/// Open the SQLite store, creating its parent directory when needed.
fn open_database(path: &str) -> Result<Arc<AssistantDatabase>, ServiceError> {
    if path != ":memory:" {
        if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ServiceError::Io {
                path: parent.display().to_string(),
                reason: e.to_string(),
            })?;
        }
    }
    Ok(Arc::new(AssistantDatabase::open(path)?))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
