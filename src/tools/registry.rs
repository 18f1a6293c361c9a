//! In-memory snapshot of enabled tools, plus the knowledge execute path.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::errors::ToolError;
use super::types::{ToolCallContext, ToolConfig, ToolImplementation};
use crate::config::{ConfigError, Reloadable};
use crate::inference::ToolDefinition;
use crate::knowledge::{KnowledgeError, KnowledgeQuery, KnowledgeRegistry, KnowledgeResponse, QueryStatus};
use crate::storage::AssistantDatabase;

// ─── Knowledge backend seam ──────────────────────────────────────────────────

/// Something that can answer a query against a provider id.
#[async_trait]
pub trait KnowledgeBackend: Send + Sync {
    async fn query_provider(
        &self,
        token: &CancellationToken,
        provider_id: i64,
        query: &KnowledgeQuery,
    ) -> Result<KnowledgeResponse, KnowledgeError>;
}

#[async_trait]
impl KnowledgeBackend for KnowledgeRegistry {
    async fn query_provider(
        &self,
        token: &CancellationToken,
        provider_id: i64,
        query: &KnowledgeQuery,
    ) -> Result<KnowledgeResponse, KnowledgeError> {
        self.query(token, provider_id, query).await
    }
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

type ToolMap = HashMap<String, Arc<ToolConfig>>;

/// Enabled tools keyed by name. Readers hold the previous snapshot until a swap.
pub struct ToolRegistry {
    db: Arc<AssistantDatabase>,
    tools: RwLock<Arc<ToolMap>>,
    knowledge: Arc<dyn KnowledgeBackend>,
}

impl ToolRegistry {
    pub fn new(db: Arc<AssistantDatabase>, knowledge: Arc<dyn KnowledgeBackend>) -> Self {
        Self {
            db,
            tools: RwLock::new(Arc::new(HashMap::new())),
            knowledge,
        }
    }

    fn snapshot(&self) -> Arc<ToolMap> {
        self.tools
            .read()
            .map(|t| Arc::clone(&t))
            .unwrap_or_default()
    }

    fn swap(&self, next: ToolMap) {
        if let Ok(mut guard) = self.tools.write() {
            *guard = Arc::new(next);
        }
    }

    /// Replace the snapshot with the store's enabled tools.
    pub fn load(&self) -> Result<usize, ToolError> {
        let tools = self
            .db
            .list_tools(false)
            .map_err(|e| ToolError::ExecutionFailed {
                tool: "*".into(),
                reason: format!("failed to load tools: {e}"),
            })?;
        let next: ToolMap = tools
            .into_iter()
            .map(|t| (t.name.clone(), Arc::new(t)))
            .collect();
        let count = next.len();
        self.swap(next);
        tracing::info!(tools = count, "tool registry loaded");
        Ok(count)
    }

    /// Add or replace one tool in the live snapshot.
    pub fn register(&self, tool: ToolConfig) -> Result<(), ToolError> {
        tool.validate()?;
        let mut next: ToolMap = (*self.snapshot()).clone();
        tracing::debug!(tool = %tool.name, kind = tool.implementation.kind(), "tool registered");
        next.insert(tool.name.clone(), Arc::new(tool));
        self.swap(next);
        Ok(())
    }

    /// Remove one tool from the live snapshot. Returns whether it was present.
    pub fn unregister(&self, name: &str) -> bool {
        let mut next: ToolMap = (*self.snapshot()).clone();
        let removed = next.remove(name).is_some();
        if removed {
            self.swap(next);
            tracing::debug!(tool = name, "tool unregistered");
        }
        removed
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.snapshot().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolConfig>> {
        self.snapshot().get(name).cloned()
    }

    /// All enabled tools sorted by name.
    pub fn all(&self) -> Vec<Arc<ToolConfig>> {
        let mut tools: Vec<Arc<ToolConfig>> = self
            .snapshot()
            .values()
            .filter(|t| t.enabled)
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Function-calling catalogue for every enabled tool.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.all().iter().map(|t| to_definition(t)).collect()
    }

    /// Catalogue restricted to `names`, in the given order. Unknown names are skipped.
    pub fn definitions_for(&self, names: &[String]) -> Vec<ToolDefinition> {
        let snapshot = self.snapshot();
        let mut seen = std::collections::HashSet::new();
        names
            .iter()
            .filter(|n| seen.insert(n.as_str()))
            .filter_map(|n| snapshot.get(n))
            .filter(|t| t.enabled)
            .map(|t| to_definition(t))
            .collect()
    }

    /// Run a knowledge-kind tool against its bound provider.
    ///
    /// The result is the provider response as JSON. A provider-reported
    /// failure becomes `KNOWLEDGE_QUERY_FAILED`; "no results" is a success.
    pub async fn execute(
        &self,
        token: &CancellationToken,
        ctx: &ToolCallContext,
        name: &str,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let tool = self.get(name).ok_or(ToolError::NotFound {
            name: name.to_string(),
        })?;
        self.execute_knowledge(token, ctx, &tool, args).await
    }

    pub(crate) async fn execute_knowledge(
        &self,
        token: &CancellationToken,
        ctx: &ToolCallContext,
        tool: &ToolConfig,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let ToolImplementation::Knowledge { provider_id } = tool.implementation else {
            return Err(ToolError::InvalidDefinition {
                tool: tool.name.clone(),
                reason: format!("'{}' is not a knowledge tool", tool.implementation.kind()),
            });
        };

        let query = KnowledgeQuery {
            query: args
                .get("query")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            user_id: ctx.user_id.clone(),
            conversation_id: ctx.conversation_id.clone(),
            top_k: args
                .get("top_k")
                .and_then(Value::as_u64)
                .map(|k| k as u32),
        };
        if query.query.trim().is_empty() {
            return Err(ToolError::InvalidArguments {
                tool: tool.name.clone(),
                reason: "missing required field 'query'".into(),
            });
        }

        let response = self
            .knowledge
            .query_provider(token, provider_id, &query)
            .await
            .map_err(|e| match e {
                KnowledgeError::Cancelled => ToolError::Cancelled {
                    tool: tool.name.clone(),
                },
                config_err @ (KnowledgeError::NotFound { .. }
                | KnowledgeError::UnknownType { .. }
                | KnowledgeError::InvalidConfig { .. }) => ToolError::InvalidDefinition {
                    tool: tool.name.clone(),
                    reason: config_err.to_string(),
                },
                other => ToolError::KnowledgeQueryFailed {
                    provider: provider_id.to_string(),
                    reason: other.to_string(),
                },
            })?;

        if response.status == QueryStatus::Failed {
            return Err(ToolError::KnowledgeQueryFailed {
                provider: provider_id.to_string(),
                reason: response.error.unwrap_or_else(|| "provider reported failure".into()),
            });
        }
        serde_json::to_value(&response).map_err(|e| ToolError::ExecutionFailed {
            tool: tool.name.clone(),
            reason: e.to_string(),
        })
    }
}

fn to_definition(tool: &ToolConfig) -> ToolDefinition {
    ToolDefinition::function(&tool.name, &tool.description, tool.parameter_schema())
}

#[async_trait]
impl Reloadable for ToolRegistry {
    fn component(&self) -> &str {
        "tools"
    }

    async fn reload(&self) -> Result<(), ConfigError> {
        self.load().map(|_| ()).map_err(|e| ConfigError::Reload {
            component: self.component().to_string(),
            reason: e.to_string(),
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Knowledge backend with a canned answer per provider id.
    #[derive(Default)]
    pub(crate) struct StubKnowledge {
        pub answers: Mutex<HashMap<i64, KnowledgeResponse>>,
        pub calls: AtomicUsize,
    }

    impl StubKnowledge {
        pub(crate) fn with(provider_id: i64, response: KnowledgeResponse) -> Self {
            let stub = Self::default();
            stub.answers.lock().unwrap().insert(provider_id, response);
            stub
        }
    }

    #[async_trait]
    impl KnowledgeBackend for StubKnowledge {
        async fn query_provider(
            &self,
            _token: &CancellationToken,
            provider_id: i64,
            _query: &KnowledgeQuery,
        ) -> Result<KnowledgeResponse, KnowledgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .lock()
                .unwrap()
                .get(&provider_id)
                .cloned()
                .ok_or(KnowledgeError::NotFound { id: provider_id })
        }
    }

    fn knowledge_tool(name: &str, provider_id: i64) -> ToolConfig {
        ToolConfig::new(name, "search docs", ToolImplementation::Knowledge { provider_id })
    }

    fn registry(stub: StubKnowledge) -> ToolRegistry {
        ToolRegistry::new(
            Arc::new(AssistantDatabase::open_in_memory().unwrap()),
            Arc::new(stub),
        )
    }

    #[test]
    fn test_register_list_unregister() {
        let registry = registry(StubKnowledge::default());
        registry.register(knowledge_tool("kb_a", 1)).unwrap();
        registry.register(knowledge_tool("kb_b", 2)).unwrap();
        assert!(registry.is_registered("kb_a"));

        let names: Vec<String> = registry
            .definitions()
            .into_iter()
            .map(|d| d.function.name)
            .collect();
        assert_eq!(names, vec!["kb_a", "kb_b"]);

        assert!(registry.unregister("kb_a"));
        assert!(!registry.unregister("kb_a"));
        assert!(!registry.is_registered("kb_a"));
        assert!(registry.is_registered("kb_b"));
        assert_eq!(registry.definitions().len(), 1);
    }

    #[test]
    fn test_default_query_parameter() {
        let registry = registry(StubKnowledge::default());
        registry.register(knowledge_tool("kb", 1)).unwrap();
        let defs = registry.definitions();
        assert_eq!(defs[0].function.parameters["required"][0], "query");
    }

    #[test]
    fn test_definitions_for_dedupes_and_skips_unknown() {
        let registry = registry(StubKnowledge::default());
        registry.register(knowledge_tool("kb", 1)).unwrap();
        let defs = registry.definitions_for(&["kb".into(), "ghost".into(), "kb".into()]);
        assert_eq!(defs.len(), 1);
    }

    #[test]
    fn test_load_counts_only_enabled() {
        let db = Arc::new(AssistantDatabase::open_in_memory().unwrap());
        db.upsert_tool(&knowledge_tool("on", 1)).unwrap();
        let mut off = knowledge_tool("off", 1);
        off.enabled = false;
        db.upsert_tool(&off).unwrap();

        let registry = ToolRegistry::new(db, Arc::new(StubKnowledge::default()));
        assert_eq!(registry.load().unwrap(), 1);
        assert_eq!(registry.definitions().len(), 1);
        assert!(!registry.is_registered("off"));
    }

    #[tokio::test]
    async fn test_execute_knowledge_tool() {
        let stub = StubKnowledge::with(
            7,
            KnowledgeResponse {
                status: QueryStatus::Success,
                answer: Some("42".into()),
                documents: vec![],
                conversation_id: None,
                error: None,
            },
        );
        let registry = registry(stub);
        registry.register(knowledge_tool("kb", 7)).unwrap();

        let result = registry
            .execute(
                &CancellationToken::new(),
                &ToolCallContext::default(),
                "kb",
                &serde_json::json!({"query": "meaning"}),
            )
            .await
            .unwrap();
        assert_eq!(result["status"], "success");
        assert_eq!(result["answer"], "42");
    }

    #[tokio::test]
    async fn test_unknown_provider_is_not_retryable() {
        let registry = registry(StubKnowledge::default());
        registry.register(knowledge_tool("kb", 99)).unwrap();

        let err = registry
            .execute(
                &CancellationToken::new(),
                &ToolCallContext::default(),
                "kb",
                &serde_json::json!({"query": "anything"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_TOOL_DEFINITION");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_execute_rejects_non_knowledge_and_missing_query() {
        let registry = registry(StubKnowledge::default());
        registry
            .register(ToolConfig::new(
                "native",
                "",
                ToolImplementation::Native {
                    handler: "h".into(),
                },
            ))
            .unwrap();
        registry.register(knowledge_tool("kb", 1)).unwrap();
        let token = CancellationToken::new();
        let ctx = ToolCallContext::default();

        let err = registry
            .execute(&token, &ctx, "native", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidDefinition { .. }));

        let err = registry
            .execute(&token, &ctx, "kb", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_TOOL_ARGUMENTS");

        let err = registry
            .execute(&token, &ctx, "missing", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TOOL_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_provider_failure_status_is_error() {
        let stub = StubKnowledge::with(1, KnowledgeResponse::failed("index offline"));
        let registry = registry(stub);
        registry.register(knowledge_tool("kb", 1)).unwrap();
        let err = registry
            .execute(
                &CancellationToken::new(),
                &ToolCallContext::default(),
                "kb",
                &serde_json::json!({"query": "x"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "KNOWLEDGE_QUERY_FAILED");
        assert!(err.is_retryable());
    }
}
