//! AgentRegistry: hot-reloadable snapshot of enabled agents and their tools.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::errors::AgentError;
use super::types::{system_agent_seeds, AgentConfig, AgentType};
use crate::config::{ConfigError, Reloadable};
use crate::storage::AssistantDatabase;

/// One consistent view of the agents. Replaced wholesale on reload.
#[derive(Debug, Default)]
pub struct AgentSnapshot {
    by_name: HashMap<String, Arc<AgentConfig>>,
    by_id: HashMap<i64, Arc<AgentConfig>>,
}

impl AgentSnapshot {
    fn from_configs(configs: Vec<AgentConfig>) -> Self {
        let mut snapshot = AgentSnapshot::default();
        for config in configs {
            let config = Arc::new(config);
            snapshot.by_id.insert(config.agent.id, Arc::clone(&config));
            snapshot.by_name.insert(config.agent.name.clone(), config);
        }
        snapshot
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<Arc<AgentConfig>> {
        self.by_name.get(name).cloned()
    }

    /// Sorted by priority (highest first), then name.
    pub fn all(&self) -> Vec<Arc<AgentConfig>> {
        let mut agents: Vec<Arc<AgentConfig>> = self.by_name.values().cloned().collect();
        agents.sort_by(|a, b| {
            b.agent
                .priority
                .cmp(&a.agent.priority)
                .then_with(|| a.agent.name.cmp(&b.agent.name))
        });
        agents
    }

    /// Agents users may address with `@name`.
    pub fn for_mention(&self) -> Vec<Arc<AgentConfig>> {
        self.all()
            .into_iter()
            .filter(|a| a.agent.is_mentionable())
            .collect()
    }
}

pub struct AgentRegistry {
    db: Arc<AssistantDatabase>,
    snapshot: RwLock<Arc<AgentSnapshot>>,
}

impl AgentRegistry {
    pub fn new(db: Arc<AssistantDatabase>) -> Self {
        Self {
            db,
            snapshot: RwLock::new(Arc::new(AgentSnapshot::default())),
        }
    }

    /// Create any missing reserved system agents. Returns how many were added.
    pub fn seed_system_agents(&self) -> Result<usize, AgentError> {
        let inserted = self.db.insert_missing_agents(&system_agent_seeds())?;
        if inserted > 0 {
            tracing::info!(inserted, "seeded system agents");
        }
        Ok(inserted)
    }

    /// Read enabled agents with their tools and swap the snapshot.
    ///
    /// Invalid rows are skipped with a warning so one bad agent cannot take
    /// routing down.
    pub fn load(&self) -> Result<usize, AgentError> {
        let rows = self.db.load_agents_with_tools(false)?;
        let mut configs = Vec::with_capacity(rows.len());
        for (agent, tools) in rows {
            if let Err(e) = agent.validate() {
                tracing::warn!(agent = %agent.name, error = %e, "skipping invalid agent");
                continue;
            }
            configs.push(AgentConfig { agent, tools });
        }
        let next = AgentSnapshot::from_configs(configs);
        let count = next.len();
        if let Ok(mut guard) = self.snapshot.write() {
            *guard = Arc::new(next);
        }
        tracing::info!(agents = count, "agent registry loaded");
        Ok(count)
    }

    /// Seed then load. Used at startup.
    pub fn init(&self) -> Result<usize, AgentError> {
        self.seed_system_agents()?;
        self.load()
    }

    /// The current snapshot. Holders keep it even if a reload swaps it.
    pub fn snapshot(&self) -> Arc<AgentSnapshot> {
        self.snapshot
            .read()
            .map(|s| Arc::clone(&s))
            .unwrap_or_default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<AgentConfig>> {
        self.snapshot().get(name)
    }

    pub fn get_by_id(&self, id: i64) -> Option<Arc<AgentConfig>> {
        self.snapshot().by_id.get(&id).cloned()
    }

    pub fn by_type(&self, agent_type: AgentType) -> Vec<Arc<AgentConfig>> {
        self.snapshot()
            .all()
            .into_iter()
            .filter(|a| a.agent.agent_type == agent_type)
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<AgentConfig>> {
        self.snapshot().all()
    }

    pub fn for_mention(&self) -> Vec<Arc<AgentConfig>> {
        self.snapshot().for_mention()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Reloadable for AgentRegistry {
    fn component(&self) -> &str {
        "agents"
    }

    async fn reload(&self) -> Result<(), ConfigError> {
        self.load().map(|_| ()).map_err(|e| ConfigError::Reload {
            component: "agents".into(),
            reason: e.to_string(),
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
