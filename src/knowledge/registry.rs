//! Loads providers from the store and serves them by id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::conversational::{self, ConversationalConfig, ConversationalProvider};
use super::errors::KnowledgeError;
use super::provider::KnowledgeProvider;
use super::search::{self, SearchConfig, SearchProvider};
use super::types::{KnowledgeQuery, KnowledgeResponse, ProviderRecord};
use crate::config::env::expand_env_vars;
use crate::config::{ConfigError, Reloadable};
use crate::storage::{AssistantDatabase, HealthState};

type ProviderMap = HashMap<i64, Arc<dyn KnowledgeProvider>>;

/// Instantiate a provider client from its row. Placeholders in the config are expanded first.
pub fn build_provider(record: &ProviderRecord) -> Result<Arc<dyn KnowledgeProvider>, KnowledgeError> {
    let config = expand_config(&record.config).map_err(|reason| KnowledgeError::InvalidConfig {
        provider: record.name.clone(),
        reason,
    })?;
    let invalid = |e: serde_json::Error| KnowledgeError::InvalidConfig {
        provider: record.name.clone(),
        reason: e.to_string(),
    };

    match record.provider_type.as_str() {
        search::PROVIDER_TYPE => {
            let cfg: SearchConfig = serde_json::from_value(config).map_err(invalid)?;
            Ok(Arc::new(SearchProvider::new(&record.name, cfg)?))
        }
        conversational::PROVIDER_TYPE => {
            let cfg: ConversationalConfig = serde_json::from_value(config).map_err(invalid)?;
            Ok(Arc::new(ConversationalProvider::new(&record.name, cfg)?))
        }
        other => Err(KnowledgeError::UnknownType {
            provider_type: other.to_string(),
        }),
    }
}

fn expand_config(config: &Value) -> Result<Value, String> {
    let raw = serde_json::to_string(config).map_err(|e| e.to_string())?;
    serde_json::from_str(&expand_env_vars(&raw)).map_err(|e| e.to_string())
}

// ─── KnowledgeRegistry ───────────────────────────────────────────────────────

/// Snapshot of instantiated providers, swapped atomically on reload.
pub struct KnowledgeRegistry {
    db: Arc<AssistantDatabase>,
    providers: RwLock<Arc<ProviderMap>>,
}

impl KnowledgeRegistry {
    pub fn new(db: Arc<AssistantDatabase>) -> Self {
        Self {
            db,
            providers: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    fn snapshot(&self) -> Arc<ProviderMap> {
        self.providers
            .read()
            .map(|p| Arc::clone(&p))
            .unwrap_or_default()
    }

    fn swap(&self, next: ProviderMap) {
        if let Ok(mut guard) = self.providers.write() {
            *guard = Arc::new(next);
        }
    }

    /// Rebuild the provider map from enabled rows.
    ///
    /// A row that fails to instantiate is marked unhealthy and skipped.
    pub fn load(&self) -> Result<usize, KnowledgeError> {
        let records = self.db.list_knowledge_providers(false)?;
        let mut next = HashMap::with_capacity(records.len());
        for record in &records {
            match build_provider(record) {
                Ok(provider) => {
                    next.insert(record.id, provider);
                }
                Err(e) => {
                    tracing::error!(provider = %record.name, error = %e, "failed to build knowledge provider");
                    let _ = self.db.update_provider_health(
                        record.id,
                        HealthState::Unhealthy,
                        Some(&e.to_string()),
                    );
                }
            }
        }
        let count = next.len();
        self.swap(next);
        tracing::info!(providers = count, "knowledge providers loaded");
        Ok(count)
    }

    /// Install a provider directly under `id` (tests and embedding callers).
    pub fn register(&self, id: i64, provider: Arc<dyn KnowledgeProvider>) {
        let mut next: ProviderMap = (*self.snapshot()).clone();
        next.insert(id, provider);
        self.swap(next);
    }

    pub fn get(&self, id: i64) -> Option<Arc<dyn KnowledgeProvider>> {
        self.snapshot().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Query the provider loaded under `provider_id`.
    pub async fn query(
        &self,
        token: &CancellationToken,
        provider_id: i64,
        request: &KnowledgeQuery,
    ) -> Result<KnowledgeResponse, KnowledgeError> {
        let provider = self
            .get(provider_id)
            .ok_or(KnowledgeError::NotFound { id: provider_id })?;
        provider.query(token, request).await
    }

    /// Probe every loaded provider and record the outcome.
    pub async fn check_health(&self, token: &CancellationToken) -> Vec<(i64, HealthState)> {
        let snapshot = self.snapshot();
        let mut results = Vec::with_capacity(snapshot.len());
        for (id, provider) in snapshot.iter() {
            let (state, error) = match provider.health(token).await {
                Ok(()) => (HealthState::Healthy, None),
                Err(e) => {
                    tracing::warn!(provider = provider.name(), error = %e, "knowledge provider unhealthy");
                    (HealthState::Unhealthy, Some(e.to_string()))
                }
            };
            if let Err(e) = self.db.update_provider_health(*id, state, error.as_deref()) {
                tracing::warn!(error = %e, "failed to record provider health");
            }
            results.push((*id, state));
        }
        results
    }

    /// Run `check_health` on a fixed cadence until cancelled.
    pub fn spawn_health_checker(
        self: Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.check_health(&token).await;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Reloadable for KnowledgeRegistry {
    fn component(&self) -> &str {
        "knowledge_providers"
    }

    async fn reload(&self) -> Result<(), ConfigError> {
        self.load().map(|_| ()).map_err(|e| ConfigError::Reload {
            component: self.component().to_string(),
            reason: e.to_string(),
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
