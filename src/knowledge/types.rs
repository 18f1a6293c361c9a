//! Knowledge provider types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::HealthRecord;

/// A persisted knowledge provider row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    /// Selects the client implementation (`search`, `conversational`).
    pub provider_type: String,
    /// Provider-specific settings; may contain `${ENV}` placeholders.
    #[serde(default)]
    pub config: Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub health: HealthRecord,
    #[serde(default)]
    pub updated_at: i64,
}

fn default_enabled() -> bool {
    true
}

/// One knowledge lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeQuery {
    pub query: String,
    #[serde(default)]
    pub user_id: String,
    /// Carried across turns by conversational providers.
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub top_k: Option<u32>,
}

/// Domain-level outcome of a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Success,
    NoResults,
    Failed,
}

/// A ranked document returned by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeResponse {
    pub status: QueryStatus,
    /// Answer synthesised by the provider, when it produces one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default)]
    pub documents: Vec<KnowledgeDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl KnowledgeResponse {
    pub fn no_results(conversation_id: Option<String>) -> Self {
        Self {
            status: QueryStatus::NoResults,
            answer: None,
            documents: Vec::new(),
            conversation_id,
            error: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: QueryStatus::Failed,
            answer: None,
            documents: Vec::new(),
            conversation_id: None,
            error: Some(reason.into()),
        }
    }

    /// True when there is nothing for the summary step to work with.
    pub fn is_empty(&self) -> bool {
        self.status == QueryStatus::NoResults
            || (self.documents.is_empty()
                && self.answer.as_deref().map(str::trim).unwrap_or("").is_empty())
    }
}
