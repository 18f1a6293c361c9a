//! Conversational provider: a chat-style knowledge app that keeps a
//! `conversation_id` across turns.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::errors::KnowledgeError;
use super::provider::{build_http_client, join_url, post_json, probe, KnowledgeProvider, DEFAULT_TIMEOUT_SECS};
use super::types::{KnowledgeDocument, KnowledgeQuery, KnowledgeResponse, QueryStatus};

pub const PROVIDER_TYPE: &str = "conversational";

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationalConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Extra app inputs sent with every query.
    #[serde(default)]
    pub inputs: serde_json::Map<String, Value>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_chat_path() -> String {
    "/chat-messages".into()
}
fn default_health_path() -> String {
    "/parameters".into()
}
fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    query: &'a str,
    inputs: &'a serde_json::Map<String, Value>,
    response_mode: &'static str,
    /// Empty string starts a new conversation.
    conversation_id: &'a str,
    user: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    answer: String,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    metadata: Option<ChatMetadata>,
}

#[derive(Deserialize)]
struct ChatMetadata {
    #[serde(default)]
    retriever_resources: Vec<RetrieverResource>,
}

#[derive(Deserialize)]
struct RetrieverResource {
    #[serde(default)]
    document_name: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    score: Option<f64>,
}

pub struct ConversationalProvider {
    name: String,
    config: ConversationalConfig,
    http: HttpClient,
}

impl ConversationalProvider {
    pub fn new(name: &str, config: ConversationalConfig) -> Result<Self, KnowledgeError> {
        if config.endpoint.trim().is_empty() {
            return Err(KnowledgeError::InvalidConfig {
                provider: name.to_string(),
                reason: "endpoint is required".into(),
            });
        }
        let http = build_http_client(name, config.timeout_secs)?;
        Ok(Self {
            name: name.to_string(),
            config,
            http,
        })
    }
}

#[async_trait]
impl KnowledgeProvider for ConversationalProvider {
    fn provider_type(&self) -> &'static str {
        PROVIDER_TYPE
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn query(
        &self,
        token: &CancellationToken,
        request: &KnowledgeQuery,
    ) -> Result<KnowledgeResponse, KnowledgeError> {
        let url = join_url(&self.config.endpoint, &self.config.chat_path);
        let user = if request.user_id.is_empty() {
            "ai-assistant"
        } else {
            &request.user_id
        };
        let body = ChatRequest {
            query: &request.query,
            inputs: &self.config.inputs,
            response_mode: "blocking",
            conversation_id: request.conversation_id.as_deref().unwrap_or(""),
            user,
        };
        let resp: ChatResponse = post_json(
            &self.http,
            &self.name,
            &url,
            self.config.api_key.as_deref(),
            &body,
            token,
        )
        .await?;

        // Keep the caller's id when the provider does not echo one back.
        let conversation_id = resp
            .conversation_id
            .filter(|c| !c.is_empty())
            .or_else(|| request.conversation_id.clone());

        let documents: Vec<KnowledgeDocument> = resp
            .metadata
            .map(|m| m.retriever_resources)
            .unwrap_or_default()
            .into_iter()
            .map(|r| KnowledgeDocument {
                title: r.document_name,
                content: r.content,
                url: None,
                score: r.score,
            })
            .collect();

        if resp.answer.trim().is_empty() {
            return Ok(KnowledgeResponse::no_results(conversation_id));
        }
        Ok(KnowledgeResponse {
            status: QueryStatus::Success,
            answer: Some(resp.answer),
            documents,
            conversation_id,
            error: None,
        })
    }

    async fn health(&self, token: &CancellationToken) -> Result<(), KnowledgeError> {
        let url = join_url(&self.config.endpoint, &self.config.health_path);
        probe(&self.http, &self.name, &url, self.config.api_key.as_deref(), token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn provider(url: String) -> ConversationalProvider {
        let config: ConversationalConfig = serde_json::from_value(serde_json::json!({
            "endpoint": url,
            "api_key": "app-key"
        }))
        .unwrap();
        ConversationalProvider::new("helpdesk", config).unwrap()
    }

    #[tokio::test]
    async fn test_conversation_id_carried_across_turns() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("POST", "/chat-messages")
            .match_header("authorization", "Bearer app-key")
            .match_body(Matcher::PartialJson(serde_json::json!({"conversation_id": ""})))
            .with_status(200)
            .with_body(r#"{"answer":"VPN 使用 OpenVPN","conversation_id":"conv-1"}"#)
            .create_async()
            .await;
        let second = server
            .mock("POST", "/chat-messages")
            .match_body(Matcher::PartialJson(serde_json::json!({"conversation_id": "conv-1"})))
            .with_status(200)
            .with_body(r#"{"answer":"端口 1194","conversation_id":"conv-1"}"#)
            .create_async()
            .await;

        let p = provider(server.url());
        let token = CancellationToken::new();
        let resp = p
            .query(
                &token,
                &KnowledgeQuery {
                    query: "vpn 怎么连".into(),
                    user_id: "u1".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.conversation_id.as_deref(), Some("conv-1"));

        let resp = p
            .query(
                &token,
                &KnowledgeQuery {
                    query: "端口呢".into(),
                    user_id: "u1".into(),
                    conversation_id: resp.conversation_id.clone(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.answer.as_deref(), Some("端口 1194"));
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_blank_answer_is_no_results() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat-messages")
            .with_status(200)
            .with_body(r#"{"answer":"  "}"#)
            .create_async()
            .await;

        let resp = provider(server.url())
            .query(
                &CancellationToken::new(),
                &KnowledgeQuery {
                    query: "?".into(),
                    conversation_id: Some("conv-9".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.status, QueryStatus::NoResults);
        assert_eq!(resp.conversation_id.as_deref(), Some("conv-9"));
    }
}
