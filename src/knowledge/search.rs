//! Search-style provider: ranked documents plus an optional synthesised answer.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::errors::KnowledgeError;
use super::provider::{build_http_client, join_url, post_json, probe, KnowledgeProvider, DEFAULT_TIMEOUT_SECS};
use super::types::{KnowledgeDocument, KnowledgeQuery, KnowledgeResponse, QueryStatus};

pub const PROVIDER_TYPE: &str = "search";

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_search_path")]
    pub search_path: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    /// Documents scoring below this are dropped.
    #[serde(default)]
    pub min_score: Option<f64>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_search_path() -> String {
    "/search".into()
}
fn default_health_path() -> String {
    "/health".into()
}
fn default_top_k() -> u32 {
    5
}
fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    top_k: u32,
    #[serde(skip_serializing_if = "str::is_empty")]
    user_id: &'a str,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<KnowledgeDocument>,
}

pub struct SearchProvider {
    name: String,
    config: SearchConfig,
    http: HttpClient,
}

impl SearchProvider {
    pub fn new(name: &str, config: SearchConfig) -> Result<Self, KnowledgeError> {
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
impl KnowledgeProvider for SearchProvider {
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
        let url = join_url(&self.config.endpoint, &self.config.search_path);
        let body = SearchRequest {
            query: &request.query,
            top_k: request.top_k.unwrap_or(self.config.top_k),
            user_id: &request.user_id,
        };
        let resp: SearchResponse = post_json(
            &self.http,
            &self.name,
            &url,
            self.config.api_key.as_deref(),
            &body,
            token,
        )
        .await?;

        let documents: Vec<KnowledgeDocument> = match self.config.min_score {
            Some(min) => resp
                .results
                .into_iter()
                .filter(|d| d.score.map(|s| s >= min).unwrap_or(true))
                .collect(),
            None => resp.results,
        };
        let answer = resp.answer.filter(|a| !a.trim().is_empty());

        tracing::debug!(
            provider = %self.name,
            documents = documents.len(),
            has_answer = answer.is_some(),
            "search provider answered"
        );

        if documents.is_empty() && answer.is_none() {
            return Ok(KnowledgeResponse::no_results(None));
        }
        Ok(KnowledgeResponse {
            status: QueryStatus::Success,
            answer,
            documents,
            conversation_id: None,
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

    fn provider(url: String) -> SearchProvider {
        let config: SearchConfig =
            serde_json::from_value(serde_json::json!({"endpoint": url, "min_score": 0.3})).unwrap();
        SearchProvider::new("docs", config).unwrap()
    }

    #[tokio::test]
    async fn test_query_returns_ranked_documents() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/search")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "query": "jumpserver地址是什么",
                "top_k": 5
            })))
            .with_status(200)
            .with_body(
                r#"{"answer":"https://jump.example.com","results":[
                    {"title":"堡垒机","content":"jumpserver: https://jump.example.com","score":0.9},
                    {"title":"运维手册","content":"...","score":0.5},
                    {"title":"noise","content":"...","score":0.1}
                ]}"#,
            )
            .create_async()
            .await;

        let resp = provider(server.url())
            .query(
                &CancellationToken::new(),
                &KnowledgeQuery {
                    query: "jumpserver地址是什么".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.status, QueryStatus::Success);
        assert_eq!(resp.documents.len(), 2);
        assert_eq!(resp.answer.as_deref(), Some("https://jump.example.com"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_empty_results_are_no_results() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/search")
            .with_status(200)
            .with_body(r#"{"results":[]}"#)
            .create_async()
            .await;

        let resp = provider(server.url())
            .query(&CancellationToken::new(), &KnowledgeQuery::default())
            .await
            .unwrap();
        assert_eq!(resp.status, QueryStatus::NoResults);
        assert!(resp.is_empty());
    }

    #[tokio::test]
    async fn test_server_error_is_http_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/search")
            .with_status(502)
            .create_async()
            .await;

        let err = provider(server.url())
            .query(&CancellationToken::new(), &KnowledgeQuery::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KnowledgeError::Http { status: Some(502), .. }));
    }

    #[tokio::test]
    async fn test_health_probe() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/health")
            .with_status(200)
            .create_async()
            .await;
        assert!(provider(server.url())
            .health(&CancellationToken::new())
            .await
            .is_ok());
    }

    #[test]
    fn test_missing_endpoint_rejected() {
        let config: SearchConfig =
            serde_json::from_value(serde_json::json!({"endpoint": ""})).unwrap();
        assert!(SearchProvider::new("docs", config).is_err());
    }
}
