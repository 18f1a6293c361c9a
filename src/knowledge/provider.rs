//! The provider interface and shared HTTP plumbing.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::errors::KnowledgeError;
use super::types::{KnowledgeQuery, KnowledgeResponse};

/// TCP connection timeout for provider calls.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default request timeout for provider calls.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// A search-over-documents service.
#[async_trait]
pub trait KnowledgeProvider: Send + Sync {
    /// Tag used for registry lookups (`search`, `conversational`).
    fn provider_type(&self) -> &'static str;

    /// Configured provider name, for logs.
    fn name(&self) -> &str;

    /// Run a query. Empty results come back as `QueryStatus::NoResults`.
    async fn query(
        &self,
        token: &CancellationToken,
        request: &KnowledgeQuery,
    ) -> Result<KnowledgeResponse, KnowledgeError>;

    /// Probe the service.
    async fn health(&self, token: &CancellationToken) -> Result<(), KnowledgeError>;
}

// ─── HTTP helpers ────────────────────────────────────────────────────────────

pub(crate) fn build_http_client(provider: &str, timeout_secs: u64) -> Result<HttpClient, KnowledgeError> {
    HttpClient::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .map_err(|e| KnowledgeError::InvalidConfig {
            provider: provider.to_string(),
            reason: format!("failed to build HTTP client: {e}"),
        })
}

/// POST `body` as JSON and decode the JSON answer, honouring cancellation.
pub(crate) async fn post_json<B: Serialize + ?Sized, R: DeserializeOwned>(
    http: &HttpClient,
    provider: &str,
    url: &str,
    api_key: Option<&str>,
    body: &B,
    token: &CancellationToken,
) -> Result<R, KnowledgeError> {
    let mut request = http.post(url).json(body);
    if let Some(key) = api_key.filter(|k| !k.is_empty()) {
        request = request.bearer_auth(key);
    }

    let send = async {
        let response = request.send().await.map_err(|e| KnowledgeError::Http {
            provider: provider.to_string(),
            status: None,
            body: e.to_string(),
        })?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(KnowledgeError::Http {
                provider: provider.to_string(),
                status: Some(status.as_u16()),
                body: text,
            });
        }
        serde_json::from_str(&text).map_err(|e| KnowledgeError::InvalidResponse {
            provider: provider.to_string(),
            reason: e.to_string(),
        })
    };

    tokio::select! {
        biased;
        _ = token.cancelled() => Err(KnowledgeError::Cancelled),
        result = send => result,
    }
}

/// GET `url` and require a 2xx answer.
pub(crate) async fn probe(
    http: &HttpClient,
    provider: &str,
    url: &str,
    api_key: Option<&str>,
    token: &CancellationToken,
) -> Result<(), KnowledgeError> {
    let mut request = http.get(url);
    if let Some(key) = api_key.filter(|k| !k.is_empty()) {
        request = request.bearer_auth(key);
    }
    let check = async {
        let response = request.send().await.map_err(|e| KnowledgeError::Http {
            provider: provider.to_string(),
            status: None,
            body: e.to_string(),
        })?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(KnowledgeError::Http {
                provider: provider.to_string(),
                status: Some(response.status().as_u16()),
                body: response.text().await.unwrap_or_default(),
            })
        }
    };
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(KnowledgeError::Cancelled),
        result = check => result,
    }
}

/// Join a base URL and a path with exactly one slash.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://kb/", "/search"), "http://kb/search");
        assert_eq!(join_url("http://kb", "search"), "http://kb/search");
    }
}
