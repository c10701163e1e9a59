//! 联网检索（HTTP JSON 端点）
//!
//! 对接 SearxNG 风格的 `?q=...&format=json` 接口。网络与 5xx 算瞬态，
//! 401/403 算配置问题。

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::core::AssistantError;
use crate::providers::traits::{SearchHit, SearchProvider};

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<RawHit>,
}

#[derive(Debug, Deserialize)]
struct RawHit {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default, alias = "content")]
    snippet: String,
}

/// HTTP 检索端点客户端
pub struct HttpSearchProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSearchProvider {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, AssistantError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AssistantError::Internal(format!("search client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl SearchProvider for HttpSearchProvider {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, AssistantError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("format", "json")])
            .send()
            .await
            .map_err(|e| AssistantError::TransientIo(format!("search: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AssistantError::UpstreamAuth(format!(
                "search endpoint rejected request: {status}"
            )));
        }
        if !status.is_success() {
            return Err(AssistantError::TransientIo(format!(
                "search endpoint returned {status}"
            )));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| AssistantError::TransientIo(format!("search: malformed response: {e}")))?;

        tracing::debug!(query, hits = parsed.results.len(), "search completed");
        Ok(parsed
            .results
            .into_iter()
            .take(max_results)
            .map(|r| SearchHit {
                title: r.title,
                url: r.url,
                snippet: r.snippet,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_searx_result_shape() {
        let raw = r#"{
            "query": "rust",
            "results": [
                {"title": "Rust", "url": "https://rust-lang.org", "content": "systems language"},
                {"title": "Tokio", "url": "https://tokio.rs"}
            ]
        }"#;
        let parsed: SearchResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.results.len(), 2);
        assert_eq!(parsed.results[0].snippet, "systems language");
        assert_eq!(parsed.results[1].snippet, "");
    }

    #[test]
    fn test_missing_results_key_is_empty() {
        let parsed: SearchResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.results.is_empty());
    }
}
