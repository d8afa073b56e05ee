//! Web search backed by the Tavily API.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use qr_core::{Error, Resource, SearchProvider};

const DEFAULT_BASE_URL: &str = "https://api.tavily.com";

#[derive(Debug, Clone)]
pub struct TavilyConfig {
    /// Missing keys make every search fail with an auth error.
    pub api_key: Option<String>,
    pub base_url: String,
    pub max_results: usize,
    pub search_depth: String,
}

impl Default for TavilyConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            max_results: 5,
            search_depth: "advanced".to_string(),
        }
    }
}

pub struct TavilySearch {
    client: Client,
    config: TavilyConfig,
}

impl TavilySearch {
    pub fn new(config: TavilyConfig) -> Self {
        Self {
            client: Client::builder()
                .user_agent(concat!("qr/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_default(),
            config,
        }
    }
}

#[derive(Debug, Serialize)]
struct TavilyRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    max_results: usize,
    search_depth: &'a str,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    /// Snippet of the page relevant to the query.
    #[serde(default)]
    content: String,
}

#[async_trait]
impl SearchProvider for TavilySearch {
    fn name(&self) -> &str {
        "tavily"
    }

    async fn search(&self, query: &str) -> Result<Vec<Resource>, Error> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::auth("no Tavily API key configured"))?;

        let url = format!("{}/search", self.config.base_url.trim_end_matches('/'));
        let body = TavilyRequest {
            api_key,
            query,
            max_results: self.config.max_results,
            search_depth: &self.config.search_depth,
        };

        info!(query = %query, "Calling Tavily");
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => Error::auth(text),
                429 => Error::rate_limit(text),
                code => Error::search(format!("Tavily returned {}: {}", code, text)),
            });
        }

        let data: TavilyResponse = response
            .json()
            .await
            .map_err(|e| Error::serialization(e.to_string()))?;

        let resources: Vec<Resource> = data
            .results
            .into_iter()
            .filter(|r| !r.url.is_empty())
            .take(self.config.max_results)
            .map(|r| Resource::new(r.url, r.title, r.content))
            .collect();

        debug!(query = %query, count = resources.len(), "Tavily results");
        Ok(resources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn search_for(server: &MockServer) -> TavilySearch {
        TavilySearch::new(TavilyConfig {
            api_key: Some("tvly-test".to_string()),
            base_url: server.uri(),
            ..TavilyConfig::default()
        })
    }

    #[tokio::test]
    async fn test_search_maps_results_and_limits_count() {
        let server = MockServer::start().await;
        let results: Vec<serde_json::Value> = (0..8)
            .map(|i| {
                serde_json::json!({
                    "title": format!("Result {}", i),
                    "url": format!("https://example.com/{}", i),
                    "content": format!("snippet {}", i),
                    "score": 0.9
                })
            })
            .collect();

        Mock::given(method("POST"))
            .and(path("/search"))
            .and(body_partial_json(serde_json::json!({
                "query": "solar power",
                "max_results": 5,
                "search_depth": "advanced"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "query": "solar power",
                "results": results
            })))
            .mount(&server)
            .await;

        let found = search_for(&server).search("solar power").await.unwrap();
        assert_eq!(found.len(), 5);
        assert_eq!(found[0].url, "https://example.com/0");
        assert_eq!(found[0].title, "Result 0");
        assert_eq!(found[0].description, "snippet 0");
        assert!(found[0].content.is_none());
    }

    #[tokio::test]
    async fn test_search_quota_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("quota exceeded"))
            .mount(&server)
            .await;

        let err = search_for(&server).search("anything").await.unwrap_err();
        assert!(matches!(err, Error::RateLimit(_)));
    }

    #[tokio::test]
    async fn test_search_without_key_fails_closed() {
        let search = TavilySearch::new(TavilyConfig::default());
        let err = search.search("anything").await.unwrap_err();
        assert!(err.is_auth_error());
    }
}
