use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use mentora_schema::SearchHit;

use crate::error::ProviderError;
use crate::retry::{retry_with_backoff, DEFAULT_ATTEMPTS};

pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RESULT_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchEngine {
    Tavily,
    Bocha,
}

impl SearchEngine {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tavily" => Some(SearchEngine::Tavily),
            "bocha" => Some(SearchEngine::Bocha),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SearchEngine::Tavily => "tavily",
            SearchEngine::Bocha => "bocha",
        }
    }
}

#[async_trait]
pub trait WebSearchProvider: Send + Sync {
    async fn search(&self, query: &str, count: usize) -> Result<Vec<SearchHit>, ProviderError>;
}

/// Build a search provider for a configured engine.
pub fn search_provider(
    engine: SearchEngine,
    api_key: impl Into<String>,
    base_url: Option<&str>,
) -> Box<dyn WebSearchProvider> {
    match engine {
        SearchEngine::Tavily => Box::new(TavilySearch::new(
            api_key,
            base_url.unwrap_or("https://api.tavily.com"),
        )),
        SearchEngine::Bocha => Box::new(BochaSearch::new(
            api_key,
            base_url.unwrap_or("https://api.bochaai.com/v1"),
        )),
    }
}

// ---------------------------------------------------------------------------
// Tavily
// ---------------------------------------------------------------------------

pub struct TavilySearch {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl TavilySearch {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SEARCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn search_once(&self, query: &str, count: usize) -> Result<Vec<SearchHit>, ProviderError> {
        let url = format!("{}/search", self.base_url);
        let body = serde_json::json!({
            "api_key": self.api_key,
            "query": query,
            "max_results": count,
        });

        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), text));
        }

        let parsed: TavilyResponse = response.json().await.map_err(|e| {
            ProviderError::Fatal { status: 200, detail: format!("malformed search response: {e}") }
        })?;

        Ok(parsed
            .results
            .into_iter()
            .map(|r| SearchHit {
                title: r.title,
                url: r.url,
                snippet: r.content,
                published: r.published_date,
            })
            .collect())
    }
}

#[derive(Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Deserialize)]
struct TavilyResult {
    title: String,
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    published_date: Option<String>,
}

#[async_trait]
impl WebSearchProvider for TavilySearch {
    async fn search(&self, query: &str, count: usize) -> Result<Vec<SearchHit>, ProviderError> {
        let count = count.clamp(1, 10);
        retry_with_backoff(DEFAULT_ATTEMPTS, || self.search_once(query, count)).await
    }
}

// ---------------------------------------------------------------------------
// Bocha
// ---------------------------------------------------------------------------

pub struct BochaSearch {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl BochaSearch {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SEARCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn search_once(&self, query: &str, count: usize) -> Result<Vec<SearchHit>, ProviderError> {
        let url = format!("{}/web-search", self.base_url);
        let body = serde_json::json!({
            "query": query,
            "count": count,
            "summary": true,
        });

        let response = self
            .client
            .post(&url)
            .header("authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), text));
        }

        let parsed: BochaResponse = response.json().await.map_err(|e| {
            ProviderError::Fatal { status: 200, detail: format!("malformed search response: {e}") }
        })?;

        let pages = parsed
            .data
            .and_then(|d| d.web_pages)
            .map(|w| w.value)
            .unwrap_or_default();
        Ok(pages
            .into_iter()
            .map(|p| SearchHit {
                title: p.name,
                url: p.url,
                snippet: p.snippet,
                published: p.date_published,
            })
            .collect())
    }
}

#[derive(Deserialize)]
struct BochaResponse {
    #[serde(default)]
    data: Option<BochaData>,
}

#[derive(Deserialize)]
struct BochaData {
    #[serde(rename = "webPages", default)]
    web_pages: Option<BochaWebPages>,
}

#[derive(Deserialize)]
struct BochaWebPages {
    #[serde(default)]
    value: Vec<BochaPage>,
}

#[derive(Deserialize)]
struct BochaPage {
    name: String,
    url: String,
    #[serde(default)]
    snippet: String,
    #[serde(rename = "datePublished", default)]
    date_published: Option<String>,
}

#[async_trait]
impl WebSearchProvider for BochaSearch {
    async fn search(&self, query: &str, count: usize) -> Result<Vec<SearchHit>, ProviderError> {
        let count = count.clamp(1, 10);
        retry_with_backoff(DEFAULT_ATTEMPTS, || self.search_once(query, count)).await
    }
}
