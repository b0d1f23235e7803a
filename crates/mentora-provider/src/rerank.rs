use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::retry::{retry_with_backoff, DEFAULT_ATTEMPTS};

pub const RERANK_TIMEOUT: Duration = Duration::from_secs(30);

/// Second-pass cross-encoder scoring. Scores are opaque reals aligned
/// with the candidate order; only their relative order matters. An
/// all-zero score vector signals the caller to fall back to similarity
/// ranking.
#[async_trait]
pub trait RerankProvider: Send + Sync {
    async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>, ProviderError>;
}

#[derive(Clone)]
pub struct OpenAiCompatRerank {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiCompatRerank {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(RERANK_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }

    async fn rerank_once(
        &self,
        query: &str,
        candidates: &[String],
    ) -> Result<Vec<f32>, ProviderError> {
        let url = format!("{}/rerank", self.base_url);
        let request = ApiRerankRequest {
            model: self.model.clone(),
            query: query.to_string(),
            documents: candidates.to_vec(),
        };

        let response = self
            .client
            .post(&url)
            .header("authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }

        let parsed: ApiRerankResponse = response.json().await.map_err(|e| {
            ProviderError::Fatal { status: 200, detail: format!("malformed rerank response: {e}") }
        })?;

        // Scores come back ranked; realign them with candidate order.
        let mut scores = vec![0.0_f32; candidates.len()];
        for item in parsed.results {
            if item.index < scores.len() {
                scores[item.index] = item.relevance_score;
            }
        }
        Ok(scores)
    }
}

#[async_trait]
impl RerankProvider for OpenAiCompatRerank {
    async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>, ProviderError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        retry_with_backoff(DEFAULT_ATTEMPTS, || self.rerank_once(query, candidates)).await
    }
}

#[derive(Serialize)]
struct ApiRerankRequest {
    model: String,
    query: String,
    documents: Vec<String>,
}

#[derive(Deserialize)]
struct ApiRerankResponse {
    results: Vec<ApiRerankResult>,
}

#[derive(Deserialize)]
struct ApiRerankResult {
    index: usize,
    relevance_score: f32,
}

/// Missing-credential fallback: all-zero scores, which the retrieval
/// engine reads as "use similarity instead".
pub struct NoopRerank;

#[async_trait]
impl RerankProvider for NoopRerank {
    async fn rerank(&self, _query: &str, candidates: &[String]) -> Result<Vec<f32>, ProviderError> {
        Ok(vec![0.0; candidates.len()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn scores_align_with_candidate_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rerank"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    {"index": 2, "relevance_score": 0.9},
                    {"index": 0, "relevance_score": 0.4},
                    {"index": 1, "relevance_score": 0.1}
                ]
            })))
            .mount(&server)
            .await;

        let provider = OpenAiCompatRerank::new("sk", server.uri(), "bge-reranker-v2-m3");
        let scores = provider
            .rerank("q", &["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(scores, vec![0.4, 0.1, 0.9]);
    }

    #[tokio::test]
    async fn empty_candidates_return_empty() {
        let provider = OpenAiCompatRerank::new("sk", "http://127.0.0.1:1", "m");
        let scores = provider.rerank("q", &[]).await.unwrap();
        assert!(scores.is_empty());
    }

    #[tokio::test]
    async fn noop_returns_all_zero_signal() {
        let scores = NoopRerank
            .rerank("q", &["a".into(), "b".into()])
            .await
            .unwrap();
        assert_eq!(scores, vec![0.0, 0.0]);
    }

    #[tokio::test]
    async fn provider_5xx_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rerank"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let provider = OpenAiCompatRerank::new("sk", server.uri(), "m");
        let err = provider.rerank("q", &["a".into()]).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
