use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ProviderError;
use crate::retry::{retry_with_backoff, DEFAULT_ATTEMPTS};

pub const EMBED_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub embeddings: Vec<Vec<f32>>,
    pub model: String,
    pub dimensions: usize,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingResult, ProviderError>;
    fn model_id(&self) -> &str;
    fn dimensions(&self) -> usize;
    /// False for the zero-vector fallback: its output carries no
    /// semantics and must never rank against real queries.
    fn is_semantic(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible implementation
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct OpenAiCompatEmbedding {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dimensions: usize,
}

impl OpenAiCompatEmbedding {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(EMBED_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            dimensions,
        }
    }

    async fn embed_once(&self, texts: &[String]) -> Result<EmbeddingResult, ProviderError> {
        let url = format!("{}/embeddings", self.base_url);
        let request = ApiEmbeddingRequest {
            model: self.model.clone(),
            input: texts.to_vec(),
            encoding_format: "float".into(),
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

        let parsed: ApiEmbeddingResponse = response.json().await.map_err(|e| {
            ProviderError::Fatal { status: 200, detail: format!("malformed embedding response: {e}") }
        })?;
        let model = parsed.model.clone();
        let embeddings = extract_ordered_embeddings(parsed)?;

        if embeddings.len() != texts.len() {
            return Err(ProviderError::Fatal {
                status: 200,
                detail: format!(
                    "embedding count mismatch: expected {}, got {}",
                    texts.len(),
                    embeddings.len()
                ),
            });
        }
        if embeddings.iter().any(|item| item.len() != self.dimensions) {
            return Err(ProviderError::Fatal {
                status: 200,
                detail: format!(
                    "embedding dimensions mismatch with configured dimensions {}",
                    self.dimensions
                ),
            });
        }

        Ok(EmbeddingResult {
            embeddings,
            model,
            dimensions: self.dimensions,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiCompatEmbedding {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingResult, ProviderError> {
        if texts.is_empty() {
            return Ok(EmbeddingResult {
                embeddings: Vec::new(),
                model: self.model.clone(),
                dimensions: self.dimensions,
            });
        }
        retry_with_backoff(DEFAULT_ATTEMPTS, || self.embed_once(texts)).await
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[derive(Serialize)]
struct ApiEmbeddingRequest {
    model: String,
    input: Vec<String>,
    encoding_format: String,
}

#[derive(Deserialize)]
struct ApiEmbeddingResponse {
    data: Vec<ApiEmbeddingData>,
    #[serde(default)]
    model: String,
}

#[derive(Deserialize)]
struct ApiEmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

fn extract_ordered_embeddings(
    response: ApiEmbeddingResponse,
) -> Result<Vec<Vec<f32>>, ProviderError> {
    let mut data = response.data;
    data.sort_by_key(|item| item.index);

    for (expected_index, item) in data.iter().enumerate() {
        if item.index != expected_index {
            return Err(ProviderError::Fatal {
                status: 200,
                detail: format!(
                    "missing or duplicated embedding index: expected {expected_index}, got {}",
                    item.index
                ),
            });
        }
    }

    Ok(data.into_iter().map(|item| item.embedding).collect())
}

// ---------------------------------------------------------------------------
// Zero-vector fallback (missing credential)
// ---------------------------------------------------------------------------

/// Returns the zero-vector sentinel for every input. Used when the
/// tenant has no embedding credential so ingestion can still complete;
/// sentinel rows never match a real query.
#[derive(Clone)]
pub struct ZeroEmbeddingProvider {
    dims: usize,
}

impl ZeroEmbeddingProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

#[async_trait]
impl EmbeddingProvider for ZeroEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingResult, ProviderError> {
        Ok(EmbeddingResult {
            embeddings: texts.iter().map(|_| vec![0.0; self.dims]).collect(),
            model: "none".into(),
            dimensions: self.dims,
        })
    }

    fn model_id(&self) -> &str {
        "none"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn is_semantic(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Deterministic stub (tests)
// ---------------------------------------------------------------------------

/// Hash-derived pseudo-embeddings: deterministic, non-zero, and equal
/// inputs map to equal vectors.
#[derive(Clone)]
pub struct StubEmbeddingProvider {
    dims: usize,
}

impl StubEmbeddingProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn hash_to_unit_range(text: &str, index: usize) -> f32 {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(index.to_le_bytes());
        let hash = hasher.finalize();
        let value = u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]]);
        (value as f32 / u32::MAX as f32) * 2.0 - 1.0
    }
}

#[async_trait]
impl EmbeddingProvider for StubEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingResult, ProviderError> {
        let embeddings = texts
            .iter()
            .map(|text| {
                (0..self.dims)
                    .map(|index| Self::hash_to_unit_range(text, index))
                    .collect::<Vec<f32>>()
            })
            .collect();
        Ok(EmbeddingResult {
            embeddings,
            model: "stub".into(),
            dimensions: self.dims,
        })
    }

    fn model_id(&self) -> &str {
        "stub"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}
