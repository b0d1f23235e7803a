//! Provider gateway: typed calls to external embedding, chat,
//! reranker and web-search providers. The gateway is stateless:
//! every call carries its own (lazily decrypted) credential.

pub mod chat;
pub mod credentials;
pub mod embedding;
pub mod error;
pub mod rerank;
pub mod retry;
pub mod web_search;

use mentora_schema::{ProviderType, UserCredential};

pub use chat::{
    ChatMessage, ChatProvider, ChatRequest, ChatResponse, ChatUsage, OpenAiCompatChat, StubChat,
    ToolCallRequest, ToolDef,
};
pub use credentials::CredentialVault;
pub use embedding::{
    EmbeddingProvider, EmbeddingResult, OpenAiCompatEmbedding, StubEmbeddingProvider,
    ZeroEmbeddingProvider,
};
pub use error::ProviderError;
pub use rerank::{NoopRerank, OpenAiCompatRerank, RerankProvider};
pub use retry::retry_with_backoff;
pub use web_search::{search_provider, SearchEngine, WebSearchProvider};

/// System-wide provider defaults from configuration.
#[derive(Debug, Clone)]
pub struct ProviderDefaults {
    pub chat_model: String,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub rerank_model: String,
}

impl Default for ProviderDefaults {
    fn default() -> Self {
        Self {
            chat_model: "gpt-4o-mini".into(),
            embedding_model: "text-embedding-3-small".into(),
            embedding_dimensions: 1536,
            rerank_model: "bge-reranker-v2-m3".into(),
        }
    }
}

/// A decrypted, ready-to-use credential.
#[derive(Debug, Clone)]
pub struct ResolvedCredential {
    pub provider_type: ProviderType,
    pub api_key: String,
    pub base_url: String,
    pub model_id: Option<String>,
    pub model_ids: Vec<String>,
}

/// Factory for per-request provider instances.
#[derive(Clone)]
pub struct ProviderGateway {
    vault: CredentialVault,
    pub defaults: ProviderDefaults,
}

impl ProviderGateway {
    pub fn new(vault: CredentialVault, defaults: ProviderDefaults) -> Self {
        Self { vault, defaults }
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    /// Decrypt a stored credential and fill in provider defaults.
    pub fn resolve(&self, cred: &UserCredential) -> Result<ResolvedCredential, ProviderError> {
        let api_key = self
            .vault
            .open(&cred.encrypted_key)
            .map_err(|e| ProviderError::Unconfigured(format!("credential unusable: {e}")))?;

        let base_url = match cred.base_url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let default = cred.provider_type.default_base_url();
                if default.is_empty() {
                    return Err(ProviderError::Unconfigured(
                        "custom provider requires a base URL".into(),
                    ));
                }
                default.to_string()
            }
        };

        Ok(ResolvedCredential {
            provider_type: cred.provider_type,
            api_key,
            base_url,
            model_id: cred.model_id.clone(),
            model_ids: cred.model_ids.clone(),
        })
    }

    /// Chat capability. Missing credential is an error; there is no
    /// meaningful chat fallback. Returns the provider, the model id
    /// after precedence resolution (request override, then the user's
    /// configured model, then the system default), and the provider
    /// type label for audit columns.
    pub fn chat_provider(
        &self,
        cred: Option<&UserCredential>,
        model_override: Option<&str>,
    ) -> Result<(Box<dyn ChatProvider>, String, &'static str), ProviderError> {
        let cred = cred.ok_or_else(|| {
            ProviderError::Unconfigured("no chat provider credential configured".into())
        })?;
        let resolved = self.resolve(cred)?;

        let model = model_override
            .map(str::to_owned)
            .or_else(|| resolved.model_id.clone())
            .or_else(|| resolved.model_ids.first().cloned())
            .unwrap_or_else(|| self.defaults.chat_model.clone());

        Ok((
            Box::new(OpenAiCompatChat::new(resolved.api_key, resolved.base_url)),
            model,
            resolved.provider_type.as_str(),
        ))
    }

    /// Embedding capability. A missing or unusable credential degrades
    /// to the zero-vector sentinel provider so ingestion still
    /// completes (the rows simply never match real queries).
    pub fn embedding_provider(&self, cred: Option<&UserCredential>) -> Box<dyn EmbeddingProvider> {
        let dims = self.defaults.embedding_dimensions;
        let Some(cred) = cred else {
            return Box::new(ZeroEmbeddingProvider::new(dims));
        };
        match self.resolve(cred) {
            Ok(resolved) => Box::new(OpenAiCompatEmbedding::new(
                resolved.api_key,
                resolved.base_url,
                self.defaults.embedding_model.clone(),
                dims,
            )),
            Err(e) => {
                tracing::warn!(error = %e, "embedding credential unusable, using zero-vector sentinel");
                Box::new(ZeroEmbeddingProvider::new(dims))
            }
        }
    }

    /// Rerank capability. Missing credential degrades to all-zero
    /// scores, which the retrieval engine reads as a fallback signal.
    pub fn rerank_provider(&self, cred: Option<&UserCredential>) -> Box<dyn RerankProvider> {
        let Some(cred) = cred else {
            return Box::new(NoopRerank);
        };
        match self.resolve(cred) {
            Ok(resolved) => Box::new(OpenAiCompatRerank::new(
                resolved.api_key,
                resolved.base_url,
                self.defaults.rerank_model.clone(),
            )),
            Err(e) => {
                tracing::warn!(error = %e, "rerank credential unusable, falling back to similarity");
                Box::new(NoopRerank)
            }
        }
    }

    /// Web-search capability for a configured engine.
    pub fn web_search_provider(
        &self,
        engine: &str,
        api_key: &str,
        base_url: Option<&str>,
    ) -> Result<Box<dyn WebSearchProvider>, ProviderError> {
        let engine = SearchEngine::parse(engine).ok_or_else(|| {
            ProviderError::Unconfigured(format!("unsupported search engine: {engine}"))
        })?;
        if api_key.is_empty() {
            return Err(ProviderError::Unconfigured(
                "search engine credential missing".into(),
            ));
        }
        Ok(search_provider(engine, api_key, base_url))
    }
}
