use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use mentora_provider::{EmbeddingProvider, RerankProvider};
use mentora_retrieval::RetrievalScope;
use mentora_schema::{AppError, ProviderType, RetrievedSpan, UserCredential};
use mentora_store::{KnowledgeRepo, UserRepo};

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/semantic", post(semantic_search))
}

#[derive(Deserialize)]
struct SemanticSearchRequest {
    query: String,
    #[serde(default)]
    kb_ids: Option<Vec<i64>>,
}

#[derive(Serialize)]
struct SemanticSearchResponse {
    results: Vec<RetrievedSpan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

const EMBEDDING_ORDER: &[ProviderType] = &[
    ProviderType::SiliconFlow,
    ProviderType::OpenAI,
    ProviderType::Zhipu,
    ProviderType::ModelScope,
    ProviderType::Custom,
];

fn pick_credential(creds: &[UserCredential]) -> Option<&UserCredential> {
    EMBEDDING_ORDER
        .iter()
        .find_map(|p| creds.iter().find(|c| c.provider_type == *p))
}

/// Ad-hoc semantic search over the caller's owned (or visible) corpora.
async fn semantic_search(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<SemanticSearchRequest>,
) -> ApiResult<Json<SemanticSearchResponse>> {
    if request.query.trim().is_empty() {
        return Err(AppError::bad_request("query must not be empty").into());
    }

    let kb_ids = match request.kb_ids {
        Some(requested) => Some(
            KnowledgeRepo::new(state.db.clone())
                .accessible_kb_ids(user_id, requested)
                .await?,
        ),
        None => None,
    };

    let creds = UserRepo::new(state.db.clone()).credentials(user_id).await?;
    let picked = pick_credential(&creds);
    let embedder: Arc<dyn EmbeddingProvider> = Arc::from(state.gateway.embedding_provider(picked));
    let reranker: Arc<dyn RerankProvider> = Arc::from(state.gateway.rerank_provider(picked));

    let outcome = state
        .retrieval
        .retrieve(
            user_id,
            &request.query,
            &RetrievalScope {
                kb_ids,
                conversation_id: None,
            },
            embedder.as_ref(),
            reranker.as_ref(),
        )
        .await?;

    Ok(Json(SemanticSearchResponse {
        results: outcome.spans,
        reason: outcome.reason,
    }))
}
