//! Retrieval engine: query embedding → top-K cosine candidates →
//! cross-encoder rerank with similarity fallback.

use anyhow::Result;

use mentora_provider::{EmbeddingProvider, RerankProvider};
use mentora_schema::{DocumentStatus, RetrievedSpan, SpanSource};
use mentora_store::{
    is_zero_vector, vector::cosine_similarity, ChunkFilter, ConversationRepo, Database, VectorIndex,
};

/// Candidate pool size before reranking.
pub const K_INITIAL: usize = 50;
/// Final result count.
pub const K_FINAL: usize = 5;
/// Diagnostic reason when the caller has no usable embedding
/// credential.
pub const NO_EMBEDDING_REASON: &str = "no embedding available";

/// What to search: the caller's knowledge bases and/or the ambient
/// conversation's temporary files. `kb_ids: None` means all owned
/// corpora.
#[derive(Debug, Clone, Default)]
pub struct RetrievalScope {
    pub kb_ids: Option<Vec<i64>>,
    pub conversation_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    pub spans: Vec<RetrievedSpan>,
    /// Set when the result is empty for a diagnosable reason.
    pub reason: Option<String>,
}

impl RetrievalOutcome {
    fn empty(reason: &str) -> Self {
        Self {
            spans: Vec::new(),
            reason: Some(reason.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct RetrievalEngine {
    index: VectorIndex,
    conversations: ConversationRepo,
}

impl RetrievalEngine {
    pub fn new(db: Database) -> Self {
        Self {
            index: VectorIndex::new(db.clone()),
            conversations: ConversationRepo::new(db),
        }
    }

    /// Run one retrieval for `owner_id` with the caller's providers.
    /// The embedder must be the owner's credential (zero-vector queries
    /// produce an empty result with a diagnostic, never false matches).
    pub async fn retrieve(
        &self,
        owner_id: i64,
        query: &str,
        scope: &RetrievalScope,
        embedder: &dyn EmbeddingProvider,
        reranker: &dyn RerankProvider,
    ) -> Result<RetrievalOutcome> {
        if query.trim().is_empty() {
            return Ok(RetrievalOutcome::empty("empty query"));
        }
        if !embedder.is_semantic() {
            return Ok(RetrievalOutcome::empty(NO_EMBEDDING_REASON));
        }

        let embedded = embedder
            .embed(&[query.to_string()])
            .await
            .map_err(anyhow::Error::from)?;
        let query_embedding = match embedded.embeddings.into_iter().next() {
            Some(e) if !is_zero_vector(&e) => e,
            _ => return Ok(RetrievalOutcome::empty(NO_EMBEDDING_REASON)),
        };

        let mut candidates = self
            .chunk_candidates(owner_id, &query_embedding, scope)
            .await?;
        candidates.extend(self.temp_file_candidates(owner_id, &query_embedding, scope).await?);

        if candidates.is_empty() {
            return Ok(RetrievalOutcome {
                spans: Vec::new(),
                reason: None,
            });
        }

        // Small pools skip the rerank pass entirely.
        if candidates.len() < K_FINAL {
            candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
            return Ok(RetrievalOutcome {
                spans: candidates,
                reason: None,
            });
        }

        let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        match reranker.rerank(query, &texts).await {
            Ok(scores) if scores.len() == candidates.len() => {
                // The gateway signals a missing reranker with all-zero
                // scores; similarity is the fallback ranking.
                if scores.iter().any(|s| *s != 0.0) {
                    for (candidate, score) in candidates.iter_mut().zip(&scores) {
                        candidate.score = *score;
                    }
                } else {
                    tracing::debug!("rerank returned all-zero scores, using similarity order");
                }
            }
            Ok(_) => {
                tracing::warn!("rerank score count mismatch, using similarity order");
            }
            Err(e) => {
                tracing::warn!(error = %e, "rerank failed, using similarity order");
            }
        }

        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates.truncate(K_FINAL);
        Ok(RetrievalOutcome {
            spans: candidates,
            reason: None,
        })
    }

    async fn chunk_candidates(
        &self,
        owner_id: i64,
        query_embedding: &[f32],
        scope: &RetrievalScope,
    ) -> Result<Vec<RetrievedSpan>> {
        // An explicitly empty kb set means "no knowledge bases": only
        // temp files remain in scope.
        if matches!(&scope.kb_ids, Some(ids) if ids.is_empty()) {
            return Ok(Vec::new());
        }

        let mut filter = ChunkFilter::owner(owner_id);
        if let Some(kb_ids) = &scope.kb_ids {
            filter = filter.with_kb_ids(kb_ids.clone());
        }

        let hits = self
            .index
            .query_top_k(query_embedding.to_vec(), filter, K_INITIAL)
            .await?;
        Ok(hits
            .into_iter()
            .map(|(chunk, score)| RetrievedSpan {
                chunk_id: chunk.id,
                document_id: chunk.document_id,
                kb_id: chunk.kb_id,
                chunk_index: chunk.chunk_index,
                text: chunk.text,
                score,
                source: SpanSource::Document,
            })
            .collect())
    }

    async fn temp_file_candidates(
        &self,
        owner_id: i64,
        query_embedding: &[f32],
        scope: &RetrievalScope,
    ) -> Result<Vec<RetrievedSpan>> {
        let Some(conversation_id) = scope.conversation_id else {
            return Ok(Vec::new());
        };

        let files = self.conversations.list_temp_files(conversation_id).await?;
        Ok(files
            .into_iter()
            .filter(|f| {
                f.owner_id == owner_id
                    && f.status == DocumentStatus::Completed
                    && !f.embedding.is_empty()
                    && !is_zero_vector(&f.embedding)
            })
            .map(|f| {
                let score = cosine_similarity(query_embedding, &f.embedding);
                RetrievedSpan {
                    chunk_id: f.id,
                    document_id: f.id,
                    kb_id: 0,
                    chunk_index: 0,
                    text: f.extracted_text,
                    score,
                    source: SpanSource::TemporaryFile,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mentora_provider::{
        EmbeddingResult, NoopRerank, ProviderError, StubEmbeddingProvider, ZeroEmbeddingProvider,
    };
    use mentora_schema::AccessLevel;
    use mentora_store::{KnowledgeRepo, NewChunk, UserRepo};

    /// Embedder that maps known words onto fixed axes so similarity is
    /// predictable in tests.
    struct AxisEmbedder;

    #[async_trait]
    impl EmbeddingProvider for AxisEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<EmbeddingResult, ProviderError> {
            let embeddings = texts
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    let mut v = vec![0.0_f32; 4];
                    if t.contains("paris") || t.contains("france") {
                        v[0] = 1.0;
                    }
                    if t.contains("tokyo") || t.contains("japan") {
                        v[1] = 1.0;
                    }
                    if t.contains("rust") {
                        v[2] = 1.0;
                    }
                    if v.iter().all(|x| *x == 0.0) {
                        v[3] = 1.0;
                    }
                    v
                })
                .collect();
            Ok(EmbeddingResult {
                embeddings,
                model: "axis".into(),
                dimensions: 4,
            })
        }

        fn model_id(&self) -> &str {
            "axis"
        }

        fn dimensions(&self) -> usize {
            4
        }
    }

    /// Reranker that strongly prefers candidates containing a keyword.
    struct KeywordRerank(&'static str);

    #[async_trait]
    impl mentora_provider::RerankProvider for KeywordRerank {
        async fn rerank(
            &self,
            _query: &str,
            candidates: &[String],
        ) -> Result<Vec<f32>, ProviderError> {
            Ok(candidates
                .iter()
                .map(|c| if c.contains(self.0) { 10.0 } else { 0.1 })
                .collect())
        }
    }

    struct Fixture {
        db: Database,
        owner: i64,
        kb: i64,
        doc: i64,
    }

    async fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let owner = UserRepo::new(db.clone()).create("owner").await.unwrap().id;
        let repo = KnowledgeRepo::new(db.clone());
        let kb = repo
            .create_kb(owner, "kb", None, AccessLevel::Private)
            .await
            .unwrap()
            .id;
        let doc = repo
            .create_document(kb, owner, "geo.txt", "k", "u", "text/plain", None)
            .await
            .unwrap()
            .id;
        Fixture { db, owner, kb, doc }
    }

    async fn index_texts(f: &Fixture, texts: &[&str]) {
        let embedder = AxisEmbedder;
        let result = embedder
            .embed(&texts.iter().map(|t| t.to_string()).collect::<Vec<_>>())
            .await
            .unwrap();
        let index = VectorIndex::new(f.db.clone());
        index.ensure_vec_table(4).await.unwrap();
        index
            .insert_chunks(
                texts
                    .iter()
                    .zip(result.embeddings)
                    .enumerate()
                    .map(|(i, (text, embedding))| NewChunk {
                        document_id: f.doc,
                        owner_id: f.owner,
                        kb_id: f.kb,
                        chunk_index: i as i64,
                        text: text.to_string(),
                        embedding,
                    })
                    .collect(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn zero_embedder_reports_no_embedding_available() {
        let f = fixture().await;
        index_texts(&f, &["The capital of France is Paris."]).await;

        let engine = RetrievalEngine::new(f.db.clone());
        let outcome = engine
            .retrieve(
                f.owner,
                "Alpha",
                &RetrievalScope::default(),
                &ZeroEmbeddingProvider::new(4),
                &NoopRerank,
            )
            .await
            .unwrap();
        assert!(outcome.spans.is_empty());
        assert_eq!(outcome.reason.as_deref(), Some(NO_EMBEDDING_REASON));
    }

    #[tokio::test]
    async fn similarity_ranking_finds_relevant_chunk() {
        let f = fixture().await;
        index_texts(
            &f,
            &[
                "The capital of France is Paris.",
                "Tokyo is the capital of Japan.",
                "Rust has a borrow checker.",
            ],
        )
        .await;

        let engine = RetrievalEngine::new(f.db.clone());
        let outcome = engine
            .retrieve(
                f.owner,
                "What is the capital of France?",
                &RetrievalScope {
                    kb_ids: Some(vec![f.kb]),
                    conversation_id: None,
                },
                &AxisEmbedder,
                &NoopRerank,
            )
            .await
            .unwrap();

        assert!(!outcome.spans.is_empty());
        assert!(outcome.spans[0].text.contains("Paris"));
        assert!(outcome.reason.is_none());
    }

    #[tokio::test]
    async fn rerank_overrides_similarity_order() {
        let f = fixture().await;
        // Five France-axis chunks so the pool reaches K_FINAL and the
        // reranker runs; only one mentions the keyword it prefers.
        index_texts(
            &f,
            &[
                "France fact one.",
                "France fact two.",
                "France fact three.",
                "France fact four.",
                "Paris is the capital of France.",
            ],
        )
        .await;

        let engine = RetrievalEngine::new(f.db.clone());
        let outcome = engine
            .retrieve(
                f.owner,
                "France",
                &RetrievalScope::default(),
                &AxisEmbedder,
                &KeywordRerank("Paris"),
            )
            .await
            .unwrap();

        assert_eq!(outcome.spans.len(), K_FINAL);
        assert!(outcome.spans[0].text.contains("Paris"));
        assert!(outcome.spans[0].score > outcome.spans[1].score);
    }

    #[tokio::test]
    async fn all_zero_rerank_falls_back_to_similarity() {
        let f = fixture().await;
        index_texts(
            &f,
            &[
                "Paris and France together.",
                "France fact.",
                "France note.",
                "France detail.",
                "Rust borrow checker.",
            ],
        )
        .await;

        let engine = RetrievalEngine::new(f.db.clone());
        let outcome = engine
            .retrieve(
                f.owner,
                "France",
                &RetrievalScope::default(),
                &AxisEmbedder,
                &NoopRerank,
            )
            .await
            .unwrap();

        assert_eq!(outcome.spans.len(), K_FINAL);
        // Similarity order survives: the Rust chunk scores lowest.
        assert!(outcome
            .spans
            .last()
            .map(|s| s.text.contains("Rust") || s.score <= outcome.spans[0].score)
            .unwrap_or(false));
    }

    #[tokio::test]
    async fn small_pool_skips_rerank() {
        let f = fixture().await;
        index_texts(&f, &["Paris in France.", "Tokyo in Japan."]).await;

        let engine = RetrievalEngine::new(f.db.clone());
        let outcome = engine
            .retrieve(
                f.owner,
                "France",
                &RetrievalScope::default(),
                &AxisEmbedder,
                &KeywordRerank("Tokyo"),
            )
            .await
            .unwrap();

        // Fewer than K_FINAL candidates: reranker (which would prefer
        // Tokyo) must not have run.
        assert_eq!(outcome.spans.len(), 2);
        assert!(outcome.spans[0].text.contains("Paris"));
    }

    #[tokio::test]
    async fn temp_files_join_the_pool() {
        let f = fixture().await;
        let convo = ConversationRepo::new(f.db.clone())
            .create(f.owner)
            .await
            .unwrap();
        let repo = ConversationRepo::new(f.db.clone());
        let file = repo
            .create_temp_file(convo.id, f.owner, "t.txt", "ai_chat_temp_files/t", "text/plain")
            .await
            .unwrap();
        let emb = AxisEmbedder
            .embed(&["Paris attachment".to_string()])
            .await
            .unwrap()
            .embeddings
            .remove(0);
        repo.complete_temp_file(file.id, "Paris attachment", emb)
            .await
            .unwrap();

        let engine = RetrievalEngine::new(f.db.clone());
        let outcome = engine
            .retrieve(
                f.owner,
                "Paris",
                &RetrievalScope {
                    kb_ids: Some(vec![]),
                    conversation_id: Some(convo.id),
                },
                &AxisEmbedder,
                &NoopRerank,
            )
            .await
            .unwrap();

        assert_eq!(outcome.spans.len(), 1);
        assert_eq!(outcome.spans[0].source, SpanSource::TemporaryFile);
        assert!(outcome.spans[0].text.contains("Paris"));
    }

    #[tokio::test]
    async fn pending_temp_files_are_excluded() {
        let f = fixture().await;
        let repo = ConversationRepo::new(f.db.clone());
        let convo = repo.create(f.owner).await.unwrap();
        repo.create_temp_file(convo.id, f.owner, "p.txt", "ai_chat_temp_files/p", "text/plain")
            .await
            .unwrap();

        let engine = RetrievalEngine::new(f.db.clone());
        let outcome = engine
            .retrieve(
                f.owner,
                "Paris",
                &RetrievalScope {
                    kb_ids: Some(vec![]),
                    conversation_id: Some(convo.id),
                },
                &AxisEmbedder,
                &NoopRerank,
            )
            .await
            .unwrap();
        assert!(outcome.spans.is_empty());
    }

    #[tokio::test]
    async fn stub_embedder_never_matches_unrelated_corpus() {
        let f = fixture().await;
        // Index with the deterministic stub; a different query text
        // hashes to an uncorrelated vector, so scores hover near zero
        // but results still come back ranked.
        let stub = StubEmbeddingProvider::new(4);
        let texts = vec!["Alpha".to_string()];
        let result = stub.embed(&texts).await.unwrap();
        let index = VectorIndex::new(f.db.clone());
        index.ensure_vec_table(4).await.unwrap();
        index
            .insert_chunks(vec![NewChunk {
                document_id: f.doc,
                owner_id: f.owner,
                kb_id: f.kb,
                chunk_index: 0,
                text: "Alpha".into(),
                embedding: result.embeddings[0].clone(),
            }])
            .await
            .unwrap();

        let engine = RetrievalEngine::new(f.db.clone());
        let outcome = engine
            .retrieve(f.owner, "Alpha", &RetrievalScope::default(), &stub, &NoopRerank)
            .await
            .unwrap();
        // Identical text embeds identically: perfect similarity.
        assert_eq!(outcome.spans.len(), 1);
        assert!(outcome.spans[0].score > 0.99);
    }
}
