use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::Semaphore;
use tokio::task;

use mentora_blob::BlobStore;
use mentora_provider::{EmbeddingProvider, ProviderGateway};
use mentora_schema::{DocumentStatus, ProviderType, UserCredential};
use mentora_store::{ConversationRepo, Database, KnowledgeRepo, NewChunk, UserRepo, VectorIndex};

use crate::chunker::{chunk_text, ChunkerConfig};
use crate::extract::extract_text;

/// Credential precedence for embedding calls when a user has several
/// providers configured.
const EMBEDDING_PROVIDER_ORDER: &[ProviderType] = &[
    ProviderType::SiliconFlow,
    ProviderType::OpenAI,
    ProviderType::Zhipu,
    ProviderType::ModelScope,
    ProviderType::Custom,
];

/// Orchestrates blob download → extract → chunk → embed → index with
/// durable status transitions. Runs off the request path; the HTTP
/// endpoint creates the row, returns 202 and hands the id here.
pub struct IngestionPipeline {
    knowledge: KnowledgeRepo,
    conversations: ConversationRepo,
    index: VectorIndex,
    users: UserRepo,
    blob: Arc<dyn BlobStore>,
    gateway: ProviderGateway,
    chunker: ChunkerConfig,
    semaphore: Arc<Semaphore>,
    embedder_override: Option<Arc<dyn EmbeddingProvider>>,
}

impl IngestionPipeline {
    pub fn new(
        db: Database,
        blob: Arc<dyn BlobStore>,
        gateway: ProviderGateway,
        max_concurrent: usize,
    ) -> Arc<Self> {
        Arc::new(Self::build(db, blob, gateway, max_concurrent, None))
    }

    /// Substitute a fixed embedding provider (tests, offline mode).
    pub fn with_embedder(
        db: Database,
        blob: Arc<dyn BlobStore>,
        gateway: ProviderGateway,
        max_concurrent: usize,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Arc<Self> {
        Arc::new(Self::build(db, blob, gateway, max_concurrent, Some(embedder)))
    }

    fn build(
        db: Database,
        blob: Arc<dyn BlobStore>,
        gateway: ProviderGateway,
        max_concurrent: usize,
        embedder_override: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Self {
        Self {
            knowledge: KnowledgeRepo::new(db.clone()),
            conversations: ConversationRepo::new(db.clone()),
            index: VectorIndex::new(db.clone()),
            users: UserRepo::new(db),
            blob,
            gateway,
            chunker: ChunkerConfig::default(),
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            embedder_override,
        }
    }

    /// Fire-and-forget document ingestion, bounded by the worker pool.
    pub fn spawn_document(self: &Arc<Self>, document_id: i64) {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = pipeline.semaphore.clone().acquire_owned().await;
            if let Err(e) = pipeline.run_document(document_id).await {
                tracing::error!(document_id, error = %e, "document ingestion failed");
            }
        });
    }

    pub fn spawn_temp_file(self: &Arc<Self>, temp_file_id: i64) {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = pipeline.semaphore.clone().acquire_owned().await;
            if let Err(e) = pipeline.run_temp_file(temp_file_id).await {
                tracing::error!(temp_file_id, error = %e, "temporary file ingestion failed");
            }
        });
    }

    /// Run the document state machine to a terminal status. Idempotent:
    /// an already-completed document is left untouched, so at-least-once
    /// task delivery is safe.
    pub async fn run_document(&self, document_id: i64) -> Result<()> {
        let doc = self
            .knowledge
            .get_document(document_id)
            .await?
            .ok_or_else(|| anyhow!("document {document_id} not found"))?;
        if doc.status == DocumentStatus::Completed {
            tracing::debug!(document_id, "document already completed, skipping");
            return Ok(());
        }

        self.knowledge
            .set_document_status(document_id, DocumentStatus::Processing, Some("downloading"))
            .await?;

        match self.process_document(&doc).await {
            Ok(total_chunks) => {
                self.knowledge
                    .complete_document(document_id, total_chunks)
                    .await?;
                tracing::info!(document_id, total_chunks, "document ingestion completed");
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                self.knowledge
                    .set_document_status(document_id, DocumentStatus::Failed, Some(&message))
                    .await?;
                tracing::warn!(document_id, error = %message, "document ingestion failed");
                Ok(())
            }
        }
    }

    async fn process_document(&self, doc: &mentora_schema::KnowledgeDocument) -> Result<i64> {
        // Source of truth is the blob store, even on the same host.
        let bytes = self.blob.download(&doc.blob_key).await?;

        self.knowledge
            .set_document_status(doc.id, DocumentStatus::Processing, Some("extracting text"))
            .await?;
        let mime = doc.mime.clone();
        let text = task::spawn_blocking(move || extract_text(&bytes, &mime)).await??;
        if text.trim().is_empty() {
            return Err(anyhow!("empty content"));
        }

        let chunks = chunk_text(&text, &self.chunker);
        if chunks.is_empty() {
            return Err(anyhow!("chunk failed"));
        }

        self.knowledge
            .set_document_status(doc.id, DocumentStatus::Processing, Some("embedding"))
            .await?;
        let embedder = self.embedder_for(doc.owner_id).await?;
        self.index.ensure_vec_table(embedder.dimensions()).await?;

        let result = embedder.embed(&chunks).await.map_err(|e| anyhow!("{e}"))?;
        if result.embeddings.len() != chunks.len() {
            return Err(anyhow!("embedding count mismatch"));
        }

        let rows = chunks
            .into_iter()
            .zip(result.embeddings)
            .enumerate()
            .map(|(i, (text, embedding))| NewChunk {
                document_id: doc.id,
                owner_id: doc.owner_id,
                kb_id: doc.kb_id,
                chunk_index: i as i64,
                text,
                embedding,
            })
            .collect::<Vec<_>>();
        let n = rows.len() as i64;
        self.index.insert_chunks(rows).await?;
        Ok(n)
    }

    /// Temporary files run the same machine but produce one chunk-shaped
    /// row scoped to the conversation.
    pub async fn run_temp_file(&self, temp_file_id: i64) -> Result<()> {
        let file = self
            .conversations
            .get_temp_file(temp_file_id)
            .await?
            .ok_or_else(|| anyhow!("temporary file {temp_file_id} not found"))?;
        if file.status == DocumentStatus::Completed {
            return Ok(());
        }

        self.conversations
            .set_temp_file_status(temp_file_id, DocumentStatus::Processing, Some("downloading"))
            .await?;

        let outcome: Result<()> = async {
            let bytes = self.blob.download(&file.blob_key).await?;
            let mime = file.mime.clone();
            let text = task::spawn_blocking(move || extract_text(&bytes, &mime)).await??;
            if text.trim().is_empty() {
                return Err(anyhow!("empty content"));
            }

            let embedder = self.embedder_for(file.owner_id).await?;
            let result = embedder
                .embed(&[text.clone()])
                .await
                .map_err(|e| anyhow!("{e}"))?;
            let embedding = result
                .embeddings
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("embedding count mismatch"))?;

            self.conversations
                .complete_temp_file(temp_file_id, &text, embedding)
                .await
        }
        .await;

        if let Err(e) = outcome {
            let message = e.to_string();
            self.conversations
                .set_temp_file_status(temp_file_id, DocumentStatus::Failed, Some(&message))
                .await?;
            tracing::warn!(temp_file_id, error = %message, "temporary file ingestion failed");
        }
        Ok(())
    }

    async fn embedder_for(&self, owner_id: i64) -> Result<Arc<dyn EmbeddingProvider>> {
        if let Some(embedder) = &self.embedder_override {
            return Ok(Arc::clone(embedder));
        }
        let creds = self.users.credentials(owner_id).await?;
        let picked = pick_embedding_credential(&creds);
        Ok(Arc::from(self.gateway.embedding_provider(picked)))
    }
}

fn pick_embedding_credential(creds: &[UserCredential]) -> Option<&UserCredential> {
    EMBEDDING_PROVIDER_ORDER
        .iter()
        .find_map(|p| creds.iter().find(|c| c.provider_type == *p))
}
