//! Worker task handlers that close over server-side services.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use mentora_blob::BlobStore;
use mentora_ingest::IngestionPipeline;
use mentora_queue::TaskHandler;
use mentora_store::{Database, VectorIndex};

/// Runs (or re-runs) document ingestion. Idempotent: a completed
/// document is left untouched.
pub struct DocumentProcessingHandler {
    pipeline: Arc<IngestionPipeline>,
}

impl DocumentProcessingHandler {
    pub fn new(pipeline: Arc<IngestionPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl TaskHandler for DocumentProcessingHandler {
    fn task_type(&self) -> &'static str {
        "document_processing"
    }

    async fn execute(&self, data: &serde_json::Value) -> Result<serde_json::Value> {
        let document_id = data
            .get("document_id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| anyhow!("missing document_id"))?;
        self.pipeline.run_document(document_id).await?;
        Ok(serde_json::json!({"processed": true, "document_id": document_id}))
    }
}

/// Batch (re-)vectorization of a document; rides the same idempotent
/// pipeline and reports the resulting chunk count.
pub struct BatchVectorizationHandler {
    pipeline: Arc<IngestionPipeline>,
    db: Database,
}

impl BatchVectorizationHandler {
    pub fn new(pipeline: Arc<IngestionPipeline>, db: Database) -> Self {
        Self { pipeline, db }
    }
}

#[async_trait]
impl TaskHandler for BatchVectorizationHandler {
    fn task_type(&self) -> &'static str {
        "batch_vectorization"
    }

    async fn execute(&self, data: &serde_json::Value) -> Result<serde_json::Value> {
        let document_id = data
            .get("document_id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| anyhow!("missing document_id"))?;
        self.pipeline.run_document(document_id).await?;
        let count = VectorIndex::new(self.db.clone())
            .count_for_document(document_id)
            .await?;
        Ok(serde_json::json!({"vectorized": true, "vectors_count": count}))
    }
}

/// Compensation delete for blobs whose owning request crashed or whose
/// synchronous delete failed. Blob deletion is idempotent, so retries
/// are safe.
pub struct BlobCompensationHandler {
    blob: Arc<dyn BlobStore>,
}

impl BlobCompensationHandler {
    pub fn new(blob: Arc<dyn BlobStore>) -> Self {
        Self { blob }
    }
}

#[async_trait]
impl TaskHandler for BlobCompensationHandler {
    fn task_type(&self) -> &'static str {
        "blob_compensation_delete"
    }

    async fn execute(&self, data: &serde_json::Value) -> Result<serde_json::Value> {
        let blob_key = data
            .get("blob_key")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("missing blob_key"))?;
        self.blob.delete(blob_key).await?;
        Ok(serde_json::json!({"deleted": true, "blob_key": blob_key}))
    }
}
