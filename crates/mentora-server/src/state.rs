use std::sync::Arc;

use mentora_agent::AgentLoop;
use mentora_blob::BlobStore;
use mentora_ingest::IngestionPipeline;
use mentora_provider::ProviderGateway;
use mentora_queue::{MetricsRecorder, NodeManager, TaskQueue, WorkerNode};
use mentora_retrieval::RetrievalEngine;
use mentora_store::Database;

use crate::config::Config;

/// Shared application state handed to every route handler. Constructed
/// once at startup; no process-wide mutable singletons.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub blob: Arc<dyn BlobStore>,
    pub gateway: ProviderGateway,
    pub pipeline: Arc<IngestionPipeline>,
    pub agent: Arc<AgentLoop>,
    pub retrieval: RetrievalEngine,
    pub queue: TaskQueue,
    pub registry: Arc<NodeManager>,
    pub worker: Arc<WorkerNode>,
    pub metrics: MetricsRecorder,
}
