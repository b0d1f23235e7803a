pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::HeaderValue;
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use mentora_agent::{AgentConfig, AgentLoop};
use mentora_blob::{BlobStore, LocalBlobStore, S3BlobStore};
use mentora_ingest::IngestionPipeline;
use mentora_provider::{CredentialVault, ProviderDefaults, ProviderGateway};
use mentora_queue::{
    FormatConversionHandler, MetricsRecorder, NodeManager, QueueStore, SqliteQueueStore, TaskQueue,
    ThumbnailHandler, WorkerNode,
};
use mentora_retrieval::RetrievalEngine;
use mentora_store::Database;

use crate::config::{BlobBackend, Config};
use crate::handlers::{BatchVectorizationHandler, BlobCompensationHandler, DocumentProcessingHandler};
use crate::state::AppState;

/// Assemble every service from configuration. Constructed once and
/// shared by reference; handlers get it through axum state.
pub fn build_state(config: Config) -> Result<AppState> {
    let config = Arc::new(config);

    let db = Database::open(&config.database.path).context("open relational store")?;
    let queue_store: Arc<dyn QueueStore> =
        Arc::new(SqliteQueueStore::open(&config.queue.path).context("open queue store")?);

    let blob: Arc<dyn BlobStore> = match config.blob.backend {
        BlobBackend::Local => Arc::new(LocalBlobStore::new(
            &config.blob.local_root,
            &config.blob.public_base_url,
        )),
        BlobBackend::S3 => Arc::new(S3BlobStore::new(
            &config.blob.endpoint,
            &config.blob.bucket,
            &config.blob.region,
            &config.blob.access_key,
            &config.blob.secret_key,
            &config.blob.public_base_url,
        )),
    };

    let gateway = ProviderGateway::new(
        CredentialVault::new(&config.providers.credential_master_key),
        ProviderDefaults {
            chat_model: config.providers.chat_model.clone(),
            embedding_model: config.providers.embedding_model.clone(),
            embedding_dimensions: config.providers.embedding_dimensions,
            rerank_model: config.providers.rerank_model.clone(),
        },
    );

    let pipeline = IngestionPipeline::new(
        db.clone(),
        Arc::clone(&blob),
        gateway.clone(),
        config.node.ingest_concurrency,
    );

    let agent = Arc::new(AgentLoop::new(
        db.clone(),
        gateway.clone(),
        Arc::clone(&pipeline),
        Arc::clone(&blob),
        config.search.clone(),
        config.mcp_tools.clone(),
        AgentConfig::default(),
    ));

    let mut worker = WorkerNode::new(Arc::clone(&queue_store));
    worker.register_handler(Arc::new(DocumentProcessingHandler::new(Arc::clone(&pipeline))));
    worker.register_handler(Arc::new(BatchVectorizationHandler::new(
        Arc::clone(&pipeline),
        db.clone(),
    )));
    worker.register_handler(Arc::new(BlobCompensationHandler::new(Arc::clone(&blob))));
    worker.register_handler(Arc::new(ThumbnailHandler));
    worker.register_handler(Arc::new(FormatConversionHandler));

    Ok(AppState {
        retrieval: RetrievalEngine::new(db.clone()),
        queue: TaskQueue::new(Arc::clone(&queue_store)),
        registry: Arc::new(NodeManager::new(Arc::clone(&queue_store), None)),
        metrics: MetricsRecorder::new(queue_store),
        worker: Arc::new(worker),
        config,
        db,
        blob,
        gateway,
        pipeline,
        agent,
    })
}

/// The full application router with CORS and request tracing.
pub fn app(state: AppState) -> Router {
    let cors = cors_layer(&state.config);
    routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors
        .allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(origins))
    }
}
