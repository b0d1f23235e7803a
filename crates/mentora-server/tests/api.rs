//! End-to-end API tests over the full router with stub providers.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use tempfile::TempDir;
use tower::ServiceExt;

use mentora_agent::{AgentConfig, AgentLoop};
use mentora_blob::{BlobStore, LocalBlobStore};
use mentora_ingest::IngestionPipeline;
use mentora_provider::{
    CredentialVault, ProviderDefaults, ProviderGateway, StubChat, StubEmbeddingProvider,
};
use mentora_queue::{
    FormatConversionHandler, MetricsRecorder, NodeManager, QueueStore, SqliteQueueStore, TaskQueue,
    ThumbnailHandler, WorkerNode,
};
use mentora_retrieval::RetrievalEngine;
use mentora_server::auth::issue_token;
use mentora_server::config::Config;
use mentora_server::handlers::{
    BatchVectorizationHandler, BlobCompensationHandler, DocumentProcessingHandler,
};
use mentora_server::state::AppState;
use mentora_server::{app, build_state};
use mentora_store::{Database, UserRepo};

struct TestApp {
    _dir: TempDir,
    router: Router,
    state: AppState,
    user_id: i64,
    token: String,
}

async fn test_app() -> TestApp {
    let dir = TempDir::new().unwrap();

    let mut config = Config::default();
    config.database.path = dir.path().join("mentora.db");
    config.queue.path = dir.path().join("queue.db");
    config.blob.local_root = dir.path().join("blobs");
    config.blob.public_base_url = "https://blobs.test".into();
    config.providers.embedding_dimensions = 8;
    let config = Arc::new(config);

    let db = Database::open(&config.database.path).unwrap();
    let queue_store: Arc<dyn QueueStore> =
        Arc::new(SqliteQueueStore::open(&config.queue.path).unwrap());
    let blob: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(
        &config.blob.local_root,
        &config.blob.public_base_url,
    ));
    let gateway = ProviderGateway::new(
        CredentialVault::new(&config.providers.credential_master_key),
        ProviderDefaults {
            embedding_dimensions: 8,
            ..ProviderDefaults::default()
        },
    );
    let pipeline = IngestionPipeline::with_embedder(
        db.clone(),
        Arc::clone(&blob),
        gateway.clone(),
        2,
        Arc::new(StubEmbeddingProvider::new(8)),
    );
    let agent = Arc::new(
        AgentLoop::new(
            db.clone(),
            gateway.clone(),
            Arc::clone(&pipeline),
            Arc::clone(&blob),
            None,
            vec![],
            AgentConfig {
                attachment_wait: Duration::from_millis(300),
                attachment_poll: Duration::from_millis(50),
                ..AgentConfig::default()
            },
        )
        .with_chat_override(Arc::new(StubChat::new("[assistant]"))),
    );

    let mut worker = WorkerNode::new(Arc::clone(&queue_store));
    worker.register_handler(Arc::new(DocumentProcessingHandler::new(Arc::clone(&pipeline))));
    worker.register_handler(Arc::new(BatchVectorizationHandler::new(
        Arc::clone(&pipeline),
        db.clone(),
    )));
    worker.register_handler(Arc::new(BlobCompensationHandler::new(Arc::clone(&blob))));
    worker.register_handler(Arc::new(ThumbnailHandler));
    worker.register_handler(Arc::new(FormatConversionHandler));

    let state = AppState {
        retrieval: RetrievalEngine::new(db.clone()),
        queue: TaskQueue::new(Arc::clone(&queue_store)),
        registry: Arc::new(NodeManager::new(Arc::clone(&queue_store), None)),
        metrics: MetricsRecorder::new(queue_store),
        worker: Arc::new(worker),
        config: Arc::clone(&config),
        db: db.clone(),
        blob,
        gateway,
        pipeline,
        agent,
    };

    let user_id = UserRepo::new(db).create("student").await.unwrap().id;
    let token = issue_token(&config.auth.jwt_secret, user_id, 60);
    let router = app(state.clone());

    TestApp {
        _dir: dir,
        router,
        state,
        user_id,
        token,
    }
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

fn authed(app: &TestApp, builder: axum::http::request::Builder) -> axum::http::request::Builder {
    builder.header(header::AUTHORIZATION, format!("Bearer {}", app.token))
}

fn json_request(
    app: &TestApp,
    method: &str,
    uri: &str,
    body: serde_json::Value,
) -> Request<Body> {
    authed(app, Request::builder().method(method).uri(uri))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

const BOUNDARY: &str = "mentora-test-boundary";

fn multipart_body(fields: &[(&str, &str)], file: Option<(&str, &str, &[u8])>) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        );
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    if let Some((file_name, mime, bytes)) = file {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n")
                .as_bytes(),
        );
        body.extend_from_slice(format!("Content-Type: {mime}\r\n\r\n").as_bytes());
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn multipart_request(app: &TestApp, uri: &str, body: Vec<u8>) -> Request<Body> {
    authed(app, Request::builder().method("POST").uri(uri))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unauthenticated_requests_are_rejected() {
    let app = test_app().await;
    let request = Request::builder()
        .method("GET")
        .uri("/users/me/points/history")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthenticated");
}

#[tokio::test]
async fn forged_token_is_rejected() {
    let app = test_app().await;
    let request = Request::builder()
        .method("GET")
        .uri("/users/me/points/history")
        .header(header::AUTHORIZATION, "Bearer not.a.token")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// ---------------------------------------------------------------------------
// Agent turn (S1)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fresh_conversation_turn_persists_and_credits_points() {
    let app = test_app().await;
    let body = multipart_body(
        &[
            ("query", "Hello, who are you?"),
            ("use_tools", "false"),
        ],
        None,
    );
    let (status, answer) = send(&app, multipart_request(&app, "/ai/qa", body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(answer["answer_mode"], "general");
    assert_eq!(answer["turn_messages"].as_array().unwrap().len(), 2);
    assert!(answer["conversation_id"].as_i64().unwrap() > 0);
    assert!(answer["answer"].as_str().unwrap().contains("Hello, who are you?"));

    let (status, history) = send(
        &app,
        authed(
            &app,
            Request::builder().method("GET").uri("/users/me/points/history"),
        )
        .body(Body::empty())
        .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let history = history.as_array().unwrap().clone();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["amount"], 1);
    assert_eq!(history[0]["reason"], "发送聊天消息");
}

#[tokio::test]
async fn qa_with_unknown_tool_is_bad_request() {
    let app = test_app().await;
    let body = multipart_body(
        &[
            ("query", "hi"),
            ("use_tools", "true"),
            ("preferred_tools", r#"["teleport"]"#),
        ],
        None,
    );
    let (status, body) = send(&app, multipart_request(&app, "/ai/qa", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");
}

#[tokio::test]
async fn qa_with_empty_query_is_bad_request() {
    let app = test_app().await;
    let body = multipart_body(&[("query", "  ")], None);
    let (status, _) = send(&app, multipart_request(&app, "/ai/qa", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Ingestion (S3)
// ---------------------------------------------------------------------------

async fn create_kb(app: &TestApp) -> i64 {
    let (status, kb) = send(
        app,
        json_request(app, "POST", "/knowledge-bases", serde_json::json!({"name": "notes"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    kb["id"].as_i64().unwrap()
}

#[tokio::test]
async fn document_ingestion_reaches_completed_with_chunks() {
    let app = test_app().await;
    let kb_id = create_kb(&app).await;

    let content = "Mentora ingestion test paragraph. ".repeat(300); // ~10 KB
    let body = multipart_body(&[], Some(("lecture.txt", "text/plain", content.as_bytes())));
    let (status, doc) = send(
        &app,
        multipart_request(&app, &format!("/knowledge-bases/{kb_id}/documents"), body),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(doc["status"], "pending");
    let doc_id = doc["id"].as_i64().unwrap();

    // Poll until the pipeline reaches a terminal status.
    let uri = format!("/knowledge-bases/{kb_id}/documents/{doc_id}");
    let mut last = serde_json::Value::Null;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (status, body) = send(
            &app,
            authed(&app, Request::builder().method("GET").uri(&uri))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        last = body;
        let s = last["status"].as_str().unwrap();
        if s == "completed" || s == "failed" {
            break;
        }
    }

    assert_eq!(last["status"], "completed", "document: {last}");
    assert!(last["total_chunks"].as_i64().unwrap() >= 1);
}

#[tokio::test]
async fn executable_upload_is_rejected() {
    let app = test_app().await;
    let kb_id = create_kb(&app).await;

    let body = multipart_body(&[], Some(("virus.exe", "application/octet-stream", b"MZ\x90")));
    let (status, body) = send(
        &app,
        multipart_request(&app, &format!("/knowledge-bases/{kb_id}/documents"), body),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");
}

#[tokio::test]
async fn video_upload_is_rejected_for_knowledge_bases() {
    let app = test_app().await;
    let kb_id = create_kb(&app).await;

    let body = multipart_body(&[], Some(("clip.mp4", "video/mp4", b"\x00\x00\x00\x18ftyp")));
    let (status, _) = send(
        &app,
        multipart_request(&app, &format!("/knowledge-bases/{kb_id}/documents"), body),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn foreign_document_reads_as_not_found() {
    let app = test_app().await;
    let kb_id = create_kb(&app).await;

    let (status, body) = send(
        &app,
        authed(
            &app,
            Request::builder()
                .method("GET")
                .uri(format!("/knowledge-bases/{kb_id}/documents/9999")),
        )
        .body(Body::empty())
        .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn deleting_document_removes_chunks_and_blob() {
    let app = test_app().await;
    let kb_id = create_kb(&app).await;

    let body = multipart_body(&[], Some(("doc.txt", "text/plain", b"delete me please")));
    let (_, doc) = send(
        &app,
        multipart_request(&app, &format!("/knowledge-bases/{kb_id}/documents"), body),
    )
    .await;
    let doc_id = doc["id"].as_i64().unwrap();
    let blob_key = doc["blob_key"].as_str().unwrap().to_string();

    // Wait for ingestion to finish so chunks exist.
    let uri = format!("/knowledge-bases/{kb_id}/documents/{doc_id}");
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (_, body) = send(
            &app,
            authed(&app, Request::builder().method("GET").uri(&uri))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        if body["status"] == "completed" {
            break;
        }
    }

    let (status, _) = send(
        &app,
        authed(&app, Request::builder().method("DELETE").uri(&uri))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Chunks gone (P7) and the blob is no longer reachable.
    let count = mentora_store::VectorIndex::new(app.state.db.clone())
        .count_for_document(doc_id)
        .await
        .unwrap();
    assert_eq!(count, 0);
    assert!(app.state.blob.download(&blob_key).await.is_err());
}

// ---------------------------------------------------------------------------
// Semantic search (S6)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn search_without_embedding_credential_reports_diagnostic() {
    let app = test_app().await;
    let (status, body) = send(
        &app,
        json_request(
            &app,
            "POST",
            "/search/semantic",
            serde_json::json!({"query": "Alpha"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["results"].as_array().unwrap().is_empty());
    assert_eq!(body["reason"], "no embedding available");
}

#[tokio::test]
async fn search_with_empty_query_is_bad_request() {
    let app = test_app().await;
    let (status, _) = send(
        &app,
        json_request(&app, "POST", "/search/semantic", serde_json::json!({"query": ""})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Distributed tasks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn task_submit_status_cancel_lifecycle() {
    let app = test_app().await;

    let (status, submitted) = send(
        &app,
        json_request(
            &app,
            "POST",
            "/distributed/tasks/submit",
            serde_json::json!({
                "task_type": "thumbnail_generation",
                "priority": "high",
                "data": {"output_path": "thumbs/1.png"}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let task_id = submitted["task_id"].as_str().unwrap().to_string();

    let (status, task) = send(
        &app,
        authed(
            &app,
            Request::builder()
                .method("GET")
                .uri(format!("/distributed/tasks/{task_id}/status")),
        )
        .body(Body::empty())
        .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["status"], "pending");
    assert_eq!(task["priority"], "high");

    let (status, cancelled) = send(
        &app,
        authed(
            &app,
            Request::builder()
                .method("POST")
                .uri(format!("/distributed/tasks/{task_id}/cancel")),
        )
        .body(Body::empty())
        .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "cancelled");

    // Cancelling a terminal task conflicts.
    let (status, body) = send(
        &app,
        authed(
            &app,
            Request::builder()
                .method("POST")
                .uri(format!("/distributed/tasks/{task_id}/cancel")),
        )
        .body(Body::empty())
        .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");
}

#[tokio::test]
async fn unknown_task_status_is_not_found() {
    let app = test_app().await;
    let (status, _) = send(
        &app,
        authed(
            &app,
            Request::builder()
                .method("GET")
                .uri("/distributed/tasks/ghost/status"),
        )
        .body(Body::empty())
        .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn empty_task_type_is_bad_request() {
    let app = test_app().await;
    let (status, _) = send(
        &app,
        json_request(
            &app,
            "POST",
            "/distributed/tasks/submit",
            serde_json::json!({"task_type": "  ", "data": {}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Worker protocol
// ---------------------------------------------------------------------------

#[tokio::test]
async fn worker_executes_assigned_task() {
    let app = test_app().await;
    let task = mentora_schema::TaskRecord::new(
        "format_conversion",
        serde_json::json!({"target_format": "pdf"}),
    );
    app.state.queue.save(&task).await.unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/api/worker/execute")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_string(&task).unwrap()))
        .unwrap();
    let (status, outcome) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["status"], "success");
    assert_eq!(outcome["result"]["output_format"], "pdf");

    let stored = app.state.queue.get(&task.task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, mentora_schema::TaskStatus::Completed);
}

// ---------------------------------------------------------------------------
// Achievements
// ---------------------------------------------------------------------------

#[tokio::test]
async fn chat_achievement_grants_once_with_reward() {
    let app = test_app().await;
    // Active achievement: first chat message, +10.
    app.state
        .db
        .call(|conn| {
            conn.execute(
                "INSERT INTO achievements(name, criteria_type, criteria_value, reward_points)
                 VALUES ('初次对话', 'CHAT_MESSAGES_COUNT', 1, 10)",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

    let body = multipart_body(&[("query", "first message")], None);
    let (status, _) = send(&app, multipart_request(&app, "/ai/qa", body)).await;
    assert_eq!(status, StatusCode::OK);

    let (_, achievements) = send(
        &app,
        authed(
            &app,
            Request::builder().method("GET").uri("/users/me/achievements"),
        )
        .body(Body::empty())
        .unwrap(),
    )
    .await;
    let achievements = achievements.as_array().unwrap().clone();
    assert_eq!(achievements.len(), 1);
    assert_eq!(achievements[0]["achievement"]["name"], "初次对话");

    // A second message must not re-grant (P3), but still earns its
    // chat-message point.
    let body = multipart_body(&[("query", "second message")], None);
    send(&app, multipart_request(&app, "/ai/qa", body)).await;

    let (_, achievements) = send(
        &app,
        authed(
            &app,
            Request::builder().method("GET").uri("/users/me/achievements"),
        )
        .body(Body::empty())
        .unwrap(),
    )
    .await;
    assert_eq!(achievements.as_array().unwrap().len(), 1);

    // Ledger sum equals the balance (P2): 1 + 10 + 1.
    let user = UserRepo::new(app.state.db.clone())
        .get(app.user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(user.total_points, 12);
}

// ---------------------------------------------------------------------------
// Wiring smoke test for the production constructor
// ---------------------------------------------------------------------------

#[tokio::test]
async fn build_state_wires_all_services() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.database.path = dir.path().join("m.db");
    config.queue.path = dir.path().join("q.db");
    config.blob.local_root = dir.path().join("blobs");

    let state = build_state(config).unwrap();
    assert!(state.worker.capabilities().contains(&"document_processing".to_string()));
    assert!(state
        .worker
        .capabilities()
        .contains(&"blob_compensation_delete".to_string()));
    let _router = app(state);
}
