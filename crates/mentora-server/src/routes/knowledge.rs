use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use mentora_blob::make_key;
use mentora_ingest::{validate_upload, UploadKind};
use mentora_schema::{blob_prefix, AccessLevel, AppError, KnowledgeBase, KnowledgeDocument, TaskRecord};
use mentora_store::KnowledgeRepo;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_kb).get(list_kbs))
        .route("/{kb_id}/documents", post(upload_document).get(list_documents))
        .route(
            "/{kb_id}/documents/{document_id}",
            get(get_document).delete(delete_document),
        )
}

#[derive(Deserialize)]
struct CreateKbRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    access: Option<String>,
}

impl CreateKbRequest {
    fn validate(&self) -> Result<AccessLevel, AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::bad_request("name must not be empty"));
        }
        match self.access.as_deref() {
            None => Ok(AccessLevel::Private),
            Some("private") => Ok(AccessLevel::Private),
            Some("public") => Ok(AccessLevel::Public),
            Some(other) => Err(AppError::bad_request(format!("unknown access level: {other}"))),
        }
    }
}

async fn create_kb(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<CreateKbRequest>,
) -> ApiResult<(StatusCode, Json<KnowledgeBase>)> {
    let access = request.validate()?;
    let kb = KnowledgeRepo::new(state.db.clone())
        .create_kb(user_id, request.name.trim(), request.description.as_deref(), access)
        .await?;
    Ok((StatusCode::CREATED, Json(kb)))
}

async fn list_kbs(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> ApiResult<Json<Vec<KnowledgeBase>>> {
    let kbs = KnowledgeRepo::new(state.db.clone()).list_kbs(user_id).await?;
    Ok(Json(kbs))
}

/// Upload a document and enqueue ingestion. Returns `202 Accepted` with
/// the pending row; poll the GET endpoint for status.
async fn upload_document(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(kb_id): Path<i64>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<KnowledgeDocument>)> {
    let repo = KnowledgeRepo::new(state.db.clone());
    let kb = repo
        .get_kb(kb_id)
        .await?
        .filter(|kb| kb.owner_id == user_id)
        .ok_or_else(|| AppError::not_found("knowledge base not found"))?;

    let mut file: Option<(String, String, Vec<u8>)> = None;
    let mut folder_id: Option<i64> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(format!("malformed multipart body: {e}")))?
    {
        match field.name().unwrap_or("") {
            "file" => {
                let file_name = field.file_name().unwrap_or("document").to_string();
                let mime = field
                    .content_type()
                    .map(str::to_owned)
                    .unwrap_or_else(|| {
                        mime_guess::from_path(&file_name)
                            .first_or_octet_stream()
                            .essence_str()
                            .to_string()
                    });
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::bad_request(format!("unreadable file part: {e}")))?;
                file = Some((file_name, mime, bytes.to_vec()));
            }
            "folder_id" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| AppError::bad_request(format!("unreadable field: {e}")))?;
                if !raw.trim().is_empty() {
                    folder_id = Some(
                        raw.trim()
                            .parse::<i64>()
                            .map_err(|_| AppError::bad_request("folder_id must be an integer"))?,
                    );
                }
            }
            _ => {}
        }
    }

    let (file_name, mime, bytes) = file.ok_or_else(|| AppError::bad_request("missing file part"))?;
    validate_upload(&file_name, &mime, &bytes, UploadKind::KnowledgeDocument)?;

    let key = make_key(blob_prefix::KNOWLEDGE_DOCUMENTS, &file_name);
    let url = state.blob.public_url(&key);
    let document = repo
        .create_document(kb.id, user_id, &file_name, &key, &url, &mime, folder_id)
        .await?;

    // Blob upload failure compensates by removing the row; the client
    // sees the error synchronously.
    if let Err(e) = state.blob.upload(&key, &bytes, &mime).await {
        repo.delete_document_row(document.id).await?;
        return Err(AppError::ProviderTransient(format!("blob upload failed: {e}")).into());
    }

    state.pipeline.spawn_document(document.id);
    Ok((StatusCode::ACCEPTED, Json(document)))
}

async fn list_documents(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(kb_id): Path<i64>,
) -> ApiResult<Json<Vec<KnowledgeDocument>>> {
    let repo = KnowledgeRepo::new(state.db.clone());
    let kb = repo
        .get_kb(kb_id)
        .await?
        .filter(|kb| kb.owner_id == user_id || kb.access == AccessLevel::Public)
        .ok_or_else(|| AppError::not_found("knowledge base not found"))?;
    let documents = repo.list_documents(kb.id).await?;
    Ok(Json(documents))
}

/// Document row including `status`, `status_message`, `total_chunks`.
async fn get_document(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path((kb_id, document_id)): Path<(i64, i64)>,
) -> ApiResult<Json<KnowledgeDocument>> {
    let repo = KnowledgeRepo::new(state.db.clone());
    let document = repo
        .get_document(document_id)
        .await?
        .filter(|d| d.kb_id == kb_id && d.owner_id == user_id)
        .ok_or_else(|| AppError::not_found("document not found"))?;
    Ok(Json(document))
}

/// Delete a document: row and chunks go in one transaction, then the
/// blob. A failed blob delete is compensated through the task queue so
/// the blob never outlives the row unobserved.
async fn delete_document(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path((kb_id, document_id)): Path<(i64, i64)>,
) -> ApiResult<StatusCode> {
    let repo = KnowledgeRepo::new(state.db.clone());
    repo.get_document(document_id)
        .await?
        .filter(|d| d.kb_id == kb_id && d.owner_id == user_id)
        .ok_or_else(|| AppError::not_found("document not found"))?;

    let blob_key = repo.delete_document(document_id, user_id).await?;
    if let Err(e) = state.blob.delete(&blob_key).await {
        tracing::warn!(blob_key, error = %e, "synchronous blob delete failed, scheduling compensation");
        state
            .queue
            .submit(TaskRecord::new(
                "blob_compensation_delete",
                serde_json::json!({"blob_key": blob_key}),
            ))
            .await?;
    }
    Ok(StatusCode::NO_CONTENT)
}
