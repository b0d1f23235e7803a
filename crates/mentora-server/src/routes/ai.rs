use axum::extract::{Multipart, State};
use axum::routing::post;
use axum::{Json, Router};

use mentora_agent::{AgentAnswer, AgentRequest, AttachmentUpload, PreferredTools};
use mentora_schema::AppError;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/qa", post(qa))
}

/// One agent turn. Multipart: text fields `query`, `conversation_id`,
/// `kb_ids` (JSON array), `use_tools` (bool), `preferred_tools` (JSON
/// array or `"all"`), `llm_model_id`; optional `file` part.
async fn qa(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    multipart: Multipart,
) -> ApiResult<Json<AgentAnswer>> {
    let request = parse_qa_multipart(user_id, multipart).await?;
    let answer = state.agent.invoke(request).await?;
    Ok(Json(answer))
}

async fn parse_qa_multipart(
    user_id: i64,
    mut multipart: Multipart,
) -> Result<AgentRequest, AppError> {
    let mut request = AgentRequest {
        user_id,
        query: String::new(),
        conversation_id: None,
        kb_ids: Vec::new(),
        use_tools: false,
        preferred_tools: PreferredTools::All,
        llm_model_id: None,
        attachment: None,
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "query" => request.query = read_text(field).await?,
            "conversation_id" => {
                let raw = read_text(field).await?;
                if !raw.trim().is_empty() && raw.trim() != "null" {
                    request.conversation_id = Some(
                        raw.trim()
                            .parse::<i64>()
                            .map_err(|_| AppError::bad_request("conversation_id must be an integer"))?,
                    );
                }
            }
            "kb_ids" => {
                let raw = read_text(field).await?;
                if !raw.trim().is_empty() {
                    request.kb_ids = serde_json::from_str::<Vec<i64>>(&raw)
                        .map_err(|_| AppError::bad_request("kb_ids must be a JSON array of integers"))?;
                }
            }
            "use_tools" => {
                let raw = read_text(field).await?;
                request.use_tools = matches!(raw.trim(), "true" | "1");
            }
            "preferred_tools" => {
                let raw = read_text(field).await?;
                let trimmed = raw.trim().trim_matches('"');
                if trimmed.eq_ignore_ascii_case("all") || trimmed.is_empty() {
                    request.preferred_tools = PreferredTools::All;
                } else {
                    let names = serde_json::from_str::<Vec<String>>(&raw).map_err(|_| {
                        AppError::bad_request("preferred_tools must be a JSON array or \"all\"")
                    })?;
                    request.preferred_tools = PreferredTools::Selected(names);
                }
            }
            "llm_model_id" => {
                let raw = read_text(field).await?;
                if !raw.trim().is_empty() {
                    request.llm_model_id = Some(raw.trim().to_string());
                }
            }
            "file" => {
                let file_name = field.file_name().unwrap_or("attachment").to_string();
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
                request.attachment = Some(AttachmentUpload {
                    file_name,
                    mime,
                    bytes: bytes.to_vec(),
                });
            }
            _ => {
                // Unknown fields are ignored for forward compatibility.
            }
        }
    }

    request.validate()?;
    Ok(request)
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String, AppError> {
    field
        .text()
        .await
        .map_err(|e| AppError::bad_request(format!("unreadable field: {e}")))
}
