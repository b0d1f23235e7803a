use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use mentora_schema::{AppError, NodeInfo, TaskPriority, TaskRecord};

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/tasks/submit", post(submit_task))
        .route("/tasks/{task_id}/status", get(task_status))
        .route("/tasks/{task_id}/cancel", post(cancel_task))
        .route("/nodes", get(list_nodes))
        .route("/metrics", get(current_metrics))
}

#[derive(Deserialize)]
struct SubmitTaskRequest {
    task_type: String,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    timeout_seconds: Option<u64>,
    #[serde(default)]
    max_retries: Option<u32>,
}

impl SubmitTaskRequest {
    fn validate(&self) -> Result<(), AppError> {
        if self.task_type.trim().is_empty() {
            return Err(AppError::bad_request("task_type must not be empty"));
        }
        if let Some(timeout) = self.timeout_seconds {
            if timeout == 0 {
                return Err(AppError::bad_request("timeout_seconds must be positive"));
            }
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct SubmitTaskResponse {
    task_id: String,
}

async fn submit_task(
    State(state): State<AppState>,
    AuthUser(_user_id): AuthUser,
    Json(request): Json<SubmitTaskRequest>,
) -> ApiResult<(StatusCode, Json<SubmitTaskResponse>)> {
    request.validate()?;

    let mut task = TaskRecord::new(request.task_type.trim(), request.data)
        .with_dependencies(request.dependencies);
    if let Some(priority) = request.priority.as_deref() {
        task = task.with_priority(TaskPriority::parse(priority));
    }
    if let Some(timeout) = request.timeout_seconds {
        task = task.with_timeout(timeout);
    }
    if let Some(max_retries) = request.max_retries {
        task = task.with_max_retries(max_retries);
    }

    let task_id = state.queue.submit(task).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitTaskResponse { task_id })))
}

async fn task_status(
    State(state): State<AppState>,
    AuthUser(_user_id): AuthUser,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskRecord>> {
    let task = state
        .queue
        .get(&task_id)
        .await?
        .ok_or_else(|| AppError::not_found("task not found"))?;
    Ok(Json(task))
}

async fn cancel_task(
    State(state): State<AppState>,
    AuthUser(_user_id): AuthUser,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskRecord>> {
    if state.queue.get(&task_id).await?.is_none() {
        return Err(AppError::not_found("task not found").into());
    }
    if !state.queue.cancel(&task_id).await? {
        return Err(AppError::Conflict("task is no longer cancellable".into()).into());
    }
    let task = state
        .queue
        .get(&task_id)
        .await?
        .ok_or_else(|| AppError::not_found("task not found"))?;
    Ok(Json(task))
}

async fn list_nodes(
    State(state): State<AppState>,
    AuthUser(_user_id): AuthUser,
) -> ApiResult<Json<Vec<NodeInfo>>> {
    let nodes = state.registry.active_nodes().await?;
    Ok(Json(nodes))
}

async fn current_metrics(
    State(state): State<AppState>,
    AuthUser(_user_id): AuthUser,
) -> ApiResult<Json<HashMap<String, f64>>> {
    let metrics = state.metrics.current().await?;
    Ok(Json(metrics))
}
