use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};

use mentora_queue::ExecuteOutcome;
use mentora_schema::TaskRecord;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/execute", post(execute))
}

/// Node-to-node assignment delivery. The task runs to a terminal state
/// within this request; the scheduler treats a non-2xx (or a 30 s
/// silence) as a failed assignment and requeues.
async fn execute(
    State(state): State<AppState>,
    Json(task): Json<TaskRecord>,
) -> Json<ExecuteOutcome> {
    tracing::debug!(task_id = %task.task_id, task_type = %task.task_type, "worker execute request");
    Json(state.worker.execute(task).await)
}
