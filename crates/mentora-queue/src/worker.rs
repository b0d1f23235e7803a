use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use mentora_schema::{TaskRecord, TaskStatus};

use crate::store::QueueStore;
use crate::tasks::TaskQueue;

/// Handler for one task type. At-least-once delivery: `execute` MUST be
/// idempotent under `(task_type, data)`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> &'static str;
    async fn execute(&self, data: &serde_json::Value) -> Result<serde_json::Value>;
}

/// Wire response for the worker execute endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteOutcome {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecuteOutcome {
    fn success(result: serde_json::Value) -> Self {
        Self {
            status: "success".into(),
            result: Some(result),
            error: None,
        }
    }

    fn error(error: String) -> Self {
        Self {
            status: "error".into(),
            result: None,
            error: Some(error),
        }
    }
}

/// Executes assigned tasks: marks them `processing`, dispatches by
/// `task_type`, and records the terminal state.
pub struct WorkerNode {
    queue: TaskQueue,
    handlers: HashMap<&'static str, Arc<dyn TaskHandler>>,
}

impl WorkerNode {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            queue: TaskQueue::new(store),
            handlers: HashMap::new(),
        }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.task_type(), handler);
    }

    /// Task types this node can execute; advertised as capabilities.
    pub fn capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = self.handlers.keys().map(|k| k.to_string()).collect();
        caps.sort();
        caps
    }

    /// Execute one task to a terminal state. The outcome is both
    /// persisted on the task record and returned to the caller.
    pub async fn execute(&self, mut task: TaskRecord) -> ExecuteOutcome {
        task.status = TaskStatus::Processing;
        task.started_at = Some(Utc::now());
        if let Err(e) = self.queue.save(&task).await {
            tracing::error!(task_id = %task.task_id, error = %e, "failed to persist processing state");
            return ExecuteOutcome::error(e.to_string());
        }

        let outcome = match self.handlers.get(task.task_type.as_str()) {
            Some(handler) => handler.execute(&task.data).await,
            None => Err(anyhow!("unsupported task type: {}", task.task_type)),
        };

        task.completed_at = Some(Utc::now());
        match outcome {
            Ok(result) => {
                task.status = TaskStatus::Completed;
                task.result = Some(result.clone());
                task.error = None;
                if let Err(e) = self.queue.save(&task).await {
                    tracing::error!(task_id = %task.task_id, error = %e, "failed to persist completion");
                }
                tracing::info!(task_id = %task.task_id, task_type = %task.task_type, "task completed");
                ExecuteOutcome::success(result)
            }
            Err(e) => {
                let message = e.to_string();
                task.status = TaskStatus::Failed;
                task.error = Some(message.clone());
                if let Err(persist) = self.queue.save(&task).await {
                    tracing::error!(task_id = %task.task_id, error = %persist, "failed to persist failure");
                }
                tracing::warn!(task_id = %task.task_id, error = %message, "task failed");
                ExecuteOutcome::error(message)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in handlers
// ---------------------------------------------------------------------------

/// Thumbnail generation stub; records what would be produced.
pub struct ThumbnailHandler;

#[async_trait]
impl TaskHandler for ThumbnailHandler {
    fn task_type(&self) -> &'static str {
        "thumbnail_generation"
    }

    async fn execute(&self, data: &serde_json::Value) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "thumbnail_generated": true,
            "thumbnail_path": data.get("output_path").cloned().unwrap_or(serde_json::Value::Null),
        }))
    }
}

/// Format conversion stub.
pub struct FormatConversionHandler;

#[async_trait]
impl TaskHandler for FormatConversionHandler {
    fn task_type(&self) -> &'static str {
        "format_conversion"
    }

    async fn execute(&self, data: &serde_json::Value) -> Result<serde_json::Value> {
        let target = data
            .get("target_format")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("missing target_format"))?;
        Ok(serde_json::json!({
            "converted": true,
            "output_format": target,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteQueueStore;

    struct FlakyHandler {
        fail_marker: &'static str,
    }

    #[async_trait]
    impl TaskHandler for FlakyHandler {
        fn task_type(&self) -> &'static str {
            "flaky"
        }

        async fn execute(&self, data: &serde_json::Value) -> Result<serde_json::Value> {
            if data.get(self.fail_marker).is_some() {
                return Err(anyhow!("induced failure"));
            }
            Ok(serde_json::json!({"ok": true}))
        }
    }

    fn worker() -> (WorkerNode, TaskQueue) {
        let store: Arc<dyn QueueStore> = Arc::new(SqliteQueueStore::open_in_memory().unwrap());
        let mut node = WorkerNode::new(Arc::clone(&store));
        node.register_handler(Arc::new(FlakyHandler { fail_marker: "fail" }));
        node.register_handler(Arc::new(ThumbnailHandler));
        node.register_handler(Arc::new(FormatConversionHandler));
        (node, TaskQueue::new(store))
    }

    #[tokio::test]
    async fn successful_execution_records_result() {
        let (node, queue) = worker();
        let task = TaskRecord::new("flaky", serde_json::json!({}));
        let id = task.task_id.clone();
        queue.save(&task).await.unwrap();

        let outcome = node.execute(task).await;
        assert_eq!(outcome.status, "success");

        let stored = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.started_at.is_some());
        assert!(stored.completed_at.is_some());
        assert_eq!(stored.result.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn handler_failure_records_error() {
        let (node, queue) = worker();
        let task = TaskRecord::new("flaky", serde_json::json!({"fail": 1}));
        let id = task.task_id.clone();
        queue.save(&task).await.unwrap();

        let outcome = node.execute(task).await;
        assert_eq!(outcome.status, "error");
        assert!(outcome.error.unwrap().contains("induced failure"));

        let stored = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_task_type_fails() {
        let (node, queue) = worker();
        let task = TaskRecord::new("unknown_type", serde_json::json!({}));
        queue.save(&task).await.unwrap();

        let outcome = node.execute(task).await;
        assert_eq!(outcome.status, "error");
        assert!(outcome.error.unwrap().contains("unsupported task type"));
    }

    #[tokio::test]
    async fn rerun_same_input_reaches_same_terminal_state() {
        let (node, queue) = worker();
        let data = serde_json::json!({"target_format": "pdf"});

        let first = TaskRecord::new("format_conversion", data.clone());
        queue.save(&first).await.unwrap();
        let out1 = node.execute(first).await;

        let second = TaskRecord::new("format_conversion", data);
        queue.save(&second).await.unwrap();
        let out2 = node.execute(second).await;

        assert_eq!(out1.status, "success");
        assert_eq!(out1.result, out2.result);
    }

    #[test]
    fn capabilities_reflect_handlers() {
        let (node, _) = worker();
        let caps = node.capabilities();
        assert!(caps.contains(&"flaky".to_string()));
        assert!(caps.contains(&"thumbnail_generation".to_string()));
        assert!(caps.contains(&"format_conversion".to_string()));
    }
}
