use std::sync::Arc;

use anyhow::Result;

use mentora_schema::{TaskRecord, TaskStatus};

use crate::store::QueueStore;

pub const PENDING_SET: &str = "pending_tasks";
pub const TASK_PREFIX: &str = "task:";
/// Requeued tasks (notify failure, timeout retry) re-enter at normal
/// priority.
pub const REQUEUE_SCORE: i64 = 2;

fn task_key(task_id: &str) -> String {
    format!("{TASK_PREFIX}{task_id}")
}

/// Durable task queue over the KV substrate: the task record lives in a
/// hash, the pending set only holds ids scored by priority.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn QueueStore>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn QueueStore> {
        Arc::clone(&self.store)
    }

    /// Enqueue a task; returns its id.
    pub async fn submit(&self, task: TaskRecord) -> Result<String> {
        let task_id = task.task_id.clone();
        self.save(&task).await?;
        self.store
            .zadd(PENDING_SET, &task_id, task.priority.score())
            .await?;
        tracing::info!(task_id = %task_id, task_type = %task.task_type, priority = task.priority.as_str(), "task submitted");
        Ok(task_id)
    }

    pub async fn save(&self, task: &TaskRecord) -> Result<()> {
        let json = serde_json::to_string(task)?;
        self.store.hash_put(&task_key(&task.task_id), &json).await
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        match self.store.hash_get(&task_key(task_id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, task_id: &str) -> Result<()> {
        self.store.hash_delete(&task_key(task_id)).await?;
        self.store.zrem(PENDING_SET, task_id).await
    }

    /// Cancel a task that has not started running. Returns false when
    /// the task is unknown or already past the point of cancellation.
    pub async fn cancel(&self, task_id: &str) -> Result<bool> {
        let Some(mut task) = self.get(task_id).await? else {
            return Ok(false);
        };
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Assigned) {
            return Ok(false);
        }

        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(chrono::Utc::now());
        self.save(&task).await?;
        self.store.zrem(PENDING_SET, task_id).await?;
        tracing::info!(task_id, "task cancelled");
        Ok(true)
    }

    /// Highest-priority pending ids, up to `n`.
    pub async fn pending_top(&self, n: usize) -> Result<Vec<(String, i64)>> {
        self.store.ztop(PENDING_SET, n).await
    }

    pub async fn remove_pending(&self, task_id: &str) -> Result<()> {
        self.store.zrem(PENDING_SET, task_id).await
    }

    /// Put a task id back into the pending set.
    pub async fn requeue(&self, task_id: &str, score: i64) -> Result<()> {
        self.store.zadd(PENDING_SET, task_id, score).await
    }

    pub async fn all_task_keys(&self) -> Result<Vec<String>> {
        self.store.hash_keys(TASK_PREFIX).await
    }

    /// True when every dependency has completed.
    pub async fn dependencies_met(&self, task: &TaskRecord) -> Result<bool> {
        for dep_id in &task.dependencies {
            match self.get(dep_id).await? {
                Some(dep) if dep.status == TaskStatus::Completed => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}
