use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use mentora_schema::{NodeInfo, TaskRecord, TaskStatus};

use crate::balancer::select_optimal_node;
use crate::metrics::MetricsRecorder;
use crate::registry::{NodeManager, HEARTBEAT_GRACE};
use crate::store::QueueStore;
use crate::tasks::{TaskQueue, REQUEUE_SCORE};

pub const SCHEDULER_INTERVAL: Duration = Duration::from_secs(5);
/// Pending tasks considered per pass.
pub const ASSIGN_BATCH: usize = 10;
/// Terminal tasks older than this are garbage-collected.
pub const GC_RETENTION: Duration = Duration::from_secs(24 * 3600);
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

const LEADER_KEY: &str = "coordinator_owner";

/// Delivery of an assignment to a worker node.
#[async_trait]
pub trait WorkerNotifier: Send + Sync {
    async fn notify(&self, node: &NodeInfo, task: &TaskRecord) -> Result<()>;
}

/// POST the task to the node's worker execute endpoint.
pub struct HttpWorkerNotifier {
    client: reqwest::Client,
}

impl HttpWorkerNotifier {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(NOTIFY_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpWorkerNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerNotifier for HttpWorkerNotifier {
    async fn notify(&self, node: &NodeInfo, task: &TaskRecord) -> Result<()> {
        let url = format!("{}/api/worker/execute", node.base_url());
        let response = self.client.post(&url).json(task).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "worker {} rejected assignment with HTTP {}",
                node.node_id,
                response.status()
            ));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct LeaderMarker {
    node_id: String,
    claimed_at_ms: i64,
}

/// The coordinator loop: assigns pending tasks to capable nodes by load
/// score, requeues timed-out work, and garbage-collects old terminal
/// tasks. Exactly one coordinator runs per queue instance; a leadership
/// marker in the substrate enforces that, with takeover of markers
/// staler than the heartbeat grace window.
pub struct Coordinator {
    queue: TaskQueue,
    registry: Arc<NodeManager>,
    notifier: Box<dyn WorkerNotifier>,
    metrics: MetricsRecorder,
    node_id: String,
}

impl Coordinator {
    pub fn new(store: Arc<dyn QueueStore>, registry: Arc<NodeManager>) -> Self {
        Self::with_notifier(store, registry, Box::new(HttpWorkerNotifier::new()))
    }

    pub fn with_notifier(
        store: Arc<dyn QueueStore>,
        registry: Arc<NodeManager>,
        notifier: Box<dyn WorkerNotifier>,
    ) -> Self {
        let node_id = registry.node_id().to_string();
        Self {
            queue: TaskQueue::new(Arc::clone(&store)),
            registry,
            notifier,
            metrics: MetricsRecorder::new(store),
            node_id,
        }
    }

    /// Run until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(node_id = %self.node_id, "coordinator started");
        let mut interval = tokio::time::interval(SCHEDULER_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("coordinator stopping");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "coordinator pass failed");
                    }
                }
            }
        }
    }

    /// One scheduler pass.
    pub async fn tick(&self) -> Result<()> {
        if !self.try_acquire_leadership().await? {
            tracing::debug!(node_id = %self.node_id, "another coordinator owns the queue, skipping pass");
            return Ok(());
        }

        self.process_pending().await?;
        self.check_timeouts().await?;
        self.cleanup_terminal().await?;
        Ok(())
    }

    async fn try_acquire_leadership(&self) -> Result<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let current = self.queue.store().hash_get(LEADER_KEY).await?;

        let can_claim = match current {
            None => true,
            Some(json) => match serde_json::from_str::<LeaderMarker>(&json) {
                Ok(marker) => {
                    marker.node_id == self.node_id
                        || now_ms - marker.claimed_at_ms > HEARTBEAT_GRACE.as_millis() as i64
                }
                Err(_) => true,
            },
        };

        if can_claim {
            let marker = LeaderMarker {
                node_id: self.node_id.clone(),
                claimed_at_ms: now_ms,
            };
            self.queue
                .store()
                .hash_put(LEADER_KEY, &serde_json::to_string(&marker)?)
                .await?;
        }
        Ok(can_claim)
    }

    async fn process_pending(&self) -> Result<()> {
        let pending = self.queue.pending_top(ASSIGN_BATCH).await?;
        self.metrics
            .record("scheduler.pending_depth", pending.len() as f64)
            .await?;
        if pending.is_empty() {
            return Ok(());
        }

        let nodes = self.registry.active_nodes().await?;
        let mut assigned = 0_u64;

        for (task_id, _score) in pending {
            let Some(mut task) = self.queue.get(&task_id).await? else {
                // Record vanished; drop the dangling pending entry.
                self.queue.remove_pending(&task_id).await?;
                continue;
            };
            if task.status != TaskStatus::Pending {
                self.queue.remove_pending(&task_id).await?;
                continue;
            }
            if !self.queue.dependencies_met(&task).await? {
                continue;
            }

            let Some(node) = select_optimal_node(&task, &nodes) else {
                continue;
            };

            task.status = TaskStatus::Assigned;
            task.assigned_node = Some(node.node_id.clone());
            self.queue.save(&task).await?;
            self.queue.remove_pending(&task_id).await?;

            if let Err(e) = self.notifier.notify(node, &task).await {
                tracing::error!(task_id = %task_id, node_id = %node.node_id, error = %e, "worker notify failed, requeueing");
                task.status = TaskStatus::Pending;
                task.assigned_node = None;
                self.queue.save(&task).await?;
                self.queue.requeue(&task_id, REQUEUE_SCORE).await?;
                continue;
            }

            assigned += 1;
            tracing::info!(task_id = %task_id, node_id = %node.node_id, "task assigned");
        }

        if assigned > 0 {
            self.metrics
                .record("scheduler.assigned", assigned as f64)
                .await?;
        }
        Ok(())
    }

    async fn check_timeouts(&self) -> Result<()> {
        let now = Utc::now();
        for key in self.queue.all_task_keys().await? {
            let task_id = key.trim_start_matches(crate::tasks::TASK_PREFIX).to_string();
            let Some(task) = self.queue.get(&task_id).await? else {
                continue;
            };
            if !matches!(task.status, TaskStatus::Assigned | TaskStatus::Processing) {
                continue;
            }
            let Some(started_at) = task.started_at else {
                continue;
            };

            let elapsed = now.signed_duration_since(started_at).num_seconds();
            if elapsed > task.timeout_seconds as i64 {
                self.handle_timeout(task).await?;
            }
        }
        Ok(())
    }

    async fn handle_timeout(&self, mut task: TaskRecord) -> Result<()> {
        if task.retry_count < task.max_retries {
            task.retry_count += 1;
            task.status = TaskStatus::Pending;
            task.assigned_node = None;
            task.started_at = None;
            task.error = Some(format!("Timeout after {} seconds", task.timeout_seconds));
            let retry = task.retry_count;
            let task_id = task.task_id.clone();
            self.queue.save(&task).await?;
            self.queue.requeue(&task_id, REQUEUE_SCORE).await?;
            tracing::warn!(task_id = %task_id, retry, "task timed out, retrying");
        } else {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(Utc::now());
            task.error = Some(format!(
                "Exceeded max retries ({}) after timeout",
                task.max_retries
            ));
            let task_id = task.task_id.clone();
            self.queue.save(&task).await?;
            tracing::error!(task_id = %task_id, "task exceeded max retries after timeout");
        }
        Ok(())
    }

    async fn cleanup_terminal(&self) -> Result<()> {
        let cutoff = Utc::now() - chrono::Duration::from_std(GC_RETENTION).unwrap_or_default();
        for key in self.queue.all_task_keys().await? {
            let task_id = key.trim_start_matches(crate::tasks::TASK_PREFIX).to_string();
            let Some(task) = self.queue.get(&task_id).await? else {
                continue;
            };
            if !matches!(
                task.status,
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
            ) {
                continue;
            }
            if let Some(completed_at) = task.completed_at {
                if completed_at < cutoff {
                    self.queue.delete(&task_id).await?;
                    tracing::debug!(task_id = %task_id, "garbage-collected terminal task");
                }
            }
        }
        Ok(())
    }
}
