use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl TaskPriority {
    /// Sorted-set score; higher pops first.
    pub fn score(&self) -> i64 {
        match self {
            TaskPriority::Low => 1,
            TaskPriority::Normal => 2,
            TaskPriority::High => 3,
            TaskPriority::Urgent => 4,
        }
    }

    /// Load-balancer weight; a heavier weight makes loaded nodes more
    /// acceptable for urgent work.
    pub fn weight(&self) -> f64 {
        match self {
            TaskPriority::Low => 0.5,
            TaskPriority::Normal => 1.0,
            TaskPriority::High => 1.5,
            TaskPriority::Urgent => 2.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Urgent => "urgent",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "low" => TaskPriority::Low,
            "high" => TaskPriority::High,
            "urgent" => TaskPriority::Urgent,
            _ => TaskPriority::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "assigned" => TaskStatus::Assigned,
            "processing" => TaskStatus::Processing,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            _ => TaskStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Durable task record. The sorted pending set only holds the id; this
/// record lives in the task hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub task_type: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    #[serde(default)]
    pub assigned_node: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub data: serde_json::Value,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Estimated execution time in seconds.
    pub estimated_duration: u64,
}

impl TaskRecord {
    pub fn new(task_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            priority: TaskPriority::Normal,
            status: TaskStatus::Pending,
            assigned_node: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: 3,
            timeout_seconds: 3600,
            data,
            result: None,
            error: None,
            dependencies: Vec::new(),
            estimated_duration: 300,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Coordinator,
    Worker,
    Hybrid,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Coordinator => "coordinator",
            NodeRole::Worker => "worker",
            NodeRole::Hybrid => "hybrid",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "coordinator" => NodeRole::Coordinator,
            "worker" => NodeRole::Worker,
            _ => NodeRole::Hybrid,
        }
    }

    pub fn runs_coordinator(&self) -> bool {
        matches!(self, NodeRole::Coordinator | NodeRole::Hybrid)
    }

    pub fn runs_worker(&self) -> bool {
        matches!(self, NodeRole::Worker | NodeRole::Hybrid)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
    Busy,
    Maintenance,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
            NodeStatus::Busy => "busy",
            NodeStatus::Maintenance => "maintenance",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "online" => NodeStatus::Online,
            "busy" => NodeStatus::Busy,
            "maintenance" => NodeStatus::Maintenance,
            _ => NodeStatus::Offline,
        }
    }
}

/// Live worker roster entry, refreshed by heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub role: NodeRole,
    pub status: NodeStatus,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub available_workers: u32,
    pub last_heartbeat: DateTime<Utc>,
    /// Task types this node can execute.
    pub capabilities: Vec<String>,
    pub region: String,
}

impl NodeInfo {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_scores_order() {
        assert!(TaskPriority::Urgent.score() > TaskPriority::High.score());
        assert!(TaskPriority::High.score() > TaskPriority::Normal.score());
        assert!(TaskPriority::Normal.score() > TaskPriority::Low.score());
    }

    #[test]
    fn task_record_defaults() {
        let t = TaskRecord::new("document_processing", serde_json::json!({"document_id": 1}));
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.max_retries, 3);
        assert_eq!(t.timeout_seconds, 3600);
        assert!(t.dependencies.is_empty());
        assert!(!t.task_id.is_empty());
    }

    #[test]
    fn node_role_coordinator_gate() {
        assert!(NodeRole::Coordinator.runs_coordinator());
        assert!(NodeRole::Hybrid.runs_coordinator());
        assert!(!NodeRole::Worker.runs_coordinator());
        assert!(NodeRole::Worker.runs_worker());
    }

    #[test]
    fn task_status_roundtrip() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Assigned,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse(s.as_str()), s);
        }
    }
}
