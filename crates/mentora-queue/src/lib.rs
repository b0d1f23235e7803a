//! Distributed job system: durable priority queue, node registry with
//! heartbeat liveness, score-based scheduler, and worker execution.

pub mod balancer;
pub mod metrics;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod tasks;
pub mod worker;

pub use balancer::{node_score, select_optimal_node};
pub use metrics::{MetricPoint, MetricsRecorder};
pub use registry::{NodeManager, HEARTBEAT_GRACE, HEARTBEAT_INTERVAL};
pub use scheduler::{Coordinator, HttpWorkerNotifier, WorkerNotifier, SCHEDULER_INTERVAL};
pub use store::{QueueStore, SqliteQueueStore};
pub use tasks::TaskQueue;
pub use worker::{ExecuteOutcome, FormatConversionHandler, TaskHandler, ThumbnailHandler, WorkerNode};
