use mentora_schema::{NodeInfo, NodeStatus, TaskPriority, TaskRecord};

/// Assumed per-node worker ceiling for the worker-availability term.
const MAX_WORKERS: f64 = 10.0;

/// Load score for a node; lower is better. Combines cpu, memory and
/// worker saturation, divided by the task's priority weight so urgent
/// work tolerates busier nodes.
pub fn node_score(node: &NodeInfo, priority: TaskPriority) -> f64 {
    let cpu_score = node.cpu_usage / 100.0;
    let memory_score = node.memory_usage / 100.0;
    let worker_score = (1.0 - node.available_workers as f64 / MAX_WORKERS).max(0.0);

    let base = cpu_score * 0.4 + memory_score * 0.4 + worker_score * 0.2;
    base / priority.weight()
}

/// Pick the best node for a task: online, capable of the task type,
/// minimal score. Ties break by node id for determinism.
pub fn select_optimal_node<'a>(task: &TaskRecord, nodes: &'a [NodeInfo]) -> Option<&'a NodeInfo> {
    nodes
        .iter()
        .filter(|n| n.status == NodeStatus::Online)
        .filter(|n| n.capabilities.iter().any(|c| c == &task.task_type))
        .min_by(|a, b| {
            node_score(a, task.priority)
                .total_cmp(&node_score(b, task.priority))
                .then_with(|| a.node_id.cmp(&b.node_id))
        })
}
