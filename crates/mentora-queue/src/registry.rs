use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sysinfo::System;
use uuid::Uuid;

use mentora_schema::{NodeInfo, NodeRole, NodeStatus};

use crate::store::QueueStore;

pub const ACTIVE_NODES_SET: &str = "active_nodes";
pub const NODE_PREFIX: &str = "nodes:";
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// A node silent for longer than this is purged from the roster.
pub const HEARTBEAT_GRACE: Duration = Duration::from_secs(120);

fn node_key(node_id: &str) -> String {
    format!("{NODE_PREFIX}{node_id}")
}

/// Live worker roster: registration, periodic heartbeat with sampled
/// cpu/memory, and stale-node purge on read.
pub struct NodeManager {
    store: Arc<dyn QueueStore>,
    node_id: String,
    system: Mutex<System>,
    registered: Mutex<Option<NodeInfo>>,
}

impl NodeManager {
    pub fn new(store: Arc<dyn QueueStore>, node_id: Option<String>) -> Self {
        let node_id =
            node_id.unwrap_or_else(|| format!("node_{}", &Uuid::new_v4().simple().to_string()[..8]));
        Self {
            store,
            node_id,
            system: Mutex::new(System::new()),
            registered: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn register(
        &self,
        host: &str,
        port: u16,
        role: NodeRole,
        capabilities: Vec<String>,
        region: &str,
    ) -> Result<NodeInfo> {
        let (cpu, mem, workers) = self.sample();
        let info = NodeInfo {
            node_id: self.node_id.clone(),
            host: host.to_string(),
            port,
            role,
            status: NodeStatus::Online,
            cpu_usage: cpu,
            memory_usage: mem,
            available_workers: workers,
            last_heartbeat: Utc::now(),
            capabilities,
            region: region.to_string(),
        };

        self.store
            .hash_put(&node_key(&self.node_id), &serde_json::to_string(&info)?)
            .await?;
        self.store.sadd(ACTIVE_NODES_SET, &self.node_id).await?;
        *self.registered.lock().unwrap() = Some(info.clone());

        tracing::info!(node_id = %self.node_id, role = role.as_str(), host, port, "node registered");
        Ok(info)
    }

    pub async fn unregister(&self) -> Result<()> {
        self.store.srem(ACTIVE_NODES_SET, &self.node_id).await?;
        self.store.hash_delete(&node_key(&self.node_id)).await?;
        *self.registered.lock().unwrap() = None;
        tracing::info!(node_id = %self.node_id, "node unregistered");
        Ok(())
    }

    /// Refresh this node's stats in the roster.
    pub async fn heartbeat_once(&self) -> Result<()> {
        let mut info = match self.registered.lock().unwrap().clone() {
            Some(info) => info,
            None => return Ok(()),
        };

        let (cpu, mem, workers) = self.sample();
        info.cpu_usage = cpu;
        info.memory_usage = mem;
        info.available_workers = workers;
        info.last_heartbeat = Utc::now();

        self.store
            .hash_put(&node_key(&self.node_id), &serde_json::to_string(&info)?)
            .await?;
        *self.registered.lock().unwrap() = Some(info);
        Ok(())
    }

    /// Heartbeat supervisor task; runs until the process exits.
    pub fn spawn_heartbeat(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = self.heartbeat_once().await {
                    tracing::error!(error = %e, "heartbeat failed");
                }
            }
        })
    }

    /// All live nodes; nodes past the heartbeat grace window are purged
    /// as a side effect.
    pub async fn active_nodes(&self) -> Result<Vec<NodeInfo>> {
        let ids = self.store.smembers(ACTIVE_NODES_SET).await?;
        let mut nodes = Vec::new();
        let now = Utc::now();

        for node_id in ids {
            let Some(json) = self.store.hash_get(&node_key(&node_id)).await? else {
                self.store.srem(ACTIVE_NODES_SET, &node_id).await?;
                continue;
            };
            let info: NodeInfo = match serde_json::from_str(&json) {
                Ok(info) => info,
                Err(e) => {
                    tracing::warn!(node_id, error = %e, "dropping unreadable node record");
                    self.store.srem(ACTIVE_NODES_SET, &node_id).await?;
                    self.store.hash_delete(&node_key(&node_id)).await?;
                    continue;
                }
            };

            let age = now.signed_duration_since(info.last_heartbeat);
            if age.num_seconds() > HEARTBEAT_GRACE.as_secs() as i64 {
                tracing::warn!(node_id, age_seconds = age.num_seconds(), "purging stale node");
                self.store.srem(ACTIVE_NODES_SET, &node_id).await?;
                self.store.hash_delete(&node_key(&node_id)).await?;
                continue;
            }

            nodes.push(info);
        }

        Ok(nodes)
    }

    fn sample(&self) -> (f64, f64, u32) {
        let mut sys = self.system.lock().unwrap();
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let cpu = sys.global_cpu_usage() as f64;
        let total = sys.total_memory().max(1);
        let mem = (sys.used_memory() as f64 / total as f64) * 100.0;
        let workers = sys.cpus().len().max(1) as u32;
        (cpu, mem, workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteQueueStore;

    fn manager() -> NodeManager {
        NodeManager::new(
            Arc::new(SqliteQueueStore::open_in_memory().unwrap()),
            Some("node_test".into()),
        )
    }

    #[tokio::test]
    async fn register_appears_in_roster() {
        let mgr = manager();
        mgr.register(
            "127.0.0.1",
            8000,
            NodeRole::Hybrid,
            vec!["document_processing".into()],
            "default",
        )
        .await
        .unwrap();

        let nodes = mgr.active_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node_id, "node_test");
        assert_eq!(nodes[0].status, NodeStatus::Online);
        assert!(nodes[0].available_workers >= 1);
    }

    #[tokio::test]
    async fn unregister_removes_node() {
        let mgr = manager();
        mgr.register("h", 1, NodeRole::Worker, vec![], "r").await.unwrap();
        mgr.unregister().await.unwrap();
        assert!(mgr.active_nodes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_nodes_are_purged() {
        let store: Arc<dyn QueueStore> = Arc::new(SqliteQueueStore::open_in_memory().unwrap());
        let mgr = NodeManager::new(Arc::clone(&store), Some("node_live".into()));
        mgr.register("h", 1, NodeRole::Worker, vec![], "r").await.unwrap();

        // Plant a node whose heartbeat is far in the past.
        let stale = NodeInfo {
            node_id: "node_stale".into(),
            host: "h".into(),
            port: 2,
            role: NodeRole::Worker,
            status: NodeStatus::Online,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            available_workers: 1,
            last_heartbeat: Utc::now() - chrono::Duration::minutes(10),
            capabilities: vec![],
            region: "r".into(),
        };
        store
            .hash_put("nodes:node_stale", &serde_json::to_string(&stale).unwrap())
            .await
            .unwrap();
        store.sadd(ACTIVE_NODES_SET, "node_stale").await.unwrap();

        let nodes = mgr.active_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node_id, "node_live");
        assert!(store.hash_get("nodes:node_stale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn heartbeat_refreshes_timestamp() {
        let mgr = manager();
        let before = mgr
            .register("h", 1, NodeRole::Worker, vec![], "r")
            .await
            .unwrap()
            .last_heartbeat;
        tokio::time::sleep(Duration::from_millis(5)).await;
        mgr.heartbeat_once().await.unwrap();

        let nodes = mgr.active_nodes().await.unwrap();
        assert!(nodes[0].last_heartbeat > before);
    }
}
