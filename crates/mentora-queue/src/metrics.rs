use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::store::QueueStore;

pub const METRIC_PREFIX: &str = "metrics:";
/// Series are capped; the oldest samples fall off.
pub const SERIES_CAP: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp_ms: i64,
    pub value: f64,
}

/// Capped time-series recorder over the queue substrate. The heartbeat
/// loop records node load, the scheduler records queue depth and
/// assignment counts.
#[derive(Clone)]
pub struct MetricsRecorder {
    store: Arc<dyn QueueStore>,
}

impl MetricsRecorder {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, name: &str, value: f64) -> Result<()> {
        let point = MetricPoint {
            timestamp_ms: Utc::now().timestamp_millis(),
            value,
        };
        self.store
            .list_push_capped(
                &format!("{METRIC_PREFIX}{name}"),
                &serde_json::to_string(&point)?,
                SERIES_CAP,
            )
            .await
    }

    /// Most recent `n` samples, newest first.
    pub async fn series(&self, name: &str, n: usize) -> Result<Vec<MetricPoint>> {
        let raw = self
            .store
            .list_range(&format!("{METRIC_PREFIX}{name}"), n)
            .await?;
        let mut out = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str(&entry) {
                Ok(point) => out.push(point),
                Err(e) => tracing::debug!(name, error = %e, "skipping unreadable metric sample"),
            }
        }
        Ok(out)
    }

    /// Latest value per known metric.
    pub async fn current(&self) -> Result<HashMap<String, f64>> {
        let mut out = HashMap::new();
        for key in self.store.list_keys(METRIC_PREFIX).await? {
            let name = key.trim_start_matches(METRIC_PREFIX).to_string();
            if let Some(latest) = self.series(&name, 1).await?.into_iter().next() {
                out.insert(name, latest.value);
            }
        }
        Ok(out)
    }
}
