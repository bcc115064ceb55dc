//! External metric sources.

use std::sync::Arc;

use tokio::sync::RwLock;

use vigil_core::{BoxFuture, MetricSnapshot};

/// Supplies named metric values to alert evaluation each tick.
///
/// A failing source is logged and contributes nothing for that tick.
pub trait MetricSource: Send + Sync {
    fn name(&self) -> &str;
    fn collect(&self) -> BoxFuture<'_, anyhow::Result<MetricSnapshot>>;
}

/// A metric map the host writes into and the engine reads from.
#[derive(Debug, Clone, Default)]
pub struct SharedMetrics {
    name: String,
    values: Arc<RwLock<MetricSnapshot>>,
}

impl SharedMetrics {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            values: Arc::new(RwLock::new(MetricSnapshot::new())),
        }
    }

    pub async fn set(&self, metric: &str, value: f64) {
        self.values.write().await.insert(metric, value);
    }

    pub async fn remove(&self, metric: &str) {
        self.values.write().await.remove(metric);
    }

    pub async fn snapshot(&self) -> MetricSnapshot {
        self.values.read().await.clone()
    }
}

impl MetricSource for SharedMetrics {
    fn name(&self) -> &str {
        &self.name
    }

    fn collect(&self) -> BoxFuture<'_, anyhow::Result<MetricSnapshot>> {
        Box::pin(async move { Ok(self.snapshot().await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shared_metrics_round_trip_through_collect() {
        let metrics = SharedMetrics::new("host");
        metrics.set("cpu_usage_percent", 42.0).await;
        metrics.set("memory_usage_percent", 70.0).await;
        metrics.remove("memory_usage_percent").await;

        let clone = metrics.clone();
        let snapshot = clone.collect().await.unwrap();
        assert_eq!(snapshot.get("cpu_usage_percent"), Some(42.0));
        assert_eq!(snapshot.get("memory_usage_percent"), None);
        assert_eq!(clone.name(), "host");
    }
}
