//! Prometheus exporter hook (§2.1 supplemented ambient component). Off by default; shapes the
//! interface a pull-style scrape endpoint would serve without standing up one, since running
//! an external scrape server is outside this bridge's Non-goals-bounded scope (§1). The bridge
//! binary still samples and logs a snapshot on the janitor's own interval, so the hook is
//! actually exercised rather than left as a type nothing constructs.

use bridge_buffer::Buffer;
use bridge_core::MetricPoint;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Direct projection of the Buffer's `latest_metrics()` output (§3.3), ready to serialize
/// as a Prometheus exposition payload or JSON, depending on what the `metrics_http` feature
/// (not enabled here) chooses to do with it.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub points: Vec<MetricPoint>,
}

impl MetricsSnapshot {
    pub fn from_points(points: Vec<MetricPoint>) -> Self {
        Self { points }
    }
}

/// Spawns a loop that samples `buffer.latest_metrics()` on `interval` and logs the resulting
/// `MetricsSnapshot` as JSON, giving an operator without a scrape endpoint a way to see the
/// same numbers via `tracing` output.
pub fn spawn(buffer: Arc<Buffer>, interval: Duration, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match buffer.latest_metrics().await {
                Ok(points) => {
                    let snapshot = MetricsSnapshot::from_points(points);
                    match serde_json::to_string(&snapshot) {
                        Ok(json) => tracing::debug!(event = "bridge.metrics.snapshot", snapshot = %json, "metrics snapshot"),
                        Err(err) => tracing::warn!(event = "bridge.metrics.serialize_error", error = %err, "failed to serialize metrics snapshot"),
                    }
                }
                Err(err) => tracing::warn!(event = "bridge.metrics.sample_error", error = %err, "failed to sample metrics"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_to_json() {
        let snapshot = MetricsSnapshot::from_points(vec![MetricPoint {
            timestamp: chrono::Utc::now(),
            metric_name: "pending_current".to_string(),
            metric_value: 3.0,
        }]);
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("pending_current"));
    }
}
