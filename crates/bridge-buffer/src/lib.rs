//! The Persistent Message Buffer (§3, §4.2): the façade every adapter and the Dispatcher goes
//! through. Owns the soft-capacity check, in-process metric counters, and the coalescing flag
//! that `bridge-store` applies atomically on insert.

use bridge_core::{
    DataType, Destination, Message, MetricPoint, NewMessage, Priority, Source, Status,
    METRIC_NAMES,
};
use bridge_store::Store;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Soft-capacity thresholds (§4.2 Backpressure). Breaching `max_pending` rejects further
/// non-critical enqueues with `BufferFull`; `Critical` priority messages are never rejected.
#[derive(Debug, Clone, Copy)]
pub struct BufferLimits {
    pub max_pending: i64,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self { max_pending: 100_000 }
    }
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    expired: AtomicU64,
    retried: AtomicU64,
}

pub struct Buffer {
    store: Store,
    limits: BufferLimits,
    counters: Counters,
}

impl Buffer {
    pub fn new(store: Store, limits: BufferLimits) -> Self {
        Self { store, limits, counters: Counters::default() }
    }

    /// `enqueue(message) -> id` (§4.2). Rejects an empty `topic_or_node` or a negative
    /// `max_retries` outright, then `BufferFull` once `pending` count meets `max_pending`,
    /// unless the message is `Critical`.
    pub async fn enqueue(&self, new_message: NewMessage) -> Result<i64, bridge_core::BridgeError> {
        if new_message.topic_or_node.trim().is_empty() {
            return Err(bridge_core::BridgeError::Integrity("empty topic_or_node".to_string()));
        }
        if new_message.max_retries < 0 {
            return Err(bridge_core::BridgeError::Integrity(format!(
                "max_retries must be >= 0, got {}",
                new_message.max_retries
            )));
        }

        if new_message.priority != Priority::Critical {
            let pending = self.store.count_status(Status::Pending).await.map_err(store_err)?;
            if pending >= self.limits.max_pending {
                return Err(bridge_core::BridgeError::BufferFull);
            }
        }

        let id = self.store.insert(&new_message).await.map_err(store_err)?;
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            event = "buffer.enqueue",
            id,
            destination = ?new_message.destination,
            topic_or_node = %new_message.topic_or_node,
            priority = %new_message.priority,
            "message enqueued"
        );
        Ok(id)
    }

    /// `claim(limit, worker_id, lease_duration) -> [messages]` (§4.1), unchanged pass-through.
    pub async fn claim(
        &self,
        limit: i64,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Vec<Message>, bridge_core::BridgeError> {
        self.store.claim(limit, worker_id, lease_duration).await.map_err(store_err)
    }

    pub async fn complete(&self, id: i64) -> Result<(), bridge_core::BridgeError> {
        self.store.complete(id).await.map_err(store_err)?;
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// `fail_retry` pass-through; records `retried` or `failed` depending on the outcome.
    pub async fn fail_retry(
        &self,
        id: i64,
        error: &str,
        backoff: Duration,
    ) -> Result<bool, bridge_core::BridgeError> {
        let requeued = self.store.fail_retry(id, error, backoff).await.map_err(store_err)?;
        if requeued {
            self.counters.retried.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(requeued)
    }

    /// Unconditional archive for a `Permanent` egress outcome; ignores retry budget.
    pub async fn fail_permanent(&self, id: i64, error: &str) -> Result<(), bridge_core::BridgeError> {
        self.store.fail_permanent(id, error).await.map_err(store_err)?;
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn expire_due(&self) -> Result<u64, bridge_core::BridgeError> {
        let n = self.store.expire_due().await.map_err(store_err)?;
        self.counters.expired.fetch_add(n, Ordering::Relaxed);
        Ok(n)
    }

    pub async fn reclaim_stuck(&self) -> Result<u64, bridge_core::BridgeError> {
        self.store.reclaim_stuck().await.map_err(store_err)
    }

    pub async fn cleanup(&self, older_than: chrono::DateTime<Utc>) -> Result<u64, bridge_core::BridgeError> {
        self.store.cleanup(older_than).await.map_err(store_err)
    }

    /// Snapshots the in-process counters plus the two live gauges from the Store and persists
    /// them as one `statistics` row per name (§3.3, §4.2 metrics). Counters are NOT reset —
    /// each flush reports a cumulative total, matching `METRIC_NAMES`' "since start" semantics.
    pub async fn flush_metrics(&self, since_last_flush: Duration) -> Result<(), bridge_core::BridgeError> {
        let pending_current = self.store.count_status(Status::Pending).await.map_err(store_err)?;
        let processing_current = self.store.count_status(Status::Processing).await.map_err(store_err)?;
        let completed = self.counters.completed.load(Ordering::Relaxed);
        let minutes = (since_last_flush.as_secs_f64() / 60.0).max(1.0 / 60.0);
        let throughput_per_minute = completed as f64 / minutes;

        let now = Utc::now();
        let points = vec![
            metric_point(now, "enqueued", self.counters.enqueued.load(Ordering::Relaxed) as f64),
            metric_point(now, "completed", completed as f64),
            metric_point(now, "failed", self.counters.failed.load(Ordering::Relaxed) as f64),
            metric_point(now, "expired", self.counters.expired.load(Ordering::Relaxed) as f64),
            metric_point(now, "retried", self.counters.retried.load(Ordering::Relaxed) as f64),
            metric_point(now, "pending_current", pending_current as f64),
            metric_point(now, "processing_current", processing_current as f64),
            metric_point(now, "throughput_per_minute", throughput_per_minute),
        ];
        debug_assert_eq!(points.len(), METRIC_NAMES.len());

        self.store.record_metrics(&points).await.map_err(store_err)
    }

    pub async fn latest_metrics(&self) -> Result<Vec<MetricPoint>, bridge_core::BridgeError> {
        self.store.latest_metrics().await.map_err(store_err)
    }

    pub async fn metrics_history(&self) -> Result<Vec<MetricPoint>, bridge_core::BridgeError> {
        self.store.metrics_history().await.map_err(store_err)
    }

    pub async fn query_pending(&self, limit: i64) -> Result<Vec<Message>, bridge_core::BridgeError> {
        self.store.query_pending(limit).await.map_err(store_err)
    }

    pub async fn query_failed(&self, limit: i64) -> Result<Vec<bridge_core::ArchivedMessage>, bridge_core::BridgeError> {
        self.store.query_failed(limit).await.map_err(store_err)
    }

    pub async fn reset_processing(&self) -> Result<u64, bridge_core::BridgeError> {
        self.store.reset_processing().await.map_err(store_err)
    }

    pub async fn count_status(&self, status: Status) -> Result<i64, bridge_core::BridgeError> {
        self.store.count_status(status).await.map_err(store_err)
    }
}

fn metric_point(timestamp: chrono::DateTime<Utc>, name: &str, value: f64) -> MetricPoint {
    MetricPoint { timestamp, metric_name: name.to_string(), metric_value: value }
}

fn store_err(err: anyhow::Error) -> bridge_core::BridgeError {
    match err.downcast::<sqlx::Error>() {
        Ok(sqlx_err) => bridge_core::BridgeError::StoreUnavailable(sqlx_err),
        Err(err) => bridge_core::BridgeError::Integrity(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_store::open_in_memory;

    async fn test_buffer(limits: BufferLimits) -> Buffer {
        let pools = open_in_memory().await.expect("open in-memory store");
        Buffer::new(Store::new(pools), limits)
    }

    fn sample(priority: Priority) -> NewMessage {
        NewMessage {
            source: Source::Mqtt,
            destination: Destination::Opcua,
            topic_or_node: "line1/temp".to_string(),
            value: "42".to_string(),
            data_type: DataType::Int32,
            priority,
            max_retries: 3,
            ttl: chrono::Duration::hours(1),
            coalesce: false,
        }
    }

    #[tokio::test]
    async fn enqueue_rejects_once_soft_cap_reached() {
        let buffer = test_buffer(BufferLimits { max_pending: 1 }).await;
        buffer.enqueue(sample(Priority::Normal)).await.unwrap();
        let second = buffer.enqueue(sample(Priority::Normal)).await;
        assert!(matches!(second, Err(bridge_core::BridgeError::BufferFull)));
    }

    #[tokio::test]
    async fn enqueue_rejects_empty_topic_or_node() {
        let buffer = test_buffer(BufferLimits::default()).await;
        let mut message = sample(Priority::Normal);
        message.topic_or_node = "  ".to_string();
        let result = buffer.enqueue(message).await;
        assert!(matches!(result, Err(bridge_core::BridgeError::Integrity(_))));
    }

    #[tokio::test]
    async fn enqueue_rejects_negative_max_retries() {
        let buffer = test_buffer(BufferLimits::default()).await;
        let mut message = sample(Priority::Normal);
        message.max_retries = -1;
        let result = buffer.enqueue(message).await;
        assert!(matches!(result, Err(bridge_core::BridgeError::Integrity(_))));
    }

    #[tokio::test]
    async fn critical_priority_bypasses_soft_cap() {
        let buffer = test_buffer(BufferLimits { max_pending: 1 }).await;
        buffer.enqueue(sample(Priority::Normal)).await.unwrap();
        let second = buffer.enqueue(sample(Priority::Critical)).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn flush_metrics_writes_every_closed_set_name() {
        let buffer = test_buffer(BufferLimits::default()).await;
        buffer.enqueue(sample(Priority::Normal)).await.unwrap();
        buffer.flush_metrics(Duration::from_secs(60)).await.unwrap();

        let latest = buffer.latest_metrics().await.unwrap();
        let names: Vec<&str> = latest.iter().map(|p| p.metric_name.as_str()).collect();
        for expected in METRIC_NAMES {
            assert!(names.contains(expected), "missing metric {expected}");
        }
    }
}
