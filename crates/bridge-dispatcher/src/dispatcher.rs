//! Worker pool (§4.3): claims batches from the Buffer, invokes the egress adapter matching
//! each message's destination, and reports the outcome back through `complete`/`fail_retry`.

use bridge_buffer::Buffer;
use bridge_core::{DeliveryOutcome, Destination, EgressAdapter, Message};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    pub worker_count: usize,
    pub batch_size: i64,
    pub lease_duration: Duration,
    pub per_message_timeout: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub max_retries: i32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            batch_size: 16,
            lease_duration: Duration::from_secs(60),
            per_message_timeout: Duration::from_secs(10),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            max_retries: 5,
        }
    }
}

pub struct Dispatcher {
    buffer: Arc<Buffer>,
    egress: HashMap<Destination, Arc<dyn EgressAdapter>>,
    cfg: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        buffer: Arc<Buffer>,
        egress: HashMap<Destination, Arc<dyn EgressAdapter>>,
        cfg: DispatcherConfig,
    ) -> Self {
        Self { buffer, egress, cfg }
    }

    /// Spawns `worker_count` worker loops and returns their join handles. Each worker exits
    /// cleanly once `shutdown` is cancelled, finishing any in-flight egress call first (§4.3).
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        let instance = uuid::Uuid::new_v4();
        (0..self.cfg.worker_count)
            .map(|idx| {
                let dispatcher = Arc::clone(&self);
                let shutdown = shutdown.clone();
                let worker_id = format!("worker-{instance}-{idx}");
                tokio::spawn(async move { dispatcher.run_worker(worker_id, shutdown).await })
            })
            .collect()
    }

    async fn run_worker(&self, worker_id: String, shutdown: CancellationToken) {
        tracing::info!(event = "dispatcher.worker.started", worker_id = %worker_id, "worker started");
        let mut idle_backoff = Duration::from_millis(50);
        const IDLE_BACKOFF_CAP: Duration = Duration::from_secs(2);

        loop {
            if shutdown.is_cancelled() {
                tracing::info!(event = "dispatcher.worker.shutdown", worker_id = %worker_id, "worker shutting down");
                return;
            }

            let claimed = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(event = "dispatcher.worker.shutdown", worker_id = %worker_id, "worker shutting down");
                    return;
                }
                res = self.buffer.claim(self.cfg.batch_size, &worker_id, self.cfg.lease_duration) => res,
            };

            let messages = match claimed {
                Ok(messages) => messages,
                Err(err) => {
                    tracing::warn!(event = "dispatcher.claim.error", worker_id = %worker_id, error = %err, "claim failed");
                    tokio::time::sleep(idle_backoff).await;
                    continue;
                }
            };

            if messages.is_empty() {
                tokio::time::sleep(idle_backoff).await;
                idle_backoff = (idle_backoff * 2).min(IDLE_BACKOFF_CAP);
                continue;
            }
            idle_backoff = Duration::from_millis(50);

            for message in messages {
                self.handle_message(&worker_id, message).await;
            }
        }
    }

    async fn handle_message(&self, worker_id: &str, message: Message) {
        let Some(adapter) = self.egress.get(&message.destination) else {
            tracing::warn!(
                event = "dispatcher.message.no_adapter",
                worker_id = %worker_id,
                id = message.id,
                destination = ?message.destination,
                "no egress adapter registered for destination"
            );
            let _ = self
                .buffer
                .fail_retry(message.id, "no egress adapter registered", self.cfg.base_backoff)
                .await;
            return;
        };

        // §6.2/§7: a value that does not match its declared data_type is a permanent failure,
        // checked centrally here so every adapter shares one coercion rule. The canonical form
        // this produces, not the raw stored value, is what actually goes out over the wire.
        let mut message = message;
        match bridge_core::coerce::canonicalize(message.data_type, &message.value) {
            Ok(canonical) => message.value = canonical,
            Err(err) => {
                if let Err(err) = self.buffer.fail_permanent(message.id, &err.to_string()).await {
                    tracing::error!(event = "dispatcher.fail_permanent.error", id = message.id, error = %err, "fail_permanent failed");
                }
                return;
            }
        }

        let outcome = match tokio::time::timeout(self.cfg.per_message_timeout, adapter.deliver(&message)).await {
            Ok(outcome) => outcome,
            Err(_) => DeliveryOutcome::Retryable("timeout".to_string()),
        };

        match outcome {
            DeliveryOutcome::Ok => {
                if let Err(err) = self.buffer.complete(message.id).await {
                    tracing::warn!(event = "dispatcher.complete.error", id = message.id, error = %err, "complete failed");
                }
            }
            DeliveryOutcome::Retryable(error) => {
                let backoff = self.compute_backoff(message.retry_count);
                match self.buffer.fail_retry(message.id, &error, backoff).await {
                    Ok(true) => tracing::info!(
                        event = "dispatcher.message.retry",
                        id = message.id,
                        retry_count = message.retry_count + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "message requeued"
                    ),
                    Ok(false) => tracing::warn!(
                        event = "dispatcher.message.failed",
                        id = message.id,
                        error = %error,
                        "retry budget exhausted"
                    ),
                    Err(err) => tracing::error!(event = "dispatcher.fail_retry.error", id = message.id, error = %err, "fail_retry failed"),
                }
            }
            DeliveryOutcome::Permanent(error) => {
                match self.buffer.fail_permanent(message.id, &error).await {
                    Ok(()) => tracing::warn!(
                        event = "dispatcher.message.permanent_failure",
                        id = message.id,
                        error = %error,
                        "message permanently failed"
                    ),
                    Err(err) => tracing::error!(event = "dispatcher.fail_permanent.error", id = message.id, error = %err, "fail_permanent failed"),
                }
            }
        }
    }

    /// `min(base_backoff · 2^retry_count, max_backoff)` with ±20% jitter (§4.3 step 5).
    fn compute_backoff(&self, retry_count: i32) -> Duration {
        let exp = 2u32.checked_pow(retry_count.max(0) as u32).unwrap_or(u32::MAX);
        let scaled = self.cfg.base_backoff.saturating_mul(exp).min(self.cfg.max_backoff);
        let jitter_frac = rand::thread_rng().gen_range(-0.2..=0.2);
        let jittered_ms = (scaled.as_millis() as f64 * (1.0 + jitter_frac)).max(0.0);
        Duration::from_millis(jittered_ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_buffer::BufferLimits;
    use bridge_store::{open_in_memory, Store};
    use tokio::sync::Mutex as AsyncMutex;

    /// Records the value it was asked to deliver instead of actually delivering it.
    struct RecordingEgress {
        seen: Arc<AsyncMutex<Option<String>>>,
    }

    #[async_trait::async_trait]
    impl EgressAdapter for RecordingEgress {
        async fn deliver(&self, message: &bridge_core::Message) -> DeliveryOutcome {
            *self.seen.lock().await = Some(message.value.clone());
            DeliveryOutcome::Ok
        }
    }

    async fn test_dispatcher() -> Dispatcher {
        let pools = open_in_memory().await.unwrap();
        let buffer = Arc::new(Buffer::new(Store::new(pools), BufferLimits::default()));
        Dispatcher::new(buffer, HashMap::new(), DispatcherConfig::default())
    }

    #[tokio::test]
    async fn backoff_never_exceeds_max_backoff() {
        let dispatcher = test_dispatcher().await;
        let backoff = dispatcher.compute_backoff(20);
        assert!(backoff <= dispatcher.cfg.max_backoff + Duration::from_millis(1));
    }

    #[tokio::test]
    async fn coercion_failure_archives_as_permanent_without_calling_adapter() {
        use bridge_core::{DataType, NewMessage, Priority, Source};

        let pools = open_in_memory().await.unwrap();
        let buffer = Arc::new(Buffer::new(Store::new(pools), BufferLimits::default()));
        let id = buffer
            .enqueue(NewMessage {
                source: Source::Mqtt,
                destination: Destination::Opcua,
                topic_or_node: "line1/temp".to_string(),
                value: "abc".to_string(),
                data_type: DataType::Float,
                priority: Priority::Normal,
                max_retries: 3,
                ttl: chrono::Duration::hours(1),
                coalesce: false,
            })
            .await
            .unwrap();

        let dispatcher = Dispatcher::new(Arc::clone(&buffer), HashMap::new(), DispatcherConfig::default());
        let claimed = buffer.claim(10, "worker-test", Duration::from_secs(30)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        dispatcher.handle_message("worker-test", claimed.into_iter().next().unwrap()).await;

        let archive = buffer.query_failed(10).await.unwrap();
        assert_eq!(archive.len(), 1);
        assert_eq!(archive[0].original_id, id);
        assert_eq!(archive[0].retry_count, 0);
        assert!(archive[0].error_message.contains("coerce"));
    }

    #[tokio::test]
    async fn delivers_canonical_value_not_raw_value() {
        use bridge_core::{DataType, NewMessage, Priority, Source};

        let pools = open_in_memory().await.unwrap();
        let buffer = Arc::new(Buffer::new(Store::new(pools), BufferLimits::default()));
        buffer
            .enqueue(NewMessage {
                source: Source::Mqtt,
                destination: Destination::Opcua,
                topic_or_node: "line1/alarm".to_string(),
                value: "TRUE".to_string(),
                data_type: DataType::Boolean,
                priority: Priority::Normal,
                max_retries: 3,
                ttl: chrono::Duration::hours(1),
                coalesce: false,
            })
            .await
            .unwrap();

        let seen = Arc::new(AsyncMutex::new(None));
        let mut egress: HashMap<Destination, Arc<dyn EgressAdapter>> = HashMap::new();
        egress.insert(Destination::Opcua, Arc::new(RecordingEgress { seen: Arc::clone(&seen) }));

        let dispatcher = Dispatcher::new(Arc::clone(&buffer), egress, DispatcherConfig::default());
        let claimed = buffer.claim(10, "worker-test", Duration::from_secs(30)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        dispatcher.handle_message("worker-test", claimed.into_iter().next().unwrap()).await;

        assert_eq!(seen.lock().await.as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn backoff_grows_with_retry_count() {
        let dispatcher = test_dispatcher().await;
        let low = dispatcher.compute_backoff(0).as_millis() as f64;
        let high = dispatcher.compute_backoff(3).as_millis() as f64;
        // ±20% jitter on each side means this only holds in expectation; the exponential gap
        // between retry 0 and retry 3 (8x) comfortably clears the jitter band.
        assert!(high > low);
    }
}
