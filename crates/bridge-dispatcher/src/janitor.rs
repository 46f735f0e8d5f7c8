//! Janitor (§4.4): one periodic task running reclaim, expiry, cleanup, and a metric snapshot
//! as four independent transactions, grounded on the retrieval pack's lease-janitor interval
//! loop.

use bridge_buffer::Buffer;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct JanitorConfig {
    pub interval: Duration,
    pub retention: chrono::Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(60), retention: chrono::Duration::days(7) }
    }
}

pub struct Janitor {
    buffer: Arc<Buffer>,
    cfg: JanitorConfig,
}

impl Janitor {
    pub fn new(buffer: Arc<Buffer>, cfg: JanitorConfig) -> Self {
        Self { buffer, cfg }
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(event = "janitor.started", interval_s = self.cfg.interval.as_secs(), "janitor started");
        let mut interval = tokio::time::interval(self.cfg.interval);
        let mut last_flush = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(event = "janitor.shutdown", "janitor shutting down");
                    return;
                }
                _ = interval.tick() => {
                    self.sweep(&mut last_flush).await;
                }
            }
        }
    }

    /// Runs the four sweep steps (§4.4) each as its own transaction, so one failing step
    /// never blocks the others.
    async fn sweep(&self, last_flush: &mut tokio::time::Instant) {
        match self.buffer.reclaim_stuck().await {
            Ok(n) if n > 0 => tracing::info!(event = "janitor.reclaim_stuck", count = n, "reclaimed stuck leases"),
            Ok(_) => {}
            Err(err) => tracing::warn!(event = "janitor.reclaim_stuck.error", error = %err, "reclaim_stuck failed"),
        }

        match self.buffer.expire_due().await {
            Ok(n) if n > 0 => tracing::info!(event = "janitor.expire_due", count = n, "expired due messages"),
            Ok(_) => {}
            Err(err) => tracing::warn!(event = "janitor.expire_due.error", error = %err, "expire_due failed"),
        }

        let cutoff = Utc::now() - self.cfg.retention;
        match self.buffer.cleanup(cutoff).await {
            Ok(n) if n > 0 => tracing::info!(event = "janitor.cleanup", count = n, "removed retained completed rows"),
            Ok(_) => {}
            Err(err) => tracing::warn!(event = "janitor.cleanup.error", error = %err, "cleanup failed"),
        }

        let elapsed = last_flush.elapsed();
        match self.buffer.flush_metrics(elapsed).await {
            Ok(()) => *last_flush = tokio::time::Instant::now(),
            Err(err) => tracing::warn!(event = "janitor.snapshot_stats.error", error = %err, "snapshot_stats failed"),
        }
    }
}
