use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::config::BrokerConfig;
use crate::dispatcher::Dispatcher;
use crate::metrics::BrokerMetrics;

/// Background task re-enqueueing jobs the broker lost and refreshing the
/// queue depth gauges.
pub struct ReconcileTask {
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    grace: Duration,
    stalled_after: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl ReconcileTask {
    pub fn new(
        config: &BrokerConfig,
        dispatcher: Arc<Dispatcher>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            dispatcher,
            interval: Duration::from_secs(config.reconcile_interval_seconds.max(1)),
            grace: Duration::from_secs(config.reconcile_grace_seconds),
            stalled_after: Duration::from_secs(config.visibility_timeout_seconds),
            shutdown,
        }
    }

    /// Run one sweep immediately, then every interval until shutdown.
    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.interval);

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            grace_secs = self.grace.as_secs(),
            "Reconcile task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Reconcile task received shutdown signal");
                    break;
                }
                // First tick fires immediately, repairing a broker that
                // restarted with empty state
                _ = timer.tick() => {
                    self.sweep_once().await;
                    self.refresh_queue_gauges().await;
                }
            }
        }

        tracing::info!("Reconcile task stopped");
    }

    /// Returns the number of jobs re-enqueued.
    pub async fn sweep_once(&self) -> u64 {
        let start = Instant::now();
        match self.dispatcher.reconcile(self.grace, self.stalled_after).await {
            Ok(requeued) => {
                if requeued > 0 {
                    tracing::info!(
                        requeued,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Reconciliation sweep re-enqueued jobs"
                    );
                } else {
                    tracing::debug!("Reconciliation sweep found nothing to do");
                }
                requeued
            }
            Err(e) => {
                tracing::warn!(error = %e, "Reconciliation sweep failed");
                0
            }
        }
    }

    async fn refresh_queue_gauges(&self) {
        match self.dispatcher.broker().counts().await {
            Ok(counts) => BrokerMetrics::record_counts(&counts),
            Err(e) => tracing::debug!(error = %e, "Failed to read queue counts"),
        }
    }
}
