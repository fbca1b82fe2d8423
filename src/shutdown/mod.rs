//! Graceful shutdown handling for the delivery service.
//!
//! This module provides coordinated shutdown that:
//! 1. Signals every consumer loop and background task to stop
//! 2. Lets each consumer finish the pointer it holds; loops only stop between pointers
//! 3. Aborts a fan-out still running once the drain timeout expires
//!
//! An aborted job is not lost: its reservation expires and another worker
//! resumes it from the pending delivery rows.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::broker::QueueBroker;

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for in-flight jobs to finish (default: 30 seconds)
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Handles graceful shutdown of worker loops and background tasks
pub struct GracefulShutdown {
    broker: Arc<dyn QueueBroker>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(broker: Arc<dyn QueueBroker>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self::with_config(broker, shutdown_tx, ShutdownConfig::default())
    }

    pub fn with_config(
        broker: Arc<dyn QueueBroker>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            broker,
            shutdown_tx,
            config,
        }
    }

    /// Execute the shutdown sequence over the given task handles.
    #[tracing::instrument(name = "graceful_shutdown", skip(self, tasks), fields(tasks = tasks.len()))]
    pub async fn execute(&self, reason: &str, tasks: Vec<JoinHandle<()>>) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult {
            in_flight_at_start: self.active_reservations().await,
            ..Default::default()
        };

        // Phase 1: Signal background tasks to stop
        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Signaling tasks");
        let _ = self.shutdown_tx.send(());

        // Phase 2: Wait for consumer loops to finish their current job
        tracing::info!(
            in_flight = result.in_flight_at_start,
            "Phase 2: Draining in-flight jobs"
        );
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let total = tasks.len();

        match timeout(self.config.drain_timeout, join_all(tasks)).await {
            Ok(results) => {
                result.tasks_stopped = results.iter().filter(|r| r.is_ok()).count();
                result.tasks_aborted = total - result.tasks_stopped;
            }
            Err(_) => {
                // Phase 3: Abort stragglers
                let unfinished: Vec<_> = aborts.iter().filter(|a| !a.is_finished()).collect();
                tracing::warn!(
                    remaining = unfinished.len(),
                    timeout_secs = self.config.drain_timeout.as_secs(),
                    "Drain timeout, aborting remaining tasks"
                );
                for handle in &unfinished {
                    handle.abort();
                }
                result.tasks_aborted = unfinished.len();
                result.tasks_stopped = total - unfinished.len();
            }
        }

        result.duration = start.elapsed();
        result.success = result.tasks_aborted == 0;

        tracing::info!(
            tasks_stopped = result.tasks_stopped,
            tasks_aborted = result.tasks_aborted,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }

    async fn active_reservations(&self) -> u64 {
        match self.broker.counts().await {
            Ok(counts) => counts.active,
            Err(e) => {
                tracing::debug!(error = %e, "Could not read queue counts during shutdown");
                0
            }
        }
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Whether every task stopped before the drain timeout
    pub success: bool,
    /// Reservations held by this or other workers when shutdown began
    pub in_flight_at_start: u64,
    /// Tasks that exited on their own
    pub tasks_stopped: usize,
    /// Tasks aborted or panicked
    pub tasks_aborted: usize,
    /// Total time taken for shutdown
    pub duration: Duration,
}
