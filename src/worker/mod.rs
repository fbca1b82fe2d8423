//! Worker pool consuming job pointers from the broker.
//!
//! Each process runs `job_concurrency` consumer loops sharing one
//! `JobProcessor`, plus a sweeper returning expired reservations to the
//! waiting set so a crashed worker's jobs are picked up again.

mod processor;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::broker::{BrokerConsumer, ConsumerConfig, DeliveryHandler, QueueBroker};
use crate::metrics::BrokerMetrics;

pub use processor::{JobProcessor, WORKER_ACTOR};

pub struct WorkerPool {
    broker: Arc<dyn QueueBroker>,
    consumer: Arc<BrokerConsumer>,
    processor: Arc<JobProcessor>,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(
        broker: Arc<dyn QueueBroker>,
        processor: Arc<JobProcessor>,
        consumer_config: ConsumerConfig,
        concurrency: usize,
    ) -> Self {
        Self {
            consumer: Arc::new(BrokerConsumer::new(broker.clone(), consumer_config)),
            broker,
            processor,
            concurrency: concurrency.max(1),
        }
    }

    /// Interval between stalled-reservation sweeps.
    fn sweep_interval(&self) -> Duration {
        (self.consumer.config().visibility_timeout / 2)
            .clamp(Duration::from_secs(1), Duration::from_secs(60))
    }

    /// Spawn the consumer loops and the stalled-reservation sweeper.
    pub fn spawn(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.concurrency + 1);

        for worker in 0..self.concurrency {
            let consumer = self.consumer.clone();
            let handler: Arc<dyn DeliveryHandler> = self.processor.clone();
            let rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                consumer.run(worker, handler, rx).await;
            }));
        }

        handles.push(tokio::spawn(sweep_stalled(
            self.broker.clone(),
            self.sweep_interval(),
            shutdown.subscribe(),
        )));

        tracing::info!(
            concurrency = self.concurrency,
            backend = self.broker.backend_name(),
            "Worker pool started"
        );
        handles
    }
}

async fn sweep_stalled(
    broker: Arc<dyn QueueBroker>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut timer = tokio::time::interval(interval);
    timer.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = timer.tick() => {
                match broker.requeue_expired().await {
                    Ok(0) => {}
                    Ok(count) => {
                        BrokerMetrics::record_redelivered(count);
                        tracing::warn!(count, "Requeued reservations past their visibility deadline");
                    }
                    Err(e) => tracing::warn!(error = %e, "Stalled reservation sweep failed"),
                }
            }
        }
    }

    tracing::debug!("Stalled reservation sweeper stopped");
}
