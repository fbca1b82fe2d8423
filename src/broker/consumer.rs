//! Consumer loop applying the broker-side retry policy around a handler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::config::BrokerConfig;
use crate::metrics::BrokerMetrics;

use super::{BrokerResult, Delivery, QueueBroker, RetryPolicy};

/// Floor for the reservation heartbeat period
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// Outcome of a failed delivery attempt, as reported by the handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Redeliver the pointer after a backoff, until `max_attempts`.
    #[error("{0}")]
    Retryable(String),

    /// Dead-letter immediately.
    #[error("{0}")]
    Fatal(String),
}

#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError>;

    /// Called once the pointer has been moved to the dead-letter set.
    async fn on_exhausted(&self, delivery: &Delivery, reason: &str);
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub visibility_timeout: Duration,
    /// Sleep between polls when the queue is empty
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&BrokerConfig> for ConsumerConfig {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            visibility_timeout: Duration::from_secs(config.visibility_timeout_seconds),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            retry: RetryPolicy::from(config),
        }
    }
}

pub struct BrokerConsumer {
    broker: Arc<dyn QueueBroker>,
    config: ConsumerConfig,
}

impl BrokerConsumer {
    pub fn new(broker: Arc<dyn QueueBroker>, config: ConsumerConfig) -> Self {
        Self { broker, config }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Reserve and process a single pointer.
    ///
    /// Returns `false` when nothing was ready.
    pub async fn process_next(&self, handler: &dyn DeliveryHandler) -> BrokerResult<bool> {
        let Some(delivery) = self.broker.reserve(self.config.visibility_timeout).await? else {
            return Ok(false);
        };

        match self.handle_with_heartbeat(&delivery, handler).await {
            Ok(()) => {
                self.broker.complete(&delivery).await?;
            }
            Err(HandlerError::Retryable(reason))
                if self.config.retry.should_retry(delivery.attempt) =>
            {
                let delay = self.config.retry.delay_for(delivery.attempt);
                if self.broker.retry(&delivery, delay).await? {
                    BrokerMetrics::record_retry();
                    tracing::info!(
                        job_id = %delivery.pointer.job_id,
                        broker_id = %delivery.broker_id,
                        attempt = delivery.attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Delivery scheduled for retry"
                    );
                } else {
                    tracing::warn!(
                        job_id = %delivery.pointer.job_id,
                        broker_id = %delivery.broker_id,
                        attempt = delivery.attempt,
                        "Reservation expired before retry, pointer already redelivered"
                    );
                }
            }
            Err(HandlerError::Retryable(reason)) | Err(HandlerError::Fatal(reason)) => {
                self.exhaust(&delivery, handler, &reason).await?;
            }
        }

        Ok(true)
    }

    /// Run the handler while periodically extending the reservation, so a
    /// long fan-out is not redelivered to another consumer mid-flight.
    async fn handle_with_heartbeat(
        &self,
        delivery: &Delivery,
        handler: &dyn DeliveryHandler,
    ) -> Result<(), HandlerError> {
        let period = self.heartbeat_period();
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let handle = handler.handle(delivery);
        tokio::pin!(handle);

        loop {
            tokio::select! {
                result = &mut handle => return result,
                _ = heartbeat.tick() => self.extend(delivery).await,
            }
        }
    }

    fn heartbeat_period(&self) -> Duration {
        (self.config.visibility_timeout / 3).max(MIN_HEARTBEAT)
    }

    async fn extend(&self, delivery: &Delivery) {
        match self
            .broker
            .extend(delivery, self.config.visibility_timeout)
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                job_id = %delivery.pointer.job_id,
                broker_id = %delivery.broker_id,
                attempt = delivery.attempt,
                "Reservation lost while handling, pointer may be redelivered"
            ),
            Err(e) => tracing::warn!(
                job_id = %delivery.pointer.job_id,
                error = %e,
                "Failed to extend reservation"
            ),
        }
    }

    async fn exhaust(
        &self,
        delivery: &Delivery,
        handler: &dyn DeliveryHandler,
        reason: &str,
    ) -> BrokerResult<()> {
        self.broker.dead_letter(delivery, reason).await?;
        BrokerMetrics::record_dead_lettered();
        tracing::warn!(
            job_id = %delivery.pointer.job_id,
            broker_id = %delivery.broker_id,
            attempt = delivery.attempt,
            reason = %reason,
            "Delivery moved to dead-letter set"
        );
        handler.on_exhausted(delivery, reason).await;
        Ok(())
    }

    /// Consume until the shutdown signal fires.
    ///
    /// A pointer already being handled is finished before the loop exits.
    pub async fn run(
        &self,
        worker: usize,
        handler: Arc<dyn DeliveryHandler>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        tracing::info!(worker, backend = self.broker.backend_name(), "Consumer started");

        loop {
            match shutdown.try_recv() {
                Ok(()) | Err(TryRecvError::Closed) => break,
                Err(TryRecvError::Empty) | Err(TryRecvError::Lagged(_)) => {}
            }

            let idle = match self.process_next(handler.as_ref()).await {
                Ok(processed) => !processed,
                Err(e) => {
                    tracing::warn!(worker, error = %e, "Broker error in consumer loop");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        tracing::info!(worker, "Consumer stopped");
    }
}
