//! Queue broker wrapper.
//!
//! The broker carries lightweight pointers (`job_id`) between the dispatcher
//! and worker processes. Job state itself lives in the job store; the broker
//! only provides priority ordering, delayed delivery, visibility timeouts,
//! retries and a dead-letter set.

mod backoff;
mod consumer;
mod factory;
mod memory_backend;
mod redis_backend;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::redis::PoolError;

pub use backoff::RetryPolicy;
pub use consumer::{BrokerConsumer, ConsumerConfig, DeliveryHandler, HandlerError};
pub use factory::create_broker;
pub use memory_backend::MemoryBroker;
pub use redis_backend::RedisBroker;

/// Highest accepted priority value; lower values are delivered first.
pub const MAX_PRIORITY: i32 = 255;

/// Dead letters retained when no limit is configured.
pub const DEFAULT_DEAD_LETTER_LIMIT: usize = 10_000;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Redis error: {0}")]
    Redis(#[from] PoolError),

    #[error("Malformed broker entry: {0}")]
    Malformed(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Queue entry referencing a job by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pointer {
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: i32,
    pub delay_until: Option<DateTime<Utc>>,
}

/// A reserved pointer, owned by one consumer until its visibility deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub broker_id: String,
    pub pointer: Pointer,
    /// 1-based count of reservations of this entry
    pub attempt: u32,
    pub priority: i32,
}

impl Delivery {
    /// Identifier recorded on the job for observability.
    pub fn external_id(&self) -> String {
        format!("{}#{}", self.broker_id, self.attempt)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    /// Size of the dead-letter set
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetter {
    pub broker_id: String,
    pub job_id: Uuid,
    pub attempts: u32,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Score used to order waiting entries: priority first, then enqueue time.
pub(crate) fn waiting_score(priority: i32, enqueued_ms: i64) -> f64 {
    priority.clamp(0, MAX_PRIORITY) as f64 * 1e13 + enqueued_ms as f64
}

#[async_trait]
pub trait QueueBroker: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Add a pointer. A job that already has a live entry keeps it and the
    /// existing broker id is returned.
    async fn enqueue(&self, pointer: Pointer, options: EnqueueOptions) -> BrokerResult<String>;

    /// Promote due delayed entries, then take the next waiting entry and
    /// hide it from other consumers until `visibility_timeout` elapses.
    async fn reserve(&self, visibility_timeout: Duration) -> BrokerResult<Option<Delivery>>;

    /// Push the visibility deadline of a held reservation to
    /// `visibility_timeout` from now.
    ///
    /// Returns `false` when the reservation expired or was redelivered, in
    /// which case the caller no longer owns the entry.
    async fn extend(&self, delivery: &Delivery, visibility_timeout: Duration)
        -> BrokerResult<bool>;

    /// Acknowledge and drop the entry.
    async fn complete(&self, delivery: &Delivery) -> BrokerResult<()>;

    /// Put the entry back, ready after `delay`.
    ///
    /// Returns `false` if the reservation had already expired and the entry
    /// was redelivered elsewhere.
    async fn retry(&self, delivery: &Delivery, delay: Duration) -> BrokerResult<bool>;

    /// Move the entry to the dead-letter set, trimming the oldest dead
    /// letters beyond the retention limit.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> BrokerResult<()>;

    /// Return reservations past their visibility deadline to the waiting set.
    async fn requeue_expired(&self) -> BrokerResult<u64>;

    /// Whether the job has an entry in waiting, delayed or active.
    async fn is_tracked(&self, job_id: Uuid) -> BrokerResult<bool>;

    async fn counts(&self) -> BrokerResult<QueueCounts>;

    /// Most recent dead letters first.
    async fn dead_letters(&self, limit: usize) -> BrokerResult<Vec<DeadLetter>>;
}
