//! Durable job, delivery-log, template and audit storage.
//!
//! The store is the source of truth for job state; the broker only carries
//! pointers. Two backends are provided:
//! - `MemoryJobStore`: single-process, used for development and tests
//! - `PostgresJobStore`: sqlx-backed, shared by every worker process

mod factory;
mod memory_backend;
mod models;
mod postgres_backend;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::template::Template;

pub use factory::create_job_store;
pub use memory_backend::MemoryJobStore;
pub use models::{
    AuditAction, AuditEntry, DeliveryClaim, DeliveryLog, DeliveryStatus, DeliveryUpdate,
    FinalizeMode, Job, JobFilter, JobStatus, NewJob, ProcessingStart, Recipient,
};
pub use postgres_backend::PostgresJobStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence operations used by the dispatcher, workers and template engine.
///
/// Every method that touches more than one row is atomic.
#[async_trait]
pub trait JobStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn ping(&self) -> StoreResult<()>;

    /// Insert the job, one pending delivery row per recipient and the audit
    /// entry in a single transaction.
    async fn create_job(&self, job: NewJob, audit: AuditEntry) -> StoreResult<Job>;

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<Job>>;

    /// Newest first.
    async fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>>;

    async fn set_external_id(&self, id: Uuid, external_id: &str) -> StoreResult<()>;

    /// Optimistic `Queued|Processing -> Processing` transition.
    ///
    /// Stamps `started_at` once and bumps `attempts`. Never touches terminal
    /// or archived jobs.
    async fn begin_processing(&self, id: Uuid, external_id: &str) -> StoreResult<ProcessingStart>;

    /// Raise the cooperative cancel flag on a non-terminal job.
    ///
    /// Returns `NotFound` for unknown ids and `Conflict` for terminal jobs.
    async fn request_cancel(&self, id: Uuid) -> StoreResult<Job>;

    async fn is_cancel_requested(&self, id: Uuid) -> StoreResult<bool>;

    async fn pending_deliveries(&self, job_id: Uuid) -> StoreResult<Vec<DeliveryLog>>;

    async fn list_deliveries(&self, job_id: Uuid) -> StoreResult<Vec<DeliveryLog>>;

    /// Lease a pending row to `owner` for `lease` before sending to it.
    ///
    /// The same owner may renew its own lease. Recording an outcome releases
    /// the lease.
    async fn claim_delivery(
        &self,
        job_id: Uuid,
        recipient_id: &str,
        owner: &str,
        lease: Duration,
    ) -> StoreResult<DeliveryClaim>;

    /// Move one delivery row out of `Pending` and bump the matching job
    /// counter. Returns `false` when the row was already final.
    async fn record_delivery(
        &self,
        job_id: Uuid,
        recipient_id: &str,
        update: DeliveryUpdate,
    ) -> StoreResult<bool>;

    /// Note a transient failure: the row stays pending, the error is kept on
    /// the row and as the job's `last_error`.
    async fn record_transient(&self, job_id: Uuid, recipient_id: &str, error: &str)
        -> StoreResult<()>;

    /// Close every pending row and move the job to its terminal status.
    ///
    /// Returns `None` when the job was already terminal.
    async fn finalize_job(&self, job_id: Uuid, mode: FinalizeMode) -> StoreResult<Option<Job>>;

    /// Cancel a job that no worker has picked up yet.
    ///
    /// Returns `None` when the job is no longer `Queued`.
    async fn cancel_queued(&self, job_id: Uuid) -> StoreResult<Option<Job>>;

    /// Set `archived_at` on a terminal job; `Conflict` otherwise.
    async fn archive_job(&self, id: Uuid) -> StoreResult<Job>;

    /// Jobs the reconciliation sweep should consider re-enqueueing: queued
    /// and due before `queued_before`, or processing without progress since
    /// `stalled_before`.
    async fn reconcile_candidates(
        &self,
        queued_before: DateTime<Utc>,
        stalled_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Job>>;

    /// Insert a user template; `Conflict` when the name is taken.
    async fn insert_template(&self, template: &Template) -> StoreResult<()>;

    async fn get_template(&self, id: Uuid) -> StoreResult<Option<Template>>;

    async fn get_template_by_name(&self, name: &str) -> StoreResult<Option<Template>>;

    async fn list_templates(&self) -> StoreResult<Vec<Template>>;

    /// Replace a user template; `NotFound` or `Conflict` on a name clash.
    async fn update_template(&self, template: &Template) -> StoreResult<()>;

    /// Delete a user template unless a live job still references it.
    async fn delete_template(&self, id: Uuid) -> StoreResult<()>;

    async fn append_audit(&self, entry: AuditEntry) -> StoreResult<()>;

    async fn list_audit(&self, job_id: Option<Uuid>, limit: i64) -> StoreResult<Vec<AuditEntry>>;
}
