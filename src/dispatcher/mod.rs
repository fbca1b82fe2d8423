//! Job submission, cancellation and status queries.
//!
//! The dispatcher validates a request, snapshots its recipients, writes the
//! job with one pending delivery row per recipient and enqueues a pointer.
//! The job store commit happens first: if the broker is down the job stays
//! `Queued` and the reconciliation sweep enqueues it later.

mod directory;
mod request;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::broker::{EnqueueOptions, Pointer, QueueBroker, MAX_PRIORITY};
use crate::error::AppError;
use crate::metrics::JobMetrics;
use crate::store::{
    AuditAction, AuditEntry, DeliveryLog, Job, JobFilter, JobStatus, JobStore, NewJob, Recipient,
};
use crate::template::{is_valid_email, TemplateEngine, TemplateRef};

pub use crate::tasks::ReconcileTask;
pub use directory::{DirectoryEntry, RecipientDirectory, StaticDirectory};
pub use request::{
    JobListResponse, JobStatusView, RecipientFilter, RecipientInput, RecipientSpec,
    SubmitRequest, SubmitResponse,
};

/// Priority used when a request does not set one
pub const DEFAULT_PRIORITY: i32 = 100;

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;

/// Jobs examined per reconciliation sweep
const RECONCILE_BATCH: i64 = 500;

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn QueueBroker>,
    templates: Arc<TemplateEngine>,
    directory: Arc<dyn RecipientDirectory>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn QueueBroker>,
        templates: Arc<TemplateEngine>,
        directory: Arc<dyn RecipientDirectory>,
    ) -> Self {
        Self {
            store,
            broker,
            templates,
            directory,
        }
    }

    /// Validate and persist a job, then enqueue its pointer.
    #[tracing::instrument(skip(self, request), fields(actor = %actor))]
    pub async fn submit(&self, actor: &str, request: SubmitRequest) -> Result<Uuid, AppError> {
        let new_job = match self.build_job(actor, request).await {
            Ok(job) => job,
            Err(e) => {
                JobMetrics::record_rejected();
                tracing::debug!(error = %e, "Job rejected");
                return Err(e);
            }
        };

        let mut audit = AuditEntry::new(actor, AuditAction::JobSubmitted)
            .job(new_job.id)
            .detail(json!({
                "recipients": new_job.recipients.len(),
                "template": new_job.template_ref,
                "priority": new_job.priority,
                "scheduled_for": new_job.scheduled_for,
            }));
        if let Some(TemplateRef::User { id }) = &new_job.template_ref {
            audit = audit.template(*id);
        }

        let job = self.store.create_job(new_job, audit).await?;
        JobMetrics::record_submitted();

        match self.enqueue_job(&job).await {
            Ok(broker_id) => {
                tracing::info!(
                    job_id = %job.id,
                    broker_id = %broker_id,
                    recipients = job.total_count,
                    priority = job.priority,
                    "Job submitted"
                );
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %job.id,
                    error = %e,
                    "Job stored but not enqueued, reconciliation will retry"
                );
            }
        }

        Ok(job.id)
    }

    async fn build_job(&self, actor: &str, request: SubmitRequest) -> Result<NewJob, AppError> {
        let variables = request.variables.unwrap_or_default();

        match &request.template_ref {
            Some(template_ref) => {
                let compiled = self
                    .templates
                    .prepare(template_ref)
                    .await
                    .map_err(|e| match e {
                        AppError::NotFound(msg) => AppError::Validation(msg),
                        other => other,
                    })?;
                compiled.validate_job_data(&variables)?;
            }
            None => {
                let has_subject = request.subject.as_deref().is_some_and(|s| !s.trim().is_empty());
                let has_body = request.body.as_deref().is_some_and(|b| !b.trim().is_empty());
                if !has_subject || !has_body {
                    return Err(AppError::Validation(
                        "either template_ref or both subject and body are required".to_string(),
                    ));
                }
            }
        }

        let recipients = self.resolve_recipients(request.recipients).await?;
        if recipients.is_empty() {
            return Err(AppError::Validation("no recipients resolved".to_string()));
        }

        let now = Utc::now();
        Ok(NewJob {
            id: Uuid::new_v4(),
            template_ref: request.template_ref,
            subject: request.subject,
            body: request.body,
            variables,
            recipients,
            priority: request
                .priority
                .unwrap_or(DEFAULT_PRIORITY)
                .clamp(0, MAX_PRIORITY),
            scheduled_for: request.scheduled_for.filter(|at| *at > now),
            created_by: actor.to_string(),
        })
    }

    /// Snapshot recipients: expand filters, validate addresses and drop
    /// duplicate ids keeping the first occurrence.
    async fn resolve_recipients(&self, spec: RecipientSpec) -> Result<Vec<Recipient>, AppError> {
        let candidates = match spec {
            RecipientSpec::Explicit(inputs) => inputs
                .into_iter()
                .map(|input| {
                    let address = input.address.trim().to_string();
                    let id = input
                        .id
                        .map(|id| id.trim().to_string())
                        .filter(|id| !id.is_empty())
                        .unwrap_or_else(|| address.to_lowercase());
                    Recipient {
                        id,
                        address,
                        name: input.name,
                    }
                })
                .collect(),
            RecipientSpec::Filter(filter) => self.directory.resolve(&filter).await?,
        };

        let mut seen = HashSet::new();
        let mut recipients = Vec::with_capacity(candidates.len());
        for recipient in candidates {
            if !is_valid_email(&recipient.address) {
                return Err(AppError::Validation(format!(
                    "recipient '{}' has an invalid address '{}'",
                    recipient.id, recipient.address
                )));
            }
            if seen.insert(recipient.id.clone()) {
                recipients.push(recipient);
            }
        }
        Ok(recipients)
    }

    /// Enqueue the pointer for a stored job and record the broker id.
    pub async fn enqueue_job(&self, job: &Job) -> Result<String, AppError> {
        let broker_id = self
            .broker
            .enqueue(
                Pointer { job_id: job.id },
                EnqueueOptions {
                    priority: job.priority,
                    delay_until: job.scheduled_for,
                },
            )
            .await?;
        self.store.set_external_id(job.id, &broker_id).await?;
        Ok(broker_id)
    }

    /// Request cancellation. A job no worker has picked up yet is
    /// cancelled immediately; a running job stops at the next recipient.
    #[tracing::instrument(skip(self), fields(actor = %actor))]
    pub async fn cancel(&self, actor: &str, job_id: Uuid) -> Result<JobStatusView, AppError> {
        let flagged = self.store.request_cancel(job_id).await?;
        let status_before = flagged.status;

        let job = if flagged.status == JobStatus::Queued {
            match self.store.cancel_queued(job_id).await? {
                Some(cancelled) => {
                    JobMetrics::record_finished(cancelled.status);
                    cancelled
                }
                // A worker picked it up in the meantime
                None => self.store.get_job(job_id).await?.unwrap_or(flagged),
            }
        } else {
            flagged
        };

        self.audit(
            AuditEntry::new(actor, AuditAction::JobCancelled)
                .job(job_id)
                .detail(json!({
                    "status_before": status_before,
                    "status_after": job.status,
                    "sent": job.sent_count,
                })),
        )
        .await;

        tracing::info!(job_id = %job_id, status = %job.status, "Job cancellation requested");
        Ok(JobStatusView::from(&job))
    }

    pub async fn get_status(&self, job_id: Uuid) -> Result<JobStatusView, AppError> {
        let job = self.load(job_id).await?;
        Ok(JobStatusView::from(&job))
    }

    /// Newest first; `limit` is clamped to `1..=500`.
    pub async fn list(&self, mut filter: JobFilter) -> Result<JobListResponse, AppError> {
        filter.limit = if filter.limit <= 0 {
            DEFAULT_LIST_LIMIT
        } else {
            filter.limit.min(MAX_LIST_LIMIT)
        };
        filter.offset = filter.offset.max(0);

        let jobs = self.store.list_jobs(&filter).await?;
        Ok(JobListResponse {
            jobs: jobs.iter().map(JobStatusView::from).collect(),
            limit: filter.limit,
            offset: filter.offset,
        })
    }

    /// Per-recipient outcome rows, in submission order.
    pub async fn deliveries(&self, job_id: Uuid) -> Result<Vec<DeliveryLog>, AppError> {
        self.load(job_id).await?;
        Ok(self.store.list_deliveries(job_id).await?)
    }

    /// Hide a finished job from default listings. Jobs are never deleted.
    #[tracing::instrument(skip(self), fields(actor = %actor))]
    pub async fn archive(&self, actor: &str, job_id: Uuid) -> Result<(), AppError> {
        let job = self.store.archive_job(job_id).await?;
        self.audit(
            AuditEntry::new(actor, AuditAction::JobArchived)
                .job(job_id)
                .detail(json!({ "status": job.status })),
        )
        .await;
        Ok(())
    }

    /// Re-enqueue jobs the broker has lost track of.
    ///
    /// Candidates are `Queued` jobs older than `grace` and `Processing` jobs
    /// idle for longer than `stalled_after`; jobs the broker still tracks
    /// are left alone.
    pub async fn reconcile(&self, grace: Duration, stalled_after: Duration) -> Result<u64, AppError> {
        let now = Utc::now();
        let queued_before = now - to_chrono(grace);
        let stalled_before = now - to_chrono(stalled_after);

        let candidates = self
            .store
            .reconcile_candidates(queued_before, stalled_before, RECONCILE_BATCH)
            .await?;

        let mut requeued = 0u64;
        for job in candidates {
            if self.broker.is_tracked(job.id).await? {
                continue;
            }
            match self.enqueue_job(&job).await {
                Ok(broker_id) => {
                    requeued += 1;
                    tracing::info!(
                        job_id = %job.id,
                        broker_id = %broker_id,
                        status = %job.status,
                        "Re-enqueued untracked job"
                    );
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to re-enqueue job");
                }
            }
        }

        if requeued > 0 {
            JobMetrics::record_reconciled(requeued);
        }
        Ok(requeued)
    }

    pub fn broker(&self) -> &Arc<dyn QueueBroker> {
        &self.broker
    }

    async fn load(&self, job_id: Uuid) -> Result<Job, AppError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job {}", job_id)))
    }

    async fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.store.append_audit(entry).await {
            tracing::warn!(error = %e, "Failed to append audit entry");
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::store::{DeliveryStatus, MemoryJobStore};
    use serde_json::Map;

    struct Fixture {
        store: Arc<dyn JobStore>,
        broker: Arc<dyn QueueBroker>,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let broker: Arc<dyn QueueBroker> = Arc::new(MemoryBroker::new());
        let entries: Vec<DirectoryEntry> = serde_json::from_value(json!([
            { "id": "a1", "address": "admin1@example.com", "roles": ["admin"] },
            { "id": "a2", "address": "admin2@example.com", "roles": ["admin"] }
        ]))
        .unwrap();
        let dispatcher = Dispatcher::new(
            store.clone(),
            broker.clone(),
            Arc::new(TemplateEngine::new(store.clone())),
            Arc::new(StaticDirectory::new(entries)),
        );
        Fixture {
            store,
            broker,
            dispatcher,
        }
    }

    fn recipient(id: &str, address: &str) -> RecipientInput {
        RecipientInput {
            id: Some(id.to_string()),
            address: address.to_string(),
            name: None,
        }
    }

    fn inline(recipients: Vec<RecipientInput>) -> SubmitRequest {
        SubmitRequest {
            recipients: RecipientSpec::Explicit(recipients),
            template_ref: None,
            subject: Some("Hello".into()),
            body: Some("Hi {{ recipient.name }}".into()),
            variables: None,
            priority: None,
            scheduled_for: None,
        }
    }

    #[tokio::test]
    async fn test_submit_stores_and_enqueues() {
        let f = fixture();
        let id = f
            .dispatcher
            .submit(
                "alice",
                inline(vec![
                    recipient("u1", "one@example.com"),
                    recipient("u2", "two@example.com"),
                ]),
            )
            .await
            .unwrap();

        let job = f.store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.total_count, 2);
        assert_eq!(job.priority, DEFAULT_PRIORITY);
        assert!(job.external_id.is_some());
        assert!(f.broker.is_tracked(id).await.unwrap());

        let rows = f.store.list_deliveries(id).await.unwrap();
        assert!(rows.iter().all(|r| r.status == DeliveryStatus::Pending));

        let audit = f.store.list_audit(Some(id), 10).await.unwrap();
        assert_eq!(audit[0].action, AuditAction::JobSubmitted);
        assert_eq!(audit[0].actor, "alice");
    }

    #[tokio::test]
    async fn test_duplicates_dropped_first_wins() {
        let f = fixture();
        let id = f
            .dispatcher
            .submit(
                "alice",
                inline(vec![
                    recipient("u1", "first@example.com"),
                    recipient("u2", "two@example.com"),
                    recipient("u1", "second@example.com"),
                ]),
            )
            .await
            .unwrap();

        let job = f.store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.total_count, 2);
        assert_eq!(job.recipients[0].address, "first@example.com");
    }

    #[tokio::test]
    async fn test_zero_recipients_rejected_and_nothing_stored() {
        let f = fixture();
        let result = f.dispatcher.submit("alice", inline(vec![])).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
        assert!(f
            .store
            .list_jobs(&JobFilter {
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap()
            .is_empty());
        assert_eq!(f.broker.counts().await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_invalid_address_rejected() {
        let f = fixture();
        let result = f
            .dispatcher
            .submit("alice", inline(vec![recipient("u1", "not-an-address")]))
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_missing_content_rejected() {
        let f = fixture();
        let mut request = inline(vec![recipient("u1", "one@example.com")]);
        request.body = None;
        assert!(matches!(
            f.dispatcher.submit("alice", request).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_template_is_validation_error() {
        let f = fixture();
        let mut request = inline(vec![recipient("u1", "one@example.com")]);
        request.template_ref = Some(TemplateRef::User { id: Uuid::new_v4() });
        assert!(matches!(
            f.dispatcher.submit("alice", request).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_template_variables_checked_at_submit() {
        let f = fixture();
        let mut request = inline(vec![recipient("u1", "one@example.com")]);
        request.template_ref = Some(TemplateRef::System {
            name: "welcome".into(),
        });
        let mut variables = Map::new();
        variables.insert("product".into(), json!("Ara"));
        request.variables = Some(variables);

        // login_url is required
        assert!(matches!(
            f.dispatcher.submit("alice", request.clone()).await,
            Err(AppError::Validation(_))
        ));

        request
            .variables
            .as_mut()
            .unwrap()
            .insert("login_url".into(), json!("https://ara.example.com"));
        assert!(f.dispatcher.submit("alice", request).await.is_ok());
    }

    #[tokio::test]
    async fn test_filter_is_snapshotted() {
        let f = fixture();
        let mut request = inline(vec![]);
        request.recipients = RecipientSpec::Filter(RecipientFilter {
            role: Some("admin".into()),
            group: None,
        });
        let id = f.dispatcher.submit("alice", request).await.unwrap();

        let job = f.store.get_job(id).await.unwrap().unwrap();
        let ids: Vec<_> = job.recipients.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["a1", "a2"]);
    }

    #[tokio::test]
    async fn test_priority_clamped_and_past_schedule_is_now() {
        let f = fixture();
        let mut request = inline(vec![recipient("u1", "one@example.com")]);
        request.priority = Some(10_000);
        request.scheduled_for = Some(Utc::now() - chrono::Duration::hours(1));
        let id = f.dispatcher.submit("alice", request).await.unwrap();

        let job = f.store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.priority, MAX_PRIORITY);
        assert_eq!(job.scheduled_for, None);
        assert_eq!(f.broker.counts().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let f = fixture();
        let id = f
            .dispatcher
            .submit("alice", inline(vec![recipient("u1", "one@example.com")]))
            .await
            .unwrap();

        let view = f.dispatcher.cancel("bob", id).await.unwrap();
        assert_eq!(view.status, JobStatus::Cancelled);
        assert_eq!(view.sent_count, 0);
        assert_eq!(view.failed_count, view.total_count);

        // Terminal now
        assert!(f.dispatcher.cancel("bob", id).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let f = fixture();
        let err = f.dispatcher.cancel("bob", Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_archive_requires_terminal() {
        let f = fixture();
        let id = f
            .dispatcher
            .submit("alice", inline(vec![recipient("u1", "one@example.com")]))
            .await
            .unwrap();

        let err = f.dispatcher.archive("alice", id).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");

        f.dispatcher.cancel("alice", id).await.unwrap();
        f.dispatcher.archive("alice", id).await.unwrap();
        let view = f.dispatcher.get_status(id).await.unwrap();
        assert!(view.archived_at.is_some());
    }

    #[tokio::test]
    async fn test_list_clamps_limit() {
        let f = fixture();
        let listed = f
            .dispatcher
            .list(JobFilter {
                limit: 10_000,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(listed.limit, MAX_LIST_LIMIT);
    }

    #[tokio::test]
    async fn test_reconcile_requeues_lost_pointer() {
        let f = fixture();
        let id = f
            .dispatcher
            .submit("alice", inline(vec![recipient("u1", "one@example.com")]))
            .await
            .unwrap();

        // Simulate a broker that lost its volatile state
        let lost = f.broker.reserve(Duration::from_secs(60)).await.unwrap().unwrap();
        f.broker.complete(&lost).await.unwrap();
        assert!(!f.broker.is_tracked(id).await.unwrap());

        let requeued = f
            .dispatcher
            .reconcile(Duration::ZERO, Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(requeued, 1);
        assert!(f.broker.is_tracked(id).await.unwrap());

        // Tracked jobs are left alone
        let again = f
            .dispatcher
            .reconcile(Duration::ZERO, Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(again, 0);
    }
}
