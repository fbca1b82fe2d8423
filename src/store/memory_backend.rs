//! In-memory job store.
//!
//! All state lives behind one mutex so multi-row operations stay atomic.
//! Data is lost on restart; use the Postgres backend for anything shared.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::template::Template;

use super::models::{
    AuditEntry, DeliveryClaim, DeliveryLog, DeliveryStatus, DeliveryUpdate, FinalizeMode, Job,
    JobFilter, JobStatus, NewJob, ProcessingStart,
};
use super::{JobStore, StoreError, StoreResult};

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<Uuid, Job>,
    deliveries: HashMap<Uuid, Vec<DeliveryLog>>,
    templates: HashMap<Uuid, Template>,
    audit: Vec<AuditEntry>,
    /// (job, recipient) -> (owner, lease expiry)
    leases: HashMap<(Uuid, String), (String, DateTime<Utc>)>,
}

impl MemoryState {
    fn close_pending(&mut self, job_id: Uuid, reason: &str, now: DateTime<Utc>) -> i32 {
        let mut closed = 0;
        if let Some(rows) = self.deliveries.get_mut(&job_id) {
            for row in rows.iter_mut().filter(|r| r.status == DeliveryStatus::Pending) {
                row.status = DeliveryStatus::Failed;
                row.error = Some(reason.to_string());
                row.updated_at = now;
                closed += 1;
            }
        }
        closed
    }

    fn finalize(&mut self, job_id: Uuid, mode: &FinalizeMode) -> StoreResult<Option<Job>> {
        let terminal = match self.jobs.get(&job_id) {
            Some(job) => job.status.is_terminal(),
            None => return Err(StoreError::NotFound(format!("job {}", job_id))),
        };
        if terminal {
            return Ok(None);
        }

        let now = Utc::now();
        let closed = self.close_pending(job_id, mode.pending_reason(), now);
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", job_id)))?;
        job.apply_finalize(mode, closed, now);
        Ok(Some(job.clone()))
    }

    fn name_taken(&self, name: &str, except: Option<Uuid>) -> bool {
        self.templates
            .values()
            .any(|t| t.name == name && Some(t.id) != except)
    }
}

/// Job store kept entirely in process memory.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn create_job(&self, new: NewJob, audit: AuditEntry) -> StoreResult<Job> {
        let mut state = self.state();
        if state.jobs.contains_key(&new.id) {
            return Err(StoreError::Conflict(format!("job {} already exists", new.id)));
        }

        let now = Utc::now();
        let job = Job::from_new(new, now);
        let rows = job
            .recipients
            .iter()
            .enumerate()
            .map(|(i, r)| DeliveryLog::pending(job.id, i, r, now))
            .collect();

        state.deliveries.insert(job.id, rows);
        state.jobs.insert(job.id, job.clone());
        state.audit.push(audit);
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<Job>> {
        Ok(self.state().jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        let state = self.state();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| filter.include_archived || j.archived_at.is_none())
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .filter(|j| {
                filter
                    .created_by
                    .as_deref()
                    .map_or(true, |actor| j.created_by == actor)
            })
            .cloned()
            .collect();

        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(jobs
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn set_external_id(&self, id: Uuid, external_id: &str) -> StoreResult<()> {
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", id)))?;
        job.external_id = Some(external_id.to_string());
        Ok(())
    }

    async fn begin_processing(&self, id: Uuid, external_id: &str) -> StoreResult<ProcessingStart> {
        let mut state = self.state();
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(ProcessingStart::Missing);
        };
        if job.status.is_terminal() || job.archived_at.is_some() {
            return Ok(ProcessingStart::Finished(job.clone()));
        }

        let now = Utc::now();
        job.status = JobStatus::Processing;
        job.started_at.get_or_insert(now);
        job.attempts += 1;
        job.external_id = Some(external_id.to_string());
        job.updated_at = now;
        Ok(ProcessingStart::Started(job.clone()))
    }

    async fn request_cancel(&self, id: Uuid) -> StoreResult<Job> {
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", id)))?;
        if job.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "job {} is already {}",
                id, job.status
            )));
        }
        job.cancel_requested = true;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn is_cancel_requested(&self, id: Uuid) -> StoreResult<bool> {
        Ok(self
            .state()
            .jobs
            .get(&id)
            .map(|j| j.cancel_requested)
            .unwrap_or(false))
    }

    async fn pending_deliveries(&self, job_id: Uuid) -> StoreResult<Vec<DeliveryLog>> {
        Ok(self
            .state()
            .deliveries
            .get(&job_id)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.status == DeliveryStatus::Pending)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_deliveries(&self, job_id: Uuid) -> StoreResult<Vec<DeliveryLog>> {
        Ok(self
            .state()
            .deliveries
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn claim_delivery(
        &self,
        job_id: Uuid,
        recipient_id: &str,
        owner: &str,
        lease: Duration,
    ) -> StoreResult<DeliveryClaim> {
        let mut state = self.state();
        let now = Utc::now();

        let status = state
            .deliveries
            .get(&job_id)
            .and_then(|rows| rows.iter().find(|r| r.recipient_id == recipient_id))
            .map(|r| r.status)
            .ok_or_else(|| StoreError::NotFound(format!("delivery {}/{}", job_id, recipient_id)))?;
        if status != DeliveryStatus::Pending {
            return Ok(DeliveryClaim::Settled);
        }

        let key = (job_id, recipient_id.to_string());
        if let Some((holder, expires)) = state.leases.get(&key) {
            if holder != owner && *expires > now {
                return Ok(DeliveryClaim::Held);
            }
        }

        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero());
        state.leases.insert(key, (owner.to_string(), now + lease));
        Ok(DeliveryClaim::Acquired)
    }

    async fn record_delivery(
        &self,
        job_id: Uuid,
        recipient_id: &str,
        update: DeliveryUpdate,
    ) -> StoreResult<bool> {
        let mut state = self.state();
        let now = Utc::now();

        let Some(row) = state
            .deliveries
            .get_mut(&job_id)
            .and_then(|rows| rows.iter_mut().find(|r| r.recipient_id == recipient_id))
        else {
            return Err(StoreError::NotFound(format!(
                "delivery {}/{}",
                job_id, recipient_id
            )));
        };
        if row.status != DeliveryStatus::Pending {
            return Ok(false);
        }

        row.status = update.status();
        row.attempts += 1;
        row.updated_at = now;
        match update {
            DeliveryUpdate::Sent { provider_message_id } => {
                row.provider_message_id = provider_message_id;
                row.sent_at = Some(now);
                row.error = None;
            }
            DeliveryUpdate::Failed { error } => row.error = Some(error),
        }
        let status = row.status;

        if let Some(job) = state.jobs.get_mut(&job_id) {
            match status {
                DeliveryStatus::Sent => job.sent_count += 1,
                _ => job.failed_count += 1,
            }
            job.updated_at = now;
        }
        state.leases.remove(&(job_id, recipient_id.to_string()));
        Ok(true)
    }

    async fn record_transient(
        &self,
        job_id: Uuid,
        recipient_id: &str,
        error: &str,
    ) -> StoreResult<()> {
        let mut state = self.state();
        let now = Utc::now();

        if let Some(row) = state
            .deliveries
            .get_mut(&job_id)
            .and_then(|rows| rows.iter_mut().find(|r| r.recipient_id == recipient_id))
            .filter(|r| r.status == DeliveryStatus::Pending)
        {
            row.attempts += 1;
            row.error = Some(error.to_string());
            row.updated_at = now;
        }
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.last_error = Some(error.to_string());
            job.updated_at = now;
        }
        state.leases.remove(&(job_id, recipient_id.to_string()));
        Ok(())
    }

    async fn finalize_job(&self, job_id: Uuid, mode: FinalizeMode) -> StoreResult<Option<Job>> {
        self.state().finalize(job_id, &mode)
    }

    async fn cancel_queued(&self, job_id: Uuid) -> StoreResult<Option<Job>> {
        let mut state = self.state();
        match state.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Queued => job.cancel_requested = true,
            Some(_) => return Ok(None),
            None => return Err(StoreError::NotFound(format!("job {}", job_id))),
        }
        state.finalize(job_id, &FinalizeMode::Cancelled)
    }

    async fn archive_job(&self, id: Uuid) -> StoreResult<Job> {
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", id)))?;
        if !job.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "job {} is {} and cannot be archived",
                id, job.status
            )));
        }
        let now = Utc::now();
        job.archived_at.get_or_insert(now);
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn reconcile_candidates(
        &self,
        queued_before: DateTime<Utc>,
        stalled_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Job>> {
        let now = Utc::now();
        let state = self.state();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.archived_at.is_none())
            .filter(|j| match j.status {
                JobStatus::Queued => {
                    j.created_at < queued_before && j.scheduled_for.map_or(true, |at| at <= now)
                }
                JobStatus::Processing => j.updated_at < stalled_before,
                _ => false,
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.created_at.cmp(&b.created_at)));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn insert_template(&self, template: &Template) -> StoreResult<()> {
        let mut state = self.state();
        if state.name_taken(&template.name, None) {
            return Err(StoreError::Conflict(format!(
                "template name '{}' is already in use",
                template.name
            )));
        }
        state.templates.insert(template.id, template.clone());
        Ok(())
    }

    async fn get_template(&self, id: Uuid) -> StoreResult<Option<Template>> {
        Ok(self.state().templates.get(&id).cloned())
    }

    async fn get_template_by_name(&self, name: &str) -> StoreResult<Option<Template>> {
        Ok(self
            .state()
            .templates
            .values()
            .find(|t| t.name == name)
            .cloned())
    }

    async fn list_templates(&self) -> StoreResult<Vec<Template>> {
        let mut templates: Vec<Template> = self.state().templates.values().cloned().collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(templates)
    }

    async fn update_template(&self, template: &Template) -> StoreResult<()> {
        let mut state = self.state();
        if !state.templates.contains_key(&template.id) {
            return Err(StoreError::NotFound(format!("template {}", template.id)));
        }
        if state.name_taken(&template.name, Some(template.id)) {
            return Err(StoreError::Conflict(format!(
                "template name '{}' is already in use",
                template.name
            )));
        }
        state.templates.insert(template.id, template.clone());
        Ok(())
    }

    async fn delete_template(&self, id: Uuid) -> StoreResult<()> {
        let mut state = self.state();
        if !state.templates.contains_key(&id) {
            return Err(StoreError::NotFound(format!("template {}", id)));
        }
        let in_use = state.jobs.values().any(|j| {
            j.user_template_id() == Some(id) && !j.status.is_terminal() && j.archived_at.is_none()
        });
        if in_use {
            return Err(StoreError::Conflict(format!(
                "template {} is referenced by an active job",
                id
            )));
        }
        state.templates.remove(&id);
        Ok(())
    }

    async fn append_audit(&self, entry: AuditEntry) -> StoreResult<()> {
        self.state().audit.push(entry);
        Ok(())
    }

    async fn list_audit(&self, job_id: Option<Uuid>, limit: i64) -> StoreResult<Vec<AuditEntry>> {
        Ok(self
            .state()
            .audit
            .iter()
            .rev()
            .filter(|e| job_id.map_or(true, |id| e.job_id == Some(id)))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;
    use crate::store::{AuditAction, Recipient};

    fn new_job(recipients: usize) -> NewJob {
        NewJob {
            id: Uuid::new_v4(),
            template_ref: None,
            subject: Some("Hello".into()),
            body: Some("Body".into()),
            variables: Map::new(),
            recipients: (0..recipients)
                .map(|i| Recipient {
                    id: format!("r{}", i),
                    address: format!("r{}@example.com", i),
                    name: None,
                })
                .collect(),
            priority: 100,
            scheduled_for: None,
            created_by: "tester".into(),
        }
    }

    fn audit() -> AuditEntry {
        AuditEntry::new("tester", AuditAction::JobSubmitted)
    }

    #[tokio::test]
    async fn test_create_job_writes_pending_rows_and_audit() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job(3), audit()).await.unwrap();

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.total_count, 3);
        assert_eq!(store.pending_deliveries(job.id).await.unwrap().len(), 3);
        assert_eq!(store.list_audit(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_record_delivery_is_idempotent() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job(1), audit()).await.unwrap();

        let sent = DeliveryUpdate::Sent {
            provider_message_id: Some("m-1".into()),
        };
        assert!(store.record_delivery(job.id, "r0", sent.clone()).await.unwrap());
        assert!(!store.record_delivery(job.id, "r0", sent).await.unwrap());
        assert!(!store
            .record_delivery(job.id, "r0", DeliveryUpdate::Failed { error: "x".into() })
            .await
            .unwrap());

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.sent_count, 1);
        assert_eq!(job.failed_count, 0);
    }

    #[tokio::test]
    async fn test_claim_delivery_lease() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job(1), audit()).await.unwrap();
        let lease = Duration::from_secs(60);

        let claim = store.claim_delivery(job.id, "r0", "b#1", lease).await.unwrap();
        assert_eq!(claim, DeliveryClaim::Acquired);
        let claim = store.claim_delivery(job.id, "r0", "b#1", lease).await.unwrap();
        assert_eq!(claim, DeliveryClaim::Acquired);
        let claim = store.claim_delivery(job.id, "r0", "b#2", lease).await.unwrap();
        assert_eq!(claim, DeliveryClaim::Held);

        // a transient outcome releases the lease
        store.record_transient(job.id, "r0", "timeout").await.unwrap();
        let claim = store.claim_delivery(job.id, "r0", "b#2", lease).await.unwrap();
        assert_eq!(claim, DeliveryClaim::Acquired);

        let sent = DeliveryUpdate::Sent {
            provider_message_id: None,
        };
        store.record_delivery(job.id, "r0", sent).await.unwrap();
        let claim = store.claim_delivery(job.id, "r0", "b#3", lease).await.unwrap();
        assert_eq!(claim, DeliveryClaim::Settled);

        assert!(matches!(
            store.claim_delivery(job.id, "nobody", "b#3", lease).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job(1), audit()).await.unwrap();

        let claim = store
            .claim_delivery(job.id, "r0", "b#1", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(claim, DeliveryClaim::Acquired);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let claim = store
            .claim_delivery(job.id, "r0", "b#2", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(claim, DeliveryClaim::Acquired);
    }

    #[tokio::test]
    async fn test_begin_processing_skips_terminal() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job(1), audit()).await.unwrap();

        match store.begin_processing(job.id, "b#1").await.unwrap() {
            ProcessingStart::Started(j) => {
                assert_eq!(j.status, JobStatus::Processing);
                assert_eq!(j.attempts, 1);
            }
            other => panic!("unexpected {:?}", other),
        }

        store.finalize_job(job.id, FinalizeMode::Cancelled).await.unwrap();
        assert!(matches!(
            store.begin_processing(job.id, "b#2").await.unwrap(),
            ProcessingStart::Finished(_)
        ));
        assert!(matches!(
            store.begin_processing(Uuid::new_v4(), "b#1").await.unwrap(),
            ProcessingStart::Missing
        ));
    }

    #[tokio::test]
    async fn test_finalize_closes_pending_rows_once() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job(2), audit()).await.unwrap();
        store
            .record_delivery(job.id, "r0", DeliveryUpdate::Sent { provider_message_id: None })
            .await
            .unwrap();

        let done = store
            .finalize_job(job.id, FinalizeMode::Exhausted("timeout".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.sent_count + done.failed_count, done.total_count);

        assert!(store
            .finalize_job(job.id, FinalizeMode::Delivered)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cancel_queued_only_applies_to_queued() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job(2), audit()).await.unwrap();

        let cancelled = store.cancel_queued(job.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(cancelled.sent_count, 0);
        assert_eq!(cancelled.failed_count, 2);

        let other = store.create_job(new_job(1), audit()).await.unwrap();
        store.begin_processing(other.id, "b#1").await.unwrap();
        assert!(store.cancel_queued(other.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_request_cancel_conflicts_on_terminal() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job(1), audit()).await.unwrap();
        store.finalize_job(job.id, FinalizeMode::Delivered).await.unwrap();

        assert!(matches!(
            store.request_cancel(job.id).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            store.request_cancel(Uuid::new_v4()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_archive_requires_terminal() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job(1), audit()).await.unwrap();
        assert!(matches!(
            store.archive_job(job.id).await,
            Err(StoreError::Conflict(_))
        ));

        store.cancel_queued(job.id).await.unwrap();
        let archived = store.archive_job(job.id).await.unwrap();
        assert!(archived.archived_at.is_some());

        let listed = store
            .list_jobs(&JobFilter {
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_candidates_respects_grace_and_schedule() {
        let store = MemoryJobStore::new();
        let due = store.create_job(new_job(1), audit()).await.unwrap();

        let mut later = new_job(1);
        later.scheduled_for = Some(Utc::now() + chrono::Duration::hours(1));
        store.create_job(later, audit()).await.unwrap();

        let future = Utc::now() + chrono::Duration::seconds(1);
        let past = Utc::now() - chrono::Duration::hours(1);

        let candidates = store.reconcile_candidates(future, past, 10).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, due.id);

        assert!(store.reconcile_candidates(past, past, 10).await.unwrap().is_empty());
    }
}
