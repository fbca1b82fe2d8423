//! Persistent records owned by the job store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::template::TemplateRef;

/// A single addressee, snapshotted onto the job at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl Recipient {
    /// Variables exposed to templates under the `recipient.` prefix.
    pub fn template_scope(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "address": self.address,
            "email": self.address,
            "name": self.name.clone().unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(JobStatus::Queued),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// How a job leaves the non-terminal states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeMode {
    /// Every recipient was attempted: `Completed` if anything was sent, else `Failed`.
    Delivered,
    /// The cooperative cancel flag was honoured.
    Cancelled,
    /// The broker gave up on the pointer; remaining rows fail with this error.
    Exhausted(String),
}

impl FinalizeMode {
    /// Error written onto rows still pending when the job is closed.
    pub fn pending_reason(&self) -> &str {
        match self {
            FinalizeMode::Delivered => "not attempted",
            FinalizeMode::Cancelled => "cancelled",
            FinalizeMode::Exhausted(error) => error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub external_id: Option<String>,
    pub template_ref: Option<TemplateRef>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub variables: Map<String, Value>,
    pub recipients: Vec<Recipient>,
    pub status: JobStatus,
    pub priority: i32,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub total_count: i32,
    pub sent_count: i32,
    pub failed_count: i32,
    pub cancel_requested: bool,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn from_new(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            external_id: None,
            template_ref: new.template_ref,
            subject: new.subject,
            body: new.body,
            variables: new.variables,
            total_count: new.recipients.len() as i32,
            recipients: new.recipients,
            status: JobStatus::Queued,
            priority: new.priority,
            scheduled_for: new.scheduled_for,
            sent_count: 0,
            failed_count: 0,
            cancel_requested: false,
            attempts: 0,
            last_error: None,
            created_by: new.created_by,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            archived_at: None,
        }
    }

    /// User template id this job depends on, if any.
    pub fn user_template_id(&self) -> Option<Uuid> {
        match &self.template_ref {
            Some(TemplateRef::User { id }) => Some(*id),
            _ => None,
        }
    }

    pub fn pending_count(&self) -> i32 {
        self.total_count - self.sent_count - self.failed_count
    }

    /// Stamp the terminal status once pending rows have been closed.
    ///
    /// `closed` is the number of rows that were still pending and have just
    /// been marked failed with the mode's reason.
    pub fn apply_finalize(&mut self, mode: &FinalizeMode, closed: i32, now: DateTime<Utc>) {
        self.failed_count += closed;
        self.status = match mode {
            FinalizeMode::Delivered if self.sent_count > 0 => JobStatus::Completed,
            FinalizeMode::Delivered => JobStatus::Failed,
            FinalizeMode::Cancelled => JobStatus::Cancelled,
            FinalizeMode::Exhausted(_) => JobStatus::Failed,
        };

        match self.status {
            JobStatus::Failed => {
                self.failed_at = Some(now);
                if let FinalizeMode::Exhausted(error) = mode {
                    self.last_error = Some(error.clone());
                } else if self.last_error.is_none() {
                    self.last_error = Some("all recipients failed".to_string());
                }
            }
            _ => self.completed_at = Some(now),
        }
        self.updated_at = now;
    }
}

/// Everything needed to create a job row and its delivery rows.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub template_ref: Option<TemplateRef>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub variables: Map<String, Value>,
    pub recipients: Vec<Recipient>,
    pub priority: i32,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub created_by: String,
}

/// Outcome of an optimistic `Queued|Processing -> Processing` transition.
#[derive(Debug, Clone)]
pub enum ProcessingStart {
    Started(Job),
    /// Terminal or archived; the pointer should simply be acknowledged.
    Finished(Job),
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Sent => "SENT",
            DeliveryStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(DeliveryStatus::Pending),
            "SENT" => Ok(DeliveryStatus::Sent),
            "FAILED" => Ok(DeliveryStatus::Failed),
            other => Err(format!("unknown delivery status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryLog {
    pub job_id: Uuid,
    pub recipient_id: String,
    pub position: i32,
    pub address: String,
    pub recipient_name: Option<String>,
    pub status: DeliveryStatus,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl DeliveryLog {
    pub fn pending(job_id: Uuid, position: usize, recipient: &Recipient, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            recipient_id: recipient.id.clone(),
            position: position as i32,
            address: recipient.address.clone(),
            recipient_name: recipient.name.clone(),
            status: DeliveryStatus::Pending,
            provider_message_id: None,
            error: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
            sent_at: None,
        }
    }

    pub fn recipient(&self) -> Recipient {
        Recipient {
            id: self.recipient_id.clone(),
            address: self.address.clone(),
            name: self.recipient_name.clone(),
        }
    }
}

/// Result of leasing a delivery row before sending to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryClaim {
    /// The caller holds the row until the lease expires.
    Acquired,
    /// The row is already `Sent` or `Failed`.
    Settled,
    /// Another reservation holds an unexpired lease on the row.
    Held,
}

/// Final outcome for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryUpdate {
    Sent { provider_message_id: Option<String> },
    Failed { error: String },
}

impl DeliveryUpdate {
    pub fn status(&self) -> DeliveryStatus {
        match self {
            DeliveryUpdate::Sent { .. } => DeliveryStatus::Sent,
            DeliveryUpdate::Failed { .. } => DeliveryStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub created_by: Option<String>,
    pub include_archived: bool,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    JobSubmitted,
    JobCancelled,
    JobCompleted,
    JobFailed,
    JobCancelledByWorker,
    JobDeadLettered,
    JobArchived,
    TemplateCreated,
    TemplateUpdated,
    TemplateDeleted,
    PermissionDenied,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::JobSubmitted => "JOB_SUBMITTED",
            AuditAction::JobCancelled => "JOB_CANCELLED",
            AuditAction::JobCompleted => "JOB_COMPLETED",
            AuditAction::JobFailed => "JOB_FAILED",
            AuditAction::JobCancelledByWorker => "JOB_CANCELLED_BY_WORKER",
            AuditAction::JobDeadLettered => "JOB_DEAD_LETTERED",
            AuditAction::JobArchived => "JOB_ARCHIVED",
            AuditAction::TemplateCreated => "TEMPLATE_CREATED",
            AuditAction::TemplateUpdated => "TEMPLATE_UPDATED",
            AuditAction::TemplateDeleted => "TEMPLATE_DELETED",
            AuditAction::PermissionDenied => "PERMISSION_DENIED",
        }
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let action = match s {
            "JOB_SUBMITTED" => AuditAction::JobSubmitted,
            "JOB_CANCELLED" => AuditAction::JobCancelled,
            "JOB_COMPLETED" => AuditAction::JobCompleted,
            "JOB_FAILED" => AuditAction::JobFailed,
            "JOB_CANCELLED_BY_WORKER" => AuditAction::JobCancelledByWorker,
            "JOB_DEAD_LETTERED" => AuditAction::JobDeadLettered,
            "JOB_ARCHIVED" => AuditAction::JobArchived,
            "TEMPLATE_CREATED" => AuditAction::TemplateCreated,
            "TEMPLATE_UPDATED" => AuditAction::TemplateUpdated,
            "TEMPLATE_DELETED" => AuditAction::TemplateDeleted,
            "PERMISSION_DENIED" => AuditAction::PermissionDenied,
            other => return Err(format!("unknown audit action '{}'", other)),
        };
        Ok(action)
    }
}

/// Append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub actor: String,
    pub action: AuditAction,
    pub job_id: Option<Uuid>,
    pub template_id: Option<Uuid>,
    pub detail: Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(actor: impl Into<String>, action: AuditAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor: actor.into(),
            action,
            job_id: None,
            template_id: None,
            detail: Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn template(mut self, template_id: Uuid) -> Self {
        self.template_id = Some(template_id);
        self
    }

    pub fn detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }

    /// Audit entry for a terminal job transition performed by a worker.
    pub fn for_terminal(job: &Job, actor: &str) -> Self {
        let action = match job.status {
            JobStatus::Completed => AuditAction::JobCompleted,
            JobStatus::Cancelled => AuditAction::JobCancelledByWorker,
            _ => AuditAction::JobFailed,
        };
        Self::new(actor, action).job(job.id).detail(serde_json::json!({
            "sent": job.sent_count,
            "failed": job.failed_count,
            "total": job.total_count,
            "last_error": job.last_error,
        }))
    }
}
