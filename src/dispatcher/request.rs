//! Submission requests and job views exposed by the dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::store::{Job, JobStatus};
use crate::template::TemplateRef;

/// One explicitly addressed recipient.
#[derive(Debug, Clone, Deserialize)]
pub struct RecipientInput {
    /// Stable recipient id; defaults to the lower-cased address
    #[serde(default)]
    pub id: Option<String>,
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Directory query expanded once, at submission time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RecipientFilter {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
}

impl RecipientFilter {
    pub fn is_empty(&self) -> bool {
        self.role.is_none() && self.group.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientSpec {
    Explicit(Vec<RecipientInput>),
    Filter(RecipientFilter),
}

/// Request to create a delivery job
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub recipients: RecipientSpec,
    #[serde(default)]
    pub template_ref: Option<TemplateRef>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub variables: Option<Map<String, Value>>,
    /// Lower is sooner
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
}

/// Progress summary of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub id: Uuid,
    pub status: JobStatus,
    pub total_count: i32,
    pub sent_count: i32,
    pub failed_count: i32,
    pub priority: i32,
    pub cancel_requested: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            total_count: job.total_count,
            sent_count: job.sent_count,
            failed_count: job.failed_count,
            priority: job.priority,
            cancel_requested: job.cancel_requested,
            created_by: job.created_by.clone(),
            created_at: job.created_at,
            scheduled_for: job.scheduled_for,
            started_at: job.started_at,
            completed_at: job.completed_at,
            failed_at: job.failed_at,
            archived_at: job.archived_at,
            last_error: job.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobStatusView>,
    pub limit: i64,
    pub offset: i64,
}
