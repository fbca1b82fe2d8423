//! PostgreSQL job store.
//!
//! Uses the `delivery_jobs`, `delivery_logs`, `delivery_templates` and
//! `delivery_audit` tables created by the bundled migrations. Multi-row
//! operations run in a transaction with the job row locked `FOR UPDATE`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::postgres::PostgresPool;
use crate::template::{Template, TemplateRef, TemplateSource, VariableSchema};

use super::models::{
    AuditEntry, DeliveryClaim, DeliveryLog, DeliveryStatus, DeliveryUpdate, FinalizeMode, Job,
    JobFilter, JobStatus, NewJob, ProcessingStart, Recipient,
};
use super::{JobStore, StoreError, StoreResult};

const JOB_COLUMNS: &str = "id, external_id, template_ref, subject, body, variables, recipients, \
     status, priority, scheduled_for, total_count, sent_count, failed_count, cancel_requested, \
     attempts, last_error, created_by, created_at, updated_at, started_at, completed_at, \
     failed_at, archived_at";

const DELIVERY_COLUMNS: &str = "job_id, recipient_id, position, address, recipient_name, status, \
     provider_message_id, error, attempts, created_at, updated_at, sent_at";

const TEMPLATE_COLUMNS: &str =
    "id, name, category, subject_pattern, body_pattern, variable_schema, active, created_at, updated_at";

#[derive(FromRow)]
struct JobRow {
    id: Uuid,
    external_id: Option<String>,
    template_ref: Option<Json<TemplateRef>>,
    subject: Option<String>,
    body: Option<String>,
    variables: Json<serde_json::Map<String, serde_json::Value>>,
    recipients: Json<Vec<Recipient>>,
    status: String,
    priority: i32,
    scheduled_for: Option<DateTime<Utc>>,
    total_count: i32,
    sent_count: i32,
    failed_count: i32,
    cancel_requested: bool,
    attempts: i32,
    last_error: Option<String>,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    archived_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(StoreError::Unavailable)?;

        Ok(Job {
            id: row.id,
            external_id: row.external_id,
            template_ref: row.template_ref.map(|Json(r)| r),
            subject: row.subject,
            body: row.body,
            variables: row.variables.0,
            recipients: row.recipients.0,
            status,
            priority: row.priority,
            scheduled_for: row.scheduled_for,
            total_count: row.total_count,
            sent_count: row.sent_count,
            failed_count: row.failed_count,
            cancel_requested: row.cancel_requested,
            attempts: row.attempts,
            last_error: row.last_error,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            failed_at: row.failed_at,
            archived_at: row.archived_at,
        })
    }
}

#[derive(FromRow)]
struct DeliveryRow {
    job_id: Uuid,
    recipient_id: String,
    position: i32,
    address: String,
    recipient_name: Option<String>,
    status: String,
    provider_message_id: Option<String>,
    error: Option<String>,
    attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
}

impl TryFrom<DeliveryRow> for DeliveryLog {
    type Error = StoreError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        Ok(DeliveryLog {
            job_id: row.job_id,
            recipient_id: row.recipient_id,
            position: row.position,
            address: row.address,
            recipient_name: row.recipient_name,
            status: row.status.parse().map_err(StoreError::Unavailable)?,
            provider_message_id: row.provider_message_id,
            error: row.error,
            attempts: row.attempts,
            created_at: row.created_at,
            updated_at: row.updated_at,
            sent_at: row.sent_at,
        })
    }
}

#[derive(FromRow)]
struct TemplateRow {
    id: Uuid,
    name: String,
    category: String,
    subject_pattern: String,
    body_pattern: String,
    variable_schema: Json<VariableSchema>,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<TemplateRow> for Template {
    fn from(row: TemplateRow) -> Self {
        Template {
            id: row.id,
            name: row.name,
            category: row.category,
            subject_pattern: row.subject_pattern,
            body_pattern: row.body_pattern,
            variable_schema: row.variable_schema.0,
            source: TemplateSource::User,
            active: row.active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct AuditRow {
    id: Uuid,
    actor: String,
    action: String,
    job_id: Option<Uuid>,
    template_id: Option<Uuid>,
    detail: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = StoreError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        Ok(AuditEntry {
            id: row.id,
            actor: row.actor,
            action: row.action.parse().map_err(StoreError::Unavailable)?,
            job_id: row.job_id,
            template_id: row.template_id,
            detail: row.detail,
            created_at: row.created_at,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn jobs_from_rows(rows: Vec<JobRow>) -> StoreResult<Vec<Job>> {
    rows.into_iter().map(Job::try_from).collect()
}

/// Job store backed by PostgreSQL.
pub struct PostgresJobStore {
    pool: PostgresPool,
}

impl PostgresJobStore {
    pub fn new(pool: PostgresPool) -> Self {
        Self { pool }
    }

    fn db(&self) -> &PgPool {
        self.pool.pool()
    }

    async fn insert_audit<'e, E>(executor: E, entry: &AuditEntry) -> StoreResult<()>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO delivery_audit (id, actor, action, job_id, template_id, detail, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.actor)
        .bind(entry.action.as_str())
        .bind(entry.job_id)
        .bind(entry.template_id)
        .bind(&entry.detail)
        .bind(entry.created_at)
        .execute(executor)
        .await?;
        Ok(())
    }

    async fn lock_job(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> StoreResult<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM delivery_jobs WHERE id = $1 FOR UPDATE",
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(Job::try_from).transpose()
    }

    /// Close pending rows and write the terminal job state inside `tx`.
    async fn finalize_in(
        tx: &mut Transaction<'_, Postgres>,
        mut job: Job,
        mode: &FinalizeMode,
    ) -> StoreResult<Job> {
        let closed = sqlx::query(
            r#"
            UPDATE delivery_logs
            SET status = 'FAILED', error = $2, updated_at = NOW()
            WHERE job_id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(job.id)
        .bind(mode.pending_reason())
        .execute(&mut **tx)
        .await?
        .rows_affected();

        job.apply_finalize(mode, closed as i32, Utc::now());

        sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = $2, failed_count = $3, last_error = $4,
                completed_at = $5, failed_at = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(job.failed_count)
        .bind(&job.last_error)
        .bind(job.completed_at)
        .bind(job.failed_at)
        .bind(job.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(job)
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(self.db()).await?;
        Ok(())
    }

    async fn create_job(&self, new: NewJob, audit: AuditEntry) -> StoreResult<Job> {
        let job = Job::from_new(new, Utc::now());
        let mut tx = self.db().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO delivery_jobs (
                id, template_ref, user_template_id, subject, body, variables, recipients,
                status, priority, scheduled_for, total_count, created_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
            "#,
        )
        .bind(job.id)
        .bind(job.template_ref.as_ref().map(Json))
        .bind(job.user_template_id())
        .bind(&job.subject)
        .bind(&job.body)
        .bind(Json(&job.variables))
        .bind(Json(&job.recipients))
        .bind(job.status.as_str())
        .bind(job.priority)
        .bind(job.scheduled_for)
        .bind(job.total_count)
        .bind(&job.created_by)
        .bind(job.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict(format!("job {} already exists", job.id))
            } else {
                StoreError::Database(e)
            }
        })?;

        for (position, recipient) in job.recipients.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO delivery_logs (
                    job_id, recipient_id, position, address, recipient_name, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $6)
                "#,
            )
            .bind(job.id)
            .bind(&recipient.id)
            .bind(position as i32)
            .bind(&recipient.address)
            .bind(&recipient.name)
            .bind(job.created_at)
            .execute(&mut *tx)
            .await?;
        }

        Self::insert_audit(&mut *tx, &audit).await?;
        tx.commit().await?;

        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM delivery_jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.db())
        .await?;
        row.map(Job::try_from).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM delivery_jobs
            WHERE ($1::TEXT IS NULL OR status = $1)
              AND ($2::TEXT IS NULL OR created_by = $2)
              AND ($3 OR archived_at IS NULL)
            ORDER BY created_at DESC, id DESC
            LIMIT $4 OFFSET $5
            "#,
            JOB_COLUMNS
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.created_by.as_deref())
        .bind(filter.include_archived)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(self.db())
        .await?;
        jobs_from_rows(rows)
    }

    async fn set_external_id(&self, id: Uuid, external_id: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE delivery_jobs SET external_id = $2 WHERE id = $1")
            .bind(id)
            .bind(external_id)
            .execute(self.db())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job {}", id)));
        }
        Ok(())
    }

    async fn begin_processing(&self, id: Uuid, external_id: &str) -> StoreResult<ProcessingStart> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE delivery_jobs
            SET status = 'PROCESSING',
                started_at = COALESCE(started_at, NOW()),
                attempts = attempts + 1,
                external_id = $2,
                updated_at = NOW()
            WHERE id = $1
              AND status IN ('QUEUED', 'PROCESSING')
              AND archived_at IS NULL
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(id)
        .bind(external_id)
        .fetch_optional(self.db())
        .await?;

        if let Some(row) = row {
            return Ok(ProcessingStart::Started(row.try_into()?));
        }
        Ok(match self.get_job(id).await? {
            Some(job) => ProcessingStart::Finished(job),
            None => ProcessingStart::Missing,
        })
    }

    async fn request_cancel(&self, id: Uuid) -> StoreResult<Job> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE delivery_jobs
            SET cancel_requested = TRUE, updated_at = NOW()
            WHERE id = $1 AND status IN ('QUEUED', 'PROCESSING')
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.db())
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => match self.get_job(id).await? {
                Some(job) => Err(StoreError::Conflict(format!(
                    "job {} is already {}",
                    id, job.status
                ))),
                None => Err(StoreError::NotFound(format!("job {}", id))),
            },
        }
    }

    async fn is_cancel_requested(&self, id: Uuid) -> StoreResult<bool> {
        let flag: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM delivery_jobs WHERE id = $1")
                .bind(id)
                .fetch_optional(self.db())
                .await?;
        Ok(flag.unwrap_or(false))
    }

    async fn pending_deliveries(&self, job_id: Uuid) -> StoreResult<Vec<DeliveryLog>> {
        let rows: Vec<DeliveryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM delivery_logs WHERE job_id = $1 AND status = 'PENDING' ORDER BY position",
            DELIVERY_COLUMNS
        ))
        .bind(job_id)
        .fetch_all(self.db())
        .await?;
        rows.into_iter().map(DeliveryLog::try_from).collect()
    }

    async fn list_deliveries(&self, job_id: Uuid) -> StoreResult<Vec<DeliveryLog>> {
        let rows: Vec<DeliveryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM delivery_logs WHERE job_id = $1 ORDER BY position",
            DELIVERY_COLUMNS
        ))
        .bind(job_id)
        .fetch_all(self.db())
        .await?;
        rows.into_iter().map(DeliveryLog::try_from).collect()
    }

    async fn claim_delivery(
        &self,
        job_id: Uuid,
        recipient_id: &str,
        owner: &str,
        lease: Duration,
    ) -> StoreResult<DeliveryClaim> {
        let claimed = sqlx::query(
            r#"
            UPDATE delivery_logs
            SET claimed_by = $3,
                claimed_until = NOW() + make_interval(secs => $4::float8)
            WHERE job_id = $1 AND recipient_id = $2 AND status = 'PENDING'
              AND (claimed_until IS NULL OR claimed_until < NOW() OR claimed_by = $3)
            "#,
        )
        .bind(job_id)
        .bind(recipient_id)
        .bind(owner)
        .bind(lease.as_secs_f64())
        .execute(self.db())
        .await?
        .rows_affected();
        if claimed > 0 {
            return Ok(DeliveryClaim::Acquired);
        }

        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM delivery_logs WHERE job_id = $1 AND recipient_id = $2",
        )
        .bind(job_id)
        .bind(recipient_id)
        .fetch_optional(self.db())
        .await?;

        match status.as_deref() {
            Some("PENDING") => Ok(DeliveryClaim::Held),
            Some(_) => Ok(DeliveryClaim::Settled),
            None => Err(StoreError::NotFound(format!(
                "delivery {}/{}",
                job_id, recipient_id
            ))),
        }
    }

    async fn record_delivery(
        &self,
        job_id: Uuid,
        recipient_id: &str,
        update: DeliveryUpdate,
    ) -> StoreResult<bool> {
        let status = update.status();
        let (message_id, error) = match update {
            DeliveryUpdate::Sent { provider_message_id } => (provider_message_id, None),
            DeliveryUpdate::Failed { error } => (None, Some(error)),
        };

        let mut tx = self.db().begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE delivery_logs
            SET status = $3,
                provider_message_id = $4,
                error = $5,
                attempts = attempts + 1,
                updated_at = NOW(),
                sent_at = CASE WHEN $3 = 'SENT' THEN NOW() ELSE sent_at END,
                claimed_by = NULL,
                claimed_until = NULL
            WHERE job_id = $1 AND recipient_id = $2 AND status = 'PENDING'
            "#,
        )
        .bind(job_id)
        .bind(recipient_id)
        .bind(status.as_str())
        .bind(message_id)
        .bind(error)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let counter = match status {
            DeliveryStatus::Sent => "sent_count",
            _ => "failed_count",
        };
        sqlx::query(&format!(
            "UPDATE delivery_jobs SET {counter} = {counter} + 1, updated_at = NOW() WHERE id = $1"
        ))
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn record_transient(
        &self,
        job_id: Uuid,
        recipient_id: &str,
        error: &str,
    ) -> StoreResult<()> {
        let mut tx = self.db().begin().await?;

        sqlx::query(
            r#"
            UPDATE delivery_logs
            SET attempts = attempts + 1, error = $3, updated_at = NOW(),
                claimed_by = NULL, claimed_until = NULL
            WHERE job_id = $1 AND recipient_id = $2 AND status = 'PENDING'
            "#,
        )
        .bind(job_id)
        .bind(recipient_id)
        .bind(error)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE delivery_jobs SET last_error = $2, updated_at = NOW() WHERE id = $1")
            .bind(job_id)
            .bind(error)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn finalize_job(&self, job_id: Uuid, mode: FinalizeMode) -> StoreResult<Option<Job>> {
        let mut tx = self.db().begin().await?;

        let job = Self::lock_job(&mut tx, job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job {}", job_id)))?;
        if job.status.is_terminal() {
            tx.rollback().await?;
            return Ok(None);
        }

        let job = Self::finalize_in(&mut tx, job, &mode).await?;
        tx.commit().await?;
        Ok(Some(job))
    }

    async fn cancel_queued(&self, job_id: Uuid) -> StoreResult<Option<Job>> {
        let mut tx = self.db().begin().await?;

        let mut job = Self::lock_job(&mut tx, job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job {}", job_id)))?;
        if job.status != JobStatus::Queued {
            tx.rollback().await?;
            return Ok(None);
        }

        sqlx::query("UPDATE delivery_jobs SET cancel_requested = TRUE WHERE id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        job.cancel_requested = true;

        let job = Self::finalize_in(&mut tx, job, &FinalizeMode::Cancelled).await?;
        tx.commit().await?;
        Ok(Some(job))
    }

    async fn archive_job(&self, id: Uuid) -> StoreResult<Job> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE delivery_jobs
            SET archived_at = COALESCE(archived_at, NOW()), updated_at = NOW()
            WHERE id = $1 AND status IN ('COMPLETED', 'FAILED', 'CANCELLED')
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.db())
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => match self.get_job(id).await? {
                Some(job) => Err(StoreError::Conflict(format!(
                    "job {} is {} and cannot be archived",
                    id, job.status
                ))),
                None => Err(StoreError::NotFound(format!("job {}", id))),
            },
        }
    }

    async fn reconcile_candidates(
        &self,
        queued_before: DateTime<Utc>,
        stalled_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM delivery_jobs
            WHERE archived_at IS NULL
              AND (
                (status = 'QUEUED' AND created_at < $1
                    AND (scheduled_for IS NULL OR scheduled_for <= NOW()))
                OR (status = 'PROCESSING' AND updated_at < $2)
              )
            ORDER BY priority ASC, created_at ASC
            LIMIT $3
            "#,
            JOB_COLUMNS
        ))
        .bind(queued_before)
        .bind(stalled_before)
        .bind(limit)
        .fetch_all(self.db())
        .await?;
        jobs_from_rows(rows)
    }

    async fn insert_template(&self, template: &Template) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO delivery_templates (
                id, name, category, subject_pattern, body_pattern, variable_schema,
                active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(template.id)
        .bind(&template.name)
        .bind(&template.category)
        .bind(&template.subject_pattern)
        .bind(&template.body_pattern)
        .bind(Json(&template.variable_schema))
        .bind(template.active)
        .bind(template.created_at)
        .bind(template.updated_at)
        .execute(self.db())
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict(format!(
                    "template name '{}' is already in use",
                    template.name
                ))
            } else {
                StoreError::Database(e)
            }
        })?;
        Ok(())
    }

    async fn get_template(&self, id: Uuid) -> StoreResult<Option<Template>> {
        let row: Option<TemplateRow> = sqlx::query_as(&format!(
            "SELECT {} FROM delivery_templates WHERE id = $1",
            TEMPLATE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.db())
        .await?;
        Ok(row.map(Template::from))
    }

    async fn get_template_by_name(&self, name: &str) -> StoreResult<Option<Template>> {
        let row: Option<TemplateRow> = sqlx::query_as(&format!(
            "SELECT {} FROM delivery_templates WHERE name = $1",
            TEMPLATE_COLUMNS
        ))
        .bind(name)
        .fetch_optional(self.db())
        .await?;
        Ok(row.map(Template::from))
    }

    async fn list_templates(&self) -> StoreResult<Vec<Template>> {
        let rows: Vec<TemplateRow> = sqlx::query_as(&format!(
            "SELECT {} FROM delivery_templates ORDER BY name",
            TEMPLATE_COLUMNS
        ))
        .fetch_all(self.db())
        .await?;
        Ok(rows.into_iter().map(Template::from).collect())
    }

    async fn update_template(&self, template: &Template) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_templates
            SET name = $2, category = $3, subject_pattern = $4, body_pattern = $5,
                variable_schema = $6, active = $7, updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(template.id)
        .bind(&template.name)
        .bind(&template.category)
        .bind(&template.subject_pattern)
        .bind(&template.body_pattern)
        .bind(Json(&template.variable_schema))
        .bind(template.active)
        .bind(template.updated_at)
        .execute(self.db())
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict(format!(
                    "template name '{}' is already in use",
                    template.name
                ))
            } else {
                StoreError::Database(e)
            }
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("template {}", template.id)));
        }
        Ok(())
    }

    async fn delete_template(&self, id: Uuid) -> StoreResult<()> {
        let mut tx = self.db().begin().await?;

        let exists: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM delivery_templates WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!("template {}", id)));
        }

        let in_use: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM delivery_jobs
                WHERE user_template_id = $1
                  AND status IN ('QUEUED', 'PROCESSING')
                  AND archived_at IS NULL
            )
            "#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        if in_use {
            return Err(StoreError::Conflict(format!(
                "template {} is referenced by an active job",
                id
            )));
        }

        sqlx::query("DELETE FROM delivery_templates WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn append_audit(&self, entry: AuditEntry) -> StoreResult<()> {
        Self::insert_audit(self.db(), &entry).await
    }

    async fn list_audit(&self, job_id: Option<Uuid>, limit: i64) -> StoreResult<Vec<AuditEntry>> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            r#"
            SELECT id, actor, action, job_id, template_id, detail, created_at
            FROM delivery_audit
            WHERE ($1::UUID IS NULL OR job_id = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(job_id)
        .bind(limit)
        .fetch_all(self.db())
        .await?;
        rows.into_iter().map(AuditEntry::try_from).collect()
    }
}
