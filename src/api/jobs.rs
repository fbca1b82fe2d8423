//! Job submission and status endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use uuid::Uuid;

use crate::dispatcher::{JobListResponse, JobStatusView, SubmitRequest, SubmitResponse};
use crate::error::AppError;
use crate::server::AppState;
use crate::store::{DeliveryLog, JobFilter, JobStatus};
use crate::telemetry::attributes;

use super::Actor;

/// Query string for `GET /api/v1/jobs`
#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub created_by: Option<String>,
    #[serde(default)]
    pub include_archived: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ListJobsQuery {
    fn into_filter(self) -> Result<JobFilter, AppError> {
        let status = self
            .status
            .as_deref()
            .map(str::parse::<JobStatus>)
            .transpose()
            .map_err(AppError::Validation)?;

        Ok(JobFilter {
            status,
            created_by: self.created_by,
            include_archived: self.include_archived,
            limit: self.limit.unwrap_or(0),
            offset: self.offset.unwrap_or(0),
        })
    }
}

/// POST /api/v1/jobs - Validate, persist and enqueue a job
#[tracing::instrument(name = "http.submit_job", skip(state, request), fields(actor = %actor.as_str()))]
pub async fn submit_job(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    let kv = attributes::actor(actor.as_str());
    tracing::Span::current().set_attribute(kv.key, kv.value);

    let job_id = state.dispatcher.submit(actor.as_str(), request).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id })))
}

/// GET /api/v1/jobs - List jobs, newest first
#[tracing::instrument(name = "http.list_jobs", skip(state))]
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobListResponse>, AppError> {
    let filter = query.into_filter()?;
    Ok(Json(state.dispatcher.list(filter).await?))
}

/// GET /api/v1/jobs/{id}
#[tracing::instrument(name = "http.get_job", skip(state))]
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobStatusView>, AppError> {
    Ok(Json(state.dispatcher.get_status(id).await?))
}

/// GET /api/v1/jobs/{id}/deliveries - Per-recipient outcomes
#[tracing::instrument(name = "http.job_deliveries", skip(state))]
pub async fn job_deliveries(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<DeliveryLog>>, AppError> {
    Ok(Json(state.dispatcher.deliveries(id).await?))
}

/// POST /api/v1/jobs/{id}/cancel
#[tracing::instrument(name = "http.cancel_job", skip(state), fields(actor = %actor.as_str()))]
pub async fn cancel_job(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<JobStatusView>, AppError> {
    Ok(Json(state.dispatcher.cancel(actor.as_str(), id).await?))
}

/// POST /api/v1/jobs/{id}/archive
#[tracing::instrument(name = "http.archive_job", skip(state), fields(actor = %actor.as_str()))]
pub async fn archive_job(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.dispatcher.archive(actor.as_str(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_parses_status() {
        let query = ListJobsQuery {
            status: Some("completed".into()),
            limit: Some(10),
            ..Default::default()
        };
        let filter = query.into_filter().unwrap();
        assert_eq!(filter.status, Some(JobStatus::Completed));
        assert_eq!(filter.limit, 10);
        assert_eq!(filter.offset, 0);
    }

    #[test]
    fn test_query_rejects_unknown_status() {
        let query = ListJobsQuery {
            status: Some("sleeping".into()),
            ..Default::default()
        };
        assert!(matches!(query.into_filter(), Err(AppError::Validation(_))));
    }
}
