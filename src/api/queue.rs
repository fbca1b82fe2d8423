//! Broker inspection and audit trail endpoints.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::broker::{DeadLetter, QueueCounts};
use crate::error::AppError;
use crate::metrics::BrokerMetrics;
use crate::server::AppState;
use crate::store::AuditEntry;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    pub job_id: Option<Uuid>,
    pub limit: Option<usize>,
}

fn clamp_limit(limit: Option<usize>) -> usize {
    match limit {
        Some(0) | None => DEFAULT_LIMIT,
        Some(n) => n.min(MAX_LIMIT),
    }
}

/// GET /api/v1/queue/stats
#[tracing::instrument(name = "http.queue_stats", skip(state))]
pub async fn queue_stats(State(state): State<AppState>) -> Result<Json<QueueCounts>, AppError> {
    let counts = state.broker.counts().await?;
    BrokerMetrics::record_counts(&counts);
    Ok(Json(counts))
}

/// GET /api/v1/queue/dead-letters - Most recent first
#[tracing::instrument(name = "http.dead_letters", skip(state))]
pub async fn dead_letters(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<DeadLetter>>, AppError> {
    let letters = state.broker.dead_letters(clamp_limit(query.limit)).await?;
    Ok(Json(letters))
}

/// GET /api/v1/audit - Newest first, optionally for one job
#[tracing::instrument(name = "http.list_audit", skip(state))]
pub async fn list_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEntry>>, AppError> {
    let entries = state
        .store
        .list_audit(query.job_id, clamp_limit(query.limit) as i64)
        .await?;
    Ok(Json(entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None), DEFAULT_LIMIT);
        assert_eq!(clamp_limit(Some(0)), DEFAULT_LIMIT);
        assert_eq!(clamp_limit(Some(7)), 7);
        assert_eq!(clamp_limit(Some(10_000)), MAX_LIMIT);
    }
}
