use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::server::{api_key_auth, AppState};

use super::health::health;
use super::jobs::{archive_job, cancel_job, get_job, job_deliveries, list_jobs, submit_job};
use super::metrics::prometheus_metrics;
use super::queue::{dead_letters, list_audit, queue_stats};
use super::templates::{
    create_template, delete_template, get_template, list_templates, preview_template,
    update_template,
};

/// Versioned API, gated by the optional API key.
fn v1_routes(state: AppState) -> Router<AppState> {
    Router::new()
        // Jobs
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/deliveries", get(job_deliveries))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/jobs/{id}/archive", post(archive_job))
        // Templates
        .route("/templates", get(list_templates).post(create_template))
        .route("/templates/preview", post(preview_template))
        .route(
            "/templates/{id}",
            get(get_template).put(update_template).delete(delete_template),
        )
        // Broker inspection
        .route("/queue/stats", get(queue_stats))
        .route("/queue/dead-letters", get(dead_letters))
        .route("/audit", get(list_audit))
        .layer(middleware::from_fn_with_state(state, api_key_auth))
}

pub fn api_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .nest("/api/v1", v1_routes(state))
}
