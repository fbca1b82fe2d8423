//! Template CRUD and preview endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::error::AppError;
use crate::server::AppState;
use crate::template::{
    CreateTemplateRequest, PreviewRequest, RenderedMessage, Template, TemplateListResponse,
    UpdateTemplateRequest,
};

use super::Actor;

/// POST /api/v1/templates - Create a user template
#[tracing::instrument(
    name = "http.create_template",
    skip(state, request),
    fields(name = %request.name, actor = %actor.as_str())
)]
pub async fn create_template(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<CreateTemplateRequest>,
) -> Result<(StatusCode, Json<Template>), AppError> {
    let created = state.templates.create(actor.as_str(), request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /api/v1/templates - System templates followed by user templates
#[tracing::instrument(name = "http.list_templates", skip(state))]
pub async fn list_templates(
    State(state): State<AppState>,
) -> Result<Json<TemplateListResponse>, AppError> {
    let templates = state.templates.list().await?;
    let total = templates.len();
    Ok(Json(TemplateListResponse { templates, total }))
}

/// GET /api/v1/templates/{id}
#[tracing::instrument(name = "http.get_template", skip(state))]
pub async fn get_template(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Template>, AppError> {
    Ok(Json(state.templates.get(id).await?))
}

/// PUT /api/v1/templates/{id}
#[tracing::instrument(name = "http.update_template", skip(state, request), fields(actor = %actor.as_str()))]
pub async fn update_template(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateTemplateRequest>,
) -> Result<Json<Template>, AppError> {
    Ok(Json(state.templates.update(actor.as_str(), id, request).await?))
}

/// DELETE /api/v1/templates/{id}
#[tracing::instrument(name = "http.delete_template", skip(state), fields(actor = %actor.as_str()))]
pub async fn delete_template(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.templates.delete(actor.as_str(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/templates/preview - Render with sample data
#[tracing::instrument(name = "http.preview_template", skip(state, request))]
pub async fn preview_template(
    State(state): State<AppState>,
    Json(request): Json<PreviewRequest>,
) -> Result<Json<RenderedMessage>, AppError> {
    Ok(Json(state.templates.preview(&request).await?))
}
