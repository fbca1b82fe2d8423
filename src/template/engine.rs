//! Template resolution, rendering and user-template management.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::AppError;
use crate::store::{AuditAction, AuditEntry, JobStore};

use super::cache::{CompiledTemplate, TemplateCache};
use super::system;
use super::types::{
    CreateTemplateRequest, PreviewRequest, RenderedMessage, Template, TemplateRef,
    UpdateTemplateRequest,
};
use super::TemplateError;

pub struct TemplateEngine {
    store: Arc<dyn JobStore>,
    cache: TemplateCache,
}

impl TemplateEngine {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            cache: TemplateCache::new(),
        }
    }

    pub fn cache(&self) -> &TemplateCache {
        &self.cache
    }

    /// Look up the template a job refers to. Inactive templates are rejected.
    pub async fn resolve(&self, template_ref: &TemplateRef) -> Result<Template, AppError> {
        let template = match template_ref {
            TemplateRef::System { name } => system::find_by_name(name)
                .cloned()
                .ok_or_else(|| TemplateError::NotFound(name.clone()))?,
            TemplateRef::User { id } => self
                .store
                .get_template(*id)
                .await?
                .ok_or_else(|| TemplateError::NotFound(id.to_string()))?,
        };

        if !template.active {
            return Err(TemplateError::Inactive(template.name).into());
        }
        Ok(template)
    }

    /// Resolve and compile, reusing the cache.
    pub async fn prepare(
        &self,
        template_ref: &TemplateRef,
    ) -> Result<Arc<CompiledTemplate>, AppError> {
        let template = self.resolve(template_ref).await?;
        Ok(self.cache.get_or_compile(&template))
    }

    pub async fn render(
        &self,
        template_ref: &TemplateRef,
        data: &Map<String, Value>,
    ) -> Result<RenderedMessage, AppError> {
        let compiled = self.prepare(template_ref).await?;
        Ok(compiled.render(data)?)
    }

    /// Render a template-less job. Same placeholder rules, no schema.
    pub fn render_inline(subject: &str, body: &str, data: &Map<String, Value>) -> RenderedMessage {
        CompiledTemplate::inline(subject, body).render_unchecked(data)
    }

    /// Render with sample data. Recipient fields missing from the sample
    /// render empty instead of failing the preview.
    pub async fn preview(&self, request: &PreviewRequest) -> Result<RenderedMessage, AppError> {
        let compiled = self.prepare(&request.template_ref).await?;
        compiled.validate_job_data(&request.variables)?;
        Ok(compiled.render_unchecked(&request.variables))
    }

    /// System templates followed by user templates.
    pub async fn list(&self) -> Result<Vec<Template>, AppError> {
        let mut templates: Vec<Template> = system::all().to_vec();
        templates.extend(self.store.list_templates().await?);
        Ok(templates)
    }

    pub async fn get(&self, id: Uuid) -> Result<Template, AppError> {
        if let Some(template) = system::find_by_id(id) {
            return Ok(template.clone());
        }
        self.store
            .get_template(id)
            .await?
            .ok_or_else(|| TemplateError::NotFound(id.to_string()).into())
    }

    #[tracing::instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create(
        &self,
        actor: &str,
        request: CreateTemplateRequest,
    ) -> Result<Template, AppError> {
        let template = Template::from(request);
        template.validate()?;

        if system::is_system_name(&template.name) {
            self.deny(actor, None, "create", &template.name).await;
            return Err(TemplateError::AlreadyExists(template.name).into());
        }

        self.store.insert_template(&template).await?;
        self.audit(
            AuditEntry::new(actor, AuditAction::TemplateCreated)
                .template(template.id)
                .detail(json!({ "name": template.name })),
        )
        .await;

        tracing::info!(template_id = %template.id, actor = %actor, "Template created");
        Ok(template)
    }

    #[tracing::instrument(skip(self, request))]
    pub async fn update(
        &self,
        actor: &str,
        id: Uuid,
        request: UpdateTemplateRequest,
    ) -> Result<Template, AppError> {
        if let Some(protected) = system::find_by_id(id) {
            self.deny(actor, Some(id), "update", &protected.name).await;
            return Err(TemplateError::Protected(protected.name.clone()).into());
        }

        let mut template = self
            .store
            .get_template(id)
            .await?
            .ok_or_else(|| TemplateError::NotFound(id.to_string()))?;

        request.apply(&mut template);
        template.validate()?;

        if system::is_system_name(&template.name) {
            self.deny(actor, Some(id), "rename", &template.name).await;
            return Err(TemplateError::AlreadyExists(template.name).into());
        }

        self.store.update_template(&template).await?;
        self.cache.invalidate(id);
        self.audit(
            AuditEntry::new(actor, AuditAction::TemplateUpdated)
                .template(id)
                .detail(json!({ "name": template.name })),
        )
        .await;

        tracing::info!(template_id = %id, actor = %actor, "Template updated");
        Ok(template)
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, actor: &str, id: Uuid) -> Result<(), AppError> {
        if let Some(protected) = system::find_by_id(id) {
            self.deny(actor, Some(id), "delete", &protected.name).await;
            return Err(TemplateError::Protected(protected.name.clone()).into());
        }

        self.store.delete_template(id).await?;
        self.cache.invalidate(id);
        self.audit(AuditEntry::new(actor, AuditAction::TemplateDeleted).template(id))
            .await;

        tracing::info!(template_id = %id, actor = %actor, "Template deleted");
        Ok(())
    }

    async fn deny(&self, actor: &str, id: Option<Uuid>, operation: &str, name: &str) {
        tracing::warn!(
            actor = %actor,
            operation = %operation,
            template = %name,
            "Rejected mutation of a system template"
        );

        let mut entry = AuditEntry::new(actor, AuditAction::PermissionDenied)
            .detail(json!({ "operation": operation, "template": name }));
        if let Some(id) = id {
            entry = entry.template(id);
        }
        self.audit(entry).await;
    }

    async fn audit(&self, entry: AuditEntry) {
        let action = entry.action;
        if let Err(e) = self.store.append_audit(entry).await {
            tracing::warn!(error = %e, action = %action.as_str(), "Failed to append audit entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryJobStore;
    use crate::template::{VariableSpec, VariableType};

    fn engine() -> (TemplateEngine, Arc<dyn JobStore>) {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        (TemplateEngine::new(store.clone()), store)
    }

    fn create_request(name: &str) -> CreateTemplateRequest {
        let mut schema = crate::template::VariableSchema::new();
        schema.insert("code".into(), VariableSpec::required(VariableType::String));
        CreateTemplateRequest {
            name: name.into(),
            category: "security".into(),
            subject_pattern: "Your code".into(),
            body_pattern: "Code: {{ code }}".into(),
            variable_schema: schema,
            active: true,
        }
    }

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_create_and_render_user_template() {
        let (engine, _) = engine();
        let t = engine.create("ops", create_request("otp")).await.unwrap();

        let rendered = engine
            .render(&t.template_ref(), &vars(json!({"code": "1234"})))
            .await
            .unwrap();
        assert_eq!(rendered.body, "Code: 1234");

        let err = engine
            .render(&t.template_ref(), &Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_system_name_is_reserved() {
        let (engine, store) = engine();
        let err = engine.create("ops", create_request("welcome")).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");

        let audit = store.list_audit(None, 10).await.unwrap();
        assert_eq!(audit[0].action, AuditAction::PermissionDenied);
    }

    #[tokio::test]
    async fn test_system_templates_are_read_only() {
        let (engine, store) = engine();
        let welcome = system::find_by_name("welcome").unwrap().id;

        let err = engine
            .update("ops", welcome, UpdateTemplateRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");

        let err = engine.delete("ops", welcome).await.unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");

        assert_eq!(store.list_audit(None, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rename_to_system_name_conflicts() {
        let (engine, _) = engine();
        let t = engine.create("ops", create_request("otp")).await.unwrap();

        let err = engine
            .update(
                "ops",
                t.id,
                UpdateTemplateRequest {
                    name: Some("announcement".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_duplicate_user_name_conflicts() {
        let (engine, _) = engine();
        engine.create("ops", create_request("otp")).await.unwrap();
        let err = engine.create("ops", create_request("otp")).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_update_invalidates_cache() {
        let (engine, _) = engine();
        let t = engine.create("ops", create_request("otp")).await.unwrap();
        engine.prepare(&t.template_ref()).await.unwrap();
        assert_eq!(engine.cache().len(), 1);

        engine
            .update(
                "ops",
                t.id,
                UpdateTemplateRequest {
                    body_pattern: Some("New {{ code }}".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(engine.cache().is_empty());

        let rendered = engine
            .render(&t.template_ref(), &vars(json!({"code": "9"})))
            .await
            .unwrap();
        assert_eq!(rendered.body, "New 9");
    }

    #[tokio::test]
    async fn test_inactive_template_rejected() {
        let (engine, _) = engine();
        let mut request = create_request("paused");
        request.active = false;
        let t = engine.create("ops", request).await.unwrap();

        let err = engine.prepare(&t.template_ref()).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_list_includes_system_templates() {
        let (engine, _) = engine();
        engine.create("ops", create_request("otp")).await.unwrap();
        let list = engine.list().await.unwrap();
        assert_eq!(list.len(), system::all().len() + 1);
    }

    #[tokio::test]
    async fn test_preview_tolerates_missing_recipient() {
        let (engine, _) = engine();
        let preview = engine
            .preview(&PreviewRequest {
                template_ref: TemplateRef::System {
                    name: "welcome".into(),
                },
                variables: vars(json!({"product": "Ara", "login_url": "https://a.io"})),
            })
            .await
            .unwrap();
        assert_eq!(preview.subject, "Welcome to Ara, ");
    }

    #[test]
    fn test_render_inline() {
        let rendered = TemplateEngine::render_inline(
            "Hi {{ recipient.name }}",
            "{{ note }}",
            &vars(json!({"recipient": {"name": "Bo"}, "note": "hello"})),
        );
        assert_eq!(rendered.subject, "Hi Bo");
        assert_eq!(rendered.body, "hello");
    }
}
