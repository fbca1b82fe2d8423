//! Compiled-template cache.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::schema::validate_variables;
use super::substitution::CompiledPattern;
use super::types::{RenderedMessage, Template, VariableSchema};
use super::TemplateResult;

/// Scope under which recipient fields are exposed to templates.
pub const RECIPIENT_SCOPE: &str = "recipient";

/// A template parsed and ready to render.
#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    pub name: String,
    subject: CompiledPattern,
    body: CompiledPattern,
    schema: VariableSchema,
}

impl CompiledTemplate {
    pub fn from_template(template: &Template) -> Self {
        Self {
            name: template.name.clone(),
            subject: CompiledPattern::compile(&template.subject_pattern),
            body: CompiledPattern::compile(&template.body_pattern),
            schema: template.variable_schema.clone(),
        }
    }

    /// Ad-hoc subject and body with no schema.
    pub fn inline(subject: &str, body: &str) -> Self {
        Self {
            name: "inline".to_string(),
            subject: CompiledPattern::compile(subject),
            body: CompiledPattern::compile(body),
            schema: VariableSchema::new(),
        }
    }

    /// Whether output differs per recipient.
    pub fn is_per_recipient(&self) -> bool {
        self.subject.has_placeholders_under(RECIPIENT_SCOPE)
            || self.body.has_placeholders_under(RECIPIENT_SCOPE)
    }

    /// Check job-level data, leaving `recipient.*` entries to the worker.
    pub fn validate_job_data(&self, data: &Map<String, Value>) -> TemplateResult<()> {
        validate_variables(&self.schema, data, Some(RECIPIENT_SCOPE))
    }

    /// Validate against the full schema and render.
    pub fn render(&self, data: &Map<String, Value>) -> TemplateResult<RenderedMessage> {
        validate_variables(&self.schema, data, None)?;
        Ok(self.render_unchecked(data))
    }

    pub fn render_unchecked(&self, data: &Map<String, Value>) -> RenderedMessage {
        RenderedMessage {
            subject: self.subject.render(data),
            body: self.body.render(data),
        }
    }
}

/// Compiled templates keyed by id, tagged with the `updated_at` they were
/// compiled from so an edit made by another process is picked up on the
/// next lookup.
#[derive(Default)]
pub struct TemplateCache {
    entries: DashMap<Uuid, (DateTime<Utc>, Arc<CompiledTemplate>)>,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile(&self, template: &Template) -> Arc<CompiledTemplate> {
        if let Some(entry) = self.entries.get(&template.id) {
            let (compiled_at, compiled) = entry.value();
            if *compiled_at == template.updated_at {
                return compiled.clone();
            }
        }

        let compiled = Arc::new(CompiledTemplate::from_template(template));
        self.entries
            .insert(template.id, (template.updated_at, compiled.clone()));
        compiled
    }

    pub fn invalidate(&self, id: Uuid) {
        self.entries.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
