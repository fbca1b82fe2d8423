use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{TemplateError, TemplateResult};

/// How a job points at its template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum TemplateRef {
    /// Built-in template, addressed by its stable name
    System { name: String },
    /// Operator-managed template, addressed by id
    User { id: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemplateSource {
    System,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    String,
    Number,
    Boolean,
    Email,
    Url,
    Date,
    #[default]
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSpec {
    #[serde(rename = "type", default)]
    pub var_type: VariableType,
    #[serde(default)]
    pub required: bool,
}

impl VariableSpec {
    pub fn required(var_type: VariableType) -> Self {
        Self {
            var_type,
            required: true,
        }
    }

    pub fn optional(var_type: VariableType) -> Self {
        Self {
            var_type,
            required: false,
        }
    }
}

/// Variable name to its declared type.
pub type VariableSchema = BTreeMap<String, VariableSpec>;

/// A message template with `{{ variable }}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,

    /// Unique across system and user templates
    pub name: String,

    pub category: String,

    pub subject_pattern: String,

    pub body_pattern: String,

    #[serde(default)]
    pub variable_schema: VariableSchema,

    pub source: TemplateSource,

    pub active: bool,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Template {
    pub fn is_system(&self) -> bool {
        self.source == TemplateSource::System
    }

    pub fn template_ref(&self) -> TemplateRef {
        match self.source {
            TemplateSource::System => TemplateRef::System {
                name: self.name.clone(),
            },
            TemplateSource::User => TemplateRef::User { id: self.id },
        }
    }

    /// Validate the template
    pub fn validate(&self) -> TemplateResult<()> {
        if self.name.is_empty() || self.name.len() > 64 {
            return Err(TemplateError::InvalidTemplate(
                "Name must be 1-64 characters".to_string(),
            ));
        }

        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(TemplateError::InvalidTemplate(
                "Name must contain only alphanumeric, dash, or underscore".to_string(),
            ));
        }

        if self.category.is_empty() || self.category.len() > 64 {
            return Err(TemplateError::InvalidTemplate(
                "Category must be 1-64 characters".to_string(),
            ));
        }

        if self.subject_pattern.trim().is_empty() || self.subject_pattern.len() > 998 {
            return Err(TemplateError::InvalidTemplate(
                "Subject must be 1-998 characters".to_string(),
            ));
        }

        if self.body_pattern.trim().is_empty() {
            return Err(TemplateError::InvalidTemplate(
                "Body must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Request to create a new user template
#[derive(Debug, Deserialize)]
pub struct CreateTemplateRequest {
    pub name: String,

    pub category: String,

    pub subject_pattern: String,

    pub body_pattern: String,

    #[serde(default)]
    pub variable_schema: VariableSchema,

    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl From<CreateTemplateRequest> for Template {
    fn from(req: CreateTemplateRequest) -> Self {
        let now = Utc::now();
        Template {
            id: Uuid::new_v4(),
            name: req.name,
            category: req.category,
            subject_pattern: req.subject_pattern,
            body_pattern: req.body_pattern,
            variable_schema: req.variable_schema,
            source: TemplateSource::User,
            active: req.active,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Request to update an existing user template; absent fields are kept
#[derive(Debug, Default, Deserialize)]
pub struct UpdateTemplateRequest {
    pub name: Option<String>,

    pub category: Option<String>,

    pub subject_pattern: Option<String>,

    pub body_pattern: Option<String>,

    pub variable_schema: Option<VariableSchema>,

    pub active: Option<bool>,
}

impl UpdateTemplateRequest {
    pub fn apply(self, template: &mut Template) {
        if let Some(name) = self.name {
            template.name = name;
        }
        if let Some(category) = self.category {
            template.category = category;
        }
        if let Some(subject) = self.subject_pattern {
            template.subject_pattern = subject;
        }
        if let Some(body) = self.body_pattern {
            template.body_pattern = body;
        }
        if let Some(schema) = self.variable_schema {
            template.variable_schema = schema;
        }
        if let Some(active) = self.active {
            template.active = active;
        }
        template.updated_at = Utc::now();
    }
}

/// Render a stored template with sample data
#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub template_ref: TemplateRef,

    #[serde(default)]
    pub variables: Map<String, Value>,
}

/// Response for listing templates
#[derive(Debug, Serialize)]
pub struct TemplateListResponse {
    pub templates: Vec<Template>,

    pub total: usize,
}

/// Subject and body after substitution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}
