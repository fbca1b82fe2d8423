//! Message template system.
//!
//! This module provides:
//! - Template definitions with `{{ variable }}` placeholders and a typed
//!   variable schema
//! - Built-in system templates and operator-managed user templates
//! - A compiled-template cache and the rendering engine used by workers
//!
//! # Example
//!
//! ```ignore
//! let engine = TemplateEngine::new(store.clone());
//!
//! let rendered = engine
//!     .render(
//!         &TemplateRef::System { name: "welcome".into() },
//!         json!({
//!             "product": "Ara",
//!             "login_url": "https://ara.example.com",
//!             "recipient": { "name": "Ann" }
//!         })
//!         .as_object()
//!         .unwrap(),
//!     )
//!     .await?;
//! ```

mod cache;
mod engine;
mod schema;
mod substitution;
pub mod system;
mod types;

use thiserror::Error;

use crate::error::AppError;

pub use cache::{CompiledTemplate, TemplateCache, RECIPIENT_SCOPE};
pub use engine::TemplateEngine;
pub use schema::{is_valid_email, validate_variables};
pub use substitution::CompiledPattern;
pub use types::{
    CreateTemplateRequest, PreviewRequest, RenderedMessage, Template, TemplateListResponse,
    TemplateRef, TemplateSource, UpdateTemplateRequest, VariableSchema, VariableSpec,
    VariableType,
};

/// Template-specific error type
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Template not found: {0}")]
    NotFound(String),

    #[error("Template name already in use: {0}")]
    AlreadyExists(String),

    #[error("System template '{0}' is read-only")]
    Protected(String),

    #[error("Template '{0}' is inactive")]
    Inactive(String),

    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    #[error("Missing required variable: {0}")]
    MissingVariable(String),

    #[error("Variable '{name}' must be of type {expected:?}")]
    InvalidVariable { name: String, expected: VariableType },
}

/// Result type for template operations
pub type TemplateResult<T> = Result<T, TemplateError>;

impl From<TemplateError> for AppError {
    fn from(err: TemplateError) -> Self {
        match err {
            TemplateError::NotFound(_) => AppError::NotFound(err.to_string()),
            TemplateError::AlreadyExists(_) => AppError::Conflict(err.to_string()),
            TemplateError::Protected(_) => AppError::Permission(err.to_string()),
            TemplateError::Inactive(_)
            | TemplateError::InvalidTemplate(_)
            | TemplateError::MissingVariable(_)
            | TemplateError::InvalidVariable { .. } => AppError::Validation(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            AppError::from(TemplateError::NotFound("x".into())).code(),
            "NOT_FOUND"
        );
        assert_eq!(
            AppError::from(TemplateError::Protected("welcome".into())).code(),
            "PERMISSION_DENIED"
        );
        let missing = AppError::from(TemplateError::MissingVariable("name".into()));
        assert_eq!(missing.code(), "VALIDATION_ERROR");
        assert!(missing.to_string().contains("name"));
    }
}
