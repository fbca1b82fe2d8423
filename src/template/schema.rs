//! Variable schema checks applied before rendering.

use chrono::{DateTime, NaiveDate};
use serde_json::{Map, Value};

use super::substitution::lookup;
use super::types::{VariableSchema, VariableType};
use super::{TemplateError, TemplateResult};

/// Minimal address check: one `@` with non-empty sides and no whitespace.
pub fn is_valid_email(address: &str) -> bool {
    let mut parts = address.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => {
            !local.is_empty()
                && !domain.is_empty()
                && !address.chars().any(char::is_whitespace)
        }
        _ => false,
    }
}

fn is_valid_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn is_valid_date(value: &str) -> bool {
    DateTime::parse_from_rfc3339(value).is_ok()
        || NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
}

fn type_matches(var_type: VariableType, value: &Value) -> bool {
    match var_type {
        VariableType::Any => true,
        VariableType::String => value.is_string(),
        VariableType::Number => value.is_number(),
        VariableType::Boolean => value.is_boolean(),
        VariableType::Email => value.as_str().is_some_and(is_valid_email),
        VariableType::Url => value.as_str().is_some_and(is_valid_url),
        VariableType::Date => value.as_str().is_some_and(is_valid_date),
    }
}

/// Check `data` against `schema`.
///
/// Entries whose name starts with `skip_scope.` are ignored; the worker
/// supplies those per recipient.
pub fn validate_variables(
    schema: &VariableSchema,
    data: &Map<String, Value>,
    skip_scope: Option<&str>,
) -> TemplateResult<()> {
    for (name, spec) in schema {
        if let Some(scope) = skip_scope {
            if name
                .strip_prefix(scope)
                .is_some_and(|rest| rest.starts_with('.'))
            {
                continue;
            }
        }

        match lookup(data, name) {
            None | Some(Value::Null) => {
                if spec.required {
                    return Err(TemplateError::MissingVariable(name.clone()));
                }
            }
            Some(value) => {
                if !type_matches(spec.var_type, value) {
                    return Err(TemplateError::InvalidVariable {
                        name: name.clone(),
                        expected: spec.var_type,
                    });
                }
            }
        }
    }
    Ok(())
}
