//! Built-in templates shipped with the binary. They are read-only.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use uuid::Uuid;

use super::types::{Template, TemplateSource, VariableSchema, VariableSpec, VariableType};

fn system_template(
    id: u128,
    name: &str,
    category: &str,
    subject: &str,
    body: &str,
    schema: &[(&str, VariableSpec)],
) -> Template {
    Template {
        id: Uuid::from_u128(id),
        name: name.to_string(),
        category: category.to_string(),
        subject_pattern: subject.to_string(),
        body_pattern: body.to_string(),
        variable_schema: schema
            .iter()
            .map(|(name, spec)| (name.to_string(), spec.clone()))
            .collect::<VariableSchema>(),
        source: TemplateSource::System,
        active: true,
        created_at: DateTime::<Utc>::UNIX_EPOCH,
        updated_at: DateTime::<Utc>::UNIX_EPOCH,
    }
}

lazy_static! {
    static ref SYSTEM_TEMPLATES: Vec<Template> = vec![
        system_template(
            0x5157_0001,
            "welcome",
            "account",
            "Welcome to {{ product }}, {{ recipient.name }}",
            "Hi {{ recipient.name }},\n\nYour {{ product }} account is ready. \
             Sign in at {{ login_url }} to get started.\n",
            &[
                ("product", VariableSpec::required(VariableType::String)),
                ("login_url", VariableSpec::required(VariableType::Url)),
            ],
        ),
        system_template(
            0x5157_0002,
            "password-reset",
            "security",
            "Reset your {{ product }} password",
            "Hi {{ recipient.name }},\n\nUse the link below to reset your password. \
             It expires on {{ expires_on }}.\n\n{{ reset_url }}\n",
            &[
                ("product", VariableSpec::required(VariableType::String)),
                ("reset_url", VariableSpec::required(VariableType::Url)),
                ("expires_on", VariableSpec::optional(VariableType::Date)),
            ],
        ),
        system_template(
            0x5157_0003,
            "announcement",
            "broadcast",
            "{{ title }}",
            "{{ message }}\n",
            &[
                ("title", VariableSpec::required(VariableType::String)),
                ("message", VariableSpec::required(VariableType::String)),
            ],
        ),
    ];
}

pub fn all() -> &'static [Template] {
    &SYSTEM_TEMPLATES
}

pub fn find_by_name(name: &str) -> Option<&'static Template> {
    SYSTEM_TEMPLATES.iter().find(|t| t.name == name)
}

pub fn find_by_id(id: Uuid) -> Option<&'static Template> {
    SYSTEM_TEMPLATES.iter().find(|t| t.id == id)
}

pub fn is_system_name(name: &str) -> bool {
    find_by_name(name).is_some()
}
