//! `{{ variable }}` placeholder parsing and rendering.
//!
//! Patterns are split once into literal and variable segments so repeated
//! renders (one per recipient) do not rescan the source text.

use serde_json::{Map, Value};
use smallvec::SmallVec;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(String),
}

/// A pattern split into literal text and placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPattern {
    segments: SmallVec<[Segment; 8]>,
}

fn is_variable_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

impl CompiledPattern {
    pub fn compile(source: &str) -> Self {
        let mut segments: SmallVec<[Segment; 8]> = SmallVec::new();
        let mut literal = String::new();
        let mut rest = source;

        while let Some(open) = rest.find("{{") {
            literal.push_str(&rest[..open]);
            let after_open = &rest[open + 2..];

            let placeholder = after_open.find("}}").and_then(|close| {
                let name = after_open[..close].trim();
                is_variable_name(name).then(|| (name.to_string(), close))
            });

            match placeholder {
                Some((name, close)) => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Variable(name));
                    rest = &after_open[close + 2..];
                }
                None => {
                    // Not a placeholder: keep one brace and rescan from the next one
                    literal.push('{');
                    rest = &rest[open + 1..];
                }
            }
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Self { segments }
    }

    /// Substitute placeholders; a missing or null value renders as empty text.
    pub fn render(&self, variables: &Map<String, Value>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Variable(name) => {
                    if let Some(value) = lookup(variables, name) {
                        push_value(&mut out, value);
                    }
                }
            }
        }
        out
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Variable(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    pub fn has_placeholders_under(&self, prefix: &str) -> bool {
        self.placeholders()
            .any(|name| name.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('.')))
    }
}

/// Resolve a possibly dotted variable name.
///
/// An exact top-level key wins over traversal, so `{"a.b": 1}` still
/// satisfies `{{ a.b }}`.
pub fn lookup<'a>(variables: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    if let Some(value) = variables.get(name) {
        return Some(value);
    }

    let mut parts = name.split('.');
    let mut current = variables.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn push_value(out: &mut String, value: &Value) {
    match value {
        Value::String(s) => out.push_str(s),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Null => {}
        // Arrays and objects use their JSON representation
        _ => out.push_str(&value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_substitute_simple() {
        let p = CompiledPattern::compile("Hello, {{name}}!");
        assert_eq!(p.render(&vars(json!({"name": "World"}))), "Hello, World!");
    }

    #[test]
    fn test_inner_whitespace_and_repeats() {
        let p = CompiledPattern::compile("Order {{ order_id }} / {{order_id}}");
        assert_eq!(
            p.render(&vars(json!({"order_id": "ORD-123"}))),
            "Order ORD-123 / ORD-123"
        );
    }

    #[test]
    fn test_dotted_names() {
        let p = CompiledPattern::compile("Hi {{ recipient.name }}, code {{a.b}}");
        let data = vars(json!({
            "recipient": {"name": "Ann"},
            "a.b": 7
        }));
        assert_eq!(p.render(&data), "Hi Ann, code 7");
    }

    #[test]
    fn test_missing_and_null_render_empty() {
        let p = CompiledPattern::compile("[{{missing}}][{{gone}}]");
        assert_eq!(p.render(&vars(json!({"gone": null}))), "[][]");
    }

    #[test]
    fn test_value_formatting() {
        let p = CompiledPattern::compile("{{n}} {{b}} {{list}}");
        let data = vars(json!({"n": 42, "b": true, "list": [1, 2]}));
        assert_eq!(p.render(&data), "42 true [1,2]");
    }

    #[test]
    fn test_non_placeholders_are_literal() {
        let p = CompiledPattern::compile("{{ not valid! }} {{unterminated");
        assert_eq!(p.render(&Map::new()), "{{ not valid! }} {{unterminated");
        assert_eq!(p.placeholders().count(), 0);
    }

    #[test]
    fn test_quadruple_brace_is_not_an_escape() {
        let p = CompiledPattern::compile("{{{{x}}");
        assert_eq!(p.render(&vars(json!({"x": "v"}))), "{{v");
    }

    #[test]
    fn test_placeholder_prefix_detection() {
        let p = CompiledPattern::compile("Hi {{recipient.name}} from {{recipients}}");
        assert!(p.has_placeholders_under("recipient"));
        let q = CompiledPattern::compile("Hi {{recipients}}");
        assert!(!q.has_placeholders_under("recipient"));
    }

    #[test]
    fn test_render_is_deterministic() {
        let p = CompiledPattern::compile("{{a}}-{{b.c}}");
        let data = vars(json!({"a": 1, "b": {"c": "x"}}));
        assert_eq!(p.render(&data), p.render(&data));
    }
}
