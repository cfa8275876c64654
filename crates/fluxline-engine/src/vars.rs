//! Variable resolution
//!
//! Input templates and text fields may contain `{{scope.path}}` placeholders,
//! where `scope` is one of `form`, `system`, or `node`. This module is a
//! small dedicated scanner/resolver kept apart from the engine's control
//! flow: parsing produces the referenced paths, resolution fills them from
//! an execution context. Resolution is pure and deterministic.

use serde_json::Value;

use crate::context::ContextView;
use crate::error::{EngineError, Result};

/// The namespace a variable path belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// User-supplied form data, seeded at run start.
    Form,
    /// Run metadata supplied by the surrounding service.
    System,
    /// An upstream node's output (`node.<id>.<field>`).
    Node,
}

impl Scope {
    /// Classify a dotted path by its leading segment.
    pub fn of(path: &str) -> Option<Scope> {
        match path.split('.').next()? {
            "form" => Some(Scope::Form),
            "system" => Some(Scope::System),
            "node" => Some(Scope::Node),
            _ => None,
        }
    }
}

/// For a `node.<id>.<field>` path, extract the referenced node id.
pub fn node_ref(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("node.")?;
    let id = rest.split('.').next()?;
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

/// Scan a text for `{{...}}` placeholders, returning the referenced paths.
///
/// Paths are trimmed; malformed openers without a closing `}}` are ignored
/// (they resolve as literal text).
pub fn parse_refs(text: &str) -> Vec<String> {
    let mut refs = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            break;
        };
        let path = after[..close].trim();
        if !path.is_empty() {
            refs.push(path.to_string());
        }
        rest = &after[close + 2..];
    }
    refs
}

/// Collect every placeholder path appearing anywhere in a JSON template.
pub fn template_refs(template: &Value) -> Vec<String> {
    let mut refs = Vec::new();
    collect_refs(template, &mut refs);
    refs
}

fn collect_refs(value: &Value, refs: &mut Vec<String>) {
    match value {
        Value::String(s) => refs.extend(parse_refs(s)),
        Value::Array(items) => {
            for item in items {
                collect_refs(item, refs);
            }
        }
        Value::Object(map) => {
            for sub in map.values() {
                collect_refs(sub, refs);
            }
        }
        _ => {}
    }
}

/// Resolve all placeholders in a text against the context.
///
/// A text that is exactly one placeholder resolves to the referenced value
/// unchanged (preserving numbers, objects, arrays). Mixed text interpolates
/// each value into a string.
pub fn resolve_text<C: ContextView + ?Sized>(
    text: &str,
    ctx: &C,
    node_id: &str,
) -> Result<Value> {
    let trimmed = text.trim();
    if trimmed.starts_with("{{") && trimmed.ends_with("}}") {
        let inner = trimmed[2..trimmed.len() - 2].trim();
        if !inner.is_empty() && !inner.contains("{{") && !inner.contains("}}") {
            return lookup(inner, ctx, node_id).cloned();
        }
    }

    let mut out = String::new();
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            // No closing braces: keep the remainder literally
            out.push_str(&rest[open..]);
            return Ok(Value::String(out));
        };
        let path = after[..close].trim();
        if path.is_empty() {
            out.push_str("{{}}");
        } else {
            out.push_str(&render(lookup(path, ctx, node_id)?));
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// Resolve a full JSON template: strings are placeholder-expanded, objects
/// and arrays recurse, other values pass through untouched.
pub fn resolve_template<C: ContextView + ?Sized>(
    template: &Value,
    ctx: &C,
    node_id: &str,
) -> Result<Value> {
    match template {
        Value::String(s) => resolve_text(s, ctx, node_id),
        Value::Array(items) => {
            let resolved = items
                .iter()
                .map(|item| resolve_template(item, ctx, node_id))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Array(resolved))
        }
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, sub) in map {
                resolved.insert(key.clone(), resolve_template(sub, ctx, node_id)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn lookup<'a, C: ContextView + ?Sized>(
    path: &str,
    ctx: &'a C,
    node_id: &str,
) -> Result<&'a Value> {
    ctx.lookup(path).ok_or_else(|| EngineError::UndefinedVariable {
        path: path.to_string(),
        node_id: node_id.to_string(),
    })
}

/// Render a value for string interpolation (strings unquoted).
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        ExecutionContext::seeded(
            &json!({"name": "Ada", "age": 20}),
            &json!({"runId": "r-1"}),
        )
    }

    #[test]
    fn test_parse_refs() {
        assert_eq!(
            parse_refs("Hello {{form.name}}, run {{ system.runId }}"),
            vec!["form.name", "system.runId"]
        );
        assert!(parse_refs("no placeholders").is_empty());
        // Unterminated placeholder is ignored
        assert!(parse_refs("broken {{form.name").is_empty());
    }

    #[test]
    fn test_scope_classification() {
        assert_eq!(Scope::of("form.age"), Some(Scope::Form));
        assert_eq!(Scope::of("node.draft.text"), Some(Scope::Node));
        assert_eq!(Scope::of("bogus.x"), None);
        assert_eq!(node_ref("node.draft.text"), Some("draft"));
        assert_eq!(node_ref("form.age"), None);
    }

    #[test]
    fn test_whole_placeholder_preserves_type() {
        let resolved = resolve_text("{{form.age}}", &ctx(), "n1").unwrap();
        assert_eq!(resolved, json!(20));
    }

    #[test]
    fn test_interpolation() {
        let resolved = resolve_text("{{form.name}} is {{form.age}}", &ctx(), "n1").unwrap();
        assert_eq!(resolved, json!("Ada is 20"));
    }

    #[test]
    fn test_undefined_reference_names_path_and_node() {
        let err = resolve_text("{{form.missing}}", &ctx(), "summarize").unwrap_err();
        match err {
            EngineError::UndefinedVariable { path, node_id } => {
                assert_eq!(path, "form.missing");
                assert_eq!(node_id, "summarize");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_resolve_template_recurses() {
        let template = json!({
            "prompt": "Summarize for {{form.name}}",
            "options": {"maxTokens": 64, "user": "{{form.name}}"},
            "tags": ["{{system.runId}}"]
        });
        let resolved = resolve_template(&template, &ctx(), "n1").unwrap();
        assert_eq!(resolved["prompt"], json!("Summarize for Ada"));
        assert_eq!(resolved["options"]["maxTokens"], json!(64));
        assert_eq!(resolved["tags"][0], json!("r-1"));
    }

    #[test]
    fn test_template_refs() {
        let template = json!({
            "a": "{{form.x}}",
            "b": {"c": ["{{node.up.text}} and {{system.t}}"]}
        });
        let mut refs = template_refs(&template);
        refs.sort();
        assert_eq!(refs, vec!["form.x", "node.up.text", "system.t"]);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let template = json!({"p": "{{form.name}}-{{form.age}}"});
        let a = resolve_template(&template, &ctx(), "n1").unwrap();
        let b = resolve_template(&template, &ctx(), "n1").unwrap();
        assert_eq!(a, b);
    }
}
