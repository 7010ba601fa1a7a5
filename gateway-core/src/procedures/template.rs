//! `{{ expr }}` template evaluation for procedure steps (§4.9).

use serde_json::Value;

/// Resolve every `{{ expr }}` occurrence in `value` against `context`,
/// recursing into objects and arrays. A string that is *entirely* one
/// template (ignoring surrounding whitespace) resolves to the looked-up
/// value's own type; a template embedded in a larger string is rendered as
/// text.
#[must_use]
pub fn resolve(value: &Value, context: &Value) -> Value {
    match value {
        Value::String(s) => resolve_string(s, context),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve(v, context)).collect()),
        Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), resolve(v, context))).collect()),
        other => other.clone(),
    }
}

fn resolve_string(s: &str, context: &Value) -> Value {
    let trimmed = s.trim();
    if let Some(expr) = whole_template(trimmed) {
        return lookup(context, expr.trim()).unwrap_or(Value::Null);
    }

    let mut out = String::new();
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        let Some(end) = rest[start..].find("}}") else {
            out.push_str(rest);
            rest = "";
            break;
        };
        out.push_str(&rest[..start]);
        let expr = &rest[start + 2..start + end];
        let resolved = lookup(context, expr.trim()).unwrap_or(Value::Null);
        out.push_str(&display(&resolved));
        rest = &rest[start + end + 2..];
    }
    out.push_str(rest);
    Value::String(out)
}

fn whole_template(s: &str) -> Option<&str> {
    s.strip_prefix("{{").and_then(|rest| rest.strip_suffix("}}"))
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Dotted-path lookup: `"input.user.name"` walks object keys; a segment
/// that parses as a number indexes into an array.
#[must_use]
pub fn lookup(context: &Value, path: &str) -> Option<Value> {
    let mut current = context.clone();
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        current = match &current {
            Value::Object(map) => map.get(segment)?.clone(),
            Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get(idx)?.clone()
            }
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn whole_string_template_preserves_type() {
        let ctx = json!({"input": {"count": 5}});
        assert_eq!(resolve(&json!("{{ input.count }}"), &ctx), json!(5));
    }

    #[test]
    fn embedded_template_renders_as_text() {
        let ctx = json!({"input": {"name": "Ada"}});
        assert_eq!(resolve(&json!("hello {{ input.name }}!"), &ctx), json!("hello Ada!"));
    }

    #[test]
    fn missing_path_resolves_to_null() {
        let ctx = json!({"input": {}});
        assert_eq!(resolve(&json!("{{ input.missing }}"), &ctx), Value::Null);
    }

    #[test]
    fn nested_objects_and_arrays_resolve_recursively() {
        let ctx = json!({"input": {"id": "abc"}});
        let template = json!({"ref": "{{ input.id }}", "tags": ["{{ input.id }}"]});
        let resolved = resolve(&template, &ctx);
        assert_eq!(resolved["ref"], json!("abc"));
        assert_eq!(resolved["tags"][0], json!("abc"));
    }
}
