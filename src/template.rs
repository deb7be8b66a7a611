//! C2 — template resolver.
//!
//! Expands `{{ expr }}` references in config/input values against the
//! aggregated `step_data` output map, per spec §4.3/§6. `expr` is a dotted
//! path rooted at `$` (project input), `steps.<name>.output[...]`, or a
//! `variables.<key>`/`input.<key>` reference. Whitespace inside the braces is
//! trimmed. Missing paths resolve to the empty string and emit a warning
//! (they never fail the step). Resolution is non-recursive: a resolved value
//! that itself contains `{{ }}` is left as literal text (spec §9 Open
//! Question, decided in DESIGN.md).

use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

/// Everything the resolver needs to look a path up.
pub struct ResolveContext<'a> {
    /// Project-level `$`/`input.<key>` payload.
    pub input: &'a Value,
    /// Project `variables` map.
    pub variables: &'a HashMap<String, Value>,
    /// Completed step outputs keyed by step *name* (not id — templates
    /// address steps by name per spec grammar `steps.<name>.output`).
    pub step_outputs_by_name: &'a HashMap<String, Value>,
}

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Resolves all `{{ expr }}` occurrences in `value`, recursing into arrays
/// and objects but never re-expanding a resolved string's own templates.
pub fn resolve_value(value: &Value, ctx: &ResolveContext) -> Value {
    match value {
        Value::String(s) => resolve_string(s, ctx),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, ctx)).collect()),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, ctx));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Resolves a single string. If the entire string is exactly one
/// `{{ expr }}` occurrence, the resolved (possibly non-string) value is
/// returned directly so `{{ steps.a.output }}` can yield an object.
/// Otherwise every occurrence is substituted as its string form.
fn resolve_string(s: &str, ctx: &ResolveContext) -> Value {
    if let Some(expr) = whole_string_expr(s) {
        return lookup(expr, ctx);
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];
        match after_open.find(CLOSE) {
            Some(end) => {
                let expr = after_open[..end].trim();
                out.push_str(&value_to_string(&lookup(expr, ctx)));
                rest = &after_open[end + CLOSE.len()..];
            }
            None => {
                // unterminated `{{` — treat the rest as literal text.
                out.push_str(&rest[start..]);
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    Value::String(out)
}

/// If `s` is exactly `{{ expr }}` with no surrounding text, returns `expr`
/// trimmed.
fn whole_string_expr(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    let inner = trimmed.strip_prefix(OPEN)?.strip_suffix(CLOSE)?;
    if inner.contains(OPEN) {
        return None;
    }
    Some(inner.trim())
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Resolves one dotted path expression against the context.
fn lookup(expr: &str, ctx: &ResolveContext) -> Value {
    let parts: Vec<&str> = expr.split('.').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        warn!(expr, "empty template expression");
        return Value::String(String::new());
    }

    let root = parts[0];
    let resolved = if root == "$" {
        Some(ctx.input.clone())
    } else if root == "input" {
        index_path(ctx.input, &parts[1..])
    } else if root == "variables" {
        if parts.len() < 2 {
            None
        } else {
            ctx.variables.get(parts[1]).cloned().and_then(|v| index_path(&v, &parts[2..]))
        }
    } else if root == "steps" {
        if parts.len() < 3 || parts[2] != "output" {
            None
        } else {
            let step_name = parts[1];
            ctx.step_outputs_by_name
                .get(step_name)
                .cloned()
                .and_then(|v| index_path(&v, &parts[3..]))
        }
    } else {
        None
    };

    resolved.unwrap_or_else(|| {
        warn!(expr, "template path did not resolve; substituting empty string");
        Value::String(String::new())
    })
}

/// Walks the remaining dotted/indexed segments of a path into a JSON value.
/// Each segment is either a plain object key or a `name[idx]` array index.
fn index_path(root: &Value, segments: &[&str]) -> Option<Value> {
    let mut current = root.clone();
    for segment in segments {
        let (key, indices) = split_indices(segment);
        if !key.is_empty() {
            current = current.get(key)?.clone();
        }
        for idx in indices {
            current = current.get(idx)?.clone();
        }
    }
    Some(current)
}

/// Splits `foo[0][1]` into (`"foo"`, `[0, 1]`).
fn split_indices(segment: &str) -> (&str, Vec<usize>) {
    match segment.find('[') {
        None => (segment, vec![]),
        Some(pos) => {
            let key = &segment[..pos];
            let mut indices = Vec::new();
            let mut rest = &segment[pos..];
            while let Some(open) = rest.strip_prefix('[') {
                if let Some(close) = open.find(']') {
                    if let Ok(idx) = open[..close].parse::<usize>() {
                        indices.push(idx);
                    }
                    rest = &open[close + 1..];
                } else {
                    break;
                }
            }
            (key, indices)
        }
    }
}

/// Builds a `step_id -> name` lookup the caller can combine with the
/// executor's `step_id -> output` map to produce `step_outputs_by_name`.
pub fn name_keyed_outputs(
    steps_by_id: &HashMap<Uuid, crate::model::Step>,
    step_data: &HashMap<Uuid, Value>,
) -> HashMap<String, Value> {
    step_data
        .iter()
        .filter_map(|(id, out)| steps_by_id.get(id).map(|s| (s.name.clone(), out.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx<'a>(
        input: &'a Value,
        variables: &'a HashMap<String, Value>,
        outputs: &'a HashMap<String, Value>,
    ) -> ResolveContext<'a> {
        ResolveContext {
            input,
            variables,
            step_outputs_by_name: outputs,
        }
    }

    #[test]
    fn whole_string_template_yields_object() {
        let input = Value::Null;
        let variables = HashMap::new();
        let mut outputs = HashMap::new();
        outputs.insert("a".to_string(), json!({"x": 1}));
        let c = ctx(&input, &variables, &outputs);

        let resolved = resolve_value(&json!("{{ steps.a.output }}"), &c);
        assert_eq!(resolved, json!({"x": 1}));
    }

    #[test]
    fn mixed_string_yields_string_substitution() {
        let input = Value::Null;
        let variables = HashMap::new();
        let mut outputs = HashMap::new();
        outputs.insert("a".to_string(), json!("x"));
        let c = ctx(&input, &variables, &outputs);

        let resolved = resolve_value(&json!("prompt: {{ steps.a.output }}!"), &c);
        assert_eq!(resolved, json!("prompt: x!"));
    }

    #[test]
    fn missing_path_resolves_to_empty_string() {
        let input = Value::Null;
        let variables = HashMap::new();
        let outputs = HashMap::new();
        let c = ctx(&input, &variables, &outputs);

        let resolved = resolve_value(&json!("{{ steps.ghost.output }}"), &c);
        assert_eq!(resolved, json!(""));
    }

    #[test]
    fn nested_templates_are_not_re_expanded() {
        let input = Value::Null;
        let variables = HashMap::new();
        let mut outputs = HashMap::new();
        outputs.insert("a".to_string(), json!("{{ steps.b.output }}"));
        let c = ctx(&input, &variables, &outputs);

        let resolved = resolve_value(&json!("{{ steps.a.output }}"), &c);
        assert_eq!(resolved, json!("{{ steps.b.output }}"));
    }

    #[test]
    fn indexed_and_dotted_path_resolves() {
        let input = Value::Null;
        let variables = HashMap::new();
        let mut outputs = HashMap::new();
        outputs.insert("a".to_string(), json!({"items": [{"k": "v1"}, {"k": "v2"}]}));
        let c = ctx(&input, &variables, &outputs);

        let resolved = resolve_value(&json!("{{ steps.a.output.items[1].k }}"), &c);
        assert_eq!(resolved, json!("v2"));
    }

    #[test]
    fn variables_and_input_paths_resolve() {
        let input = json!({"name": "world"});
        let mut variables = HashMap::new();
        variables.insert("greeting".to_string(), json!("hello"));
        let outputs = HashMap::new();
        let c = ctx(&input, &variables, &outputs);

        assert_eq!(resolve_value(&json!("{{ variables.greeting }}"), &c), json!("hello"));
        assert_eq!(resolve_value(&json!("{{ input.name }}"), &c), json!("world"));
        assert_eq!(resolve_value(&json!("{{ $ }}"), &c), json!({"name": "world"}));
    }
}
