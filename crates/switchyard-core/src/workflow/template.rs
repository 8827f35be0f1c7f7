//! Run scope construction and input template resolution.
//!
//! The run scope is the JSON view of a run that templates and expressions
//! read from:
//!
//! ```json
//! { "input": { ... }, "stages": { "<id>": { "status": "succeeded", "output": ... } } }
//! ```
//!
//! Templates are arbitrary JSON. Only string leaves are rewritten: a string
//! that is exactly one `{{ path }}` marker becomes the referenced value with
//! its JSON type preserved, while markers embedded in longer text are
//! interpolated as text. Unresolvable references become `null` (whole
//! string) or empty text (embedded).

use serde_json::{Map, Value, json};

use switchyard_types::run::StageRecord;

/// Build the run scope from the run input and the current stage records.
pub fn build_scope(input: &Value, records: &[StageRecord]) -> Value {
    let stages: Map<String, Value> = records
        .iter()
        .map(|record| {
            (
                record.stage_id.clone(),
                json!({
                    "status": record.status.as_str(),
                    "output": record.output.clone().unwrap_or(Value::Null),
                }),
            )
        })
        .collect();
    json!({ "input": input, "stages": stages })
}

/// Payload for a stage without a template: the run input plus the outputs
/// of its direct dependencies.
pub fn default_payload(input: &Value, dependencies: &[(&str, Option<&Value>)]) -> Value {
    let deps: Map<String, Value> = dependencies
        .iter()
        .map(|(id, output)| (id.to_string(), output.cloned().unwrap_or(Value::Null)))
        .collect();
    json!({ "input": input, "dependencies": deps })
}

/// Resolve every string leaf of `template` against `scope`.
pub fn resolve_template(template: &Value, scope: &Value) -> Value {
    match template {
        Value::String(s) => resolve_string(s, scope),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_template(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_template(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(s: &str, scope: &Value) -> Value {
    if let Some(path) = whole_marker(s) {
        return lookup(scope, path).cloned().unwrap_or(Value::Null);
    }
    if !s.contains("{{") {
        return Value::String(s.to_string());
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let path = after_open[..end].trim();
        if let Some(value) = lookup(scope, path) {
            push_text(&mut out, value);
        }
        rest = &after_open[end + 2..];
    }
    out.push_str(rest);
    Value::String(out)
}

/// `Some(path)` if the whole string is a single `{{ path }}` marker.
fn whole_marker(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

fn push_text(out: &mut String, value: &Value) {
    match value {
        Value::Null => {}
        Value::String(s) => out.push_str(s),
        other => out.push_str(&other.to_string()),
    }
}

/// Follow a dotted path (`stages.search.output.items.0`) through the scope.
pub fn lookup<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(scope, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_types::run::StageStatus;

    fn scope() -> Value {
        let mut search = StageRecord::pending("search");
        search.status = StageStatus::Succeeded;
        search.output = Some(json!({ "hits": 3, "items": ["a", "b"] }));
        let skipped = {
            let mut r = StageRecord::pending("skipped");
            r.status = StageStatus::Skipped;
            r
        };
        build_scope(&json!({ "topic": "rust", "n": 2 }), &[search, skipped])
    }

    #[test]
    fn test_build_scope_shape() {
        let scope = scope();
        assert_eq!(scope["input"]["topic"], "rust");
        assert_eq!(scope["stages"]["search"]["status"], "succeeded");
        assert_eq!(scope["stages"]["search"]["output"]["hits"], 3);
        assert_eq!(scope["stages"]["skipped"]["output"], Value::Null);
    }

    #[test]
    fn test_whole_marker_preserves_type() {
        let resolved = resolve_template(&json!("{{ stages.search.output }}"), &scope());
        assert_eq!(resolved, json!({ "hits": 3, "items": ["a", "b"] }));

        let n = resolve_template(&json!("{{input.n}}"), &scope());
        assert_eq!(n, json!(2));
    }

    #[test]
    fn test_embedded_markers_interpolate_text() {
        let resolved = resolve_template(
            &json!("Summarize {{ input.topic }} ({{ stages.search.output.hits }} hits)"),
            &scope(),
        );
        assert_eq!(resolved, json!("Summarize rust (3 hits)"));
    }

    #[test]
    fn test_nested_template_structure() {
        let template = json!({
            "prompt": "About {{ input.topic }}",
            "context": ["{{ stages.search.output.items.1 }}", 7, true],
            "meta": { "source": "{{ stages.search.status }}" }
        });
        let resolved = resolve_template(&template, &scope());
        assert_eq!(resolved["prompt"], "About rust");
        assert_eq!(resolved["context"], json!(["b", 7, true]));
        assert_eq!(resolved["meta"]["source"], "succeeded");
    }

    #[test]
    fn test_unresolvable_references() {
        assert_eq!(resolve_template(&json!("{{ stages.nope.output }}"), &scope()), Value::Null);
        assert_eq!(
            resolve_template(&json!("x{{ input.missing }}y"), &scope()),
            json!("xy")
        );
    }

    #[test]
    fn test_unclosed_marker_left_alone() {
        assert_eq!(
            resolve_template(&json!("price {{ input.n"), &scope()),
            json!("price {{ input.n")
        );
    }

    #[test]
    fn test_default_payload() {
        let out = json!("done");
        let payload = default_payload(&json!({"q": 1}), &[("a", Some(&out)), ("b", None)]);
        assert_eq!(payload["input"]["q"], 1);
        assert_eq!(payload["dependencies"]["a"], "done");
        assert_eq!(payload["dependencies"]["b"], Value::Null);
    }
}
