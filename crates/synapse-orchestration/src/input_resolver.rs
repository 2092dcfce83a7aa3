//! # Input Resolver
//!
//! Computes a step's effective parameters from its `input_mapping`. Mapping
//! values are literals or templated strings over a closed placeholder set:
//!
//! | Placeholder | Resolves to |
//! |---|---|
//! | `{$original_input}` | the task's original input |
//! | `{$task_description}` | the task description string |
//! | `{$step.<id>}` | the named antecedent step's entire result |
//! | `{$step.<id>.<key>}` | that result indexed by key (one level) |
//!
//! Substitution is string interpolation against the string form of the
//! resolved value. An unresolved placeholder fails the step — and the task —
//! with a plan error.

use std::collections::HashMap;

use serde_json::{Map, Value};

use synapse_shared::models::{FailureKind, StepFailure};

/// Everything a placeholder can resolve against
#[derive(Debug)]
pub struct ResolveContext<'a> {
    pub original_input: &'a Value,
    pub task_description: &'a str,
    /// Results of completed steps in earlier stages
    pub step_results: &'a HashMap<String, Value>,
}

/// String form used for interpolation
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolve one placeholder body (the part between `{$` and `}`)
fn resolve_placeholder(body: &str, ctx: &ResolveContext<'_>) -> Result<String, StepFailure> {
    if body == "original_input" {
        return Ok(value_to_string(ctx.original_input));
    }
    if body == "task_description" {
        return Ok(ctx.task_description.to_string());
    }
    if let Some(rest) = body.strip_prefix("step.") {
        let (step_id, key) = match rest.split_once('.') {
            Some((step_id, key)) => (step_id, Some(key)),
            None => (rest, None),
        };

        let result = ctx.step_results.get(step_id).ok_or_else(|| {
            StepFailure::new(
                FailureKind::Plan,
                format!("placeholder references step '{step_id}' with no available result"),
            )
        })?;

        return match key {
            None => Ok(value_to_string(result)),
            Some(key) => {
                let indexed = result.get(key).ok_or_else(|| {
                    StepFailure::new(
                        FailureKind::Plan,
                        format!("step '{step_id}' result has no key '{key}'"),
                    )
                })?;
                Ok(value_to_string(indexed))
            }
        };
    }

    Err(StepFailure::new(
        FailureKind::Plan,
        format!("unknown placeholder '{{{}{}}}'", "$", body),
    ))
}

/// Interpolate every `{$...}` placeholder in a template string
pub fn resolve_template(template: &str, ctx: &ResolveContext<'_>) -> Result<String, StepFailure> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{$") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let body = &after[..end];
                out.push_str(&resolve_placeholder(body, ctx)?);
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated marker: treat the remainder as literal text
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Compute a step's effective parameters: literal `parameters` as the base,
/// resolved `input_mapping` entries layered over them.
pub fn resolve_parameters(
    parameters: &Map<String, Value>,
    input_mapping: &Map<String, Value>,
    ctx: &ResolveContext<'_>,
) -> Result<Map<String, Value>, StepFailure> {
    let mut resolved = parameters.clone();

    for (key, value) in input_mapping {
        let resolved_value = match value {
            Value::String(template) if template.contains("{$") => {
                Value::String(resolve_template(template, ctx)?)
            }
            literal => literal.clone(),
        };
        resolved.insert(key.clone(), resolved_value);
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx<'a>(
        input: &'a Value,
        results: &'a HashMap<String, Value>,
    ) -> ResolveContext<'a> {
        ResolveContext {
            original_input: input,
            task_description: "summarize the report",
            step_results: results,
        }
    }

    #[test]
    fn test_original_input_placeholder() {
        let input = json!("hello");
        let results = HashMap::new();
        let out = resolve_template("{$original_input}", &ctx(&input, &results)).unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn test_task_description_placeholder() {
        let input = json!(null);
        let results = HashMap::new();
        let out = resolve_template("do: {$task_description}", &ctx(&input, &results)).unwrap();
        assert_eq!(out, "do: summarize the report");
    }

    #[test]
    fn test_step_result_whole_and_keyed() {
        let input = json!(null);
        let mut results = HashMap::new();
        results.insert("fetch".to_string(), json!({"title": "Q3", "pages": 12}));

        let whole =
            resolve_template("{$step.fetch}", &ctx(&input, &results)).unwrap();
        assert_eq!(whole, r#"{"pages":12,"title":"Q3"}"#);

        let keyed =
            resolve_template("title={$step.fetch.title}", &ctx(&input, &results)).unwrap();
        assert_eq!(keyed, "title=Q3");
    }

    #[test]
    fn test_multiple_placeholders_interpolated() {
        let input = json!("in");
        let mut results = HashMap::new();
        results.insert("a".to_string(), json!("ra"));
        results.insert("b".to_string(), json!("rb"));

        let out = resolve_template("{$step.a}+{$step.b}", &ctx(&input, &results)).unwrap();
        assert_eq!(out, "ra+rb");
    }

    #[test]
    fn test_missing_step_is_plan_error() {
        let input = json!(null);
        let results = HashMap::new();
        let err = resolve_template("{$step.ghost}", &ctx(&input, &results)).unwrap_err();
        assert_eq!(err.kind, FailureKind::Plan);
    }

    #[test]
    fn test_missing_key_is_plan_error() {
        let input = json!(null);
        let mut results = HashMap::new();
        results.insert("a".to_string(), json!({"x": 1}));
        let err = resolve_template("{$step.a.y}", &ctx(&input, &results)).unwrap_err();
        assert_eq!(err.kind, FailureKind::Plan);
    }

    #[test]
    fn test_unknown_placeholder_is_plan_error() {
        let input = json!(null);
        let results = HashMap::new();
        let err = resolve_template("{$nonsense}", &ctx(&input, &results)).unwrap_err();
        assert_eq!(err.kind, FailureKind::Plan);
    }

    #[test]
    fn test_unterminated_marker_stays_literal() {
        let input = json!(null);
        let results = HashMap::new();
        let out = resolve_template("brace {$unclosed", &ctx(&input, &results)).unwrap();
        assert_eq!(out, "brace {$unclosed");
    }

    #[test]
    fn test_parameters_layering() {
        let input = json!("text");
        let results = HashMap::new();

        let mut parameters = Map::new();
        parameters.insert("model".to_string(), json!("small"));
        parameters.insert("prompt".to_string(), json!("overridden below"));

        let mut mapping = Map::new();
        mapping.insert("prompt".to_string(), json!("{$original_input}"));
        mapping.insert("depth".to_string(), json!(3));

        let resolved =
            resolve_parameters(&parameters, &mapping, &ctx(&input, &results)).unwrap();
        assert_eq!(resolved["model"], "small");
        assert_eq!(resolved["prompt"], "text");
        assert_eq!(resolved["depth"], 3);
    }

    #[test]
    fn test_literal_braces_untouched() {
        let input = json!(null);
        let results = HashMap::new();
        let out = resolve_template("json {\"k\": 1}", &ctx(&input, &results)).unwrap();
        assert_eq!(out, "json {\"k\": 1}");
    }
}
