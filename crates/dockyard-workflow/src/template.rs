//! Parameter template language (spec §4.D): scalar literals plus `{{ path
//! }}` substitutions resolved against an explicit environment map. No
//! `eval`-style dispatch — `resolve_path` is a small recursive-descent
//! walk over dot-separated segments, grounded in the "explicit environment,
//! no eval" instruction spec §9 Design Notes calls out by name.

use std::collections::HashMap;
use std::sync::LazyLock;

use dockyard_persistence::model::RunTrigger;
use regex::Regex;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("unresolved template path: {0}")]
    UnresolvedPath(String),
}

/// One step's recorded outputs, as the template environment sees them.
#[derive(Debug, Clone, Default)]
pub struct StepEnvEntry {
    pub output: Option<Value>,
    pub response: Option<Value>,
}

/// The full `{ parameters, steps.<id>.output, steps.<id>.response,
/// shared.<name>, run.{id,triggeredBy,trigger}, asset.<id>.payload }`
/// environment a step's parameter template is resolved against.
#[derive(Debug, Clone)]
pub struct Environment {
    pub parameters: Value,
    pub steps: HashMap<String, StepEnvEntry>,
    pub shared: Value,
    pub run_id: Uuid,
    pub triggered_by: RunTrigger,
    pub trigger_payload: Option<Value>,
    pub assets: HashMap<String, Value>,
}

static WHOLE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\{\{\s*(?P<path>[^{}]+?)\s*\}\}$").unwrap());
static EMBEDDED_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*(?P<path>[^{}]+?)\s*\}\}").unwrap());

impl Environment {
    /// Resolve a dot-separated path against the environment. Every segment
    /// must exist; a missing path is a hard error (spec: "Missing paths are
    /// an immediate step failure with kind validation"), never an empty
    /// string or `null`.
    pub fn resolve_path(&self, path: &str) -> Result<Value, TemplateError> {
        let mut segments = path.split('.');
        let root = segments
            .next()
            .ok_or_else(|| TemplateError::UnresolvedPath(path.to_string()))?;

        let value = match root {
            "parameters" => walk(&self.parameters, segments, path)?,
            "shared" => walk(&self.shared, segments, path)?,
            "steps" => {
                let step_id = segments
                    .next()
                    .ok_or_else(|| TemplateError::UnresolvedPath(path.to_string()))?;
                let entry = self
                    .steps
                    .get(step_id)
                    .ok_or_else(|| TemplateError::UnresolvedPath(path.to_string()))?;
                let field = segments
                    .next()
                    .ok_or_else(|| TemplateError::UnresolvedPath(path.to_string()))?;
                let base = match field {
                    "output" => entry
                        .output
                        .as_ref()
                        .ok_or_else(|| TemplateError::UnresolvedPath(path.to_string()))?,
                    "response" => entry
                        .response
                        .as_ref()
                        .ok_or_else(|| TemplateError::UnresolvedPath(path.to_string()))?,
                    _ => return Err(TemplateError::UnresolvedPath(path.to_string())),
                };
                walk(base, segments, path)?
            }
            "asset" => {
                let asset_id = segments
                    .next()
                    .ok_or_else(|| TemplateError::UnresolvedPath(path.to_string()))?;
                let payload_field = segments
                    .next()
                    .ok_or_else(|| TemplateError::UnresolvedPath(path.to_string()))?;
                if payload_field != "payload" {
                    return Err(TemplateError::UnresolvedPath(path.to_string()));
                }
                let base = self
                    .assets
                    .get(asset_id)
                    .ok_or_else(|| TemplateError::UnresolvedPath(path.to_string()))?;
                walk(base, segments, path)?
            }
            "run" => {
                let field = segments
                    .next()
                    .ok_or_else(|| TemplateError::UnresolvedPath(path.to_string()))?;
                match field {
                    "id" => Value::String(self.run_id.to_string()),
                    "triggeredBy" => Value::String(format!("{:?}", self.triggered_by).to_lowercase()),
                    "trigger" => self.trigger_payload.clone().unwrap_or(Value::Null),
                    _ => return Err(TemplateError::UnresolvedPath(path.to_string())),
                }
            }
            _ => return Err(TemplateError::UnresolvedPath(path.to_string())),
        };
        Ok(value)
    }
}

fn walk<'a>(
    mut current: &Value,
    segments: impl Iterator<Item = &'a str>,
    full_path: &str,
) -> Result<Value, TemplateError> {
    for segment in segments {
        current = current
            .get(segment)
            .ok_or_else(|| TemplateError::UnresolvedPath(full_path.to_string()))?;
    }
    Ok(current.clone())
}

/// Resolve every `{{ path }}` occurrence in `template`, recursing through
/// objects and arrays. A string consisting of exactly one `{{ path }}`
/// (after trimming whitespace) is replaced by the resolved value verbatim,
/// preserving its type (object/array/number/bool survive as such). A string
/// with `{{ path }}` embedded among literal text has each occurrence
/// stringified and spliced in.
pub fn resolve(template: &Value, env: &Environment) -> Result<Value, TemplateError> {
    match template {
        Value::String(s) => resolve_string(s, env),
        Value::Array(items) => {
            let resolved: Result<Vec<Value>, TemplateError> =
                items.iter().map(|item| resolve(item, env)).collect();
            Ok(Value::Array(resolved?))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), resolve(value, env)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(s: &str, env: &Environment) -> Result<Value, TemplateError> {
    if let Some(captures) = WHOLE_PATTERN.captures(s) {
        let path = &captures["path"];
        return env.resolve_path(path);
    }

    if !EMBEDDED_PATTERN.is_match(s) {
        return Ok(Value::String(s.to_string()));
    }

    let mut err = None;
    let replaced = EMBEDDED_PATTERN.replace_all(s, |captures: &regex::Captures| {
        let path = &captures["path"];
        match env.resolve_path(path) {
            Ok(value) => scalar_to_string(&value),
            Err(e) => {
                err = Some(e);
                String::new()
            }
        }
    });
    if let Some(e) = err {
        return Err(e);
    }
    Ok(Value::String(replaced.into_owned()))
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env() -> Environment {
        let mut steps = HashMap::new();
        steps.insert(
            "fetch".to_string(),
            StepEnvEntry {
                output: Some(json!({"url": "https://example.com", "count": 3})),
                response: None,
            },
        );
        let mut assets = HashMap::new();
        assets.insert("dataset".to_string(), json!({"rows": 10}));
        Environment {
            parameters: json!({"repoId": "repo-1"}),
            steps,
            shared: json!({"token": "abc"}),
            run_id: Uuid::now_v7(),
            triggered_by: RunTrigger::Manual,
            trigger_payload: Some(json!({"kind": "manual"})),
            assets,
        }
    }

    #[test]
    fn whole_string_match_preserves_type() {
        let env = env();
        let resolved = resolve(&json!("{{ steps.fetch.output.count }}"), &env).unwrap();
        assert_eq!(resolved, json!(3));
    }

    #[test]
    fn embedded_match_stringifies() {
        let env = env();
        let resolved = resolve(&json!("url: {{ steps.fetch.output.url }}"), &env).unwrap();
        assert_eq!(resolved, json!("url: https://example.com"));
    }

    #[test]
    fn resolves_through_nested_objects_and_arrays() {
        let env = env();
        let template = json!({
            "repo": "{{ parameters.repoId }}",
            "items": ["{{ shared.token }}", "{{ asset.dataset.payload.rows }}"],
        });
        let resolved = resolve(&template, &env).unwrap();
        assert_eq!(
            resolved,
            json!({"repo": "repo-1", "items": ["abc", 10]})
        );
    }

    #[test]
    fn missing_path_is_an_error() {
        let env = env();
        let err = resolve(&json!("{{ steps.unknown.output }}"), &env).unwrap_err();
        assert!(matches!(err, TemplateError::UnresolvedPath(_)));
    }

    #[test]
    fn run_context_resolves() {
        let env = env();
        let resolved = resolve(&json!("{{ run.triggeredBy }}"), &env).unwrap();
        assert_eq!(resolved, json!("manual"));
    }
}
