//! Structural validation of generator output.
//!
//! Raw text is decoded into the six RFC 6902 operation kinds with a named
//! error for every way it can be malformed, then each operation is checked
//! against the target document by applying the sequence to a scratch copy.
//! Operations written against the top-level `spec` of a kind that nests its
//! pod template are rebased onto the nested pod spec.

use super::{apply_operation, parse_pointer, Patch, PatchOperation, PatchSource};
use crate::manifest::{self, POD_SPEC_FIELDS, POD_SPEC_POINTERS};
use crate::util::truncate;
use serde_json::{Map, Value};

const PREVIEW_CHARS: usize = 160;
const NESTED_TEMPLATE_REASON: &str =
    "pod spec field addressed at top-level spec of a workload with a nested pod template";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    #[error("no parseable JSON array in generator output: {0}")]
    NotJson(String),
    #[error("top-level value is not an array of operation objects: {0}")]
    NotArray(String),
    #[error("operation {index} is invalid: {reason}")]
    InvalidOp { index: usize, reason: String },
    #[error("operation {index} path {path} does not apply: {reason}")]
    PathNotApplicable {
        index: usize,
        path: String,
        reason: String,
    },
}

impl GuardError {
    pub fn category(&self) -> &'static str {
        match self {
            GuardError::NotJson(_) => "not_json",
            GuardError::NotArray(_) => "not_array",
            GuardError::InvalidOp { .. } => "invalid_op",
            GuardError::PathNotApplicable { .. } => "path_not_applicable",
        }
    }
}

/// Decode and validate `raw` against `document`.
pub fn guard(
    raw: &str,
    document: &Value,
    id: &str,
    policy_id: &str,
    source: PatchSource,
) -> Result<Patch, GuardError> {
    let ops = decode_operations(raw)?;
    let ops = validate_operations(&ops, document)?;
    Ok(Patch::new(id, policy_id, source, ops))
}

/// Strip markdown code fences from generator output
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = if let Some(rest) = trimmed.strip_prefix("```json") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest
    } else {
        trimmed
    };
    let clean = clean.strip_suffix("```").unwrap_or(clean);
    clean.trim()
}

/// Extract a JSON fragment between matching delimiters
fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if start <= end {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Decode generator text into typed operations without consulting a document.
pub fn decode_operations(raw: &str) -> Result<Vec<PatchOperation>, GuardError> {
    let clean = strip_markdown_fences(raw);
    let value = match serde_json::from_str::<Value>(clean) {
        Ok(value) => value,
        Err(_) => {
            let fragment = extract_json_fragment(clean, '[', ']')
                .ok_or_else(|| GuardError::NotJson(truncate(clean, PREVIEW_CHARS)))?;
            serde_json::from_str::<Value>(fragment).map_err(|e| {
                GuardError::NotJson(format!("{} in {}", e, truncate(fragment, PREVIEW_CHARS)))
            })?
        }
    };

    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(GuardError::NotArray(format!(
                "found {}",
                json_type_name(&other)
            )))
        }
    };

    items
        .iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::Object(map) => decode_operation(index, map),
            other => Err(GuardError::NotArray(format!(
                "element {} is {}",
                index,
                json_type_name(other)
            ))),
        })
        .collect()
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn decode_operation(index: usize, map: &Map<String, Value>) -> Result<PatchOperation, GuardError> {
    let invalid = |reason: String| GuardError::InvalidOp { index, reason };
    let op = map
        .get("op")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing string field 'op'".to_string()))?;
    let pointer = |field: &str| -> Result<String, GuardError> {
        let text = map
            .get(field)
            .and_then(Value::as_str)
            .ok_or_else(|| invalid(format!("'{}' requires string field '{}'", op, field)))?;
        parse_pointer(text).map_err(|e| invalid(format!("{} '{}': {}", field, text, e)))?;
        Ok(text.to_string())
    };
    let value = || -> Result<Value, GuardError> {
        map.get("value")
            .cloned()
            .ok_or_else(|| invalid(format!("'{}' requires field 'value'", op)))
    };

    match op {
        "add" => Ok(PatchOperation::Add {
            path: pointer("path")?,
            value: value()?,
        }),
        "remove" => Ok(PatchOperation::Remove {
            path: pointer("path")?,
        }),
        "replace" => Ok(PatchOperation::Replace {
            path: pointer("path")?,
            value: value()?,
        }),
        "move" => Ok(PatchOperation::Move {
            from: pointer("from")?,
            path: pointer("path")?,
        }),
        "copy" => Ok(PatchOperation::Copy {
            from: pointer("from")?,
            path: pointer("path")?,
        }),
        "test" => Ok(PatchOperation::Test {
            path: pointer("path")?,
            value: value()?,
        }),
        other => Err(invalid(format!("unknown op '{}'", other))),
    }
}

/// Check every operation resolves when the sequence is applied in order,
/// returning the operations with any nested pod-spec rebasing applied.
pub fn validate_operations(
    ops: &[PatchOperation],
    document: &Value,
) -> Result<Vec<PatchOperation>, GuardError> {
    let mut working = document.clone();
    let mut accepted = Vec::with_capacity(ops.len());

    for (index, op) in ops.iter().enumerate() {
        let misplaced = targets_wrapper_spec(op, &working);
        if !misplaced {
            let mut trial = working.clone();
            match apply_operation(&mut trial, op) {
                Ok(()) => {
                    working = trial;
                    accepted.push(op.clone());
                    continue;
                }
                Err(failure) => {
                    if let Some((rebased, patched)) = rebase_onto_nested(op, &working) {
                        working = patched;
                        accepted.push(rebased);
                        continue;
                    }
                    return Err(GuardError::PathNotApplicable {
                        index,
                        path: op.path().to_string(),
                        reason: failure.to_string(),
                    });
                }
            }
        }

        match rebase_onto_nested(op, &working) {
            Some((rebased, patched)) => {
                working = patched;
                accepted.push(rebased);
            }
            None => {
                return Err(GuardError::PathNotApplicable {
                    index,
                    path: op.path().to_string(),
                    reason: NESTED_TEMPLATE_REASON.to_string(),
                })
            }
        }
    }

    Ok(accepted)
}

/// A `/spec/<pod field>` pointer on a document whose `spec` wraps a template.
fn targets_wrapper_spec(op: &PatchOperation, document: &Value) -> bool {
    if !manifest::has_nested_pod_spec(document)
        || manifest::pod_spec_pointers(document).contains(&"/spec")
    {
        return false;
    }
    let addresses_pod_field = |pointer: &str| {
        pointer
            .strip_prefix("/spec/")
            .and_then(|rest| rest.split('/').next())
            .is_some_and(|field| POD_SPEC_FIELDS.contains(&field))
    };
    addresses_pod_field(op.path()) || op.from().is_some_and(addresses_pod_field)
}

/// Longest pod-spec prefix of `pointer` and the remainder below it.
fn split_pod_spec_prefix(pointer: &str) -> Option<(&'static str, &str)> {
    POD_SPEC_POINTERS.iter().find_map(|prefix| {
        let rest = pointer.strip_prefix(prefix)?;
        rest.starts_with('/').then_some((*prefix, rest))
    })
}

fn rebase_onto_nested(op: &PatchOperation, working: &Value) -> Option<(PatchOperation, Value)> {
    let (stripped, _) = split_pod_spec_prefix(op.path())?;
    for target in manifest::pod_spec_pointers(working) {
        if target == stripped || target == "/spec" {
            continue;
        }
        let rebased = op.map_pointers(|pointer| match split_pod_spec_prefix(pointer) {
            Some((prefix, rest)) if prefix == stripped => format!("{}{}", target, rest),
            _ => pointer.to_string(),
        });
        let mut trial = working.clone();
        if apply_operation(&mut trial, &rebased).is_ok() {
            tracing::debug!(
                from = op.path(),
                to = rebased.path(),
                "rebased operation onto nested pod spec"
            );
            return Some((rebased, trial));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parse_manifest;
    use serde_json::json;

    fn pod() -> Value {
        parse_manifest(
            "kind: Pod\nmetadata:\n  name: web\nspec:\n  containers:\n    - name: app\n      image: app:latest\n",
        )
        .unwrap()
    }

    fn cronjob() -> Value {
        parse_manifest(
            r#"
kind: CronJob
metadata:
  name: nightly
spec:
  schedule: "@daily"
  jobTemplate:
    spec:
      template:
        spec:
          containers:
            - name: job
              image: busybox:latest
              securityContext:
                privileged: true
"#,
        )
        .unwrap()
    }

    #[test]
    fn strips_fences_and_commentary() {
        let raw = "Here is the fix:\n```json\n[{\"op\":\"replace\",\"path\":\"/spec/containers/0/image\",\"value\":\"app:1.2\"}]\n```";
        let patch = guard(raw, &pod(), "1", "no_latest_tag", PatchSource::Model).unwrap();
        assert_eq!(patch.ops.len(), 1);
        assert_eq!(patch.source, PatchSource::Model);
    }

    #[test]
    fn rejects_text_without_array() {
        let err = decode_operations("I could not find a fix.").unwrap_err();
        assert_eq!(err.category(), "not_json");
        let err = decode_operations("[{\"op\": \"add\",").unwrap_err();
        assert!(matches!(err, GuardError::NotJson(_)));
    }

    #[test]
    fn rejects_non_array_top_level_and_non_object_elements() {
        let err = decode_operations(r#"{"op":"add","path":"/a","value":1}"#).unwrap_err();
        assert!(matches!(err, GuardError::NotArray(_)));
        let err =
            decode_operations(r#"[{"op":"add","path":"/a","value":1}, "remove /b"]"#).unwrap_err();
        assert!(matches!(err, GuardError::NotArray(ref m) if m.contains("element 1")));
    }

    #[test]
    fn rejects_unknown_ops_and_missing_fields() {
        let err = decode_operations(r#"[{"op":"merge","path":"/a"}]"#).unwrap_err();
        assert_eq!(
            err,
            GuardError::InvalidOp {
                index: 0,
                reason: "unknown op 'merge'".to_string()
            }
        );
        let err = decode_operations(r#"[{"op":"remove","path":"/a"},{"op":"add","path":"/b"}]"#)
            .unwrap_err();
        assert!(matches!(err, GuardError::InvalidOp { index: 1, .. }));
        let err = decode_operations(r#"[{"op":"copy","path":"/b"}]"#).unwrap_err();
        assert!(matches!(
            err,
            GuardError::InvalidOp { ref reason, .. } if reason.contains("'from'")
        ));
        let err = decode_operations(r#"[{"op":"remove","path":"spec"}]"#).unwrap_err();
        assert!(matches!(err, GuardError::InvalidOp { .. }));
    }

    #[test]
    fn unresolvable_paths_fail_before_any_gate() {
        let raw = r#"[{"op":"replace","path":"/spec/containers/3/image","value":"x:1"}]"#;
        let err = guard(raw, &pod(), "1", "no_latest_tag", PatchSource::Model).unwrap_err();
        assert!(matches!(err, GuardError::PathNotApplicable { index: 0, .. }));

        let raw = r#"[{"op":"add","path":"/spec/template/spec/hostNetwork","value":false}]"#;
        let err = guard(raw, &pod(), "1", "no_host_network", PatchSource::Model).unwrap_err();
        assert_eq!(err.category(), "path_not_applicable");

        let raw = r#"[{"op":"test","path":"/spec/containers/0/image","value":"other"}]"#;
        assert!(guard(raw, &pod(), "1", "x", PatchSource::Model).is_err());
    }

    #[test]
    fn operations_see_earlier_operations() {
        let raw = r#"[
            {"op":"add","path":"/spec/containers/0/securityContext","value":{}},
            {"op":"add","path":"/spec/containers/0/securityContext/runAsNonRoot","value":true}
        ]"#;
        let patch = guard(raw, &pod(), "1", "run_as_non_root", PatchSource::Model).unwrap();
        assert_eq!(patch.ops.len(), 2);
    }

    #[test]
    fn rebases_top_level_paths_onto_cronjob_template() {
        let raw = r#"[{"op":"replace","path":"/spec/containers/0/securityContext/privileged","value":false}]"#;
        let patch = guard(raw, &cronjob(), "1", "no_privileged", PatchSource::Model).unwrap();
        assert_eq!(
            patch.ops[0].path(),
            "/spec/jobTemplate/spec/template/spec/containers/0/securityContext/privileged"
        );
    }

    #[test]
    fn add_at_wrapper_spec_lands_once_at_nested_path() {
        let raw = r#"[{"op":"add","path":"/spec/containers/0/securityContext/allowPrivilegeEscalation","value":false}]"#;
        let document = cronjob();
        let patch =
            guard(raw, &document, "1", "no_allow_privilege_escalation", PatchSource::Model)
                .unwrap();
        let patched = patch.apply(&document).unwrap();
        assert!(patched.pointer("/spec/containers").is_none());
        assert_eq!(
            patched.pointer(
                "/spec/jobTemplate/spec/template/spec/containers/0/securityContext/allowPrivilegeEscalation"
            ),
            Some(&json!(false))
        );
    }

    #[test]
    fn deployment_template_paths_rebase_onto_cronjob() {
        let raw = r#"[{"op":"replace","path":"/spec/template/spec/containers/0/image","value":"busybox:1.36"}]"#;
        let patch = guard(raw, &cronjob(), "1", "no_latest_tag", PatchSource::Model).unwrap();
        assert_eq!(
            patch.ops[0].path(),
            "/spec/jobTemplate/spec/template/spec/containers/0/image"
        );
    }
}
