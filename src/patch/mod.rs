//! RFC 6902 JSON Patch model and in-memory application.

pub mod guard;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use guard::{guard, GuardError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Move { from: String, path: String },
    Copy { from: String, path: String },
    Test { path: String, value: Value },
}

impl PatchOperation {
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        PatchOperation::Add {
            path: path.into(),
            value,
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        PatchOperation::Remove { path: path.into() }
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        PatchOperation::Replace {
            path: path.into(),
            value,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PatchOperation::Add { .. } => "add",
            PatchOperation::Remove { .. } => "remove",
            PatchOperation::Replace { .. } => "replace",
            PatchOperation::Move { .. } => "move",
            PatchOperation::Copy { .. } => "copy",
            PatchOperation::Test { .. } => "test",
        }
    }

    pub fn path(&self) -> &str {
        match self {
            PatchOperation::Add { path, .. }
            | PatchOperation::Remove { path }
            | PatchOperation::Replace { path, .. }
            | PatchOperation::Move { path, .. }
            | PatchOperation::Copy { path, .. }
            | PatchOperation::Test { path, .. } => path,
        }
    }

    pub fn from(&self) -> Option<&str> {
        match self {
            PatchOperation::Move { from, .. } | PatchOperation::Copy { from, .. } => Some(from),
            _ => None,
        }
    }

    /// Same operation with its pointers rewritten by `rewrite`.
    pub fn map_pointers(&self, rewrite: impl Fn(&str) -> String) -> Self {
        match self {
            PatchOperation::Add { path, value } => PatchOperation::Add {
                path: rewrite(path),
                value: value.clone(),
            },
            PatchOperation::Remove { path } => PatchOperation::Remove {
                path: rewrite(path),
            },
            PatchOperation::Replace { path, value } => PatchOperation::Replace {
                path: rewrite(path),
                value: value.clone(),
            },
            PatchOperation::Move { from, path } => PatchOperation::Move {
                from: rewrite(from),
                path: rewrite(path),
            },
            PatchOperation::Copy { from, path } => PatchOperation::Copy {
                from: rewrite(from),
                path: rewrite(path),
            },
            PatchOperation::Test { path, value } => PatchOperation::Test {
                path: rewrite(path),
                value: value.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchSource {
    Rule,
    Model,
    Merged,
}

impl PatchSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchSource::Rule => "rule",
            PatchSource::Model => "model",
            PatchSource::Merged => "merged",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub id: String,
    pub policy_id: String,
    pub source: PatchSource,
    #[serde(rename = "patch")]
    pub ops: Vec<PatchOperation>,
}

impl Patch {
    pub fn new(
        id: impl Into<String>,
        policy_id: impl Into<String>,
        source: PatchSource,
        ops: Vec<PatchOperation>,
    ) -> Self {
        Self {
            id: id.into(),
            policy_id: policy_id.into(),
            source,
            ops,
        }
    }

    pub fn apply(&self, document: &Value) -> Result<Value, ApplyError> {
        apply_patch(document, &self.ops)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PointerError {
    #[error("pointer must start with '/'")]
    MissingLeadingSlash,
    #[error("pointer targets the document root")]
    Root,
    #[error("invalid escape sequence in segment '{0}'")]
    BadEscape(String),
}

/// Split a JSON Pointer into unescaped reference tokens.
pub fn parse_pointer(pointer: &str) -> Result<Vec<String>, PointerError> {
    if pointer.is_empty() {
        return Err(PointerError::Root);
    }
    let Some(rest) = pointer.strip_prefix('/') else {
        return Err(PointerError::MissingLeadingSlash);
    };
    rest.split('/').map(unescape_segment).collect()
}

fn unescape_segment(segment: &str) -> Result<String, PointerError> {
    let mut out = String::with_capacity(segment.len());
    let mut chars = segment.chars();
    while let Some(c) = chars.next() {
        if c != '~' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('~'),
            Some('1') => out.push('/'),
            _ => return Err(PointerError::BadEscape(segment.to_string())),
        }
    }
    Ok(out)
}

pub fn escape_segment(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// Whether `ancestor` equals `pointer` or contains it, on segment boundaries.
pub fn is_same_or_ancestor(ancestor: &str, pointer: &str) -> bool {
    match pointer.strip_prefix(ancestor) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyFailure {
    #[error("{0}")]
    Pointer(#[from] PointerError),
    #[error("parent of the target does not exist")]
    MissingParent,
    #[error("target does not exist")]
    MissingTarget,
    #[error("parent is neither an object nor an array")]
    NotContainer,
    #[error("invalid array index '{0}'")]
    BadIndex(String),
    #[error("test value does not match")]
    TestFailed,
    #[error("cannot move a value into one of its own children")]
    MoveIntoChild,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("operation {index} ({op} {path}): {failure}")]
pub struct ApplyError {
    pub index: usize,
    pub op: &'static str,
    pub path: String,
    pub failure: ApplyFailure,
}

/// Apply `ops` in order to a copy of `document`.
pub fn apply_patch(document: &Value, ops: &[PatchOperation]) -> Result<Value, ApplyError> {
    let mut working = document.clone();
    for (index, op) in ops.iter().enumerate() {
        apply_operation(&mut working, op).map_err(|failure| ApplyError {
            index,
            op: op.kind(),
            path: op.path().to_string(),
            failure,
        })?;
    }
    Ok(working)
}

/// Rewrite `ops` so that replaying them on their own result changes nothing.
///
/// `remove` and `move` would fail on replay and array insertions would repeat,
/// so each becomes a `replace` of the nearest enclosing container with its
/// value right after the operation. Operations directly under the document
/// root are kept as they are.
pub fn replay_safe(
    document: &Value,
    ops: &[PatchOperation],
) -> Result<Vec<PatchOperation>, ApplyError> {
    let mut working = document.clone();
    let mut out = Vec::with_capacity(ops.len());
    for (index, op) in ops.iter().enumerate() {
        apply_operation(&mut working, op).map_err(|failure| ApplyError {
            index,
            op: op.kind(),
            path: op.path().to_string(),
            failure,
        })?;
        let container = match op {
            PatchOperation::Remove { path } => parent_pointer(path),
            PatchOperation::Move { from, path } => parent_pointer(from)
                .zip(parent_pointer(path))
                .map(|(a, b)| common_ancestor(a, b)),
            PatchOperation::Add { path, .. } | PatchOperation::Copy { path, .. } => {
                parent_pointer(path)
                    .filter(|parent| working.pointer(parent).is_some_and(Value::is_array))
            }
            PatchOperation::Replace { .. } | PatchOperation::Test { .. } => None,
        };
        let rewritten = container
            .filter(|pointer| !pointer.is_empty())
            .and_then(|pointer| {
                working
                    .pointer(pointer)
                    .map(|value| PatchOperation::replace(pointer, value.clone()))
            });
        out.push(rewritten.unwrap_or_else(|| op.clone()));
    }
    Ok(out)
}

fn parent_pointer(pointer: &str) -> Option<&str> {
    pointer.rsplit_once('/').map(|(parent, _)| parent)
}

/// Longest pointer that is the same as or an ancestor of both `a` and `b`.
fn common_ancestor<'a>(a: &'a str, b: &str) -> &'a str {
    let mut end = 0;
    for (left, right) in a.split('/').zip(b.split('/')).skip(1) {
        if left != right {
            break;
        }
        end += 1 + left.len();
    }
    &a[..end]
}

/// Apply a single operation in place. On failure `document` may be partially
/// modified only for `move`, so callers validating speculatively work on a copy.
pub fn apply_operation(document: &mut Value, op: &PatchOperation) -> Result<(), ApplyFailure> {
    match op {
        PatchOperation::Add { path, value } => add(document, &parse_pointer(path)?, value.clone()),
        PatchOperation::Remove { path } => remove(document, &parse_pointer(path)?).map(|_| ()),
        PatchOperation::Replace { path, value } => {
            let target = lookup_mut(document, &parse_pointer(path)?)
                .ok_or(ApplyFailure::MissingTarget)?;
            *target = value.clone();
            Ok(())
        }
        PatchOperation::Move { from, path } => {
            if from != path && is_same_or_ancestor(from, path) {
                return Err(ApplyFailure::MoveIntoChild);
            }
            let from_tokens = parse_pointer(from)?;
            let to_tokens = parse_pointer(path)?;
            parent_of(document, &to_tokens)?;
            let value = remove(document, &from_tokens)?;
            add(document, &to_tokens, value)
        }
        PatchOperation::Copy { from, path } => {
            let value = lookup(document, &parse_pointer(from)?)
                .cloned()
                .ok_or(ApplyFailure::MissingTarget)?;
            add(document, &parse_pointer(path)?, value)
        }
        PatchOperation::Test { path, value } => {
            let current =
                lookup(document, &parse_pointer(path)?).ok_or(ApplyFailure::MissingTarget)?;
            if current == value {
                Ok(())
            } else {
                Err(ApplyFailure::TestFailed)
            }
        }
    }
}

fn parse_index(token: &str, len: usize, allow_end: bool) -> Result<usize, ApplyFailure> {
    if allow_end && token == "-" {
        return Ok(len);
    }
    let valid = !token.is_empty()
        && token.bytes().all(|b| b.is_ascii_digit())
        && (token == "0" || !token.starts_with('0'));
    let index = if valid { token.parse::<usize>().ok() } else { None };
    match index {
        Some(i) if i < len || (allow_end && i == len) => Ok(i),
        Some(_) => Err(ApplyFailure::MissingTarget),
        None => Err(ApplyFailure::BadIndex(token.to_string())),
    }
}

pub fn lookup<'a>(document: &'a Value, tokens: &[String]) -> Option<&'a Value> {
    let mut current = document;
    for token in tokens {
        current = match current {
            Value::Object(map) => map.get(token)?,
            Value::Array(items) => items.get(parse_index(token, items.len(), false).ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn lookup_mut<'a>(document: &'a mut Value, tokens: &[String]) -> Option<&'a mut Value> {
    let mut current = document;
    for token in tokens {
        current = match current {
            Value::Object(map) => map.get_mut(token)?,
            Value::Array(items) => {
                let len = items.len();
                items.get_mut(parse_index(token, len, false).ok()?)?
            }
            _ => return None,
        };
    }
    Some(current)
}

fn parent_of<'a>(
    document: &'a mut Value,
    tokens: &[String],
) -> Result<&'a mut Value, ApplyFailure> {
    let (_, parent_tokens) = tokens.split_last().ok_or(ApplyFailure::Pointer(PointerError::Root))?;
    let parent = lookup_mut(document, parent_tokens).ok_or(ApplyFailure::MissingParent)?;
    if parent.is_object() || parent.is_array() {
        Ok(parent)
    } else {
        Err(ApplyFailure::NotContainer)
    }
}

fn add(document: &mut Value, tokens: &[String], value: Value) -> Result<(), ApplyFailure> {
    let last = tokens.last().ok_or(ApplyFailure::Pointer(PointerError::Root))?;
    match parent_of(document, tokens)? {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = parse_index(last, items.len(), true)?;
            items.insert(index, value);
            Ok(())
        }
        _ => Err(ApplyFailure::NotContainer),
    }
}

fn remove(document: &mut Value, tokens: &[String]) -> Result<Value, ApplyFailure> {
    let last = tokens.last().ok_or(ApplyFailure::Pointer(PointerError::Root))?;
    let parent = parent_of(document, tokens).map_err(|failure| match failure {
        ApplyFailure::MissingParent => ApplyFailure::MissingTarget,
        other => other,
    })?;
    match parent {
        Value::Object(map) => map.remove(last).ok_or(ApplyFailure::MissingTarget),
        Value::Array(items) => {
            let index = parse_index(last, items.len(), false)?;
            Ok(items.remove(index))
        }
        _ => Err(ApplyFailure::NotContainer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod() -> Value {
        json!({
            "kind": "Pod",
            "spec": {
                "containers": [
                    {"name": "app", "image": "app:1", "securityContext": {"privileged": true}}
                ]
            }
        })
    }

    #[test]
    fn decodes_tagged_operations() {
        let ops: Vec<PatchOperation> = serde_json::from_value(json!([
            {"op": "add", "path": "/a", "value": 1},
            {"op": "move", "from": "/a", "path": "/b"},
            {"op": "remove", "path": "/b"}
        ]))
        .unwrap();
        assert_eq!(ops[1].from(), Some("/a"));
        assert_eq!(ops[2].kind(), "remove");
        let encoded = serde_json::to_value(&ops[0]).unwrap();
        assert_eq!(encoded, json!({"op": "add", "path": "/a", "value": 1}));
    }

    #[test]
    fn pointer_escapes_round_through_segments() {
        assert_eq!(
            parse_pointer("/metadata/annotations/a~1b~0c").unwrap(),
            vec!["metadata", "annotations", "a/b~c"]
        );
        assert_eq!(escape_segment("a/b~c"), "a~1b~0c");
        assert_eq!(parse_pointer("spec"), Err(PointerError::MissingLeadingSlash));
        assert_eq!(parse_pointer(""), Err(PointerError::Root));
        assert!(matches!(parse_pointer("/a~2"), Err(PointerError::BadEscape(_))));
    }

    #[test]
    fn ancestor_check_respects_segment_boundaries() {
        assert!(is_same_or_ancestor("/spec/containers/1", "/spec/containers/1"));
        assert!(is_same_or_ancestor("/spec/containers/1", "/spec/containers/1/image"));
        assert!(!is_same_or_ancestor("/spec/containers/1", "/spec/containers/10"));
        assert!(!is_same_or_ancestor("/spec/containers/1/image", "/spec/containers/1"));
    }

    #[test]
    fn applies_operations_sequentially() {
        let patched = apply_patch(
            &pod(),
            &[
                PatchOperation::replace(
                    "/spec/containers/0/securityContext/privileged",
                    json!(false),
                ),
                PatchOperation::add(
                    "/spec/containers/-",
                    json!({"name": "sidecar", "image": "s:1"}),
                ),
                PatchOperation::Copy {
                    from: "/spec/containers/0/image".to_string(),
                    path: "/spec/containers/1/image".to_string(),
                },
                PatchOperation::Test {
                    path: "/spec/containers/1/image".to_string(),
                    value: json!("app:1"),
                },
            ],
        )
        .unwrap();
        assert_eq!(patched["spec"]["containers"][0]["securityContext"]["privileged"], json!(false));
        assert_eq!(patched["spec"]["containers"][1]["image"], json!("app:1"));
    }

    #[test]
    fn reports_failing_operation_index() {
        let err = apply_patch(
            &pod(),
            &[
                PatchOperation::add("/spec/hostNetwork", json!(false)),
                PatchOperation::remove("/spec/volumes/0"),
            ],
        )
        .unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(err.failure, ApplyFailure::MissingTarget);

        let err = apply_patch(&pod(), &[PatchOperation::add("/spec/template/spec/x", json!(1))])
            .unwrap_err();
        assert_eq!(err.failure, ApplyFailure::MissingParent);

        let err =
            apply_patch(&pod(), &[PatchOperation::remove("/spec/containers/01")]).unwrap_err();
        assert_eq!(err.failure, ApplyFailure::BadIndex("01".to_string()));
    }

    #[test]
    fn move_rejects_moving_into_own_child() {
        let err = apply_patch(
            &pod(),
            &[PatchOperation::Move {
                from: "/spec".to_string(),
                path: "/spec/inner".to_string(),
            }],
        )
        .unwrap_err();
        assert_eq!(err.failure, ApplyFailure::MoveIntoChild);
    }

    #[test]
    fn replay_safe_rewrites_removals_and_array_inserts() {
        let doc = pod();
        let ops = vec![
            PatchOperation::remove("/spec/containers/0/securityContext/privileged"),
            PatchOperation::add("/spec/containers/-", json!({"name": "log", "image": "log:1"})),
            PatchOperation::add("/spec/containers/0/securityContext/runAsUser", json!(1000)),
        ];
        let safe = replay_safe(&doc, &ops).unwrap();
        assert_eq!(
            safe[0],
            PatchOperation::replace("/spec/containers/0/securityContext", json!({}))
        );
        assert_eq!(safe[1].path(), "/spec/containers");
        assert_eq!(safe[2], ops[2]);

        let patched = apply_patch(&doc, &ops).unwrap();
        assert_eq!(apply_patch(&doc, &safe).unwrap(), patched);
        assert_eq!(apply_patch(&patched, &safe).unwrap(), patched);
    }

    #[test]
    fn replay_safe_moves_replace_the_shared_parent() {
        let doc = json!({"spec": {"serviceAccount": "builder", "containers": []}});
        let ops = vec![PatchOperation::Move {
            from: "/spec/serviceAccount".to_string(),
            path: "/spec/serviceAccountName".to_string(),
        }];
        let safe = replay_safe(&doc, &ops).unwrap();
        assert_eq!(
            safe,
            vec![PatchOperation::replace(
                "/spec",
                json!({"serviceAccountName": "builder", "containers": []})
            )]
        );
        assert_eq!(common_ancestor("/spec/a/b", "/spec/a/c"), "/spec/a");
        assert_eq!(common_ancestor("/spec", "/status"), "");
    }

    #[test]
    fn replay_safe_keeps_top_level_operations() {
        let doc = json!({"kind": "Pod", "legacy": true});
        let ops = vec![PatchOperation::remove("/legacy")];
        assert_eq!(replay_safe(&doc, &ops).unwrap(), ops);
    }
}
