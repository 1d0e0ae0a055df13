//! Secret-literal heuristics shared by the env rule, its predicate and the
//! safety gate.

use crate::manifest;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

static SECRET_NAME: OnceLock<Option<Regex>> = OnceLock::new();
static SECRET_VALUE: OnceLock<Option<Regex>> = OnceLock::new();

fn secret_name_regex() -> Option<&'static Regex> {
    SECRET_NAME
        .get_or_init(|| {
            Regex::new(
                r"(?i)(secret|passw(or)?d|pwd|token|api_?key|access_?key|private_?key|credential)",
            )
            .ok()
        })
        .as_ref()
}

fn secret_value_regex() -> Option<&'static Regex> {
    SECRET_VALUE
        .get_or_init(|| {
            Regex::new(
                r"(AKIA[0-9A-Z]{16}|-----BEGIN [A-Z ]*PRIVATE KEY-----|gh[pousr]_[A-Za-z0-9]{36}|xox[abprs]-[A-Za-z0-9-]{10,}|sk-[A-Za-z0-9]{20,})",
            )
            .ok()
        })
        .as_ref()
}

pub fn is_secret_like_name(name: &str) -> bool {
    secret_name_regex().is_some_and(|re| re.is_match(name))
}

pub fn looks_like_secret_value(value: &str) -> bool {
    secret_value_regex().is_some_and(|re| re.is_match(value))
}

/// A literal `value` on a container env entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvLiteral {
    /// Pointer to the env entry object.
    pub pointer: String,
    pub name: String,
    pub value: String,
}

impl EnvLiteral {
    pub fn is_secret_like(&self) -> bool {
        !self.value.is_empty()
            && (is_secret_like_name(&self.name) || looks_like_secret_value(&self.value))
    }
}

/// Every env entry carrying a plain string `value`, across all containers.
pub fn env_literals(document: &Value) -> Vec<EnvLiteral> {
    let mut out = Vec::new();
    for container in manifest::containers(document) {
        let Some(env) = container.value.get("env").and_then(Value::as_array) else {
            continue;
        };
        for (index, entry) in env.iter().enumerate() {
            let name = entry.get("name").and_then(Value::as_str);
            let value = entry.get("value").and_then(Value::as_str);
            if let (Some(name), Some(value)) = (name, value) {
                out.push(EnvLiteral {
                    pointer: format!("{}/env/{}", container.pointer, index),
                    name: name.to_string(),
                    value: value.to_string(),
                });
            }
        }
    }
    out
}

pub fn secret_env_literals(document: &Value) -> Vec<EnvLiteral> {
    env_literals(document)
        .into_iter()
        .filter(EnvLiteral::is_secret_like)
        .collect()
}

/// Pointers of every string in `document` accepted by `matches`, which is
/// given the enclosing object key (empty inside arrays) and the text.
pub fn find_strings(document: &Value, matches: &dyn Fn(&str, &str) -> bool) -> Vec<String> {
    fn walk(
        value: &Value,
        key: &str,
        pointer: &mut String,
        matches: &dyn Fn(&str, &str) -> bool,
        out: &mut Vec<String>,
    ) {
        match value {
            Value::String(text) if matches(key, text) => out.push(pointer.clone()),
            Value::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    let len = pointer.len();
                    pointer.push_str(&format!("/{}", index));
                    walk(item, "", pointer, matches, out);
                    pointer.truncate(len);
                }
            }
            Value::Object(map) => {
                for (child_key, item) in map {
                    let len = pointer.len();
                    pointer.push('/');
                    pointer.push_str(&crate::patch::escape_segment(child_key));
                    walk(item, child_key, pointer, matches, out);
                    pointer.truncate(len);
                }
            }
            _ => {}
        }
    }

    let mut out = Vec::new();
    walk(document, "", &mut String::new(), matches, &mut out);
    out
}

/// Where `secret` reappears in `document`. Plain values count only as a whole
/// string outside `name` fields, so `postgres` does not match `postgres:16`.
/// Recognised credential formats also count inside longer strings.
pub fn secret_occurrences(document: &Value, secret: &str) -> Vec<String> {
    if secret.is_empty() {
        return Vec::new();
    }
    let embedded = looks_like_secret_value(secret);
    find_strings(document, &|key, text| {
        if embedded && text.contains(secret) {
            return true;
        }
        key != "name" && text == secret
    })
}
