//! Deterministic policy-keyed patch generation.
//!
//! Each supported policy maps to a pure transformation that records the
//! smallest set of edits clearing the violation. Every rule patch is then
//! hardened with the guardrail operations computed on the rule-patched
//! document, so the guardrails always apply last.

mod catalog;
pub mod guardrails;

use crate::detection::{Detection, OptIn};
use crate::patch::{
    apply_operation, escape_segment, replay_safe, Patch, PatchOperation, PatchSource,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub use guardrails::guardrail_operations;

/// High-risk Linux capabilities dropped by rules and stripped by guardrails.
pub const DANGEROUS_CAPABILITIES: &[&str] = &[
    "NET_RAW",
    "NET_ADMIN",
    "SYS_ADMIN",
    "SYS_MODULE",
    "SYS_PTRACE",
    "SYS_CHROOT",
];

/// `ALL` grants every dangerous capability at once.
pub fn is_dangerous_capability(capability: &str) -> bool {
    let upper = capability.trim().to_ascii_uppercase();
    let bare = upper.strip_prefix("CAP_").unwrap_or(&upper);
    bare == "ALL" || DANGEROUS_CAPABILITIES.contains(&bare)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleRefusal {
    #[error("no rule available for policy '{policy_id}'")]
    Unsupported { policy_id: String },
    #[error("rule for '{policy_id}' requires the {} opt-in", .marker.as_str())]
    OptInRequired { policy_id: String, marker: OptIn },
    #[error("rule for '{policy_id}' found nothing to change: {reason}")]
    NotApplicable { policy_id: String, reason: String },
}

impl RuleRefusal {
    pub fn category(&self) -> &'static str {
        match self {
            RuleRefusal::Unsupported { .. } => "unsupported_policy",
            RuleRefusal::OptInRequired { .. } => "opt_in_required",
            RuleRefusal::NotApplicable { .. } => "not_applicable",
        }
    }
}

type Transform = fn(&Value, &mut EditBuilder);

#[derive(Clone, Copy)]
struct Rule {
    transform: Transform,
    requires: Option<OptIn>,
}

pub struct RuleEngine {
    rules: BTreeMap<&'static str, Rule>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::with_builtin_rules()
    }
}

impl RuleEngine {
    pub fn with_builtin_rules() -> Self {
        let mut rules = BTreeMap::new();
        for (policy_id, transform, requires) in catalog::BUILTIN_RULES {
            rules.insert(
                *policy_id,
                Rule {
                    transform: *transform,
                    requires: *requires,
                },
            );
        }
        Self { rules }
    }

    pub fn supports(&self, policy_id: &str) -> bool {
        self.rules.contains_key(policy_id)
    }

    pub fn policy_ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.rules.keys().copied()
    }

    /// Build the rule patch for `detection`, guardrails appended.
    pub fn generate(&self, detection: &Detection, document: &Value) -> Result<Patch, RuleRefusal> {
        let policy_id = detection.policy_id.as_str();
        let rule = self
            .rules
            .get(policy_id)
            .ok_or_else(|| RuleRefusal::Unsupported {
                policy_id: policy_id.to_string(),
            })?;
        if let Some(marker) = rule.requires {
            if !detection.has_opt_in(marker) {
                return Err(RuleRefusal::OptInRequired {
                    policy_id: policy_id.to_string(),
                    marker,
                });
            }
        }

        let mut edits = EditBuilder::new(document);
        (rule.transform)(document, &mut edits);
        if edits.is_empty() {
            return Err(RuleRefusal::NotApplicable {
                policy_id: policy_id.to_string(),
                reason: "document already satisfies the policy or has no matching target"
                    .to_string(),
            });
        }

        let mut guard = EditBuilder::for_guardrails(edits.document());
        guardrails::harden(&mut guard);
        let mut ops = edits.finish();
        ops.extend(guard.finish());
        let ops = match replay_safe(document, &ops) {
            Ok(safe) => safe,
            Err(err) => {
                tracing::debug!(policy_id, %err, "rule patch kept without replay rewrite");
                ops
            }
        };
        Ok(Patch::new(&detection.id, policy_id, PatchSource::Rule, ops))
    }

    /// Guardrail operations for `document` as it stands.
    pub fn guardrails(&self, document: &Value) -> Vec<PatchOperation> {
        guardrail_operations(document)
    }
}

/// Records edits against a working copy so each edit sees the earlier ones
/// and only emits an operation when the value actually changes.
pub(crate) struct EditBuilder {
    working: Value,
    ops: Vec<PatchOperation>,
    prefer_add: bool,
}

enum Slot {
    Missing,
    Equal,
    Differs,
    Object,
    Scalar,
}

impl EditBuilder {
    pub(crate) fn new(document: &Value) -> Self {
        Self {
            working: document.clone(),
            ops: Vec::new(),
            prefer_add: false,
        }
    }

    /// Guardrails only use `add`, which also overwrites existing members.
    pub(crate) fn for_guardrails(document: &Value) -> Self {
        Self {
            prefer_add: true,
            ..Self::new(document)
        }
    }

    pub(crate) fn document(&self) -> &Value {
        &self.working
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn finish(self) -> Vec<PatchOperation> {
        self.ops
    }

    /// Set `base/fields...` to `value`, creating missing objects in one op.
    pub(crate) fn set(&mut self, base: &str, fields: &[&str], value: Value) {
        let mut pointer = base.to_string();
        for (i, field) in fields.iter().enumerate() {
            let next = format!("{}/{}", pointer, escape_segment(field));
            let last = i + 1 == fields.len();
            let slot = match self.working.pointer(&next) {
                None => Slot::Missing,
                Some(existing) if last && existing == &value => Slot::Equal,
                Some(_) if last => Slot::Differs,
                Some(existing) if existing.is_object() => Slot::Object,
                Some(_) => Slot::Scalar,
            };
            match slot {
                Slot::Equal => return,
                Slot::Object => pointer = next,
                Slot::Differs | Slot::Scalar => {
                    let nested = nest(&fields[i + 1..], value);
                    let op = if self.prefer_add {
                        PatchOperation::add(next, nested)
                    } else {
                        PatchOperation::replace(next, nested)
                    };
                    self.push(op);
                    return;
                }
                Slot::Missing => {
                    self.push(PatchOperation::add(next, nest(&fields[i + 1..], value)));
                    return;
                }
            }
        }
    }

    pub(crate) fn remove(&mut self, pointer: &str) {
        if self.working.pointer(pointer).is_some() {
            self.push(PatchOperation::remove(pointer));
        }
    }

    pub(crate) fn push(&mut self, op: PatchOperation) {
        match apply_operation(&mut self.working, &op) {
            Ok(()) => self.ops.push(op),
            Err(failure) => {
                tracing::debug!(
                    op = op.kind(),
                    path = op.path(),
                    %failure,
                    "skipped rule edit that does not apply"
                );
            }
        }
    }
}

fn nest(fields: &[&str], value: Value) -> Value {
    fields.iter().rev().fold(value, |inner, field| {
        let mut map = Map::new();
        map.insert((*field).to_string(), inner);
        Value::Object(map)
    })
}
