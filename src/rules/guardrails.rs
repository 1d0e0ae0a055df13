//! Policy-independent hardening applied on top of every patch source.

use super::{is_dangerous_capability, EditBuilder};
use crate::manifest;
use crate::patch::PatchOperation;
use serde_json::Value;

/// Guardrail operations for `document`, as `add` operations.
pub fn guardrail_operations(document: &Value) -> Vec<PatchOperation> {
    let mut edits = EditBuilder::for_guardrails(document);
    harden(&mut edits);
    edits.finish()
}

pub(crate) fn harden(edits: &mut EditBuilder) {
    let snapshot = edits.document().clone();
    for container in manifest::containers(&snapshot) {
        if container.security_flag("allowPrivilegeEscalation") != Some(false) {
            edits.set(
                &container.pointer,
                &["securityContext", "allowPrivilegeEscalation"],
                Value::Bool(false),
            );
        }
        if container.security_flag("privileged") == Some(true) {
            edits.set(
                &container.pointer,
                &["securityContext", "privileged"],
                Value::Bool(false),
            );
        }
        let added = container.added_capabilities();
        if added.iter().any(|cap| is_dangerous_capability(cap)) {
            let kept: Vec<Value> = added
                .iter()
                .filter(|cap| !is_dangerous_capability(cap))
                .map(|cap| Value::String(cap.to_string()))
                .collect();
            edits.set(
                &container.pointer,
                &["securityContext", "capabilities", "add"],
                Value::Array(kept),
            );
        }
    }
}
