//! Combining model output with the guardrail operations.

use crate::patch::{is_same_or_ancestor, Patch, PatchOperation, PatchSource};

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub patch: Patch,
    /// Model operations dropped because a guardrail claims their subtree.
    pub dropped: Vec<PatchOperation>,
}

/// Whether `op` touches a subtree claimed by a guardrail at `claimed`.
pub fn collides(op: &PatchOperation, claimed: &str) -> bool {
    is_same_or_ancestor(claimed, op.path())
        || op.from().is_some_and(|from| is_same_or_ancestor(claimed, from))
}

/// Model operations first, minus collisions, then every guardrail operation.
pub fn merge(
    model_ops: &[PatchOperation],
    guardrail_ops: &[PatchOperation],
    id: &str,
    policy_id: &str,
) -> MergeOutcome {
    let mut ops = Vec::with_capacity(model_ops.len() + guardrail_ops.len());
    let mut dropped = Vec::new();
    for op in model_ops {
        if guardrail_ops.iter().any(|g| collides(op, g.path())) {
            dropped.push(op.clone());
        } else {
            ops.push(op.clone());
        }
    }
    if !dropped.is_empty() {
        tracing::warn!(
            detection = id,
            policy = policy_id,
            dropped = dropped.len(),
            "dropped model operations colliding with guardrails"
        );
    }
    ops.extend(guardrail_ops.iter().cloned());
    MergeOutcome {
        patch: Patch::new(id, policy_id, PatchSource::Merged, ops),
        dropped,
    }
}

/// Without model output the merged stage yields the full rule patch.
pub fn degrade_to_rules(rule_patch: Patch) -> MergeOutcome {
    MergeOutcome {
        patch: rule_patch,
        dropped: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn guardrails() -> Vec<PatchOperation> {
        vec![PatchOperation::add(
            "/spec/containers/1/securityContext/allowPrivilegeEscalation",
            json!(false),
        )]
    }

    #[test]
    fn guardrails_are_always_included_last() {
        let model = vec![PatchOperation::replace("/spec/containers/0/image", json!("app:1.0"))];
        let outcome = merge(&model, &guardrails(), "3", "no_latest_tag");
        assert_eq!(outcome.patch.source, PatchSource::Merged);
        assert_eq!(outcome.patch.ops.len(), 2);
        assert_eq!(outcome.patch.ops[1], guardrails()[0]);
        assert!(outcome.dropped.is_empty());
    }

    #[test]
    fn exact_and_nested_collisions_drop_the_model_op() {
        let model = vec![
            PatchOperation::add(
                "/spec/containers/1/securityContext/allowPrivilegeEscalation",
                json!(true),
            ),
            PatchOperation::add(
                "/spec/containers/1/securityContext/allowPrivilegeEscalation/x",
                json!(1),
            ),
        ];
        let outcome = merge(&model, &guardrails(), "3", "no_privileged");
        assert_eq!(outcome.dropped.len(), 2);
        assert_eq!(outcome.patch.ops, guardrails());
    }

    #[test]
    fn sibling_indices_do_not_collide() {
        let model = vec![
            PatchOperation::add(
                "/spec/containers/10/securityContext/allowPrivilegeEscalation",
                json!(false),
            ),
            PatchOperation::add(
                "/spec/containers/0/securityContext/allowPrivilegeEscalation",
                json!(false),
            ),
        ];
        let outcome = merge(&model, &guardrails(), "3", "no_privileged");
        assert!(outcome.dropped.is_empty());
        assert_eq!(outcome.patch.ops.len(), 3);
    }

    #[test]
    fn ancestor_model_ops_are_kept() {
        let model = vec![PatchOperation::add(
            "/spec/containers/1/securityContext",
            json!({"runAsNonRoot": true}),
        )];
        let outcome = merge(&model, &guardrails(), "3", "run_as_non_root");
        assert!(outcome.dropped.is_empty());
    }

    #[test]
    fn move_from_a_claimed_path_collides() {
        let model = vec![PatchOperation::Move {
            from: "/spec/containers/1/securityContext/allowPrivilegeEscalation".to_string(),
            path: "/metadata/annotations/x".to_string(),
        }];
        assert_eq!(merge(&model, &guardrails(), "3", "p").dropped.len(), 1);
    }

    #[test]
    fn degrading_keeps_the_rule_patch() {
        let rule = Patch::new("3", "no_privileged", PatchSource::Rule, guardrails());
        let outcome = degrade_to_rules(rule.clone());
        assert_eq!(outcome.patch, rule);
    }
}
