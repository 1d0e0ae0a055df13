//! Ordered acceptance gates for a candidate patch.
//!
//! Gates run cheapest first: the targeted policy predicate, the external
//! dry-run, the safety assertions and finally the optional full rescan.
//! Evaluation stops at the first failing gate and every later gate is
//! recorded as `false`. A disabled gate always reads `true`.

pub mod dry_run;
pub mod policy;
pub mod safety;

use crate::manifest;
use crate::patch::Patch;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

pub use dry_run::{DryRunApplier, DryRunOutcome, DryRunUnavailable, KubectlDryRun};
pub use policy::BuiltinPolicies;
pub use safety::{check_safety, SafetyFinding};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    Policy,
    Schema,
    Safety,
    Rescan,
}

impl Gate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gate::Policy => "policy",
            Gate::Schema => "schema",
            Gate::Safety => "safety",
            Gate::Rescan => "rescan",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub policy_id: String,
    pub pointer: String,
    pub message: String,
}

/// Detection predicates keyed by policy id.
pub trait PolicyPredicates: Send + Sync {
    fn supports(&self, policy_id: &str) -> bool;
    fn violations(&self, policy_id: &str, document: &Value) -> Vec<Violation>;
    fn policy_ids(&self) -> Vec<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub id: String,
    pub policy_id: String,
    pub accepted: bool,
    pub ok_policy: bool,
    pub ok_schema: bool,
    pub ok_safety: bool,
    pub ok_rescan: bool,
    pub patched_yaml: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_gate: Option<Gate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl VerificationResult {
    fn pending(id: &str, policy_id: &str) -> Self {
        Self {
            id: id.to_string(),
            policy_id: policy_id.to_string(),
            accepted: false,
            ok_policy: false,
            ok_schema: false,
            ok_safety: false,
            ok_rescan: false,
            patched_yaml: None,
            errors: Vec::new(),
            failed_gate: None,
            failure_category: None,
            diagnostic: None,
        }
    }

    /// Record for a detection that never produced a verifiable patch.
    pub fn not_attempted(
        id: &str,
        policy_id: &str,
        category: &str,
        reason: impl Into<String>,
    ) -> Self {
        let mut result = Self::pending(id, policy_id);
        result.failure_category = Some(category.to_string());
        result.errors.push(reason.into());
        result
    }

    fn fail(&mut self, gate: Gate, category: &str, errors: Vec<String>) {
        self.failed_gate = Some(gate);
        self.failure_category = Some(category.to_string());
        self.errors.extend(errors);
    }

    /// Drop error detail for output files written without `--include-errors`.
    pub fn without_errors(mut self) -> Self {
        self.errors.clear();
        self.diagnostic = None;
        self
    }
}

pub struct Verifier {
    predicates: Arc<dyn PolicyPredicates>,
    dry_run: Option<Arc<dyn DryRunApplier>>,
    enable_rescan: bool,
}

impl Verifier {
    pub fn new(
        predicates: Arc<dyn PolicyPredicates>,
        dry_run: Option<Arc<dyn DryRunApplier>>,
        enable_rescan: bool,
    ) -> Self {
        Self {
            predicates,
            dry_run,
            enable_rescan,
        }
    }

    /// Builtin predicates, no schema gate, no rescan.
    pub fn offline() -> Self {
        Self::new(Arc::new(BuiltinPolicies), None, false)
    }

    pub fn rescan_enabled(&self) -> bool {
        self.enable_rescan
    }

    pub fn schema_gate_enabled(&self) -> bool {
        self.dry_run.is_some()
    }

    pub fn verify(
        &self,
        detection_id: &str,
        policy_id: &str,
        original: &Value,
        patch: &Patch,
    ) -> VerificationResult {
        let mut result = VerificationResult::pending(detection_id, policy_id);

        let patched = match patch.apply(original) {
            Ok(patched) => patched,
            Err(err) => {
                result.fail(Gate::Policy, "patch_unapplicable", vec![err.to_string()]);
                return result;
            }
        };
        match manifest::to_yaml(&patched) {
            Ok(yaml) => result.patched_yaml = Some(yaml),
            Err(err) => {
                result.fail(Gate::Policy, "yaml_render", vec![err.to_string()]);
                return result;
            }
        }

        if !self.predicates.supports(policy_id) {
            result.diagnostic = Some(format!(
                "no predicate for policy '{}'; policy gate passed unchecked",
                policy_id
            ));
        }
        let remaining = self.predicates.violations(policy_id, &patched);
        if !remaining.is_empty() {
            let errors = remaining
                .iter()
                .map(|v| format!("{} still violated at {}: {}", policy_id, v.pointer, v.message))
                .collect();
            result.fail(Gate::Policy, "policy_still_violated", errors);
            return result;
        }
        result.ok_policy = true;

        match &self.dry_run {
            Some(applier) => {
                let yaml = result.patched_yaml.as_deref().unwrap_or_default();
                let outcome = applier.dry_run(yaml);
                if !outcome.accepted {
                    let category = outcome.category.unwrap_or("schema_rejected");
                    let first_line =
                        outcome.diagnostic.lines().next().unwrap_or(category).to_string();
                    result.fail(Gate::Schema, category, vec![first_line]);
                    result.diagnostic = Some(outcome.diagnostic);
                    return result;
                }
                result.ok_schema = true;
            }
            None => result.ok_schema = true,
        }

        let findings = check_safety(original, &patched);
        if let Some(first) = findings.first() {
            let category = first.code;
            let errors = findings.iter().map(ToString::to_string).collect();
            result.fail(Gate::Safety, category, errors);
            return result;
        }
        result.ok_safety = true;

        if self.enable_rescan {
            let introduced = self.rescan(original, &patched);
            if !introduced.is_empty() {
                let errors = introduced
                    .iter()
                    .map(|v| format!("{} introduced at {}: {}", v.policy_id, v.pointer, v.message))
                    .collect();
                result.fail(Gate::Rescan, "new_violation", errors);
                return result;
            }
        }
        result.ok_rescan = true;

        result.accepted = true;
        result
    }

    /// Violations in `patched` at locations the original did not violate.
    fn rescan(&self, original: &Value, patched: &Value) -> Vec<Violation> {
        let mut introduced = Vec::new();
        for policy_id in self.predicates.policy_ids() {
            let after = self.predicates.violations(&policy_id, patched);
            if after.is_empty() {
                continue;
            }
            let before: BTreeSet<String> = self
                .predicates
                .violations(&policy_id, original)
                .into_iter()
                .map(|v| v.pointer)
                .collect();
            introduced.extend(after.into_iter().filter(|v| !before.contains(&v.pointer)));
        }
        introduced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parse_manifest;
    use crate::patch::{PatchOperation, PatchSource};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedDryRun {
        accept: bool,
        calls: AtomicUsize,
    }

    impl DryRunApplier for ScriptedDryRun {
        fn dry_run(&self, _yaml: &str) -> DryRunOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.accept {
                DryRunOutcome::accepted("pod/web created (server dry run)")
            } else {
                DryRunOutcome::rejected(
                    "admission_denied",
                    "admission webhook denied the request\nmore",
                )
            }
        }
    }

    fn dry_run(accept: bool) -> Arc<ScriptedDryRun> {
        Arc::new(ScriptedDryRun {
            accept,
            calls: AtomicUsize::new(0),
        })
    }

    const POD: &str = "kind: Pod\nmetadata:\n  name: web\nspec:\n  containers:\n    - name: app\n      image: app:latest\n";

    fn pin_patch() -> Patch {
        Patch::new(
            "1",
            "no_latest_tag",
            PatchSource::Rule,
            vec![
                PatchOperation::replace("/spec/containers/0/image", json!("app:1.0")),
                PatchOperation::add(
                    "/spec/containers/0/securityContext",
                    json!({"allowPrivilegeEscalation": false}),
                ),
            ],
        )
    }

    #[test]
    fn all_gates_pass_for_a_good_patch() {
        let applier = dry_run(true);
        let verifier = Verifier::new(Arc::new(BuiltinPolicies), Some(applier.clone()), true);
        let doc = parse_manifest(POD).unwrap();
        let result = verifier.verify("1", "no_latest_tag", &doc, &pin_patch());
        assert!(result.accepted, "{:?}", result);
        assert!(result.ok_policy && result.ok_schema && result.ok_safety && result.ok_rescan);
        assert!(result.patched_yaml.unwrap().contains("app:1.0"));
        assert_eq!(applier.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn policy_failure_skips_the_dry_run() {
        let applier = dry_run(true);
        let verifier = Verifier::new(Arc::new(BuiltinPolicies), Some(applier.clone()), false);
        let doc = parse_manifest(POD).unwrap();
        let noop = Patch::new(
            "1",
            "no_latest_tag",
            PatchSource::Model,
            vec![PatchOperation::add("/metadata/labels", json!({"a": "b"}))],
        );
        let result = verifier.verify("1", "no_latest_tag", &doc, &noop);
        assert!(!result.accepted);
        assert!(!result.ok_policy && !result.ok_schema && !result.ok_safety && !result.ok_rescan);
        assert_eq!(result.failed_gate, Some(Gate::Policy));
        assert_eq!(applier.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn schema_rejection_records_category_and_diagnostic() {
        let verifier = Verifier::new(Arc::new(BuiltinPolicies), Some(dry_run(false)), false);
        let doc = parse_manifest(POD).unwrap();
        let result = verifier.verify("1", "no_latest_tag", &doc, &pin_patch());
        assert!(result.ok_policy);
        assert!(!result.ok_schema && !result.ok_safety);
        assert_eq!(result.failed_gate, Some(Gate::Schema));
        assert_eq!(result.failure_category.as_deref(), Some("admission_denied"));
        assert_eq!(result.errors, vec!["admission webhook denied the request".to_string()]);
        assert!(result.diagnostic.unwrap().contains("more"));
    }

    #[test]
    fn disabled_gates_read_true() {
        let verifier = Verifier::offline();
        let doc = parse_manifest(POD).unwrap();
        let result = verifier.verify("1", "no_latest_tag", &doc, &pin_patch());
        assert!(result.accepted);
        assert!(result.ok_schema && result.ok_rescan);
    }

    #[test]
    fn safety_gate_catches_escalation_left_enabled() {
        let verifier = Verifier::offline();
        let doc = parse_manifest(POD).unwrap();
        let patch = Patch::new(
            "1",
            "no_latest_tag",
            PatchSource::Model,
            vec![
                PatchOperation::replace("/spec/containers/0/image", json!("app:1.0")),
                PatchOperation::add(
                    "/spec/containers/0/securityContext",
                    json!({"privileged": true}),
                ),
            ],
        );
        let result = verifier.verify("1", "no_latest_tag", &doc, &patch);
        assert!(result.ok_policy && result.ok_schema);
        assert!(!result.ok_safety && !result.ok_rescan && !result.accepted);
        assert_eq!(result.failure_category.as_deref(), Some("escalation_enabled"));
    }

    #[test]
    fn rescan_flags_newly_introduced_violations() {
        let verifier = Verifier::new(Arc::new(BuiltinPolicies), None, true);
        let doc = parse_manifest(POD).unwrap();
        let mut patch = pin_patch();
        patch
            .ops
            .push(PatchOperation::add("/spec/hostNetwork", json!(true)));
        let result = verifier.verify("1", "no_latest_tag", &doc, &patch);
        assert!(result.ok_policy && result.ok_safety);
        assert!(!result.ok_rescan && !result.accepted);
        assert_eq!(result.failed_gate, Some(Gate::Rescan));
        assert!(result.errors.iter().any(|e| e.starts_with("no_host_network")));
    }

    #[test]
    fn unapplicable_patch_fails_at_policy_gate() {
        let verifier = Verifier::offline();
        let doc = parse_manifest(POD).unwrap();
        let ops = vec![PatchOperation::remove("/spec/nope")];
        let patch = Patch::new("1", "no_latest_tag", PatchSource::Model, ops);
        let result = verifier.verify("1", "no_latest_tag", &doc, &patch);
        assert_eq!(result.failure_category.as_deref(), Some("patch_unapplicable"));
        assert!(result.patched_yaml.is_none());
    }

    #[test]
    fn errors_are_omitted_from_json_when_empty() {
        let verifier = Verifier::offline();
        let doc = parse_manifest(POD).unwrap();
        let result = verifier.verify("1", "no_latest_tag", &doc, &pin_patch());
        let value = serde_json::to_value(&result).unwrap();
        assert!(value.get("errors").is_none());
        assert_eq!(value["ok_rescan"], json!(true));
    }
}
