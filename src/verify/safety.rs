//! Invariants a patched document must hold regardless of the targeted policy.

use crate::manifest::{self, ContainerList};
use crate::rules::is_dangerous_capability;
use crate::secrets;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SafetyFinding {
    pub code: &'static str,
    pub pointer: String,
    pub message: String,
}

impl std::fmt::Display for SafetyFinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}: {}", self.code, self.pointer, self.message)
    }
}

fn finding(
    code: &'static str,
    pointer: impl Into<String>,
    message: impl Into<String>,
) -> SafetyFinding {
    SafetyFinding {
        code,
        pointer: pointer.into(),
        message: message.into(),
    }
}

/// Every safety finding for `patched`. `original` supplies the secret
/// literals that must not survive the patch.
pub fn check_safety(original: &Value, patched: &Value) -> Vec<SafetyFinding> {
    let mut findings = Vec::new();

    for container in manifest::containers(patched) {
        for flag in ["privileged", "allowPrivilegeEscalation"] {
            if container.security_flag(flag) == Some(true) {
                findings.push(finding(
                    "escalation_enabled",
                    format!("{}/securityContext/{}", container.pointer, flag),
                    format!("container '{}' sets {}=true", container.name(), flag),
                ));
            }
        }
        let risky: Vec<&str> = container
            .added_capabilities()
            .into_iter()
            .filter(|cap| is_dangerous_capability(cap))
            .collect();
        if !risky.is_empty() {
            findings.push(finding(
                "dangerous_capability",
                format!("{}/securityContext/capabilities/add", container.pointer),
                format!("container '{}' adds {}", container.name(), risky.join(", ")),
            ));
        }
        if container.list != ContainerList::EphemeralContainers {
            let image = container.value.get("image").and_then(Value::as_str);
            if image.is_none_or(|image| image.trim().is_empty()) {
                findings.push(finding(
                    "missing_image",
                    container.pointer.clone(),
                    format!("container '{}' has no image", container.name()),
                ));
            }
        }
    }

    for literal in secrets::secret_env_literals(patched) {
        findings.push(finding(
            "plaintext_secret",
            literal.pointer,
            format!("env var '{}' holds a credential-like literal", literal.name),
        ));
    }

    for literal in secrets::secret_env_literals(original) {
        for pointer in secrets::secret_occurrences(patched, &literal.value) {
            findings.push(finding(
                "secret_survived",
                pointer,
                format!("value of '{}' from the original manifest is still present", literal.name),
            ));
        }
    }

    if manifest::is_workload(patched) || manifest::kind(patched) == Some("Pod") {
        for pod_spec in manifest::pod_spec_pointers(patched) {
            let has_container = patched
                .pointer(&format!("{}/containers", pod_spec))
                .and_then(Value::as_array)
                .is_some_and(|items| !items.is_empty());
            if !has_container {
                findings.push(finding(
                    "no_containers",
                    pod_spec,
                    "pod spec has no containers",
                ));
            }
        }
    }

    findings.sort_by(|a, b| a.pointer.cmp(&b.pointer).then(a.code.cmp(b.code)));
    findings.dedup();
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clean_document_has_no_findings() {
        let doc = json!({
            "kind": "Deployment",
            "spec": {"template": {"spec": {"containers": [{
                "name": "app",
                "image": "app:1.0",
                "securityContext": {"allowPrivilegeEscalation": false}
            }]}}}
        });
        assert!(check_safety(&doc, &doc).is_empty());
    }

    #[test]
    fn nested_template_is_checked_independently() {
        let doc = json!({
            "kind": "CronJob",
            "spec": {"jobTemplate": {"spec": {"template": {"spec": {"containers": [{
                "name": "job",
                "image": "job:1",
                "securityContext": {"allowPrivilegeEscalation": true}
            }]}}}}}
        });
        let findings = check_safety(&doc, &doc);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].code, "escalation_enabled");
        assert!(findings[0]
            .pointer
            .starts_with("/spec/jobTemplate/spec/template/spec/containers/0"));
    }

    #[test]
    fn secret_literal_copied_elsewhere_is_caught() {
        let original = json!({
            "kind": "Pod",
            "spec": {"containers": [{
                "name": "app",
                "image": "app:1",
                "env": [{"name": "API_TOKEN", "value": "s3cr3t-value"}]
            }]}
        });
        let patched = json!({
            "kind": "Pod",
            "metadata": {"annotations": {"note": "s3cr3t-value"}},
            "spec": {"containers": [{
                "name": "app",
                "image": "app:1",
                "env": [{"name": "API_TOKEN", "valueFrom": {"secretKeyRef": {"name": "x", "key": "api_token"}}}]
            }]}
        });
        let codes: Vec<&str> = check_safety(&original, &patched).iter().map(|f| f.code).collect();
        assert_eq!(codes, vec!["secret_survived"]);
        assert_eq!(check_safety(&original, &original)[0].code, "plaintext_secret");
    }

    #[test]
    fn secret_equal_to_image_name_is_not_a_leak() {
        let original = json!({
            "kind": "Pod",
            "metadata": {"name": "db"},
            "spec": {"containers": [{
                "name": "postgres",
                "image": "postgres:16",
                "env": [{"name": "POSTGRES_PASSWORD", "value": "postgres"}]
            }]}
        });
        let patched = json!({
            "kind": "Pod",
            "metadata": {"name": "db"},
            "spec": {"containers": [{
                "name": "postgres",
                "image": "postgres:16",
                "securityContext": {"allowPrivilegeEscalation": false},
                "env": [{"name": "POSTGRES_PASSWORD", "valueFrom": {"secretKeyRef": {
                    "name": "db-secret",
                    "key": "postgres_password"
                }}}]
            }]}
        });
        assert!(check_safety(&original, &patched).is_empty());
    }

    #[test]
    fn empty_container_list_and_missing_image_fail() {
        let doc = json!({"kind": "Pod", "spec": {"containers": []}});
        assert_eq!(check_safety(&doc, &doc)[0].code, "no_containers");
        let doc = json!({"kind": "Pod", "spec": {"containers": [{"name": "a"}]}});
        assert_eq!(check_safety(&doc, &doc)[0].code, "missing_image");
    }

    #[test]
    fn services_are_not_expected_to_have_containers() {
        let doc = json!({"kind": "Service", "spec": {"selector": {"app": "web"}}});
        assert!(check_safety(&doc, &doc).is_empty());
    }
}
