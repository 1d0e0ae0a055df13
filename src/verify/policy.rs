//! Built-in detection predicates, one per catalogued policy.

use super::{PolicyPredicates, Violation};
use crate::manifest::{self, ContainerList, ContainerRef};
use crate::rules::{is_dangerous_capability, DANGEROUS_CAPABILITIES};
use crate::secrets;
use serde_json::Value;

type Predicate = fn(&Value) -> Vec<Violation>;

const SAFE_SYSCTLS: &[&str] = &[
    "kernel.shm_rmid_forced",
    "net.ipv4.ip_local_port_range",
    "net.ipv4.ip_unprivileged_port_start",
    "net.ipv4.tcp_syncookies",
    "net.ipv4.ping_group_range",
];

const PREDICATES: &[(&str, Predicate)] = &[
    ("no_latest_tag", no_latest_tag),
    ("no_privileged", no_privileged),
    ("no_allow_privilege_escalation", no_allow_privilege_escalation),
    ("drop_capabilities", drop_capabilities),
    ("drop_cap_sys_admin", drop_cap_sys_admin),
    ("enforce_seccomp", enforce_seccomp),
    ("set_requests_limits", set_requests_limits),
    ("read_only_root_fs", read_only_root_fs),
    ("run_as_non_root", run_as_non_root),
    ("run_as_user", run_as_user),
    ("no_host_path", no_host_path),
    ("no_host_ports", no_host_ports),
    ("no_host_network", no_host_network),
    ("no_host_pid", no_host_pid),
    ("no_host_ipc", no_host_ipc),
    ("job_ttl_after_finished", job_ttl_after_finished),
    ("unsafe_sysctls", unsafe_sysctls),
    ("deprecated_service_account_field", deprecated_service_account_field),
    ("env_var_secret", env_var_secret),
    ("pdb_unhealthy_eviction_policy", pdb_unhealthy_eviction_policy),
    ("dangling_service", dangling_service),
    ("non_existent_service_account", non_existent_service_account),
];

/// Structural re-implementation of the detector checks over a single document.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinPolicies;

impl PolicyPredicates for BuiltinPolicies {
    fn supports(&self, policy_id: &str) -> bool {
        PREDICATES.iter().any(|(id, _)| *id == policy_id)
    }

    fn policy_ids(&self) -> Vec<String> {
        PREDICATES.iter().map(|(id, _)| id.to_string()).collect()
    }

    fn violations(&self, policy_id: &str, document: &Value) -> Vec<Violation> {
        PREDICATES
            .iter()
            .find(|(id, _)| *id == policy_id)
            .map(|(_, predicate)| predicate(document))
            .unwrap_or_default()
            .into_iter()
            .map(|mut violation| {
                violation.policy_id = policy_id.to_string();
                violation
            })
            .collect()
    }
}

fn violation(pointer: impl Into<String>, message: impl Into<String>) -> Violation {
    Violation {
        policy_id: String::new(),
        pointer: pointer.into(),
        message: message.into(),
    }
}

fn per_container(
    document: &Value,
    lists: &[ContainerList],
    check: impl Fn(&Value, &ContainerRef<'_>) -> Option<String>,
) -> Vec<Violation> {
    let mut out = Vec::new();
    for pod_spec in manifest::pod_spec_pointers(document) {
        for container in manifest::containers_in(document, pod_spec, lists) {
            if let Some(message) = check(document, &container) {
                out.push(violation(container.pointer.clone(), message));
            }
        }
    }
    out
}

fn all_containers(
    document: &Value,
    check: impl Fn(&Value, &ContainerRef<'_>) -> Option<String>,
) -> Vec<Violation> {
    per_container(document, &ContainerList::ALL, check)
}

fn app_containers(
    document: &Value,
    check: impl Fn(&Value, &ContainerRef<'_>) -> Option<String>,
) -> Vec<Violation> {
    per_container(
        document,
        &[ContainerList::Containers, ContainerList::InitContainers],
        check,
    )
}

fn pod_security<'a>(document: &'a Value, pod_spec: &str, field: &str) -> Option<&'a Value> {
    document
        .pointer(pod_spec)
        .and_then(|spec| spec.get("securityContext"))
        .and_then(|sc| sc.get(field))
}

fn is_floating_image(image: &str) -> bool {
    if image.trim().is_empty() {
        return true;
    }
    if image.contains('@') {
        return false;
    }
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].rfind(':') {
        Some(colon) => &image[name_start + colon + 1..] == "latest",
        None => true,
    }
}

fn no_latest_tag(document: &Value) -> Vec<Violation> {
    all_containers(document, |_, c| {
        let image = c.value.get("image").and_then(Value::as_str).unwrap_or("");
        is_floating_image(image)
            .then(|| format!("container '{}' uses floating image '{}'", c.name(), image))
    })
}

fn no_privileged(document: &Value) -> Vec<Violation> {
    all_containers(document, |_, c| {
        (c.security_flag("privileged") == Some(true))
            .then(|| format!("container '{}' runs privileged", c.name()))
    })
}

fn no_allow_privilege_escalation(document: &Value) -> Vec<Violation> {
    all_containers(document, |_, c| {
        (c.security_flag("allowPrivilegeEscalation") != Some(false))
            .then(|| format!("container '{}' does not disable privilege escalation", c.name()))
    })
}

fn dropped(container: &ContainerRef<'_>) -> Vec<String> {
    container
        .security_context()
        .and_then(|sc| sc.pointer("/capabilities/drop"))
        .and_then(Value::as_array)
        .map(|caps| {
            caps.iter()
                .filter_map(Value::as_str)
                .map(|cap| cap.trim().to_ascii_uppercase())
                .collect()
        })
        .unwrap_or_default()
}

fn drop_capabilities(document: &Value) -> Vec<Violation> {
    all_containers(document, |_, c| {
        let added: Vec<&str> = c
            .added_capabilities()
            .into_iter()
            .filter(|cap| is_dangerous_capability(cap))
            .collect();
        if !added.is_empty() {
            return Some(format!("container '{}' adds {}", c.name(), added.join(", ")));
        }
        let dropped = dropped(c);
        if dropped.iter().any(|cap| cap == "ALL") {
            return None;
        }
        let missing: Vec<&str> = DANGEROUS_CAPABILITIES
            .iter()
            .copied()
            .filter(|cap| !dropped.iter().any(|d| d == cap))
            .collect();
        (!missing.is_empty())
            .then(|| format!("container '{}' does not drop {}", c.name(), missing.join(", ")))
    })
}

fn drop_cap_sys_admin(document: &Value) -> Vec<Violation> {
    all_containers(document, |_, c| {
        let adds_sys_admin = c.added_capabilities().iter().any(|cap| {
            let upper = cap.trim().to_ascii_uppercase();
            upper == "SYS_ADMIN" || upper == "CAP_SYS_ADMIN" || upper == "ALL"
        });
        adds_sys_admin.then(|| format!("container '{}' adds SYS_ADMIN", c.name()))
    })
}

fn enforce_seccomp(document: &Value) -> Vec<Violation> {
    all_containers(document, |doc, c| {
        let profile = c
            .security_context()
            .and_then(|sc| sc.get("seccompProfile"))
            .or_else(|| pod_security(doc, c.pod_spec, "seccompProfile"));
        let confined = matches!(
            profile.and_then(|p| p.get("type")).and_then(Value::as_str),
            Some("RuntimeDefault") | Some("Localhost")
        );
        (!confined).then(|| format!("container '{}' has no confined seccomp profile", c.name()))
    })
}

fn set_requests_limits(document: &Value) -> Vec<Violation> {
    app_containers(document, |_, c| {
        let fields = ["requests/cpu", "requests/memory", "limits/cpu", "limits/memory"];
        let missing: Vec<String> = fields
            .iter()
            .filter(|field| {
                c.value
                    .pointer(&format!("/resources/{}", field))
                    .is_none_or(Value::is_null)
            })
            .map(|field| field.replace('/', "."))
            .collect();
        (!missing.is_empty())
            .then(|| format!("container '{}' is missing {}", c.name(), missing.join(", ")))
    })
}

fn read_only_root_fs(document: &Value) -> Vec<Violation> {
    app_containers(document, |_, c| {
        (c.security_flag("readOnlyRootFilesystem") != Some(true))
            .then(|| format!("container '{}' has a writable root filesystem", c.name()))
    })
}

fn run_as_non_root(document: &Value) -> Vec<Violation> {
    app_containers(document, |doc, c| {
        let effective = c
            .security_flag("runAsNonRoot")
            .or_else(|| pod_security(doc, c.pod_spec, "runAsNonRoot").and_then(Value::as_bool));
        (effective != Some(true)).then(|| format!("container '{}' may run as root", c.name()))
    })
}

fn run_as_user(document: &Value) -> Vec<Violation> {
    app_containers(document, |doc, c| {
        let effective = c
            .security_context()
            .and_then(|sc| sc.get("runAsUser"))
            .or_else(|| pod_security(doc, c.pod_spec, "runAsUser"))
            .and_then(Value::as_u64);
        matches!(effective, None | Some(0))
            .then(|| format!("container '{}' has no non-root runAsUser", c.name()))
    })
}

fn no_host_path(document: &Value) -> Vec<Violation> {
    let mut out = Vec::new();
    for pod_spec in manifest::pod_spec_pointers(document) {
        let volumes = document
            .pointer(&format!("{}/volumes", pod_spec))
            .and_then(Value::as_array);
        for (index, volume) in volumes.into_iter().flatten().enumerate() {
            if volume.get("hostPath").is_some() {
                out.push(violation(
                    format!("{}/volumes/{}", pod_spec, index),
                    "volume mounts a host path",
                ));
            }
        }
    }
    out
}

fn no_host_ports(document: &Value) -> Vec<Violation> {
    all_containers(document, |_, c| {
        let uses_host_port = c
            .value
            .get("ports")
            .and_then(Value::as_array)
            .is_some_and(|ports| ports.iter().any(|p| p.get("hostPort").is_some()));
        uses_host_port.then(|| format!("container '{}' binds a host port", c.name()))
    })
}

fn pod_flag(document: &Value, field: &str) -> Vec<Violation> {
    manifest::pod_spec_pointers(document)
        .into_iter()
        .filter(|pod_spec| {
            document
                .pointer(&format!("{}/{}", pod_spec, field))
                .and_then(Value::as_bool)
                == Some(true)
        })
        .map(|pod_spec| violation(pod_spec, format!("pod spec enables {}", field)))
        .collect()
}

fn no_host_network(document: &Value) -> Vec<Violation> {
    pod_flag(document, "hostNetwork")
}

fn no_host_pid(document: &Value) -> Vec<Violation> {
    pod_flag(document, "hostPID")
}

fn no_host_ipc(document: &Value) -> Vec<Violation> {
    pod_flag(document, "hostIPC")
}

fn job_ttl_after_finished(document: &Value) -> Vec<Violation> {
    let job_spec = match manifest::kind(document) {
        Some("Job") => "/spec",
        Some("CronJob") => "/spec/jobTemplate/spec",
        _ => return Vec::new(),
    };
    if document
        .pointer(&format!("{}/ttlSecondsAfterFinished", job_spec))
        .is_some()
    {
        return Vec::new();
    }
    vec![violation(job_spec, "job has no ttlSecondsAfterFinished")]
}

fn unsafe_sysctls(document: &Value) -> Vec<Violation> {
    let mut out = Vec::new();
    for pod_spec in manifest::pod_spec_pointers(document) {
        let pointer = format!("{}/securityContext/sysctls", pod_spec);
        let unsafe_names: Vec<&str> = document
            .pointer(&pointer)
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|s| s.get("name").and_then(Value::as_str))
            .filter(|name| !SAFE_SYSCTLS.contains(name))
            .collect();
        if !unsafe_names.is_empty() {
            out.push(violation(pointer, format!("unsafe sysctls {}", unsafe_names.join(", "))));
        }
    }
    out
}

fn deprecated_service_account_field(document: &Value) -> Vec<Violation> {
    manifest::pod_spec_pointers(document)
        .into_iter()
        .filter(|pod_spec| {
            document
                .pointer(&format!("{}/serviceAccount", pod_spec))
                .is_some()
        })
        .map(|pod_spec| {
            violation(
                format!("{}/serviceAccount", pod_spec),
                "deprecated serviceAccount field is set",
            )
        })
        .collect()
}

fn env_var_secret(document: &Value) -> Vec<Violation> {
    secrets::secret_env_literals(document)
        .into_iter()
        .map(|literal| {
            violation(
                literal.pointer,
                format!("env var '{}' carries a literal secret value", literal.name),
            )
        })
        .collect()
}

fn pdb_unhealthy_eviction_policy(document: &Value) -> Vec<Violation> {
    if manifest::kind(document) != Some("PodDisruptionBudget") {
        return Vec::new();
    }
    let policy = document
        .pointer("/spec/unhealthyPodEvictionPolicy")
        .and_then(Value::as_str);
    if policy == Some("AlwaysAllow") {
        return Vec::new();
    }
    vec![violation(
        "/spec",
        "unhealthyPodEvictionPolicy is not AlwaysAllow",
    )]
}

/// Without cluster inventory a selector-backed Service cannot be proven to
/// have endpoints, so only an ExternalName redirect clears the check.
fn dangling_service(document: &Value) -> Vec<Violation> {
    if manifest::kind(document) != Some("Service") {
        return Vec::new();
    }
    let external = document.pointer("/spec/type").and_then(Value::as_str) == Some("ExternalName");
    let has_selector = document.pointer("/spec/selector").is_some();
    if external || !has_selector {
        return Vec::new();
    }
    vec![violation("/spec/selector", "service selector may match no pods")]
}

/// Accounts other than `default` cannot be verified against the cluster.
fn non_existent_service_account(document: &Value) -> Vec<Violation> {
    manifest::pod_spec_pointers(document)
        .into_iter()
        .filter_map(|pod_spec| {
            let account = manifest::effective_service_account(document, pod_spec)?;
            (account != "default").then(|| {
                violation(
                    pod_spec,
                    format!("service account '{}' is not known to exist", account),
                )
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parse_manifest;

    fn check(policy: &str, yaml: &str) -> Vec<Violation> {
        BuiltinPolicies.violations(policy, &parse_manifest(yaml).unwrap())
    }

    #[test]
    fn latest_and_untagged_images_violate() {
        let yaml = "kind: Pod\nspec:\n  containers:\n    - name: a\n      image: app:latest\n    - name: b\n      image: app\n    - name: c\n      image: app:1.0\n";
        let found = check("no_latest_tag", yaml);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].policy_id, "no_latest_tag");
        assert_eq!(found[1].pointer, "/spec/containers/1");
    }

    #[test]
    fn nested_cronjob_containers_are_checked() {
        let yaml = "kind: CronJob\nspec:\n  jobTemplate:\n    spec:\n      template:\n        spec:\n          containers:\n            - name: a\n              image: a:1\n              securityContext:\n                privileged: true\n";
        let found = check("no_privileged", yaml);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pointer, "/spec/jobTemplate/spec/template/spec/containers/0");
        assert_eq!(check("job_ttl_after_finished", yaml).len(), 1);
    }

    #[test]
    fn capabilities_need_drop_and_no_dangerous_add() {
        let yaml = "kind: Pod\nspec:\n  containers:\n    - name: a\n      image: a:1\n      securityContext:\n        capabilities:\n          drop: [\"ALL\"]\n";
        assert!(check("drop_capabilities", yaml).is_empty());
        let yaml = "kind: Pod\nspec:\n  containers:\n    - name: a\n      image: a:1\n      securityContext:\n        capabilities:\n          drop: [\"ALL\"]\n          add: [\"NET_RAW\"]\n";
        assert_eq!(check("drop_capabilities", yaml).len(), 1);
    }

    #[test]
    fn unknown_policy_reports_nothing() {
        assert!(!BuiltinPolicies.supports("no_anti_affinity"));
        assert!(check("no_anti_affinity", "kind: Pod\nspec: {}\n").is_empty());
    }

    #[test]
    fn pod_level_security_context_counts() {
        let yaml = "kind: Pod\nspec:\n  securityContext:\n    runAsNonRoot: true\n    runAsUser: 1000\n  containers:\n    - name: a\n      image: a:1\n";
        assert!(check("run_as_non_root", yaml).is_empty());
        assert!(check("run_as_user", yaml).is_empty());
    }
}
