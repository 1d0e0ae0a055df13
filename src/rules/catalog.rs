use super::{is_dangerous_capability, EditBuilder, Transform, DANGEROUS_CAPABILITIES};
use crate::detection::OptIn;
use crate::manifest::{self, ContainerList, ContainerRef};
use crate::secrets;
use serde_json::{json, Value};

pub(super) const BUILTIN_RULES: &[(&str, Transform, Option<OptIn>)] = &[
    ("no_latest_tag", no_latest_tag, None),
    ("no_privileged", no_privileged, None),
    ("no_allow_privilege_escalation", no_allow_privilege_escalation, None),
    ("drop_capabilities", drop_capabilities, None),
    ("drop_cap_sys_admin", drop_cap_sys_admin, None),
    ("enforce_seccomp", enforce_seccomp, None),
    ("set_requests_limits", set_requests_limits, None),
    ("read_only_root_fs", read_only_root_fs, None),
    ("run_as_non_root", run_as_non_root, None),
    ("run_as_user", run_as_user, None),
    ("no_host_path", no_host_path, None),
    ("no_host_ports", no_host_ports, None),
    ("no_host_network", no_host_network, None),
    ("no_host_pid", no_host_pid, None),
    ("no_host_ipc", no_host_ipc, None),
    ("job_ttl_after_finished", job_ttl_after_finished, None),
    ("unsafe_sysctls", unsafe_sysctls, None),
    ("deprecated_service_account_field", deprecated_service_account_field, None),
    ("env_var_secret", env_var_secret, None),
    ("pdb_unhealthy_eviction_policy", pdb_unhealthy_eviction_policy, None),
    ("dangling_service", dangling_service, Some(OptIn::ExternalNameRedirect)),
    (
        "non_existent_service_account",
        non_existent_service_account,
        Some(OptIn::ServiceAccountRewrite),
    ),
];

const PINNED_TAG: &str = "stable";
const FALLBACK_IMAGE: &str = "busybox:stable";
const RUN_AS_USER: u64 = 1000;
const JOB_TTL_SECONDS: u64 = 3600;
const RESOURCE_DEFAULTS: &[(&str, &str, &str)] = &[
    ("requests", "cpu", "100m"),
    ("requests", "memory", "128Mi"),
    ("limits", "cpu", "500m"),
    ("limits", "memory", "256Mi"),
];

/// Pinned form of `image` when it floats on `latest` or carries no tag.
fn pinned_image(image: &str) -> Option<String> {
    if image.contains('@') {
        return None;
    }
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].rfind(':') {
        Some(colon) => {
            let split = name_start + colon;
            (&image[split + 1..] == "latest").then(|| format!("{}:{}", &image[..split], PINNED_TAG))
        }
        None => Some(format!("{}:{}", image, PINNED_TAG)),
    }
}

fn app_containers(document: &Value) -> Vec<ContainerRef<'_>> {
    manifest::pod_spec_pointers(document)
        .into_iter()
        .flat_map(|pod_spec| {
            manifest::containers_in(
                document,
                pod_spec,
                &[ContainerList::Containers, ContainerList::InitContainers],
            )
        })
        .collect()
}

fn pod_security_value<'a>(document: &'a Value, pod_spec: &str, field: &str) -> Option<&'a Value> {
    document
        .pointer(pod_spec)
        .and_then(|spec| spec.get("securityContext"))
        .and_then(|sc| sc.get(field))
}

fn no_latest_tag(document: &Value, edits: &mut EditBuilder) {
    for container in manifest::containers(document) {
        let image = container.value.get("image").and_then(Value::as_str).unwrap_or("");
        let replacement = if image.trim().is_empty() {
            Some(FALLBACK_IMAGE.to_string())
        } else {
            pinned_image(image)
        };
        if let Some(pinned) = replacement {
            edits.set(&container.pointer, &["image"], json!(pinned));
        }
    }
}

fn no_privileged(document: &Value, edits: &mut EditBuilder) {
    for container in manifest::containers(document) {
        if container.security_flag("privileged") == Some(true) {
            edits.set(&container.pointer, &["securityContext", "privileged"], json!(false));
        }
    }
}

fn no_allow_privilege_escalation(document: &Value, edits: &mut EditBuilder) {
    for container in manifest::containers(document) {
        if container.security_flag("allowPrivilegeEscalation") != Some(false) {
            edits.set(
                &container.pointer,
                &["securityContext", "allowPrivilegeEscalation"],
                json!(false),
            );
        }
    }
}

fn dropped_capabilities<'a>(container: &'a ContainerRef<'_>) -> Vec<&'a str> {
    container
        .security_context()
        .and_then(|sc| sc.pointer("/capabilities/drop"))
        .and_then(Value::as_array)
        .map(|caps| caps.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn strip_added(
    container: &ContainerRef<'_>,
    edits: &mut EditBuilder,
    strip: impl Fn(&str) -> bool,
) {
    let added = container.added_capabilities();
    if !added.iter().any(|&cap| strip(cap)) {
        return;
    }
    let kept: Vec<&str> = added.into_iter().filter(|&cap| !strip(cap)).collect();
    if kept.is_empty() {
        edits.remove(&format!("{}/securityContext/capabilities/add", container.pointer));
    } else {
        edits.set(
            &container.pointer,
            &["securityContext", "capabilities", "add"],
            json!(kept),
        );
    }
}

fn drop_capabilities(document: &Value, edits: &mut EditBuilder) {
    for container in manifest::containers(document) {
        let dropped = dropped_capabilities(&container);
        if !dropped.iter().any(|cap| cap.eq_ignore_ascii_case("ALL")) {
            let mut wanted: Vec<&str> = dropped.clone();
            for cap in DANGEROUS_CAPABILITIES {
                if !dropped.iter().any(|d| d.eq_ignore_ascii_case(cap)) {
                    wanted.push(*cap);
                }
            }
            if wanted.len() != dropped.len() {
                edits.set(
                    &container.pointer,
                    &["securityContext", "capabilities", "drop"],
                    json!(wanted),
                );
            }
        }
        strip_added(&container, edits, is_dangerous_capability);
        if container.security_flag("privileged") == Some(true) {
            edits.set(&container.pointer, &["securityContext", "privileged"], json!(false));
        }
        if container.security_flag("allowPrivilegeEscalation") == Some(true) {
            edits.set(
                &container.pointer,
                &["securityContext", "allowPrivilegeEscalation"],
                json!(false),
            );
        }
    }
}

fn is_sys_admin(capability: &str) -> bool {
    let upper = capability.trim().to_ascii_uppercase();
    upper == "SYS_ADMIN" || upper == "CAP_SYS_ADMIN" || upper == "ALL"
}

fn drop_cap_sys_admin(document: &Value, edits: &mut EditBuilder) {
    for container in manifest::containers(document) {
        strip_added(&container, edits, is_sys_admin);
        let dropped = dropped_capabilities(&container);
        if !dropped.iter().any(|cap| is_sys_admin(cap)) {
            let mut wanted = dropped.clone();
            wanted.push("SYS_ADMIN");
            edits.set(
                &container.pointer,
                &["securityContext", "capabilities", "drop"],
                json!(wanted),
            );
        }
    }
}

fn is_confined_profile(profile: Option<&Value>) -> bool {
    matches!(
        profile.and_then(|p| p.get("type")).and_then(Value::as_str),
        Some("RuntimeDefault") | Some("Localhost")
    )
}

fn enforce_seccomp(document: &Value, edits: &mut EditBuilder) {
    for container in manifest::containers(document) {
        let own = container.security_context().and_then(|sc| sc.get("seccompProfile"));
        let confined = match own {
            Some(_) => is_confined_profile(own),
            None => is_confined_profile(pod_security_value(
                document,
                container.pod_spec,
                "seccompProfile",
            )),
        };
        if !confined {
            edits.set(
                &container.pointer,
                &["securityContext", "seccompProfile"],
                json!({"type": "RuntimeDefault"}),
            );
        }
    }
}

fn set_requests_limits(document: &Value, edits: &mut EditBuilder) {
    for container in app_containers(document) {
        let mut resources = container
            .value
            .get("resources")
            .filter(|r| r.is_object())
            .cloned()
            .unwrap_or_else(|| json!({}));
        for (section, field, default) in RESOURCE_DEFAULTS {
            let Some(map) = resources.as_object_mut() else {
                continue;
            };
            let entry = map.entry(section.to_string()).or_insert_with(|| json!({}));
            if !entry.is_object() {
                *entry = json!({});
            }
            if let Some(section_map) = entry.as_object_mut() {
                section_map
                    .entry(field.to_string())
                    .or_insert_with(|| json!(default));
            }
        }
        edits.set(&container.pointer, &["resources"], resources);
    }
}

fn read_only_root_fs(document: &Value, edits: &mut EditBuilder) {
    for container in app_containers(document) {
        if container.security_flag("readOnlyRootFilesystem") != Some(true) {
            edits.set(
                &container.pointer,
                &["securityContext", "readOnlyRootFilesystem"],
                json!(true),
            );
        }
    }
}

fn run_as_non_root(document: &Value, edits: &mut EditBuilder) {
    for container in app_containers(document) {
        let effective = container.security_flag("runAsNonRoot").or_else(|| {
            pod_security_value(document, container.pod_spec, "runAsNonRoot")
                .and_then(Value::as_bool)
        });
        if effective != Some(true) {
            edits.set(&container.pointer, &["securityContext", "runAsNonRoot"], json!(true));
        }
    }
}

fn run_as_user(document: &Value, edits: &mut EditBuilder) {
    for container in app_containers(document) {
        let effective = container
            .security_context()
            .and_then(|sc| sc.get("runAsUser"))
            .or_else(|| pod_security_value(document, container.pod_spec, "runAsUser"))
            .and_then(Value::as_u64);
        if matches!(effective, None | Some(0)) {
            edits.set(
                &container.pointer,
                &["securityContext", "runAsUser"],
                json!(RUN_AS_USER),
            );
        }
    }
}

fn no_host_path(document: &Value, edits: &mut EditBuilder) {
    for pod_spec in manifest::pod_spec_pointers(document) {
        let Some(volumes) = document
            .pointer(&format!("{}/volumes", pod_spec))
            .and_then(Value::as_array)
        else {
            continue;
        };
        for (index, volume) in volumes.iter().enumerate() {
            if volume.get("hostPath").is_none() {
                continue;
            }
            let name = volume.get("name").cloned().unwrap_or(Value::Null);
            edits.set(
                &format!("{}/volumes", pod_spec),
                &[&index.to_string()],
                json!({"name": name, "emptyDir": {}}),
            );
        }
    }
}

fn no_host_ports(document: &Value, edits: &mut EditBuilder) {
    for container in manifest::containers(document) {
        let Some(ports) = container.value.get("ports").and_then(Value::as_array) else {
            continue;
        };
        for (index, port) in ports.iter().enumerate() {
            if port.get("hostPort").is_some() {
                edits.remove(&format!("{}/ports/{}/hostPort", container.pointer, index));
            }
        }
    }
}

fn clear_pod_flag(document: &Value, edits: &mut EditBuilder, field: &str) {
    for pod_spec in manifest::pod_spec_pointers(document) {
        let enabled = document
            .pointer(pod_spec)
            .and_then(|spec| spec.get(field))
            .and_then(Value::as_bool)
            == Some(true);
        if enabled {
            edits.set(pod_spec, &[field], json!(false));
        }
    }
}

fn no_host_network(document: &Value, edits: &mut EditBuilder) {
    clear_pod_flag(document, edits, "hostNetwork");
}

fn no_host_pid(document: &Value, edits: &mut EditBuilder) {
    clear_pod_flag(document, edits, "hostPID");
}

fn no_host_ipc(document: &Value, edits: &mut EditBuilder) {
    clear_pod_flag(document, edits, "hostIPC");
}

/// Pointer of the Job spec that owns `ttlSecondsAfterFinished`.
fn job_spec_pointer(document: &Value) -> Option<&'static str> {
    match manifest::kind(document) {
        Some("Job") => Some("/spec"),
        Some("CronJob") => Some("/spec/jobTemplate/spec"),
        _ => None,
    }
}

fn job_ttl_after_finished(document: &Value, edits: &mut EditBuilder) {
    let Some(job_spec) = job_spec_pointer(document) else {
        return;
    };
    if document.pointer(&format!("{}/ttlSecondsAfterFinished", job_spec)).is_none() {
        edits.set(job_spec, &["ttlSecondsAfterFinished"], json!(JOB_TTL_SECONDS));
    }
}

fn unsafe_sysctls(document: &Value, edits: &mut EditBuilder) {
    for pod_spec in manifest::pod_spec_pointers(document) {
        edits.remove(&format!("{}/securityContext/sysctls", pod_spec));
    }
}

fn deprecated_service_account_field(document: &Value, edits: &mut EditBuilder) {
    for pod_spec in manifest::pod_spec_pointers(document) {
        let Some(spec) = document.pointer(pod_spec) else {
            continue;
        };
        if spec.get("serviceAccount").is_none() {
            continue;
        }
        let from = format!("{}/serviceAccount", pod_spec);
        if spec.get("serviceAccountName").is_some() {
            edits.remove(&from);
        } else {
            edits.push(crate::patch::PatchOperation::Move {
                from,
                path: format!("{}/serviceAccountName", pod_spec),
            });
        }
    }
}

fn slug(text: &str, separator: char) -> String {
    let mut out = String::new();
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with(separator) {
            out.push(separator);
        }
    }
    out.trim_end_matches(separator).to_string()
}

/// Secret name and key a literal env value is moved to.
fn secret_ref_for(document: &Value, env_name: &str) -> (String, String) {
    let workload = manifest::name(document).map(|n| slug(n, '-')).unwrap_or_default();
    let workload = if workload.is_empty() { "app".to_string() } else { workload };
    let key = slug(env_name, '_');
    let key = if key.is_empty() { "value".to_string() } else { key };
    (format!("{}-secret", workload), key)
}

fn env_var_secret(document: &Value, edits: &mut EditBuilder) {
    for literal in secrets::secret_env_literals(document) {
        let (secret_name, key) = secret_ref_for(document, &literal.name);
        let (base, index) = match literal.pointer.rsplit_once('/') {
            Some(parts) => parts,
            None => continue,
        };
        edits.set(
            base,
            &[index],
            json!({
                "name": literal.name,
                "valueFrom": {"secretKeyRef": {"name": secret_name, "key": key}}
            }),
        );
    }
}

fn pdb_unhealthy_eviction_policy(document: &Value, edits: &mut EditBuilder) {
    if manifest::kind(document) != Some("PodDisruptionBudget") {
        return;
    }
    edits.set("", &["spec", "unhealthyPodEvictionPolicy"], json!("AlwaysAllow"));
}

fn dangling_service(document: &Value, edits: &mut EditBuilder) {
    if manifest::kind(document) != Some("Service") {
        return;
    }
    if document.pointer("/spec/type").and_then(Value::as_str) == Some("ExternalName") {
        return;
    }
    let name = manifest::name(document).unwrap_or("service");
    let target = format!("{}.{}.svc.cluster.local", name, manifest::namespace(document));
    for field in ["selector", "ports", "clusterIP", "clusterIPs"] {
        edits.remove(&format!("/spec/{}", field));
    }
    edits.set("", &["spec", "type"], json!("ExternalName"));
    edits.set("", &["spec", "externalName"], json!(target));
}

fn non_existent_service_account(document: &Value, edits: &mut EditBuilder) {
    for pod_spec in manifest::pod_spec_pointers(document) {
        match manifest::effective_service_account(document, pod_spec) {
            Some(account) if account != "default" => {
                edits.set(pod_spec, &["serviceAccountName"], json!("default"));
                edits.remove(&format!("{}/serviceAccount", pod_spec));
            }
            _ => {}
        }
    }
}
