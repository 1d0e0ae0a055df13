//! Manifest loading and pod-spec discovery.
//!
//! Manifests are held as `serde_json::Value` so patches, predicates and the
//! dry-run serializer all share one tree. Workload kinds nest their pod spec
//! at different depths; discovery walks every known location so callers never
//! special-case a kind.

use serde::Deserialize;
use serde_json::Value;

/// Pod spec locations, deepest first.
pub const POD_SPEC_POINTERS: &[&str] = &[
    "/spec/jobTemplate/spec/template/spec",
    "/spec/jobTemplate/template/spec",
    "/spec/template/spec",
    "/spec",
];

/// Fields that only make sense on a pod spec.
pub const POD_SPEC_FIELDS: &[&str] = &[
    "containers",
    "initContainers",
    "ephemeralContainers",
    "volumes",
    "securityContext",
    "serviceAccount",
    "serviceAccountName",
    "automountServiceAccountToken",
    "hostNetwork",
    "hostPID",
    "hostIPC",
    "nodeSelector",
    "affinity",
    "tolerations",
];

pub const WORKLOAD_KINDS: &[&str] = &[
    "Pod",
    "Deployment",
    "StatefulSet",
    "DaemonSet",
    "ReplicaSet",
    "ReplicationController",
    "Job",
    "CronJob",
];

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("manifest contains no document")]
    Empty,
    #[error("manifest document is not a mapping")]
    NotMapping,
}

/// Parse the first non-empty YAML document of `yaml`; it must be a mapping.
pub fn parse_manifest(yaml: &str) -> Result<Value, ManifestError> {
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = Value::deserialize(document)?;
        match value {
            Value::Null => continue,
            Value::Object(_) => return Ok(value),
            _ => return Err(ManifestError::NotMapping),
        }
    }
    Err(ManifestError::Empty)
}

pub fn to_yaml(document: &Value) -> Result<String, ManifestError> {
    Ok(serde_yaml::to_string(document)?)
}

pub fn kind(document: &Value) -> Option<&str> {
    document.get("kind").and_then(Value::as_str)
}

pub fn is_workload(document: &Value) -> bool {
    kind(document).is_some_and(|k| WORKLOAD_KINDS.contains(&k))
}

pub fn name(document: &Value) -> Option<&str> {
    document.pointer("/metadata/name").and_then(Value::as_str)
}

pub fn namespace(document: &Value) -> &str {
    document
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .unwrap_or("default")
}

fn is_pod_spec_at(document: &Value, pointer: &str) -> bool {
    let Some(Value::Object(map)) = document.pointer(pointer) else {
        return false;
    };
    if pointer == "/spec" {
        return kind(document) == Some("Pod") || map.contains_key("containers");
    }
    true
}

/// Pointers of every pod spec present in `document`, deepest first.
pub fn pod_spec_pointers(document: &Value) -> Vec<&'static str> {
    POD_SPEC_POINTERS
        .iter()
        .copied()
        .filter(|pointer| is_pod_spec_at(document, pointer))
        .collect()
}

/// Whether the top-level `spec` wraps a nested pod template instead of being one.
pub fn has_nested_pod_spec(document: &Value) -> bool {
    pod_spec_pointers(document).iter().any(|p| *p != "/spec")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerList {
    Containers,
    InitContainers,
    EphemeralContainers,
}

impl ContainerList {
    pub const ALL: [ContainerList; 3] = [
        ContainerList::Containers,
        ContainerList::InitContainers,
        ContainerList::EphemeralContainers,
    ];

    pub fn field(&self) -> &'static str {
        match self {
            ContainerList::Containers => "containers",
            ContainerList::InitContainers => "initContainers",
            ContainerList::EphemeralContainers => "ephemeralContainers",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerRef<'a> {
    pub pod_spec: &'static str,
    pub list: ContainerList,
    pub index: usize,
    /// Pointer to the container object itself.
    pub pointer: String,
    pub value: &'a Value,
}

impl ContainerRef<'_> {
    pub fn name(&self) -> &str {
        self.value.get("name").and_then(Value::as_str).unwrap_or("")
    }

    pub fn security_context(&self) -> Option<&Value> {
        self.value.get("securityContext")
    }

    pub fn security_flag(&self, field: &str) -> Option<bool> {
        self.security_context()
            .and_then(|sc| sc.get(field))
            .and_then(Value::as_bool)
    }

    pub fn added_capabilities(&self) -> Vec<&str> {
        self.security_context()
            .and_then(|sc| sc.pointer("/capabilities/add"))
            .and_then(Value::as_array)
            .map(|caps| caps.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// Every container of every list in every pod spec of `document`.
pub fn containers(document: &Value) -> Vec<ContainerRef<'_>> {
    let mut out = Vec::new();
    for pod_spec in pod_spec_pointers(document) {
        out.extend(containers_in(document, pod_spec, &ContainerList::ALL));
    }
    out
}

pub fn containers_in<'a>(
    document: &'a Value,
    pod_spec: &'static str,
    lists: &[ContainerList],
) -> Vec<ContainerRef<'a>> {
    let mut out = Vec::new();
    let Some(spec) = document.pointer(pod_spec) else {
        return out;
    };
    for list in lists {
        let Some(items) = spec.get(list.field()).and_then(Value::as_array) else {
            continue;
        };
        for (index, value) in items.iter().enumerate() {
            if !value.is_object() {
                continue;
            }
            out.push(ContainerRef {
                pod_spec,
                list: *list,
                index,
                pointer: format!("{}/{}/{}", pod_spec, list.field(), index),
                value,
            });
        }
    }
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StructuralCounts {
    pub containers: usize,
    pub init_containers: usize,
    pub volumes: usize,
}

/// Containers, init containers and volumes summed over all pod specs.
pub fn structural_counts(document: &Value) -> StructuralCounts {
    let mut counts = StructuralCounts::default();
    for pointer in POD_SPEC_POINTERS {
        let Some(spec) = document.pointer(pointer) else {
            continue;
        };
        let len = |field: &str| spec.get(field).and_then(Value::as_array).map_or(0, Vec::len);
        counts.containers += len("containers");
        counts.init_containers += len("initContainers");
        counts.volumes += len("volumes");
    }
    counts
}

/// `serviceAccountName`, falling back to the deprecated `serviceAccount`.
pub fn effective_service_account<'a>(document: &'a Value, pod_spec: &str) -> Option<&'a str> {
    let spec = document.pointer(pod_spec)?;
    spec.get("serviceAccountName")
        .and_then(Value::as_str)
        .or_else(|| spec.get("serviceAccount").and_then(Value::as_str))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CRONJOB: &str = r#"
apiVersion: batch/v1
kind: CronJob
metadata:
  name: nightly
spec:
  schedule: "0 0 * * *"
  jobTemplate:
    spec:
      template:
        spec:
          containers:
            - name: job
              image: busybox:1.36
          volumes:
            - name: scratch
              emptyDir: {}
"#;

    #[test]
    fn parses_first_mapping_document() {
        let doc = parse_manifest("---\nkind: Pod\nmetadata:\n  name: a\n---\nkind: Service\n")
            .unwrap();
        assert_eq!(kind(&doc), Some("Pod"));
        assert!(matches!(parse_manifest("- a\n- b\n"), Err(ManifestError::NotMapping)));
        assert!(matches!(parse_manifest(""), Err(ManifestError::Empty)));
        assert!(matches!(parse_manifest("a: [b"), Err(ManifestError::Yaml(_))));
    }

    #[test]
    fn discovers_nested_cronjob_pod_spec() {
        let doc = parse_manifest(CRONJOB).unwrap();
        assert_eq!(
            pod_spec_pointers(&doc),
            vec!["/spec/jobTemplate/spec/template/spec"]
        );
        assert!(has_nested_pod_spec(&doc));
        let found = containers(&doc);
        assert_eq!(found.len(), 1);
        assert_eq!(
            found[0].pointer,
            "/spec/jobTemplate/spec/template/spec/containers/0"
        );
        assert_eq!(found[0].name(), "job");
    }

    #[test]
    fn service_spec_is_not_a_pod_spec() {
        let doc = parse_manifest("kind: Service\nspec:\n  selector:\n    app: web\n").unwrap();
        assert!(pod_spec_pointers(&doc).is_empty());
        assert!(!is_workload(&doc));
    }

    #[test]
    fn counts_cover_all_container_lists() {
        let doc = parse_manifest(
            "kind: Pod\nspec:\n  initContainers:\n    - name: init\n  containers:\n    - name: a\n    - name: b\n  volumes:\n    - name: v\n",
        )
        .unwrap();
        assert_eq!(
            structural_counts(&doc),
            StructuralCounts {
                containers: 2,
                init_containers: 1,
                volumes: 1
            }
        );
        assert_eq!(containers(&doc).len(), 3);
    }

    #[test]
    fn effective_service_account_prefers_name_field() {
        let doc = parse_manifest(
            "kind: Pod\nspec:\n  serviceAccount: legacy\n  serviceAccountName: current\n  containers: []\n",
        )
        .unwrap();
        assert_eq!(effective_service_account(&doc, "/spec"), Some("current"));
    }
}
