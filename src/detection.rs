//! Detection records consumed by the remediation loop.
//!
//! Detections arrive as a JSON array produced by the upstream detector. Raw
//! linter rule names are normalised to the canonical policy ids the rule
//! engine and predicates are keyed by.

use anyhow::{anyhow, Context};
use serde::{Deserialize, Deserializer, Serialize};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Operator authorisation for rewrites the rule engine otherwise withholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptIn {
    ServiceAccountRewrite,
    ExternalNameRedirect,
}

impl OptIn {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptIn::ServiceAccountRewrite => "service_account_rewrite",
            OptIn::ExternalNameRedirect => "external_name_redirect",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub manifest_path: Option<PathBuf>,
    #[serde(default)]
    pub manifest_yaml: Option<String>,
    pub policy_id: String,
    #[serde(default)]
    pub violation_text: String,
    #[serde(default)]
    pub opt_in: BTreeSet<OptIn>,
}

#[derive(Debug, thiserror::Error)]
pub enum DetectionError {
    #[error("detection {0} has neither manifest_yaml nor manifest_path")]
    NoManifest(String),
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Detection {
    pub fn new(id: impl Into<String>, policy_id: &str, manifest_yaml: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            manifest_path: None,
            manifest_yaml: Some(manifest_yaml.into()),
            policy_id: normalize_policy_id(policy_id),
            violation_text: String::new(),
            opt_in: BTreeSet::new(),
        }
    }

    pub fn with_violation(mut self, text: impl Into<String>) -> Self {
        self.violation_text = text.into();
        self
    }

    pub fn with_opt_in(mut self, marker: OptIn) -> Self {
        self.opt_in.insert(marker);
        self
    }

    pub fn has_opt_in(&self, marker: OptIn) -> bool {
        self.opt_in.contains(&marker)
    }

    /// Manifest text, read from `manifest_path` when it was not supplied inline.
    pub fn manifest(&self) -> Result<Cow<'_, str>, DetectionError> {
        if let Some(yaml) = &self.manifest_yaml {
            return Ok(Cow::Borrowed(yaml.as_str()));
        }
        let path = self
            .manifest_path
            .as_ref()
            .ok_or_else(|| DetectionError::NoManifest(self.id.clone()))?;
        fs::read_to_string(path)
            .map(Cow::Owned)
            .map_err(|source| DetectionError::Read {
                path: path.clone(),
                source,
            })
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Int(value) => value.to_string(),
    })
}

/// Load a detection batch, normalising policy ids and resolving relative
/// manifest paths against the batch file's directory.
pub fn load_detections(path: &Path) -> anyhow::Result<Vec<Detection>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read detections from {}", path.display()))?;
    let mut detections: Vec<Detection> = serde_json::from_str(&content)
        .with_context(|| {
            format!("Detections file {} is not a JSON array of detections", path.display())
        })?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut seen = BTreeSet::new();
    for detection in &mut detections {
        if !seen.insert(detection.id.clone()) {
            return Err(anyhow!("Duplicate detection id '{}'", detection.id));
        }
        if detection.manifest_yaml.is_none() && detection.manifest_path.is_none() {
            return Err(anyhow!(
                "Detection '{}' must include manifest_yaml or manifest_path",
                detection.id
            ));
        }
        detection.policy_id = normalize_policy_id(&detection.policy_id);
        if let Some(manifest_path) = &detection.manifest_path {
            if manifest_path.is_relative() {
                detection.manifest_path = Some(base_dir.join(manifest_path));
            }
        }
    }
    Ok(detections)
}

/// Order detection ids: integer ids first in numeric order, then the rest lexically.
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>().ok(), b.parse::<u64>().ok()) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

const POLICY_ALIASES: &[(&str, &str)] = &[
    ("latest-tag", "no_latest_tag"),
    ("no-privileged", "no_privileged"),
    ("privileged-container", "no_privileged"),
    ("privilege-escalation-container", "drop_capabilities"),
    ("drop-capabilities", "drop_capabilities"),
    ("linux-capabilities", "drop_capabilities"),
    ("invalid-capabilities", "drop_capabilities"),
    ("drop-net-raw-capability", "drop_capabilities"),
    ("cap-sys-admin", "drop_cap_sys_admin"),
    ("sys-admin-capability", "drop_cap_sys_admin"),
    ("allow-privilege-escalation", "no_allow_privilege_escalation"),
    ("allow-privilege-escalation-container", "no_allow_privilege_escalation"),
    ("hostpath", "no_host_path"),
    ("host-path", "no_host_path"),
    ("hostpath-volume", "no_host_path"),
    ("disallow-hostpath", "no_host_path"),
    ("sensitive-host-mounts", "no_host_path"),
    ("docker-sock", "no_host_path"),
    ("hostports", "no_host_ports"),
    ("host-port", "no_host_ports"),
    ("host-ports", "no_host_ports"),
    ("disallow-hostports", "no_host_ports"),
    ("hostnetwork", "no_host_network"),
    ("host-network", "no_host_network"),
    ("hostpid", "no_host_pid"),
    ("host-pid", "no_host_pid"),
    ("hostipc", "no_host_ipc"),
    ("host-ipc", "no_host_ipc"),
    ("run-as-non-root", "run_as_non_root"),
    ("check-runasnonroot", "run_as_non_root"),
    ("run-as-user", "run_as_user"),
    ("check-runasuser", "run_as_user"),
    ("requires-runasuser", "run_as_user"),
    ("no-read-only-root-fs", "read_only_root_fs"),
    ("check-requests-limits", "set_requests_limits"),
    ("unset-cpu-requirements", "set_requests_limits"),
    ("unset-memory-requirements", "set_requests_limits"),
    ("seccomp", "enforce_seccomp"),
    ("seccomp-profile", "enforce_seccomp"),
    ("env-var-secret", "env_var_secret"),
    ("envvar-secret", "env_var_secret"),
    ("dangling-service", "dangling_service"),
    ("non-existent-service-account", "non_existent_service_account"),
    ("deprecated-service-account-field", "deprecated_service_account_field"),
    ("pdb-unhealthy-pod-eviction-policy", "pdb_unhealthy_eviction_policy"),
    ("job-ttl-seconds-after-finished", "job_ttl_after_finished"),
    ("unsafe-sysctls", "unsafe_sysctls"),
];

/// Map a raw linter rule name to its canonical policy id. Unknown ids pass
/// through trimmed and lower-cased.
pub fn normalize_policy_id(raw: &str) -> String {
    let key = raw.trim().to_lowercase();
    POLICY_ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(key)
}
