//! Read-only corrective guidance injected into retry prompts.

use crate::detection::normalize_policy_id;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::OnceLock;

const BUILTIN_GUIDANCE: &[(&str, &str)] = &[
    (
        "no_latest_tag",
        "Pin every container image to an explicit tag instead of :latest or no tag. Replace /spec/containers/N/image with the same repository and a concrete tag.",
    ),
    (
        "no_privileged",
        "Set securityContext.privileged to false for every container, creating securityContext if missing.",
    ),
    (
        "no_allow_privilege_escalation",
        "Set securityContext.allowPrivilegeEscalation to false for every container, creating securityContext if missing.",
    ),
    (
        "drop_capabilities",
        "Ensure dangerous capabilities (NET_RAW, NET_ADMIN, SYS_ADMIN, SYS_MODULE, SYS_PTRACE, SYS_CHROOT) are dropped and absent from capabilities.add.",
    ),
    (
        "drop_cap_sys_admin",
        "Remove SYS_ADMIN from securityContext.capabilities.add and list it under capabilities.drop.",
    ),
    (
        "enforce_seccomp",
        "Set securityContext.seccompProfile.type to \"RuntimeDefault\" (create securityContext/seccompProfile if missing).",
    ),
    (
        "set_requests_limits",
        "If resources.requests or resources.limits are missing, add the missing object(s). Do not remove fields that don't exist. Use paths like /spec/containers/0/resources, /spec/containers/0/resources/requests, and /spec/containers/0/resources/limits.\n\nPopulate cpu and memory with sane defaults (requests.cpu=100m, requests.memory=128Mi, limits.cpu=500m, limits.memory=256Mi).",
    ),
    (
        "read_only_root_fs",
        "Ensure /spec/containers/0/securityContext exists. Then set readOnlyRootFilesystem to true and make sure privileged is set to false.",
    ),
    (
        "run_as_non_root",
        "Ensure /spec/containers/0/securityContext exists. Then set runAsNonRoot to true.",
    ),
    (
        "run_as_user",
        "Ensure securityContext exists and set runAsUser to a non-root UID such as 1000.\n\nOnly add or update securityContext/runAsUser (and create securityContext if missing); avoid unrelated changes.",
    ),
    (
        "no_host_path",
        "Replace any volume hostPath usage by removing hostPath and adding emptyDir: {} for that volume. Keep the volume name so existing volumeMounts still resolve.",
    ),
    (
        "no_host_ports",
        "Remove the hostPort field from every container port entry so pods rely on service networking instead.",
    ),
    ("no_host_network", "Set spec.hostNetwork to false on the pod spec."),
    ("no_host_pid", "Set spec.hostPID to false on the pod spec."),
    ("no_host_ipc", "Set spec.hostIPC to false on the pod spec."),
    (
        "job_ttl_after_finished",
        "Add spec.ttlSecondsAfterFinished with a reasonable value (for example 3600) so finished Jobs are garbage collected. For a CronJob the field lives under /spec/jobTemplate/spec.",
    ),
    (
        "unsafe_sysctls",
        "Remove securityContext.sysctls so the pod inherits the cluster defaults instead of forcing unsafe kernel settings.",
    ),
    (
        "deprecated_service_account_field",
        "Replace spec.serviceAccount with spec.serviceAccountName and drop the deprecated field.",
    ),
    (
        "env_var_secret",
        "Environment variables containing secrets should source values from a Secret. Replace plain `value` assignments with `valueFrom.secretKeyRef` entries and never copy the literal elsewhere.",
    ),
    (
        "pdb_unhealthy_eviction_policy",
        "Set spec.unhealthyPodEvictionPolicy explicitly (e.g., \"AlwaysAllow\") so disruptions are controlled even when pods report unhealthy status.",
    ),
    (
        "dangling_service",
        "Convert the Service into an ExternalName service. Remove any selector/ports/clusterIP fields, set spec.type to \"ExternalName\", and add spec.externalName pointing at the appropriate in-cluster DNS name.",
    ),
    (
        "non_existent_service_account",
        "Ensure every Pod spec uses a valid ServiceAccount. Prefer switching serviceAccountName/serviceAccount to \"default\" when the referenced account does not exist.",
    ),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuidanceSnippet {
    pub text: String,
    pub source: String,
    pub citation: String,
}

impl GuidanceSnippet {
    pub fn render(&self) -> String {
        let cite: Vec<&str> = [self.source.as_str(), self.citation.as_str()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect();
        if cite.is_empty() {
            self.text.clone()
        } else {
            format!("{}\n[Source: {}]", self.text, cite.join(" | "))
        }
    }
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    #[serde(default)]
    policies: Vec<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    citation: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GuidanceCorpus {
    builtin: BTreeMap<String, String>,
    indexed: BTreeMap<String, Vec<GuidanceSnippet>>,
}

impl GuidanceCorpus {
    pub fn builtin() -> Self {
        Self {
            builtin: BUILTIN_GUIDANCE
                .iter()
                .map(|(policy, text)| (policy.to_string(), text.to_string()))
                .collect(),
            indexed: BTreeMap::new(),
        }
    }

    /// Builtin guidance plus the entries of a JSON index file.
    pub fn load_index(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read guidance index {}", path.display()))?;
        let entries: Vec<IndexEntry> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse guidance index {}", path.display()))?;
        let mut corpus = Self::builtin();
        for entry in entries {
            let text = entry.text.trim();
            if text.is_empty() {
                continue;
            }
            let snippet = GuidanceSnippet {
                text: text.to_string(),
                source: entry.source.unwrap_or_default().trim().to_string(),
                citation: entry.citation.unwrap_or_default().trim().to_string(),
            };
            for policy in &entry.policies {
                corpus
                    .indexed
                    .entry(normalize_policy_id(policy))
                    .or_default()
                    .push(snippet.clone());
            }
        }
        tracing::debug!(
            path = %path.display(),
            policies = corpus.indexed.len(),
            "loaded guidance index"
        );
        Ok(corpus)
    }

    /// Full guidance for `policy_id`, or `None` when nothing is known.
    pub fn render(&self, policy_id: &str) -> Option<String> {
        let policy_id = normalize_policy_id(policy_id);
        match self.indexed.get(&policy_id) {
            Some(snippets) if !snippets.is_empty() => Some(
                snippets
                    .iter()
                    .map(GuidanceSnippet::render)
                    .collect::<Vec<_>>()
                    .join("\n\n"),
            ),
            _ => self.builtin.get(&policy_id).cloned(),
        }
    }

    /// The paragraph of guidance that best matches `failure_text`.
    pub fn lookup(&self, policy_id: &str, failure_text: Option<&str>) -> Option<String> {
        let full = self.render(policy_id)?;
        let wanted = match failure_text {
            Some(text) => keywords(text),
            None => return Some(full),
        };
        if wanted.is_empty() {
            return Some(full);
        }
        let mut best: Option<(&str, usize)> = None;
        for chunk in chunks(&full) {
            let score = keywords(chunk).intersection(&wanted).count();
            if score > 0 && best.is_none_or(|(_, top)| score > top) {
                best = Some((chunk, score));
            }
        }
        Some(best.map_or(full.clone(), |(chunk, _)| chunk.to_string()))
    }
}

fn word_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"[A-Za-z0-9]{3,}").ok())
        .as_ref()
}

fn keywords(text: &str) -> BTreeSet<String> {
    match word_pattern() {
        Some(pattern) => pattern
            .find_iter(text)
            .map(|m| m.as_str().to_ascii_lowercase())
            .collect(),
        None => BTreeSet::new(),
    }
}

/// Paragraphs separated by blank lines.
fn chunks(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut offset = 0;
    let mut in_blank_run = false;
    for line in text.split_inclusive('\n') {
        if line.trim().is_empty() {
            if !in_blank_run {
                let piece = text[start..offset].trim();
                if !piece.is_empty() {
                    out.push(piece);
                }
                in_blank_run = true;
            }
        } else if in_blank_run {
            start = offset;
            in_blank_run = false;
        }
        offset += line.len();
    }
    if !in_blank_run {
        let piece = text[start..].trim();
        if !piece.is_empty() {
            out.push(piece);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn every_builtin_rule_policy_has_guidance() {
        let corpus = GuidanceCorpus::builtin();
        for policy in crate::rules::RuleEngine::default().policy_ids() {
            assert!(corpus.render(policy).is_some(), "missing guidance for {}", policy);
        }
        assert!(corpus.render("no_anti_affinity").is_none());
    }

    #[test]
    fn failure_text_selects_the_matching_paragraph() {
        let corpus = GuidanceCorpus::builtin();
        let picked = corpus
            .lookup("set_requests_limits", Some("limits.memory missing: populate memory defaults"))
            .unwrap();
        assert!(picked.starts_with("Populate cpu and memory"));

        let full = corpus.lookup("set_requests_limits", None).unwrap();
        assert!(full.contains("\n\n"));
        let unmatched = corpus.lookup("set_requests_limits", Some("zz")).unwrap();
        assert_eq!(unmatched, full);
    }

    #[test]
    fn index_entries_override_builtin_and_carry_citations() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"policies": ["latest-tag"], "text": "Use digests for production images.", "source": "CIS 5.4", "citation": "section 2"}},
                {{"policies": ["no_latest_tag"], "text": "Never ship :latest.", "source": ""}},
                {{"policies": ["no_privileged"], "text": "   "}}
            ]"#
        )
        .unwrap();
        let corpus = GuidanceCorpus::load_index(file.path()).unwrap();
        assert_eq!(
            corpus.render("no_latest_tag").unwrap(),
            "Use digests for production images.\n[Source: CIS 5.4 | section 2]\n\nNever ship :latest."
        );
        assert!(corpus.render("no_privileged").unwrap().contains("privileged to false"));
        assert_eq!(
            corpus.lookup("no_latest_tag", Some("ship latest")).unwrap(),
            "Never ship :latest."
        );
    }

    #[test]
    fn missing_index_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(GuidanceCorpus::load_index(&dir.path().join("index.json")).is_err());
    }

    #[test]
    fn chunks_split_on_blank_lines() {
        assert_eq!(chunks("a\nb\n\n  \nc\n"), vec!["a\nb", "c"]);
        assert_eq!(chunks("single"), vec!["single"]);
    }
}
