pub const SYSTEM_PROMPT: &str = "Output ONLY a valid RFC6902 JSON Patch array. No prose.";

const GLOBAL_REQUIREMENTS: &str = r#"Global requirements:
- Never leave securityContext.privileged set to true; set it to false for every container.
- Always supply concrete CPU and memory values when creating resources.requests or resources.limits (e.g. cpu 100m, memory 128Mi).
- When configuring securityContext.capabilities, drop NET_RAW, NET_ADMIN, SYS_ADMIN, SYS_MODULE, SYS_PTRACE, SYS_CHROOT and remove them from capabilities.add.
- Prefer secure defaults: replace hostPath volumes with emptyDir: {} unless explicitly instructed otherwise.
- Never remove containers, init containers or volumes."#;

const NESTED_TEMPLATE_HINT: &str = "The pod template of this manifest is nested; patch paths must target the nested pod spec, not /spec/containers.";

const CLOSING: &str = "Return ONLY a valid RFC6902 JSON Patch array.";

/// Everything the model sees for one attempt.
#[derive(Debug, Clone, Default)]
pub struct PromptContext<'a> {
    pub manifest_yaml: &'a str,
    pub policy_id: &'a str,
    pub violation_text: &'a str,
    /// Pod spec pointer when it is not the top-level `/spec`.
    pub nested_pod_spec: Option<&'a str>,
    /// Most recent verifier failures, oldest first.
    pub feedback: Vec<String>,
    pub guidance: Option<String>,
}

pub fn build_prompt(ctx: &PromptContext<'_>) -> String {
    let mut sections: Vec<String> = vec![
        "You are fixing a Kubernetes manifest.".to_string(),
        format!("Manifest YAML:\n{}", ctx.manifest_yaml.trim_end()),
        format!("Policy: {}", ctx.policy_id),
    ];
    let violation = ctx.violation_text.trim();
    if !violation.is_empty() {
        sections.push(format!("Violation: {}", violation));
    }
    sections.push(GLOBAL_REQUIREMENTS.to_string());
    if let Some(pointer) = ctx.nested_pod_spec {
        sections.push(format!("{} Pod spec: {}", NESTED_TEMPLATE_HINT, pointer));
    }
    if !ctx.feedback.is_empty() {
        sections.push(format!("Verifier feedback: {}", ctx.feedback.join("; ")));
    }
    if let Some(guidance) = ctx.guidance.as_deref().filter(|g| !g.trim().is_empty()) {
        sections.push(format!("Guidance:\n{}", guidance.trim()));
    }
    sections.push(CLOSING.to_string());
    sections.join("\n\n")
}
