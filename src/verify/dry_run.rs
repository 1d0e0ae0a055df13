use crate::util::{run_command_with_timeout, tail_chars};
use std::process::Command;
use std::time::Duration;

const DIAGNOSTIC_MAX_CHARS: usize = 4_000;
const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(15);

/// Outcome of one dry-run submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DryRunOutcome {
    pub accepted: bool,
    /// `None` when accepted.
    pub category: Option<&'static str>,
    pub diagnostic: String,
}

impl DryRunOutcome {
    pub fn accepted(diagnostic: impl Into<String>) -> Self {
        Self {
            accepted: true,
            category: None,
            diagnostic: diagnostic.into(),
        }
    }

    pub fn rejected(category: &'static str, diagnostic: impl Into<String>) -> Self {
        Self {
            accepted: false,
            category: Some(category),
            diagnostic: diagnostic.into(),
        }
    }
}

/// Submits a patched document for server-side validation without persisting it.
pub trait DryRunApplier: Send + Sync {
    fn dry_run(&self, yaml: &str) -> DryRunOutcome;
}

#[derive(Debug, thiserror::Error)]
#[error("dry-run applier '{program}' is unavailable: {reason}")]
pub struct DryRunUnavailable {
    pub program: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct KubectlDryRun {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl KubectlDryRun {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: ["apply", "-f", "-", "--dry-run=server"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            timeout,
        }
    }

    /// Replace the arguments passed before the manifest is piped in.
    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Confirm the client binary runs at all. Called once at startup.
    pub fn check_available(&self) -> Result<(), DryRunUnavailable> {
        let mut command = Command::new(&self.program);
        command.args(["version", "--client"]);
        let unavailable = |reason: String| DryRunUnavailable {
            program: self.program.clone(),
            reason,
        };
        let result = run_command_with_timeout(&mut command, None, VERSION_CHECK_TIMEOUT)
            .map_err(unavailable)?;
        if result.success() {
            Ok(())
        } else if result.timed_out {
            Err(unavailable("version check timed out".to_string()))
        } else {
            Err(unavailable(tail_chars(result.stderr.trim(), 400)))
        }
    }
}

impl DryRunApplier for KubectlDryRun {
    fn dry_run(&self, yaml: &str) -> DryRunOutcome {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        let stdin = Some(yaml.as_bytes());
        let result = match run_command_with_timeout(&mut command, stdin, self.timeout) {
            Ok(result) => result,
            Err(err) => return DryRunOutcome::rejected("cluster_unreachable", err),
        };
        if result.timed_out {
            return DryRunOutcome::rejected(
                "timeout",
                format!("dry-run timed out after {}s", self.timeout.as_secs()),
            );
        }
        if result.success() {
            return DryRunOutcome::accepted(tail_chars(result.stdout.trim(), DIAGNOSTIC_MAX_CHARS));
        }
        let diagnostic = tail_chars(result.stderr.trim(), DIAGNOSTIC_MAX_CHARS);
        DryRunOutcome::rejected(classify_rejection(&diagnostic), diagnostic)
    }
}

/// Failure category for a dry-run rejection message.
pub fn classify_rejection(stderr: &str) -> &'static str {
    let lower = stderr.to_ascii_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
    if any(&["unknown field", "strict decoding error", "validationerror", "invalid value"]) {
        "schema_field"
    } else if any(&["admission webhook", "denied the request", "forbidden"]) {
        "admission_denied"
    } else if any(&[
        "unable to connect",
        "connection refused",
        "no such host",
        "couldn't get current server api",
        "i/o timeout",
    ]) {
        "cluster_unreachable"
    } else {
        "schema_rejected"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_kubectl_errors() {
        assert_eq!(
            classify_rejection(r#"error: strict decoding error: unknown field "spec.containers[0].foo""#),
            "schema_field"
        );
        assert_eq!(
            classify_rejection("Error from server (Forbidden): admission webhook \"policy\" denied the request"),
            "admission_denied"
        );
        assert_eq!(
            classify_rejection("Unable to connect to the server: dial tcp: connection refused"),
            "cluster_unreachable"
        );
        assert_eq!(classify_rejection("something odd"), "schema_rejected");
    }

    #[cfg(unix)]
    #[test]
    fn pipes_manifest_and_reports_acceptance() {
        let applier = KubectlDryRun::new("cat", Duration::from_secs(5)).with_args(&[]);
        let outcome = applier.dry_run("kind: Pod\n");
        assert!(outcome.accepted);
        assert_eq!(outcome.diagnostic, "kind: Pod");
    }

    #[cfg(unix)]
    #[test]
    fn rejection_carries_stderr_and_category() {
        let applier = KubectlDryRun::new("sh", Duration::from_secs(5)).with_args(&[
            "-c",
            "cat >/dev/null; echo 'error: unknown field \"bogus\"' >&2; exit 1",
        ]);
        let outcome = applier.dry_run("kind: Pod\n");
        assert!(!outcome.accepted);
        assert_eq!(outcome.category, Some("schema_field"));
        assert!(outcome.diagnostic.contains("bogus"));
    }

    #[test]
    fn missing_binary_is_unavailable() {
        let applier = KubectlDryRun::new("kubefix-no-such-binary", Duration::from_secs(1));
        assert!(applier.check_available().is_err());
    }
}
