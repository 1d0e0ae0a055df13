//! Structural regression check run on every candidate patch before any gate.

use crate::detection::{Detection, OptIn};
use crate::manifest::{self, POD_SPEC_POINTERS};
use crate::patch::Patch;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SemanticRegressionError {
    #[error("patch does not apply: {0}")]
    Unapplicable(String),
    #[error("patch removes containers ({before} -> {after})")]
    ContainersRemoved { before: usize, after: usize },
    #[error("patch removes init containers ({before} -> {after})")]
    InitContainersRemoved { before: usize, after: usize },
    #[error("patch removes volumes ({before} -> {after})")]
    VolumesRemoved { before: usize, after: usize },
    #[error("patch rewrites the service account at {pointer} ({before:?} -> {after:?}) without opt-in")]
    ServiceAccountRewritten {
        pointer: String,
        before: Option<String>,
        after: Option<String>,
    },
}

impl SemanticRegressionError {
    pub fn category(&self) -> &'static str {
        match self {
            SemanticRegressionError::Unapplicable(_) => "patch_unapplicable",
            SemanticRegressionError::ContainersRemoved { .. } => "containers_removed",
            SemanticRegressionError::InitContainersRemoved { .. } => "init_containers_removed",
            SemanticRegressionError::VolumesRemoved { .. } => "volumes_removed",
            SemanticRegressionError::ServiceAccountRewritten { .. } => "service_account_rewritten",
        }
    }
}

/// Apply `patch` to `original` and reject it when it shrinks the workload or
/// swaps its identity. Returns the patched document on success.
pub fn check(
    original: &Value,
    patch: &Patch,
    detection: &Detection,
) -> Result<Value, SemanticRegressionError> {
    let patched = patch
        .apply(original)
        .map_err(|err| SemanticRegressionError::Unapplicable(err.to_string()))?;

    let before = manifest::structural_counts(original);
    let after = manifest::structural_counts(&patched);
    if after.containers < before.containers {
        return Err(SemanticRegressionError::ContainersRemoved {
            before: before.containers,
            after: after.containers,
        });
    }
    if after.init_containers < before.init_containers {
        return Err(SemanticRegressionError::InitContainersRemoved {
            before: before.init_containers,
            after: after.init_containers,
        });
    }
    if after.volumes < before.volumes {
        return Err(SemanticRegressionError::VolumesRemoved {
            before: before.volumes,
            after: after.volumes,
        });
    }

    if !detection.has_opt_in(OptIn::ServiceAccountRewrite) {
        for pod_spec in POD_SPEC_POINTERS {
            let was = manifest::effective_service_account(original, pod_spec);
            let now = manifest::effective_service_account(&patched, pod_spec);
            if was != now {
                return Err(SemanticRegressionError::ServiceAccountRewritten {
                    pointer: (*pod_spec).to_string(),
                    before: was.map(str::to_string),
                    after: now.map(str::to_string),
                });
            }
        }
    }

    Ok(patched)
}
