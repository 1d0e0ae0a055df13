//! Run metrics and JSON output files.

use crate::controller::DetectionOutcome;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub max_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub total: usize,
    pub accepted: usize,
    pub exhausted: usize,
    pub acceptance_rate: f64,
    /// Accepted detections per patch source.
    pub accepted_by_source: BTreeMap<String, usize>,
    /// Detections keyed by the attempt count they ended on.
    pub attempt_histogram: BTreeMap<u32, usize>,
    /// Final failures of exhausted detections, `stage -> category -> count`.
    pub failures: BTreeMap<String, BTreeMap<String, usize>>,
    pub fallbacks: usize,
    pub dropped_model_ops: usize,
    pub latency: LatencySummary,
}

impl RunSummary {
    pub fn from_outcomes(run_id: &str, outcomes: &[DetectionOutcome]) -> Self {
        let mut accepted_by_source: BTreeMap<String, usize> = BTreeMap::new();
        let mut attempt_histogram: BTreeMap<u32, usize> = BTreeMap::new();
        let mut failures: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
        let mut accepted = 0;
        let mut fallbacks = 0;
        let mut dropped_model_ops = 0;

        for outcome in outcomes {
            *attempt_histogram.entry(outcome.attempts).or_default() += 1;
            dropped_model_ops += outcome.dropped_model_ops;
            fallbacks += outcome
                .attempt_log
                .iter()
                .filter(|record| record.fallback.is_some())
                .count();

            if outcome.accepted() {
                accepted += 1;
                if let Some(patch) = &outcome.patch {
                    *accepted_by_source
                        .entry(patch.source.as_str().to_string())
                        .or_default() += 1;
                }
            } else if let Some(failure) = outcome.final_failure() {
                *failures
                    .entry(failure.stage.as_str().to_string())
                    .or_default()
                    .entry(failure.category.clone())
                    .or_default() += 1;
            }
        }

        let total = outcomes.len();
        let mut latencies: Vec<u64> = outcomes.iter().map(|o| o.elapsed_ms).collect();
        latencies.sort_unstable();

        Self {
            run_id: run_id.to_string(),
            generated_at: Utc::now(),
            total,
            accepted,
            exhausted: total - accepted,
            acceptance_rate: if total == 0 {
                0.0
            } else {
                accepted as f64 / total as f64
            },
            accepted_by_source,
            attempt_histogram,
            failures,
            fallbacks,
            dropped_model_ops,
            latency: LatencySummary {
                p50_ms: percentile(&latencies, 50),
                p95_ms: percentile(&latencies, 95),
                max_ms: latencies.last().copied().unwrap_or(0),
            },
        }
    }
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[u64], pct: usize) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (pct * sorted.len()).div_ceil(100).max(1);
    sorted[rank.min(sorted.len()) - 1]
}

/// Pretty-print `value` to `path` through a temp file and rename.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
    file.write_all(content.as_bytes())
        .and_then(|_| file.write_all(b"\n"))
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err).with_context(|| format!("Failed to move output into {}", path.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{AttemptFailure, AttemptPhase, AttemptRecord, FailureStage};
    use crate::patch::{Patch, PatchSource};
    use crate::verify::VerificationResult;

    fn outcome(id: &str, accepted: bool, attempts: u32, elapsed_ms: u64) -> DetectionOutcome {
        let failure = (!accepted).then(|| AttemptFailure {
            stage: FailureStage::Schema,
            category: "schema_field".to_string(),
            message: "unknown field".to_string(),
        });
        DetectionOutcome {
            detection_id: id.to_string(),
            policy_id: "no_privileged".to_string(),
            terminal: if accepted {
                AttemptPhase::Accepted
            } else {
                AttemptPhase::Exhausted
            },
            attempts,
            patch: Some(Patch::new(id, "no_privileged", PatchSource::Merged, Vec::new())),
            result: VerificationResult::not_attempted(id, "no_privileged", "x", "x"),
            attempt_log: vec![AttemptRecord {
                attempt: attempts,
                source: Some(PatchSource::Merged),
                fallback: Some("model: timeout".to_string()),
                dropped_model_ops: 1,
                failure,
            }],
            dropped_model_ops: 1,
            elapsed_ms,
        }
    }

    #[test]
    fn summarises_outcomes() {
        let outcomes = vec![
            outcome("1", true, 1, 10),
            outcome("2", true, 2, 30),
            outcome("3", false, 3, 50),
            outcome("4", true, 1, 20),
        ];
        let summary = RunSummary::from_outcomes("run", &outcomes);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.accepted, 3);
        assert_eq!(summary.exhausted, 1);
        assert!((summary.acceptance_rate - 0.75).abs() < f64::EPSILON);
        assert_eq!(summary.accepted_by_source.get("merged"), Some(&3));
        assert_eq!(summary.attempt_histogram.get(&1), Some(&2));
        assert_eq!(summary.failures["schema"]["schema_field"], 1);
        assert_eq!(summary.fallbacks, 4);
        assert_eq!(summary.dropped_model_ops, 4);
        assert_eq!(summary.latency.p50_ms, 20);
        assert_eq!(summary.latency.p95_ms, 50);
        assert_eq!(summary.latency.max_ms, 50);
    }

    #[test]
    fn empty_run_has_zero_rate() {
        let summary = RunSummary::from_outcomes("run", &[]);
        assert_eq!(summary.acceptance_rate, 0.0);
        assert_eq!(summary.latency.p95_ms, 0);
    }

    #[test]
    fn write_json_replaces_the_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        fs::write(&path, "stale").unwrap();
        write_json(&path, &vec!["a", "b"]).unwrap();
        let written: Vec<String> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, vec!["a", "b"]);
        assert!(!path.with_extension("tmp").exists());
    }
}
