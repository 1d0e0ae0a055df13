//! Retry/feedback loop per detection and the parallel batch driver.
//!
//! Each detection moves through `Proposing -> Verifying` once per attempt and
//! ends in `Accepted` or `Exhausted`. Failed attempts feed a structured
//! signature back into the next prompt together with policy guidance.

use crate::config::{ProposerMode, RunConfig};
use crate::detection::{compare_ids, Detection};
use crate::guidance::GuidanceCorpus;
use crate::manifest::{self, parse_manifest};
use crate::merge::{self, MergeOutcome};
use crate::model::{build_prompt, ModelClient, ModelClientOptions, PatchBackend, PromptContext};
use crate::patch::guard::{self, validate_operations};
use crate::patch::{replay_safe, Patch, PatchSource};
use crate::rules::{RuleEngine, RuleRefusal};
use crate::semantic;
use crate::util::{prompt_fingerprint, truncate};
use crate::verify::{
    BuiltinPolicies, DryRunApplier, Gate, KubectlDryRun, VerificationResult, Verifier,
};
use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use uuid::Uuid;

/// Verifier feedback lines carried into the next prompt.
const FEEDBACK_WINDOW: usize = 3;
const FEEDBACK_MESSAGE_MAX_CHARS: usize = 300;

// ═══════════════════════════════════════════════════════════════════════════
//  FAILURE SIGNATURES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Input,
    Rule,
    Model,
    Guard,
    Merge,
    Semantic,
    Policy,
    Schema,
    Safety,
    Rescan,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Input => "input",
            FailureStage::Rule => "rule",
            FailureStage::Model => "model",
            FailureStage::Guard => "guard",
            FailureStage::Merge => "merge",
            FailureStage::Semantic => "semantic",
            FailureStage::Policy => "policy",
            FailureStage::Schema => "schema",
            FailureStage::Safety => "safety",
            FailureStage::Rescan => "rescan",
        }
    }
}

impl From<Gate> for FailureStage {
    fn from(gate: Gate) -> Self {
        match gate {
            Gate::Policy => FailureStage::Policy,
            Gate::Schema => FailureStage::Schema,
            Gate::Safety => FailureStage::Safety,
            Gate::Rescan => FailureStage::Rescan,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptFailure {
    pub stage: FailureStage,
    pub category: String,
    pub message: String,
}

impl AttemptFailure {
    fn new(stage: FailureStage, category: &str, message: impl Into<String>) -> Self {
        Self {
            stage,
            category: category.to_string(),
            message: message.into(),
        }
    }

    fn from_refusal(refusal: &RuleRefusal) -> Self {
        Self::new(FailureStage::Rule, refusal.category(), refusal.to_string())
    }

    fn from_result(result: &VerificationResult) -> Self {
        let stage = result.failed_gate.map(FailureStage::from).unwrap_or(FailureStage::Policy);
        let category = result.failure_category.as_deref().unwrap_or("unknown");
        let message = result
            .errors
            .first()
            .cloned()
            .or_else(|| result.diagnostic.clone())
            .unwrap_or_default();
        Self::new(stage, category, message)
    }

    pub fn signature(&self, policy_id: &str) -> FailureSignature {
        FailureSignature {
            policy_id: policy_id.to_string(),
            stage: self.stage,
            category: self.category.clone(),
        }
    }

    fn feedback_line(&self) -> String {
        format!(
            "{} failed ({}): {}",
            self.stage.as_str(),
            self.category,
            truncate(self.message.trim(), FEEDBACK_MESSAGE_MAX_CHARS)
        )
    }
}

/// `(policy_id, failing stage, normalized category)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FailureSignature {
    pub policy_id: String,
    pub stage: FailureStage,
    pub category: String,
}

#[derive(Debug)]
struct CachedGuidance {
    guidance: Option<String>,
    hits: u64,
}

/// Guidance derived per failure signature, shared by all workers of one run.
#[derive(Debug, Default)]
pub struct FailureCache {
    entries: Mutex<HashMap<FailureSignature, CachedGuidance>>,
}

impl FailureCache {
    /// Cached guidance for `signature`, deriving it on first sight.
    pub fn guidance(
        &self,
        signature: &FailureSignature,
        derive: impl FnOnce() -> Option<String>,
    ) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(signature) {
            entry.hits += 1;
            return entry.guidance.clone();
        }
        let guidance = derive();
        entries.insert(
            signature.clone(),
            CachedGuidance {
                guidance: guidance.clone(),
                hits: 0,
            },
        );
        guidance
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|entry| entry.hits)
            .sum()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  ATTEMPT STATE MACHINE
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptPhase {
    Proposing,
    Verifying,
    Accepted,
    Retrying,
    Exhausted,
}

impl AttemptPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptPhase::Accepted | AttemptPhase::Exhausted)
    }

    /// Next phase once attempt `attempt` (1-based) has failed.
    pub fn after_failure(attempt: u32, max_attempts: u32, retryable: bool) -> Self {
        if retryable && attempt < max_attempts {
            AttemptPhase::Retrying
        } else {
            AttemptPhase::Exhausted
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub source: Option<PatchSource>,
    /// Why the rule patch stood in for the model this attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    pub dropped_model_ops: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<AttemptFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionOutcome {
    pub detection_id: String,
    pub policy_id: String,
    pub terminal: AttemptPhase,
    pub attempts: u32,
    pub patch: Option<Patch>,
    pub result: VerificationResult,
    pub attempt_log: Vec<AttemptRecord>,
    pub dropped_model_ops: usize,
    pub elapsed_ms: u64,
}

impl DetectionOutcome {
    pub fn accepted(&self) -> bool {
        self.terminal == AttemptPhase::Accepted
    }

    /// The last recorded failure, if the detection did not end accepted.
    pub fn final_failure(&self) -> Option<&AttemptFailure> {
        self.attempt_log.iter().rev().find_map(|r| r.failure.as_ref())
    }
}

struct Candidate {
    merged: MergeOutcome,
    fallback: Option<String>,
}

/// Per-detection memory across attempts.
#[derive(Default)]
struct Session {
    feedback: Vec<String>,
    last_failure: Option<AttemptFailure>,
    sent_prompts: HashSet<u64>,
}

impl Session {
    fn record(&mut self, failure: &AttemptFailure) {
        self.feedback.push(failure.feedback_line());
        let deduped = dedup_preserve_order(std::mem::take(&mut self.feedback));
        let skip = deduped.len().saturating_sub(FEEDBACK_WINDOW);
        self.feedback = deduped.into_iter().skip(skip).collect();
        self.last_failure = Some(failure.clone());
    }
}

fn dedup_preserve_order(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        if seen.insert(item.clone()) {
            out.push(item);
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════════
//  RUN CONTEXT
// ═══════════════════════════════════════════════════════════════════════════

/// Everything shared by the workers of one run. Nothing here outlives it.
pub struct RunContext {
    pub config: RunConfig,
    pub rules: RuleEngine,
    pub verifier: Verifier,
    pub backend: Option<Arc<dyn PatchBackend>>,
    pub corpus: Arc<GuidanceCorpus>,
    pub failure_cache: FailureCache,
    pub run_id: String,
}

impl RunContext {
    pub fn new(
        config: RunConfig,
        verifier: Verifier,
        backend: Option<Arc<dyn PatchBackend>>,
    ) -> Self {
        Self {
            config,
            rules: RuleEngine::default(),
            verifier,
            backend,
            corpus: Arc::new(GuidanceCorpus::builtin()),
            failure_cache: FailureCache::default(),
            run_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_corpus(mut self, corpus: GuidanceCorpus) -> Self {
        self.corpus = Arc::new(corpus);
        self
    }

    /// Build the production context. Fails fast on configuration problems
    /// such as an unreachable dry-run client or a missing API key.
    pub fn from_config(config: RunConfig) -> Result<Self> {
        config.validate().context("Invalid run configuration")?;

        let dry_run: Option<Arc<dyn DryRunApplier>> = if config.verifier.schema_gate {
            let applier = KubectlDryRun::new(
                config.verifier.kubectl_cmd.clone(),
                config.verifier.dry_run_timeout(),
            );
            applier
                .check_available()
                .context("Schema gate is enabled but the dry-run client cannot run")?;
            Some(Arc::new(applier))
        } else {
            None
        };
        let verifier = Verifier::new(
            Arc::new(BuiltinPolicies),
            dry_run,
            config.verifier.enable_rescan,
        );

        let backend: Option<Arc<dyn PatchBackend>> = match config.proposer.mode {
            ProposerMode::Rules => None,
            ProposerMode::Model => {
                let api_key = config.resolve_api_key()?;
                let client = ModelClient::new(ModelClientOptions {
                    endpoint: config.proposer.endpoint.clone().unwrap_or_default(),
                    model: config.proposer.model.clone(),
                    api_key,
                    timeout: config.proposer.timeout(),
                    retries: config.proposer.retries,
                    backoff_base: config.proposer.backoff_base(),
                })?;
                tracing::info!(
                    endpoint = client.endpoint(),
                    model = %config.proposer.model,
                    "model proposer ready"
                );
                Some(Arc::new(client))
            }
        };

        let corpus = match &config.guidance.index_path {
            Some(path) => GuidanceCorpus::load_index(path)?,
            None => GuidanceCorpus::builtin(),
        };

        Ok(Self::new(config, verifier, backend).with_corpus(corpus))
    }

    fn rules_only(&self) -> bool {
        self.config.proposer.mode == ProposerMode::Rules || self.backend.is_none()
    }

    // ═══════════════════════════════════════════════════════════════════════
    //  PER-DETECTION LOOP
    // ═══════════════════════════════════════════════════════════════════════

    pub fn remediate(&self, detection: &Detection) -> DetectionOutcome {
        let started = Instant::now();
        let id = detection.id.as_str();
        let policy_id = detection.policy_id.as_str();

        let (yaml, original) = match load_document(detection) {
            Ok(loaded) => loaded,
            Err(failure) => {
                tracing::warn!(detection = id, error = %failure.message, "manifest unusable");
                let result = VerificationResult::not_attempted(
                    id,
                    policy_id,
                    &failure.category,
                    &failure.message,
                );
                return DetectionOutcome {
                    detection_id: id.to_string(),
                    policy_id: policy_id.to_string(),
                    terminal: AttemptPhase::Exhausted,
                    attempts: 0,
                    patch: None,
                    result,
                    attempt_log: vec![AttemptRecord {
                        attempt: 0,
                        source: None,
                        fallback: None,
                        dropped_model_ops: 0,
                        failure: Some(failure),
                    }],
                    dropped_model_ops: 0,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                };
            }
        };

        let rule_patch = self.rules.generate(detection, &original);
        let max_attempts = self.config.max_attempts.max(1);
        let mut session = Session::default();
        let mut attempt_log = Vec::new();
        let mut dropped_total = 0;
        let mut last_patch: Option<Patch> = None;
        let mut last_result: Option<VerificationResult> = None;
        let mut attempt = 0;
        let mut phase = AttemptPhase::Proposing;

        while !phase.is_terminal() {
            attempt += 1;
            phase = AttemptPhase::Proposing;
            let mut record = AttemptRecord {
                attempt,
                source: None,
                fallback: None,
                dropped_model_ops: 0,
                failure: None,
            };

            let proposed = self.propose(detection, &yaml, &original, &rule_patch, &mut session);
            let failure = match proposed {
                Err(failure) => {
                    last_result = Some(VerificationResult::not_attempted(
                        id,
                        policy_id,
                        &failure.category,
                        &failure.message,
                    ));
                    failure
                }
                Ok(candidate) => {
                    record.fallback = candidate.fallback.clone();
                    record.dropped_model_ops = candidate.merged.dropped.len();
                    dropped_total += record.dropped_model_ops;

                    match self.screen(detection, &original, &rule_patch, candidate) {
                        Err((failure, rejected)) => {
                            record.source = Some(rejected.source);
                            last_result = Some(VerificationResult::not_attempted(
                                id,
                                policy_id,
                                &failure.category,
                                &failure.message,
                            ));
                            last_patch = Some(rejected);
                            failure
                        }
                        Ok(candidate) => {
                            let patch = candidate.merged.patch;
                            record.source = Some(patch.source);
                            record.fallback = candidate.fallback;
                            phase = AttemptPhase::Verifying;
                            tracing::debug!(
                                detection = id,
                                attempt,
                                source = patch.source.as_str(),
                                "verifying candidate"
                            );
                            let result = self.verifier.verify(id, policy_id, &original, &patch);
                            if result.accepted {
                                attempt_log.push(record);
                                tracing::info!(
                                    detection = id,
                                    policy = policy_id,
                                    attempts = attempt,
                                    source = patch.source.as_str(),
                                    "accepted"
                                );
                                return DetectionOutcome {
                                    detection_id: id.to_string(),
                                    policy_id: policy_id.to_string(),
                                    terminal: AttemptPhase::Accepted,
                                    attempts: attempt,
                                    patch: Some(patch),
                                    result,
                                    attempt_log,
                                    dropped_model_ops: dropped_total,
                                    elapsed_ms: started.elapsed().as_millis() as u64,
                                };
                            }
                            let failure = AttemptFailure::from_result(&result);
                            last_result = Some(result);
                            last_patch = Some(patch);
                            failure
                        }
                    }
                }
            };

            tracing::debug!(
                detection = id,
                attempt,
                phase = ?phase,
                stage = failure.stage.as_str(),
                category = %failure.category,
                "attempt failed"
            );
            session.record(&failure);
            record.failure = Some(failure);
            attempt_log.push(record);
            phase = AttemptPhase::after_failure(attempt, max_attempts, !self.rules_only());
        }

        let result = last_result.unwrap_or_else(|| {
            VerificationResult::not_attempted(id, policy_id, "no_attempt", "no attempt was made")
        });
        tracing::info!(
            detection = id,
            policy = policy_id,
            attempts = attempt,
            category = result.failure_category.as_deref().unwrap_or("unknown"),
            "exhausted"
        );
        DetectionOutcome {
            detection_id: id.to_string(),
            policy_id: policy_id.to_string(),
            terminal: AttemptPhase::Exhausted,
            attempts: attempt,
            patch: last_patch,
            result,
            attempt_log,
            dropped_model_ops: dropped_total,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn propose(
        &self,
        detection: &Detection,
        yaml: &str,
        original: &Value,
        rule_patch: &Result<Patch, RuleRefusal>,
        session: &mut Session,
    ) -> Result<Candidate, AttemptFailure> {
        let backend = match &self.backend {
            Some(backend) if !self.rules_only() => backend,
            _ => {
                return rule_patch
                    .clone()
                    .map(|patch| Candidate {
                        merged: merge::degrade_to_rules(patch),
                        fallback: None,
                    })
                    .map_err(|refusal| AttemptFailure::from_refusal(&refusal));
            }
        };

        let policy_id = detection.policy_id.as_str();
        let guidance = match &session.last_failure {
            Some(failure) => self
                .failure_cache
                .guidance(&failure.signature(policy_id), || {
                    self.corpus.lookup(policy_id, Some(failure.message.as_str()))
                }),
            None => self.corpus.lookup(policy_id, None),
        };
        let nested = manifest::pod_spec_pointers(original)
            .into_iter()
            .find(|pointer| *pointer != "/spec");
        let prompt = build_prompt(&PromptContext {
            manifest_yaml: yaml,
            policy_id,
            violation_text: &detection.violation_text,
            nested_pod_spec: nested,
            feedback: session.feedback.clone(),
            guidance,
        });

        let fall_back = |stage: FailureStage, category: &str, message: String| {
            self.fall_back(detection, rule_patch, stage, category, &message)
        };
        if !session.sent_prompts.insert(prompt_fingerprint(&prompt)) {
            let message = "prompt identical to an earlier attempt".to_string();
            return fall_back(FailureStage::Model, "repeated_prompt", message);
        }

        let raw = match backend.request_patch(&prompt) {
            Ok(raw) => raw,
            Err(err) => return fall_back(FailureStage::Model, err.category(), err.to_string()),
        };
        let model_patch =
            match guard::guard(&raw, original, &detection.id, policy_id, PatchSource::Model) {
                Ok(patch) => patch,
                Err(err) => return fall_back(FailureStage::Guard, err.category(), err.to_string()),
            };

        let after_model = match model_patch.apply(original) {
            Ok(doc) => doc,
            Err(err) => {
                return fall_back(FailureStage::Guard, "path_not_applicable", err.to_string())
            }
        };
        let guardrails = self.rules.guardrails(&after_model);
        let mut merged = merge::merge(&model_patch.ops, &guardrails, &detection.id, policy_id);
        match validate_operations(&merged.patch.ops, original) {
            Ok(ops) => merged.patch.ops = replay_safe(original, &ops).unwrap_or(ops),
            Err(err) => return fall_back(FailureStage::Merge, err.category(), err.to_string()),
        }
        Ok(Candidate { merged, fallback: None })
    }

    /// Run the semantic check before any gate. A rejected model candidate is
    /// replaced by the rule patch, which is screened the same way; a rejected
    /// candidate never reaches the verifier.
    fn screen(
        &self,
        detection: &Detection,
        original: &Value,
        rule_patch: &Result<Patch, RuleRefusal>,
        candidate: Candidate,
    ) -> Result<Candidate, (AttemptFailure, Patch)> {
        let err = match semantic::check(original, &candidate.merged.patch, detection) {
            Ok(_) => return Ok(candidate),
            Err(err) => err,
        };
        let rejected = candidate.merged.patch;
        let category = err.category();
        let message = err.to_string();
        if rejected.source == PatchSource::Rule {
            return Err((AttemptFailure::new(FailureStage::Semantic, category, message), rejected));
        }
        match self.fall_back(detection, rule_patch, FailureStage::Semantic, category, &message) {
            Ok(fallback) => self.screen(detection, original, rule_patch, fallback),
            Err(failure) => Err((failure, rejected)),
        }
    }

    /// Use the rule patch for this attempt, or fail it when there is none.
    fn fall_back(
        &self,
        detection: &Detection,
        rule_patch: &Result<Patch, RuleRefusal>,
        stage: FailureStage,
        category: &str,
        message: &str,
    ) -> Result<Candidate, AttemptFailure> {
        match rule_patch {
            Ok(patch) => {
                tracing::warn!(
                    detection = %detection.id,
                    stage = stage.as_str(),
                    category,
                    "model proposal unusable, falling back to rule patch"
                );
                Ok(Candidate {
                    merged: merge::degrade_to_rules(patch.clone()),
                    fallback: Some(format!("{}: {}", stage.as_str(), category)),
                })
            }
            Err(_) => Err(AttemptFailure::new(stage, category, message)),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    //  BATCHES
    // ═══════════════════════════════════════════════════════════════════════

    /// Remediate every detection on a pool of `jobs` workers, sorted by id.
    pub fn run_batch(&self, detections: &[Detection]) -> Result<Vec<DetectionOutcome>> {
        let pool = self.worker_pool()?;
        tracing::info!(
            run_id = %self.run_id,
            detections = detections.len(),
            jobs = self.config.jobs,
            mode = self.config.proposer.mode.as_str(),
            "starting remediation batch"
        );
        let mut outcomes: Vec<DetectionOutcome> =
            pool.install(|| detections.par_iter().map(|d| self.remediate(d)).collect());
        outcomes.sort_by(|a, b| compare_ids(&a.detection_id, &b.detection_id));
        Ok(outcomes)
    }

    /// Verify pre-existing patches, matched to detections by id.
    pub fn verify_patches(
        &self,
        detections: &[Detection],
        patches: &[Patch],
    ) -> Result<Vec<VerificationResult>> {
        let by_id: HashMap<&str, &Patch> = patches.iter().map(|p| (p.id.as_str(), p)).collect();
        let pool = self.worker_pool()?;
        let mut results: Vec<VerificationResult> = pool.install(|| {
            detections
                .par_iter()
                .map(|d| self.verify_one(d, by_id.get(d.id.as_str()).copied()))
                .collect()
        });
        results.sort_by(|a, b| compare_ids(&a.id, &b.id));
        Ok(results)
    }

    fn verify_one(&self, detection: &Detection, patch: Option<&Patch>) -> VerificationResult {
        let id = detection.id.as_str();
        let policy_id = detection.policy_id.as_str();
        let not_attempted = |category: &str, reason: String| {
            VerificationResult::not_attempted(id, policy_id, category, reason)
        };
        let Some(patch) = patch else {
            return not_attempted("missing_patch", "no patch supplied for detection".to_string());
        };
        let original = match load_document(detection) {
            Ok((_, doc)) => doc,
            Err(failure) => return not_attempted(&failure.category, failure.message),
        };
        let patch = match validate_operations(&patch.ops, &original) {
            Ok(ops) => Patch::new(id, policy_id, patch.source, ops),
            Err(err) => return not_attempted(err.category(), err.to_string()),
        };
        if let Err(err) = semantic::check(&original, &patch, detection) {
            return not_attempted(err.category(), err.to_string());
        }
        self.verifier.verify(id, policy_id, &original, &patch)
    }

    fn worker_pool(&self) -> Result<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.jobs.max(1))
            .thread_name(|i| format!("kubefix-worker-{}", i))
            .build()
            .context("Failed to build worker pool")
    }
}

fn load_document(detection: &Detection) -> Result<(String, Value), AttemptFailure> {
    let yaml = detection
        .manifest()
        .map_err(|e| {
            AttemptFailure::new(FailureStage::Input, "manifest_unreadable", e.to_string())
        })?
        .into_owned();
    let document = parse_manifest(&yaml)
        .map_err(|e| AttemptFailure::new(FailureStage::Input, "manifest_invalid", e.to_string()))?;
    Ok((yaml, document))
}
