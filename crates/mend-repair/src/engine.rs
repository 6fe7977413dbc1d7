//! The repair loop: retrieve, match, pack, generate, gate, validate, apply.
//!
//! Low confidence widens retrieval once, then holds. Validation failures move
//! on to the next candidate in confidence order, then regenerate with the
//! failed ids excluded, and finally escalate to a reviewer once the retry
//! budget is spent.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mend_core::config::MendConfig;
use mend_core::store::{AuditAction, AuditEntry, MendStore};
use mend_core::types::{Diagnostic, FeatureContext, GraphError, Uid, ValidationResult, Version};
use mend_retrieve::{
    ContextPacker, NeededSet, PatternLibrary, PatternMatch, PatternTarget, RetrievalConstraints,
    RetrievalEngine, RetrievalError, RetrievalHints,
};

use crate::apply::{ApplyController, ApplyEvidence, Approval};
use crate::confidence::{load_calibration, ConfidenceGate};
use crate::diff::unified_diff;
use crate::generator::CandidateGenerator;
use crate::preflight::{Preflight, PreflightRun};
use crate::retry::{RetryAction, RetryBudget};
use crate::services::{static_precheck_score, BuildService, Escalation, Reasoner, TypeCheckService};
use crate::types::{
    ApplyError, Candidate, CommitRef, ConfidenceBreakdown, EvidenceFeatures, GateDecision,
    HeldCandidate, HoldReport, Rationale, RepairError, RepairOutcome, ReviewDecision,
};

/// External collaborators the engine drives.
#[derive(Clone)]
pub struct Services {
    pub type_check: Arc<dyn TypeCheckService>,
    pub build: Arc<dyn BuildService>,
    pub reasoner: Option<Arc<dyn Reasoner>>,
    pub escalation: Arc<dyn Escalation>,
}

/// One failure to repair.
#[derive(Debug, Clone, Default)]
pub struct RepairRequest {
    /// The node the diagnostics point at.
    pub target: Uid,
    /// Extra retrieval seeds; the target is always seeded first.
    pub seeds: Vec<Uid>,
    pub diagnostics: Vec<Diagnostic>,
    /// Embedding of the diagnostic text, for pattern triggers and vector search.
    pub embedding: Option<Vec<f32>>,
    /// Nodes whose presence in the Needed set defines full coverage.
    pub required: Vec<Uid>,
    pub features: FeatureContext,
}

impl RepairRequest {
    pub fn new(target: &str, diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            target: target.to_string(),
            diagnostics,
            ..Self::default()
        }
    }

    fn seeds(&self) -> Vec<Uid> {
        let mut seeds = vec![self.target.clone()];
        for seed in &self.seeds {
            if !seeds.contains(seed) {
                seeds.push(seed.clone());
            }
        }
        seeds
    }
}

/// A candidate with its gate evaluation.
struct Scored {
    candidate: Candidate,
    confidence: ConfidenceBreakdown,
}

pub struct RepairEngine {
    store: Arc<dyn MendStore>,
    config: MendConfig,
    repo_root: PathBuf,
    library: Mutex<PatternLibrary>,
    packer: ContextPacker,
    generator: CandidateGenerator,
    gate: ConfidenceGate,
    preflight: Preflight,
    controller: ApplyController,
    escalation: Arc<dyn Escalation>,
}

impl RepairEngine {
    /// Engine over the repository at `repo_root` with configuration from
    /// `.mend/mend.json`.
    pub fn open(store: Arc<dyn MendStore>, repo_root: &Path, services: Services) -> Result<Self, RepairError> {
        let config = MendConfig::load(&repo_root.join(".mend"));
        Self::new(store, repo_root, config, services)
    }

    /// Unfinished applies from an earlier run are undone before the engine
    /// is returned.
    pub fn new(
        store: Arc<dyn MendStore>,
        repo_root: &Path,
        config: MendConfig,
        services: Services,
    ) -> Result<Self, RepairError> {
        let mend_dir = repo_root.join(".mend");

        let mut library = PatternLibrary::builtin(config.patterns.ema_alpha);
        if let Some(path) = &config.patterns.library_path {
            let path = if path.is_absolute() {
                path.clone()
            } else {
                mend_dir.join(path)
            };
            library.load_file(&path)?;
        }
        library.hydrate(&*store)?;

        let mut generator = CandidateGenerator::new(&config.generator, repo_root);
        if let Some(reasoner) = services.reasoner {
            generator = generator.with_reasoner(reasoner);
        }
        let gate = ConfidenceGate::new(&config.confidence, load_calibration(&mend_dir, &config.confidence));
        let preflight = Preflight::new(
            services.type_check,
            services.build,
            store.clone(),
            &config.preflight,
            repo_root,
        );
        let controller = ApplyController::open(store.clone(), repo_root)?;

        info!(
            repo = %repo_root.display(),
            patterns = library.len(),
            mode = ?gate.mode(),
            threshold = gate.threshold(),
            "repair engine ready"
        );
        Ok(Self {
            store,
            packer: ContextPacker::new(&config.packer),
            repo_root: repo_root.to_path_buf(),
            library: Mutex::new(library),
            generator,
            gate,
            preflight,
            controller,
            escalation: services.escalation,
            config,
        })
    }

    pub fn store(&self) -> &Arc<dyn MendStore> {
        &self.store
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn gate(&self) -> &ConfidenceGate {
        &self.gate
    }

    pub fn rollback(&self, commit: &CommitRef) -> Result<Version, ApplyError> {
        self.controller.rollback(commit)
    }

    /// Run the full loop for one request. Every outcome carries its rationale.
    pub async fn repair(&self, request: RepairRequest) -> Result<RepairOutcome, RepairError> {
        let target = self
            .store
            .get_node(&request.target)
            .ok_or_else(|| GraphError::NodeNotFound(request.target.clone()))?;
        let owner = target.owner.as_deref().and_then(|uid| self.store.get_node(uid));
        let pattern_target = PatternTarget::new(&target).with_owner(owner.as_ref());

        let retrieval = RetrievalEngine::new(&*self.store, &self.config.retrieval);
        let seeds = request.seeds();
        let hints = RetrievalHints {
            query_embedding: request.embedding.clone(),
            required: request.required.clone(),
        };
        let mut constraints =
            RetrievalConstraints::from_config(&self.config.retrieval).with_features(request.features.clone());

        let mut rationale = Rationale::for_target(&target.uid);
        let mut budget = RetryBudget::new(&self.config.retry);
        let mut held: Vec<HeldCandidate> = Vec::new();
        let mut previous_matches: Option<Vec<PatternMatch>> = None;

        loop {
            let needed = match retrieval.retrieve(&seeds, &hints, &constraints) {
                Ok(needed) => needed,
                Err(RetrievalError::RetrievalEmpty { .. }) => {
                    rationale.widened = true;
                    rationale.note("no context found for the target after widening");
                    return Ok(self.reject(rationale, Vec::new()));
                }
                Err(e) => return Err(e.into()),
            };
            rationale.widened |= needed.widened || constraints.widened;

            let matches = match previous_matches.take() {
                Some(matches) if constraints.widened && !self.config.retrieval.widen.rematch_patterns => matches,
                _ => self.library().match_patterns(
                    &request.diagnostics,
                    request.embedding.as_deref(),
                    pattern_target,
                ),
            };
            previous_matches = Some(matches.clone());
            debug!(
                target = %target.uid,
                needed = needed.len(),
                matches = matches.len(),
                "context assembled"
            );
            let bundle = self
                .packer
                .pack(&needed, &request.diagnostics, &matches, self.packer.default_budget());

            let feedback = budget.feedback(&target.uid);
            let candidates = match self.generator.generate(&bundle, &matches, pattern_target, &feedback).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    rationale.note(format!("generation failed: {e}"));
                    rationale.attempts += 1;
                    match budget.record_exhausted(&target.uid) {
                        RetryAction::Escalate => {
                            return self.escalate(rationale, held, "no further candidates could be generated").await;
                        }
                        _ => continue,
                    }
                }
            };

            let scored = self.score(candidates, &needed, constraints.widened).await;
            for s in &scored {
                self.stage(&s.candidate);
            }

            let proceed: Vec<&Scored> = scored
                .iter()
                .filter(|s| s.confidence.decision == GateDecision::Proceed)
                .collect();
            if proceed.is_empty() {
                let Some(best) = scored.first() else {
                    rationale.note("generator returned an empty candidate set");
                    return self.escalate(rationale, held, "no candidates").await;
                };
                rationale.confidence = Some(best.confidence.clone());
                rationale.pattern = best.candidate.origin.pattern_id().map(str::to_string);
                rationale.origin = Some(best.candidate.origin.label());
                if best.confidence.decision == GateDecision::Widen && !constraints.widened {
                    info!(
                        target = %target.uid,
                        score = best.confidence.score,
                        threshold = best.confidence.threshold,
                        "confidence below threshold; widening retrieval"
                    );
                    constraints = retrieval.widened(&constraints);
                    rationale.widened = true;
                    continue;
                }
                rationale.note("confidence below threshold after widening");
                held.extend(scored.iter().map(|s| held_candidate(&s.candidate, Some(&s.confidence), Vec::new())));
                return self.escalate(rationale, held, "confidence below threshold").await;
            }

            rationale.attempts += 1;
            let ordered: Vec<Candidate> = proceed.iter().map(|s| s.candidate.clone()).collect();
            let selection = self.preflight.run_all(&ordered, &CancellationToken::new()).await;

            if let Some(i) = selection.winner {
                let winner = proceed[i];
                let run = &selection.runs[i];
                match self.apply_winner(winner, run) {
                    Ok(commit) => {
                        self.record_outcome(&winner.candidate, true);
                        budget.record_success(&target.uid);
                        self.record_failures(&selection.runs[..i], &proceed);
                        self.clear_staged(
                            scored
                                .iter()
                                .map(|s| &s.candidate)
                                .chain(held.iter().map(|h| &h.candidate)),
                        );
                        rationale.pattern = winner.candidate.origin.pattern_id().map(str::to_string);
                        rationale.origin = Some(winner.candidate.origin.label());
                        rationale.confidence = Some(winner.confidence.clone());
                        rationale.validation = run.results.clone();
                        rationale.failed_stage = None;
                        rationale.note(format!("applied as {}", commit.commit_id));
                        return Ok(RepairOutcome::Applied {
                            commit,
                            candidate: winner.candidate.clone(),
                            rationale,
                        });
                    }
                    Err(ApplyError::ApplyFailure { candidate, reason }) => {
                        rationale.note(format!("apply of {candidate} reverted: {reason}"));
                        held.push(held_candidate(&winner.candidate, Some(&winner.confidence), run.results.clone()));
                        let action = budget.record_failure(&target.uid, &winner.candidate.id, &[], false);
                        if action == RetryAction::Escalate {
                            return self.escalate(rationale, held, "apply failed").await;
                        }
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            let mut action = RetryAction::Regenerate;
            let finished: Vec<(&Scored, &PreflightRun)> = proceed
                .iter()
                .copied()
                .zip(&selection.runs)
                .filter(|(_, run)| !run.cancelled)
                .collect();
            for (n, (s, run)) in finished.iter().enumerate() {
                self.record_outcome(&s.candidate, false);
                rationale.failed_stage = run.failed_stage();
                rationale.validation = run.results.clone();
                held.push(held_candidate(&s.candidate, Some(&s.confidence), run.results.clone()));
                action = budget.record_failure(&target.uid, &s.candidate.id, &run.diagnostics(), n + 1 < finished.len());
                debug!(candidate = %s.candidate.id, action = action.as_str(), "candidate failed preflight");
            }
            if finished.is_empty() {
                action = budget.record_exhausted(&target.uid);
            }
            info!(
                target = %target.uid,
                attempt = budget.attempts(&target.uid),
                action = action.as_str(),
                "no candidate passed preflight"
            );
            if action == RetryAction::Escalate {
                rationale.note(format!(
                    "all candidates failed validation in {} attempts",
                    budget.attempts(&target.uid)
                ));
                return self.escalate(rationale, held, "validation failed").await;
            }
        }
    }

    /// Gate every candidate, highest confidence first. Ties keep generator order.
    async fn score(&self, candidates: Vec<Candidate>, needed: &NeededSet, widened: bool) -> Vec<Scored> {
        let mut scored = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let static_precheck = match self.preflight.static_precheck(&candidate).await {
                Ok(diagnostics) => static_precheck_score(&diagnostics),
                Err(e) => {
                    warn!(candidate = %candidate.id, error = %e, "static precheck unavailable");
                    0.0
                }
            };
            let features = EvidenceFeatures {
                coverage: needed.features.coverage,
                agreement: needed.features.agreement,
                consistency: candidate.consistency,
                static_precheck,
            };
            let confidence = self.gate.evaluate(&features, widened);
            scored.push(Scored { candidate, confidence });
        }
        scored.sort_by(|a, b| b.confidence.score.total_cmp(&a.confidence.score));
        scored
    }

    fn apply_winner(&self, winner: &Scored, run: &PreflightRun) -> Result<CommitRef, ApplyError> {
        let evidence = ApplyEvidence {
            validation: run.results.clone(),
            approval: Approval::Gate {
                score: winner.confidence.score,
                threshold: winner.confidence.threshold,
                decision: winner.confidence.decision,
            },
            rationale: format!(
                "{}; confidence {:.2}",
                winner.candidate.origin.label(),
                winner.confidence.score
            ),
        };
        self.controller.apply(&winner.candidate, &evidence)
    }

    /// Lower-ranked candidates that failed before the winner still count
    /// against their patterns.
    fn record_failures(&self, runs: &[PreflightRun], proceed: &[&Scored]) {
        for (run, s) in runs.iter().zip(proceed) {
            if !run.cancelled && !run.passed() {
                self.record_outcome(&s.candidate, false);
            }
        }
    }

    /// Hand the held candidates to the reviewer and act on the decision.
    async fn escalate(
        &self,
        mut rationale: Rationale,
        candidates: Vec<HeldCandidate>,
        reason: &str,
    ) -> Result<RepairOutcome, RepairError> {
        let report = HoldReport {
            target: rationale.target.clone(),
            reason: reason.to_string(),
            candidates,
        };
        for c in &report.candidates {
            let score = c.confidence.as_ref().map(|b| b.score);
            self.audit(&c.candidate.id, AuditAction::Hold, score, &c.validation, &rationale);
        }
        warn!(target = %report.target, candidates = report.candidates.len(), reason, "repair held for review");

        let decision = self.escalation.review(&report).await;
        self.clear_staged(report.candidates.iter().map(|c| &c.candidate));
        match decision {
            ReviewDecision::Approve(id) => {
                let held = report
                    .candidates
                    .iter()
                    .find(|c| c.candidate.id == id)
                    .ok_or_else(|| RepairError::UnknownCandidate(id.clone()))?;
                self.apply_reviewed(rationale, held, report.clone()).await
            }
            ReviewDecision::Reject(note) => {
                rationale.note(format!("rejected by reviewer: {note}"));
                let ids: Vec<&Candidate> = report.candidates.iter().map(|c| &c.candidate).collect();
                Ok(self.reject(rationale, ids))
            }
            ReviewDecision::Defer => {
                rationale.note("awaiting review");
                Ok(RepairOutcome::Held { report, rationale })
            }
        }
    }

    /// A reviewer-approved candidate still needs a full PreFlight pass.
    async fn apply_reviewed(
        &self,
        mut rationale: Rationale,
        held: &HeldCandidate,
        report: HoldReport,
    ) -> Result<RepairOutcome, RepairError> {
        let candidate = &held.candidate;
        let run = self.preflight.run(candidate, &CancellationToken::new()).await;
        rationale.validation = run.results.clone();
        rationale.failed_stage = run.failed_stage();
        rationale.pattern = candidate.origin.pattern_id().map(str::to_string);
        rationale.origin = Some(candidate.origin.label());
        if !run.passed() {
            rationale.note("reviewer-approved candidate failed validation");
            self.record_outcome(candidate, false);
            return Ok(RepairOutcome::Held { report, rationale });
        }

        let evidence = ApplyEvidence {
            validation: run.results.clone(),
            approval: Approval::Reviewer {
                note: format!("approved {}", candidate.id),
            },
            rationale: format!("{}; approved by reviewer", candidate.origin.label()),
        };
        let commit = self.controller.apply(candidate, &evidence)?;
        self.record_outcome(candidate, true);
        rationale.note("approved by reviewer");
        Ok(RepairOutcome::Applied {
            commit,
            candidate: candidate.clone(),
            rationale,
        })
    }

    fn reject(&self, rationale: Rationale, candidates: Vec<&Candidate>) -> RepairOutcome {
        if candidates.is_empty() {
            self.audit(&rationale.target, AuditAction::Reject, None, &[], &rationale);
        }
        for candidate in candidates {
            self.audit(&candidate.id, AuditAction::Reject, None, &[], &rationale);
        }
        info!(target = %rationale.target, summary = %rationale.summary(), "repair rejected");
        RepairOutcome::Rejected { rationale }
    }

    fn audit(
        &self,
        candidate_id: &str,
        action: AuditAction,
        confidence: Option<f64>,
        validation: &[ValidationResult],
        rationale: &Rationale,
    ) {
        let entry = AuditEntry {
            id: None,
            version: self.store.head_version(),
            candidate_id: candidate_id.to_string(),
            action,
            confidence,
            validation: validation.to_vec(),
            rationale: rationale.summary(),
            recorded_at: None,
        };
        if let Err(e) = self.store.append_audit(&entry) {
            warn!(candidate = candidate_id, action = action.as_str(), error = %e, "failed to append audit entry");
        }
    }

    fn stage(&self, candidate: &Candidate) {
        let staged = serde_json::to_string(candidate)
            .map_err(GraphError::from)
            .and_then(|payload| self.store.stage_candidate(&candidate.id, &payload));
        if let Err(e) = staged {
            warn!(candidate = %candidate.id, error = %e, "failed to stage candidate");
        }
    }

    fn clear_staged<'a>(&self, candidates: impl IntoIterator<Item = &'a Candidate>) {
        for candidate in candidates {
            if let Err(e) = self.store.clear_staged(&candidate.id) {
                warn!(candidate = %candidate.id, error = %e, "failed to clear staged candidate");
            }
        }
    }

    fn record_outcome(&self, candidate: &Candidate, success: bool) {
        let Some(pattern_id) = candidate.origin.pattern_id() else {
            return;
        };
        if let Err(e) = self
            .library()
            .record_outcome_persisted(&*self.store, pattern_id, success)
        {
            warn!(pattern = pattern_id, error = %e, "failed to record pattern outcome");
        }
    }

    fn library(&self) -> MutexGuard<'_, PatternLibrary> {
        match self.library.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn held_candidate(
    candidate: &Candidate,
    confidence: Option<&ConfidenceBreakdown>,
    validation: Vec<ValidationResult>,
) -> HeldCandidate {
    let diff = candidate
        .edits
        .iter()
        .map(|e| unified_diff(&e.path, &e.original, &e.updated))
        .collect::<Vec<_>>()
        .join("");
    HeldCandidate {
        candidate: candidate.clone(),
        diff,
        confidence: confidence.cloned(),
        validation,
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
