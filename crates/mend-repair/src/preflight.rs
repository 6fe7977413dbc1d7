//! PreFlight: the staged validation every candidate must pass before any
//! write to the real repository.
//!
//! Stages run strictly in order and the first `fail` or `error` ends the run.
//! Sibling candidates run concurrently, bounded by a semaphore; once one
//! passes, every lower-priority sibling is cancelled at its next stage
//! boundary.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mend_core::config::PreflightConfig;
use mend_core::store::MendStore;
use mend_core::types::{
    Diagnostic, EdgeKind, FeatureContext, NodeKind, Severity, StageStatus, ValidationResult,
    ValidationStage,
};

use crate::services::{BuildContext, BuildService, StageReport, TypeCheckService};
use crate::types::{Candidate, ServiceError};
use crate::workspace::ShadowWorkspace;

pub(crate) const REQUIRED_STAGES: [ValidationStage; 4] = [
    ValidationStage::InMemoryTypeCheck,
    ValidationStage::FormatCheck,
    ValidationStage::CompileCheck,
    ValidationStage::SelectiveTests,
];

/// Every stage result for one candidate, in execution order.
#[derive(Debug, Clone)]
pub struct PreflightRun {
    pub candidate_id: String,
    pub results: Vec<ValidationResult>,
    pub cancelled: bool,
}

impl PreflightRun {
    fn cancelled(candidate_id: &str, results: Vec<ValidationResult>) -> Self {
        Self {
            candidate_id: candidate_id.to_string(),
            results,
            cancelled: true,
        }
    }

    /// Every required stage ran and nothing failed.
    pub fn passed(&self) -> bool {
        !self.cancelled
            && self.results.iter().all(ValidationResult::passed)
            && REQUIRED_STAGES
                .iter()
                .all(|stage| self.results.iter().any(|r| r.stage == *stage))
    }

    pub fn failed_stage(&self) -> Option<ValidationStage> {
        self.results.iter().find(|r| !r.passed()).map(|r| r.stage)
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.results
            .iter()
            .flat_map(|r| r.diagnostics.iter().cloned())
            .collect()
    }
}

/// Runs of all candidates, in candidate order, plus the chosen one.
#[derive(Debug, Clone)]
pub struct PreflightSelection {
    pub runs: Vec<PreflightRun>,
    /// Lowest candidate index with a full pass.
    pub winner: Option<usize>,
}

impl PreflightSelection {
    pub fn winner_run(&self) -> Option<&PreflightRun> {
        self.winner.and_then(|i| self.runs.get(i))
    }
}

#[derive(Clone)]
pub struct Preflight {
    type_check: Arc<dyn TypeCheckService>,
    build: Arc<dyn BuildService>,
    store: Arc<dyn MendStore>,
    config: PreflightConfig,
    repo_root: PathBuf,
    features: FeatureContext,
}

impl Preflight {
    pub fn new(
        type_check: Arc<dyn TypeCheckService>,
        build: Arc<dyn BuildService>,
        store: Arc<dyn MendStore>,
        config: &PreflightConfig,
        repo_root: &Path,
    ) -> Self {
        Self {
            type_check,
            build,
            store,
            config: config.clone(),
            repo_root: repo_root.to_path_buf(),
            features: FeatureContext::default(),
        }
    }

    pub fn with_features(mut self, features: FeatureContext) -> Self {
        self.features = features;
        self
    }

    /// The configured stage sequence.
    pub fn stages(&self) -> Vec<ValidationStage> {
        let mut stages = REQUIRED_STAGES.to_vec();
        if self.config.lint {
            stages.push(ValidationStage::LintCheck);
        }
        if self.config.public_api {
            stages.push(ValidationStage::PublicApiCheck);
        }
        stages
    }

    /// In-memory check only; feeds the confidence gate before PreFlight proper.
    pub async fn static_precheck(&self, candidate: &Candidate) -> Result<Vec<Diagnostic>, ServiceError> {
        within(
            "type_check",
            self.config.typecheck_timeout_secs,
            self.type_check.check_overlay(&self.repo_root, &candidate.edits),
        )
        .await
    }

    /// Run every stage for `candidate`, stopping at the first failure or
    /// when `cancel` fires between stages. Each result is appended to the ledger.
    pub async fn run(&self, candidate: &Candidate, cancel: &CancellationToken) -> PreflightRun {
        let mut results: Vec<ValidationResult> = Vec::new();
        let mut shadow: Option<ShadowWorkspace> = None;

        for stage in self.stages() {
            if cancel.is_cancelled() {
                info!(candidate = %candidate.id, next = %stage, "preflight cancelled");
                return PreflightRun::cancelled(&candidate.id, results);
            }
            let started = Instant::now();
            let (status, diagnostics) = match self.run_stage(stage, candidate, &mut shadow).await {
                Ok(report) if report.passed => (StageStatus::Pass, report.diagnostics),
                Ok(report) => (StageStatus::Fail, report.diagnostics),
                Err(e) => (StageStatus::Error, vec![Diagnostic::error(None, &e.to_string())]),
            };
            let result = ValidationResult {
                candidate_id: candidate.id.clone(),
                stage,
                status,
                diagnostics,
                duration_ms: started.elapsed().as_millis() as u64,
            };
            if let Err(e) = self.store.append_validation(&result) {
                warn!(candidate = %candidate.id, %stage, error = %e, "failed to record validation result");
            }
            debug!(candidate = %candidate.id, %stage, status = status.as_str(), "stage finished");
            results.push(result);
            if status != StageStatus::Pass {
                info!(candidate = %candidate.id, %stage, status = status.as_str(), "preflight stopped");
                break;
            }
        }

        PreflightRun {
            candidate_id: candidate.id.clone(),
            results,
            cancelled: false,
        }
    }

    /// Validate candidates concurrently. The winner is the lowest index that
    /// passes; once it is known, higher indices are cancelled.
    pub async fn run_all(&self, candidates: &[Candidate], cancel: &CancellationToken) -> PreflightSelection {
        let limit = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
        let tokens: Vec<CancellationToken> = candidates.iter().map(|_| cancel.child_token()).collect();
        let mut set: JoinSet<(usize, PreflightRun)> = JoinSet::new();

        for (i, candidate) in candidates.iter().enumerate() {
            let this = self.clone();
            let candidate = candidate.clone();
            let token = tokens[i].clone();
            let limit = Arc::clone(&limit);
            set.spawn(async move {
                let permit = tokio::select! {
                    permit = limit.acquire_owned() => permit.ok(),
                    _ = token.cancelled() => None,
                };
                let Some(_permit) = permit else {
                    return (i, PreflightRun::cancelled(&candidate.id, Vec::new()));
                };
                (i, this.run(&candidate, &token).await)
            });
        }

        let mut runs: Vec<Option<PreflightRun>> = vec![None; candidates.len()];
        let mut winner: Option<usize> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((i, run)) => {
                    if run.passed() && winner.map_or(true, |w| i < w) {
                        winner = Some(i);
                        for token in &tokens[i + 1..] {
                            token.cancel();
                        }
                    }
                    runs[i] = Some(run);
                }
                Err(e) => warn!(error = %e, "preflight task aborted"),
            }
        }

        let runs: Vec<PreflightRun> = runs
            .into_iter()
            .zip(candidates)
            .map(|(run, c)| run.unwrap_or_else(|| PreflightRun::cancelled(&c.id, Vec::new())))
            .collect();
        if let Some(i) = winner {
            info!(candidate = %candidates[i].id, index = i, "preflight winner selected");
        }
        PreflightSelection { runs, winner }
    }

    async fn run_stage(
        &self,
        stage: ValidationStage,
        candidate: &Candidate,
        shadow: &mut Option<ShadowWorkspace>,
    ) -> Result<StageReport, ServiceError> {
        if stage == ValidationStage::InMemoryTypeCheck {
            let diagnostics = self.static_precheck(candidate).await?;
            let passed = !diagnostics.iter().any(|d| d.severity == Severity::Error);
            return Ok(StageReport { passed, diagnostics });
        }

        if shadow.is_none() {
            *shadow = Some(self.shadow_for(candidate).await?);
        }
        let Some(ws) = shadow.as_ref() else {
            return Err(ServiceError::Failed("shadow workspace missing".to_string()));
        };
        let shared_cache = self.repo_root.join("target");
        let ctx = BuildContext {
            workspace: ws.path(),
            shared_cache: &shared_cache,
            cache_dir: ws.cache_dir(),
            features: &self.features,
        };

        let cfg = &self.config;
        match stage {
            ValidationStage::FormatCheck => within("format", cfg.format_timeout_secs, self.build.format_check(ctx)).await,
            ValidationStage::CompileCheck => within("compile", cfg.compile_timeout_secs, self.build.compile(ctx)).await,
            ValidationStage::SelectiveTests => {
                let tests = self.impacted_tests(candidate);
                if tests.is_empty() {
                    return Ok(StageReport {
                        passed: true,
                        diagnostics: vec![Diagnostic::note("no tests reach the changed nodes")],
                    });
                }
                within("tests", cfg.test_timeout_secs, self.build.run_tests(ctx, &tests)).await
            }
            ValidationStage::LintCheck => within("lint", cfg.compile_timeout_secs, self.build.lint(ctx)).await,
            ValidationStage::PublicApiCheck => {
                within("public_api", cfg.compile_timeout_secs, self.build.public_api(ctx)).await
            }
            ValidationStage::InMemoryTypeCheck => Ok(StageReport::pass()),
        }
    }

    async fn shadow_for(&self, candidate: &Candidate) -> Result<ShadowWorkspace, ServiceError> {
        let repo_root = self.repo_root.clone();
        let cache_root = self.repo_root.join(".mend").join("shadow-cache");
        let excludes = self.config.shadow_excludes.clone();
        let id = candidate.id.clone();
        let edits = candidate.edits.clone();
        tokio::task::spawn_blocking(move || {
            let ws = ShadowWorkspace::create(&repo_root, &excludes, &cache_root, &id)?;
            ws.materialize(&edits)?;
            Ok::<_, std::io::Error>(ws)
        })
        .await
        .map_err(|e| ServiceError::Failed(format!("shadow workspace task: {e}")))?
        .map_err(|e| ServiceError::Failed(format!("shadow workspace: {e}")))
    }

    /// Qualified names of tests that call or depend on a changed node.
    pub fn impacted_tests(&self, candidate: &Candidate) -> Vec<String> {
        let state = self.store.current();
        let mut tests: Vec<String> = candidate
            .touched
            .iter()
            .filter_map(|uid| state.node(uid))
            .filter(|n| n.kind == NodeKind::Test)
            .map(|n| n.qualified_name())
            .collect();
        tests.extend(
            self.store
                .reverse_reachable(
                    &candidate.touched,
                    &[EdgeKind::Calls, EdgeKind::Depends],
                    self.config.test_hops,
                )
                .into_iter()
                .filter(|n| n.kind == NodeKind::Test && self.features.allows_node(n))
                .map(|n| n.qualified_name()),
        );
        tests.sort();
        tests.dedup();
        tests
    }
}

async fn within<T>(
    service: &str,
    secs: u64,
    call: impl Future<Output = Result<T, ServiceError>>,
) -> Result<T, ServiceError> {
    tokio::time::timeout(Duration::from_secs(secs), call)
        .await
        .map_err(|_| ServiceError::Timeout {
            service: service.to_string(),
            secs,
        })?
}

#[cfg(test)]
#[path = "preflight_tests.rs"]
mod tests;
