//! External collaborators: type checker, build service, reasoner and the
//! human reviewer. Each is an async trait object so tests and embedders can
//! supply their own.

use std::path::Path;

use async_trait::async_trait;

use mend_core::types::{Diagnostic, FeatureContext, Severity};
use mend_retrieve::ContextBundle;

use crate::types::{FileEdit, HoldReport, ReviewDecision, ServiceError};

/// Pass/fail plus diagnostics for one build-service call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageReport {
    pub passed: bool,
    pub diagnostics: Vec<Diagnostic>,
}

impl StageReport {
    pub fn pass() -> Self {
        Self {
            passed: true,
            diagnostics: Vec::new(),
        }
    }

    pub fn fail(diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            passed: false,
            diagnostics,
        }
    }
}

/// Where a build-service call runs.
#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    /// The ephemeral workspace holding the materialized edits.
    pub workspace: &'a Path,
    /// Artifacts of the real workspace, read-only.
    pub shared_cache: &'a Path,
    /// Per-candidate artifact directory; the only place builds may write.
    pub cache_dir: &'a Path,
    pub features: &'a FeatureContext,
}

#[async_trait]
pub trait TypeCheckService: Send + Sync {
    /// Type-check `base` with `overlay` applied in memory. Must not touch disk.
    async fn check_overlay(&self, base: &Path, overlay: &[FileEdit]) -> Result<Vec<Diagnostic>, ServiceError>;
}

#[async_trait]
pub trait BuildService: Send + Sync {
    async fn format_check(&self, ctx: BuildContext<'_>) -> Result<StageReport, ServiceError>;

    async fn compile(&self, ctx: BuildContext<'_>) -> Result<StageReport, ServiceError>;

    /// Run only `tests` (qualified test names).
    async fn run_tests(&self, ctx: BuildContext<'_>, tests: &[String]) -> Result<StageReport, ServiceError>;

    async fn lint(&self, _ctx: BuildContext<'_>) -> Result<StageReport, ServiceError> {
        Ok(StageReport::pass())
    }

    async fn public_api(&self, _ctx: BuildContext<'_>) -> Result<StageReport, ServiceError> {
        Ok(StageReport::pass())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReasonerReply {
    /// A unified diff against the repository.
    Diff(String),
    Refusal(String),
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Propose one structured diff. `feedback` carries diagnostics from
    /// earlier failed attempts on the same target.
    async fn propose(&self, bundle: &ContextBundle, feedback: &[Diagnostic]) -> Result<ReasonerReply, ServiceError>;
}

#[async_trait]
pub trait Escalation: Send + Sync {
    async fn review(&self, report: &HoldReport) -> ReviewDecision;
}

/// Escalation handler that leaves every hold pending.
pub struct DeferAll;

#[async_trait]
impl Escalation for DeferAll {
    async fn review(&self, _report: &HoldReport) -> ReviewDecision {
        ReviewDecision::Defer
    }
}

/// Score the in-memory check: clean is 1, warnings only is 0.5, any error is 0.
pub fn static_precheck_score(diagnostics: &[Diagnostic]) -> f64 {
    if diagnostics.iter().any(|d| d.severity == Severity::Error) {
        0.0
    } else if diagnostics.iter().any(|d| d.severity == Severity::Warning) {
        0.5
    } else {
        1.0
    }
}
