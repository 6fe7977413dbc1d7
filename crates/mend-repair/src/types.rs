use serde::{Deserialize, Serialize};

use mend_core::config::{ConfidenceWeights, GateMode};
use mend_core::types::{
    Diagnostic, GraphError, InterfaceNode, Uid, ValidationResult, ValidationStage, Version,
};
use mend_retrieve::{BoundPlacement, EditLocus, PatternError, RetrievalError};

/// Full replacement content for one repository file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    /// Repository-relative path.
    pub path: String,
    pub original: String,
    pub updated: String,
}

/// Template parameters that, with the pattern id and locus, re-derive a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateParams {
    pub param: String,
    pub bounds: Vec<String>,
    pub placement: BoundPlacement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum CandidateOrigin {
    Template {
        pattern_id: String,
        locus: EditLocus,
        params: TemplateParams,
    },
    /// Not re-derivable; the raw reply is kept for audit.
    Reasoner { raw_response: String },
}

impl CandidateOrigin {
    pub fn label(&self) -> String {
        match self {
            CandidateOrigin::Template {
                pattern_id, locus, ..
            } => format!("template:{pattern_id}@{}", locus.label()),
            CandidateOrigin::Reasoner { .. } => "reasoner".to_string(),
        }
    }

    pub fn pattern_id(&self) -> Option<&str> {
        match self {
            CandidateOrigin::Template { pattern_id, .. } => Some(pattern_id),
            CandidateOrigin::Reasoner { .. } => None,
        }
    }

    pub fn is_deterministic(&self) -> bool {
        matches!(self, CandidateOrigin::Template { .. })
    }
}

/// One fully specified edit set proposed for a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Content hash of the origin and the edits.
    pub id: String,
    pub target: Uid,
    pub origin: CandidateOrigin,
    pub edits: Vec<FileEdit>,
    /// Graph nodes the edits change (pre-edit UIDs). Seeds test selection.
    pub touched: Vec<Uid>,
    /// Post-edit nodes committed on apply; `predicted[i]` replaces `touched[i]`.
    pub predicted: Vec<InterfaceNode>,
    /// 1.0 when the predicted change satisfies the pattern postcondition.
    pub consistency: f64,
}

/// Evidence features fed to the confidence gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceFeatures {
    pub coverage: f64,
    pub agreement: f64,
    pub consistency: f64,
    pub static_precheck: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Proceed,
    Widen,
    Hold,
}

impl GateDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateDecision::Proceed => "proceed",
            GateDecision::Widen => "widen",
            GateDecision::Hold => "hold",
        }
    }
}

/// How a confidence score was reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    pub features: EvidenceFeatures,
    pub weights: ConfidenceWeights,
    pub calibration: String,
    pub logit: f64,
    pub score: f64,
    pub threshold: f64,
    pub mode: GateMode,
    pub decision: GateDecision,
}

/// A reference to an applied commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    pub commit_id: String,
    pub candidate_id: String,
    pub pre_version: Version,
    pub post_version: Version,
}

/// Why a decision was taken. Attached to every outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rationale {
    pub target: Uid,
    pub pattern: Option<String>,
    pub origin: Option<String>,
    pub confidence: Option<ConfidenceBreakdown>,
    pub failed_stage: Option<ValidationStage>,
    pub validation: Vec<ValidationResult>,
    pub widened: bool,
    pub attempts: u32,
    pub notes: Vec<String>,
}

impl Rationale {
    pub fn for_target(target: &str) -> Self {
        Self {
            target: target.to_string(),
            ..Self::default()
        }
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// One-line summary of the decision evidence.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(pattern) = &self.pattern {
            parts.push(format!("pattern {pattern}"));
        } else if let Some(origin) = &self.origin {
            parts.push(origin.clone());
        }
        if let Some(c) = &self.confidence {
            parts.push(format!(
                "confidence {:.2} ({} threshold {:.2}: {})",
                c.score,
                match c.mode {
                    GateMode::AccuracyFirst => "accuracy-first",
                    GateMode::Fast => "fast",
                },
                c.threshold,
                c.decision.as_str()
            ));
        }
        if let Some(stage) = self.failed_stage {
            parts.push(format!("failed at {stage}"));
        } else if !self.validation.is_empty() {
            parts.push(format!("{} stages passed", self.validation.len()));
        }
        if self.widened {
            parts.push("after widening".to_string());
        }
        if let Some(last) = self.notes.last() {
            parts.push(last.clone());
        }
        parts.join("; ")
    }
}

/// One candidate as presented to a reviewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeldCandidate {
    pub candidate: Candidate,
    pub diff: String,
    pub confidence: Option<ConfidenceBreakdown>,
    pub validation: Vec<ValidationResult>,
}

impl HeldCandidate {
    pub fn diagnostics(&self) -> Vec<&Diagnostic> {
        self.validation
            .iter()
            .flat_map(|r| r.diagnostics.iter())
            .collect()
    }
}

/// Everything a human reviewer sees on a `Hold`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldReport {
    pub target: Uid,
    pub reason: String,
    pub candidates: Vec<HeldCandidate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "detail", rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve(String),
    Reject(String),
    Defer,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RepairOutcome {
    Applied {
        commit: CommitRef,
        candidate: Candidate,
        rationale: Rationale,
    },
    Held {
        report: HoldReport,
        rationale: Rationale,
    },
    Rejected {
        rationale: Rationale,
    },
}

impl RepairOutcome {
    pub fn rationale(&self) -> &Rationale {
        match self {
            RepairOutcome::Applied { rationale, .. }
            | RepairOutcome::Held { rationale, .. }
            | RepairOutcome::Rejected { rationale } => rationale,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RepairOutcome::Applied { .. } => "applied",
            RepairOutcome::Held { .. } => "held",
            RepairOutcome::Rejected { .. } => "rejected",
        }
    }
}

/// Failure of an external service call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("{service} timed out after {secs}s")]
    Timeout { service: String, secs: u64 },

    #[error("{service} unavailable: {reason}")]
    Unavailable { service: String, reason: String },

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("Reasoner timed out after {secs}s")]
    ReasonerTimeout { secs: u64 },

    #[error("Reasoner refused: {0}")]
    ReasonerRefusal(String),

    #[error("Reasoner failed: {0}")]
    Reasoner(#[from] ServiceError),

    #[error("No candidate could be generated for {target}")]
    NoCandidates { target: Uid },

    #[error("Invalid diff: {0}")]
    Diff(String),

    #[error("Signature of {name} not found in {path}")]
    SignatureNotFound { path: String, name: String },

    #[error("Candidate {0} is reasoner-derived and cannot be re-derived")]
    NotDerivable(String),

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("Candidate {candidate} has no full PreFlight pass")]
    NotValidated { candidate: String },

    #[error("Confidence {score:.2} below threshold {threshold:.2}")]
    ConfidenceBelowThreshold { score: f64, threshold: f64 },

    #[error("Apply of {candidate} failed and was reverted: {reason}")]
    ApplyFailure { candidate: String, reason: String },

    #[error("Rollback of {commit} failed: {reason}. Automated apply is halted until cleared")]
    RollbackFailure { commit: String, reason: String },

    #[error("Repository halted: {0}")]
    RepositoryHalted(String),

    #[error("Unknown commit: {0}")]
    UnknownCommit(String),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Generate(#[from] GenerateError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("Validation failed at {stage}: {} diagnostics", diagnostics.len())]
    ValidationFailure {
        stage: ValidationStage,
        diagnostics: Vec<Diagnostic>,
    },

    #[error("Unknown candidate: {0}")]
    UnknownCandidate(String),
}
