//! Repair pipeline for mend.
//!
//! Turns retrieved context into validated, applied fixes:
//! - [`generator`]: template candidates from matched patterns, reasoner fallback
//! - [`confidence`]: calibrated acceptance score and the Proceed/Widen/Hold decision
//! - [`preflight`]: staged validation in shadow workspaces, concurrent across candidates
//! - [`apply`]: journaled apply, rollback and crash recovery
//! - [`retry`]: per-target retry budget
//! - [`engine`]: the control loop tying them together

pub mod types;
pub mod services;
pub mod diff;
pub mod workspace;
pub mod generator;
pub mod confidence;
pub mod preflight;
pub mod apply;
pub mod retry;
pub mod engine;

pub use apply::{ApplyController, ApplyEvidence, Approval, FsWorkingTree, WorkingTree};
pub use confidence::{Calibration, ConfidenceGate};
pub use engine::{RepairEngine, RepairRequest, Services};
pub use generator::{CandidateGenerator, GenerationFeedback};
pub use preflight::{Preflight, PreflightRun, PreflightSelection};
pub use retry::{RetryAction, RetryBudget};
pub use types::{
    ApplyError, Candidate, CandidateOrigin, CommitRef, ConfidenceBreakdown, EvidenceFeatures,
    FileEdit, GateDecision, HoldReport, Rationale, RepairError, RepairOutcome, ReviewDecision,
};
