//! Output formatters for mend decisions.
//!
//! Provides two output modes:
//! - **JSON** (`--json`): Machine-readable structured output
//! - **Human** (default): Plain text for a terminal or a review queue

pub mod human;
pub(crate) mod human_helpers;
pub mod json;

use mend_core::store::AuditEntry;
use mend_core::types::Version;
use mend_repair::{CommitRef, HoldReport, RepairOutcome};

pub trait OutputFormatter {
    fn format_outcome(&self, outcome: &RepairOutcome) -> String;
    fn format_hold(&self, report: &HoldReport) -> String;
    fn format_rollback(&self, commit: &CommitRef, restored: Version) -> String;
    fn format_audit(&self, entries: &[AuditEntry]) -> String;
}
