use crate::OutputFormatter;
use mend_core::store::AuditEntry;
use mend_core::types::Version;
use mend_repair::{CommitRef, HoldReport, RepairOutcome};
use serde::Serialize;

pub struct JsonFormatter;

#[derive(Serialize)]
struct RollbackReport<'a> {
    command: &'static str,
    commit: &'a CommitRef,
    restored_version: Version,
}

impl OutputFormatter for JsonFormatter {
    fn format_outcome(&self, outcome: &RepairOutcome) -> String {
        serde_json::to_string_pretty(outcome).unwrap_or_default()
    }

    fn format_hold(&self, report: &HoldReport) -> String {
        serde_json::to_string_pretty(report).unwrap_or_default()
    }

    fn format_rollback(&self, commit: &CommitRef, restored: Version) -> String {
        let report = RollbackReport {
            command: "rollback",
            commit,
            restored_version: restored,
        };
        serde_json::to_string_pretty(&report).unwrap_or_default()
    }

    fn format_audit(&self, entries: &[AuditEntry]) -> String {
        serde_json::to_string_pretty(entries).unwrap_or_default()
    }
}
