use crate::human_helpers::{
    format_confidence_human, format_validation_human, truncate_lines, MAX_DIFF_LINES,
};
use crate::OutputFormatter;
use mend_core::store::AuditEntry;
use mend_core::types::Version;
use mend_repair::{CommitRef, HoldReport, Rationale, RepairOutcome};

pub struct HumanFormatter;

impl HumanFormatter {
    fn format_rationale(&self, rationale: &Rationale) -> String {
        let mut out = String::new();
        if let Some(pattern) = &rationale.pattern {
            out.push_str(&format!("  pattern: {}\n", pattern));
        }
        if let Some(origin) = &rationale.origin {
            out.push_str(&format!("  origin: {}\n", origin));
        }
        if let Some(c) = &rationale.confidence {
            out.push_str(&format_confidence_human(c));
        }
        if rationale.widened {
            out.push_str("  widened: yes\n");
        }
        if rationale.attempts > 0 {
            out.push_str(&format!("  attempts: {}\n", rationale.attempts));
        }
        if !rationale.validation.is_empty() {
            out.push_str("  validation:\n");
            for line in format_validation_human(&rationale.validation).lines() {
                out.push_str(&format!("  {}\n", line));
            }
        }
        for note in &rationale.notes {
            out.push_str(&format!("   = {}\n", note));
        }
        out
    }
}

impl OutputFormatter for HumanFormatter {
    fn format_outcome(&self, outcome: &RepairOutcome) -> String {
        match outcome {
            RepairOutcome::Applied {
                commit,
                candidate,
                rationale,
            } => {
                let mut out = format!(
                    "Applied {} to {} [commit {}]\n  graph: {} -> {}\n",
                    candidate.origin.label(),
                    rationale.target,
                    commit.commit_id,
                    commit.pre_version,
                    commit.post_version,
                );
                for edit in &candidate.edits {
                    out.push_str(&format!("  changed: {}\n", edit.path));
                }
                out.push_str(&self.format_rationale(rationale));
                out
            }
            RepairOutcome::Held { report, rationale } => {
                let mut out = self.format_hold(report);
                out.push_str(&self.format_rationale(rationale));
                out
            }
            RepairOutcome::Rejected { rationale } => {
                let mut out = format!("Rejected repair of {}\n", rationale.target);
                out.push_str(&self.format_rationale(rationale));
                out
            }
        }
    }

    fn format_hold(&self, report: &HoldReport) -> String {
        let mut out = format!(
            "Held {}: {} ({} candidate(s))\n",
            report.target,
            report.reason,
            report.candidates.len(),
        );
        for (i, held) in report.candidates.iter().enumerate() {
            out.push_str(&format!(
                "\n{}. {} [{}]\n",
                i + 1,
                held.candidate.origin.label(),
                held.candidate.id,
            ));
            if let Some(c) = &held.confidence {
                out.push_str(&format_confidence_human(c));
            }
            out.push_str(&format_validation_human(&held.validation));
            let (diff, _) = truncate_lines(&held.diff, MAX_DIFF_LINES);
            out.push_str(&diff);
        }
        out
    }

    fn format_rollback(&self, commit: &CommitRef, restored: Version) -> String {
        format!(
            "Rolled back commit {} (candidate {})\n  graph: {} restored as {}\n",
            commit.commit_id, commit.candidate_id, commit.pre_version, restored,
        )
    }

    fn format_audit(&self, entries: &[AuditEntry]) -> String {
        if entries.is_empty() {
            return "No audit entries.\n".to_string();
        }
        let mut out = String::new();
        for e in entries {
            let confidence = e
                .confidence
                .map(|c| format!("{:.0}%", c * 100.0))
                .unwrap_or_else(|| "-".to_string());
            out.push_str(&format!(
                "{:<6} {:<12} {} confidence={} stages={}\n",
                e.version.to_string(),
                e.action.as_str(),
                e.candidate_id,
                confidence,
                e.validation.len(),
            ));
            if !e.rationale.is_empty() {
                out.push_str(&format!("   = {}\n", e.rationale));
            }
        }
        out
    }
}

#[cfg(test)]
#[path = "human_tests.rs"]
mod tests;
