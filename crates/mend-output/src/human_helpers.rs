use mend_core::types::{Diagnostic, Severity, ValidationResult};
use mend_repair::ConfidenceBreakdown;

/// Diffs longer than this are cut in held-candidate listings.
pub(crate) const MAX_DIFF_LINES: usize = 80;

pub(crate) fn format_diagnostic_human(d: &Diagnostic) -> String {
    let severity_label = match d.severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
        Severity::Note => "note",
    };

    let mut out = match &d.code {
        Some(code) => format!("{}[{}]: {}\n", severity_label, code, d.message),
        None => format!("{}: {}\n", severity_label, d.message),
    };
    if let Some(file) = &d.file {
        match d.line {
            Some(line) => out.push_str(&format!("  --> {}:{}\n", file, line)),
            None => out.push_str(&format!("  --> {}\n", file)),
        }
    }
    out
}

pub(crate) fn format_confidence_human(c: &ConfidenceBreakdown) -> String {
    let f = &c.features;
    format!(
        "  confidence: {:.0}% (threshold {:.0}%, {})\n   = coverage {:.2}  agreement {:.2}  consistency {:.2}  static {:.2}\n",
        c.score * 100.0,
        c.threshold * 100.0,
        c.decision.as_str(),
        f.coverage,
        f.agreement,
        f.consistency,
        f.static_precheck,
    )
}

/// One line per stage, diagnostics of failing stages indented beneath.
pub(crate) fn format_validation_human(results: &[ValidationResult]) -> String {
    let mut out = String::new();
    for r in results {
        out.push_str(&format!(
            "  {:<22} {} ({}ms)\n",
            r.stage.as_str(),
            r.status.as_str(),
            r.duration_ms
        ));
        if !r.passed() {
            for d in &r.diagnostics {
                for line in format_diagnostic_human(d).lines() {
                    out.push_str(&format!("    {}\n", line));
                }
            }
        }
    }
    out
}

/// Keep the first `max_lines` lines; report how many were cut.
pub(crate) fn truncate_lines(text: &str, max_lines: usize) -> (String, usize) {
    let total = text.lines().count();
    if total <= max_lines {
        return (text.to_string(), 0);
    }
    let mut kept: String = text
        .lines()
        .take(max_lines)
        .map(|l| format!("{l}\n"))
        .collect();
    kept.push_str(&format!("... {} more lines\n", total - max_lines));
    (kept, total - max_lines)
}
