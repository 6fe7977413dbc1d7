//! Context packing for candidate generation.
//!
//! The diagnostic, the target signature and the required bounds are anchors:
//! they open the bundle and are repeated at its end. Supporting sections sit
//! in the middle, ordered by relevance, and are the only thing truncated.

use serde::Serialize;

use mend_core::config::PackerConfig;
use mend_core::types::{Diagnostic, Severity};

use crate::patterns::PatternMatch;
use crate::token_budget::{estimate_tokens, truncate_lines};
use crate::types::NeededSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionRole {
    Anchor,
    Supporting,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextSection {
    pub role: SectionRole,
    pub title: String,
    pub body: String,
    pub relevance: f64,
}

impl ContextSection {
    fn anchor(title: &str, body: String) -> Self {
        Self {
            role: SectionRole::Anchor,
            title: title.to_string(),
            body,
            relevance: 1.0,
        }
    }

    pub fn render(&self) -> String {
        format!("## {}\n{}\n", self.title, self.body)
    }

    /// Cost of the section once packed, including the line that joins it
    /// to its neighbour.
    pub fn tokens(&self) -> usize {
        estimate_tokens(&format!("{}\n", self.render()))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextBundle {
    pub head: Vec<ContextSection>,
    pub middle: Vec<ContextSection>,
    pub tail: Vec<ContextSection>,
    pub token_budget: usize,
    pub tokens_used: usize,
    /// Titles of supporting sections cut to fit, lowest relevance last in.
    pub dropped: Vec<String>,
    /// The anchors alone exceed the budget.
    pub over_budget: bool,
}

impl ContextBundle {
    pub fn sections(&self) -> impl Iterator<Item = &ContextSection> {
        self.head.iter().chain(&self.middle).chain(&self.tail)
    }

    pub fn render(&self) -> String {
        self.sections()
            .map(ContextSection::render)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub struct ContextPacker {
    default_budget: usize,
}

impl ContextPacker {
    pub fn new(config: &PackerConfig) -> Self {
        Self {
            default_budget: config.token_budget,
        }
    }

    pub fn default_budget(&self) -> usize {
        self.default_budget
    }

    pub fn pack(
        &self,
        needed: &NeededSet,
        diagnostics: &[Diagnostic],
        patterns: &[PatternMatch],
        token_budget: usize,
    ) -> ContextBundle {
        let head = anchors(needed, diagnostics, patterns);
        let tail: Vec<ContextSection> = head
            .iter()
            .map(|s| ContextSection {
                title: format!("{} (restated)", s.title),
                ..s.clone()
            })
            .collect();
        let anchor_tokens: usize = head.iter().chain(&tail).map(ContextSection::tokens).sum();

        let mut supporting = supporting_sections(needed, patterns);
        supporting.sort_by(|a, b| {
            b.relevance
                .total_cmp(&a.relevance)
                .then_with(|| a.title.cmp(&b.title))
        });

        let mut remaining = token_budget.saturating_sub(anchor_tokens);
        let mut middle = Vec::new();
        let mut dropped = Vec::new();
        let mut exhausted = false;
        for section in supporting {
            if exhausted {
                dropped.push(section.title);
                continue;
            }
            let cost = section.tokens();
            if cost <= remaining {
                remaining -= cost;
                middle.push(section);
                continue;
            }
            exhausted = true;
            // partial body if the header plus at least one line fits
            let header = estimate_tokens(&format!("## {} [truncated]\n\n", section.title));
            let (kept, _) = truncate_lines(&section.body, remaining.saturating_sub(header));
            if kept.is_empty() {
                dropped.push(section.title);
                continue;
            }
            let partial = ContextSection {
                title: format!("{} [truncated]", section.title),
                body: kept,
                ..section
            };
            remaining = remaining.saturating_sub(partial.tokens());
            middle.push(partial);
        }

        let mut bundle = ContextBundle {
            head,
            middle,
            tail,
            token_budget,
            tokens_used: 0,
            dropped,
            over_budget: anchor_tokens > token_budget,
        };
        bundle.tokens_used = estimate_tokens(&bundle.render());
        bundle
    }
}

fn anchors(needed: &NeededSet, diagnostics: &[Diagnostic], patterns: &[PatternMatch]) -> Vec<ContextSection> {
    let mut sections = Vec::new();

    let errors: Vec<String> = diagnostics
        .iter()
        .map(|d| {
            let level = match d.severity {
                Severity::Error => "error",
                Severity::Warning => "warning",
                Severity::Note => "note",
            };
            let code = d.code.as_deref().map(|c| format!("[{c}]")).unwrap_or_default();
            let location = match (&d.file, d.line) {
                (Some(file), Some(line)) => format!(" ({file}:{line})"),
                (Some(file), None) => format!(" ({file})"),
                _ => String::new(),
            };
            format!("{level}{code}: {}{location}", d.message)
        })
        .collect();
    if !errors.is_empty() {
        sections.push(ContextSection::anchor("Diagnostic", errors.join("\n")));
    }

    let targets: Vec<String> = needed
        .seed_nodes()
        .iter()
        .map(|n| format!("{} [{}]\n{}", n.qualified_name(), n.kind, n.signature))
        .collect();
    if !targets.is_empty() {
        sections.push(ContextSection::anchor("Target signature", targets.join("\n")));
    }

    let required: Vec<String> = patterns
        .iter()
        .map(|m| format!("{}: {} ({})", m.param, m.bounds.join(" + "), m.id()))
        .collect();
    if !required.is_empty() {
        sections.push(ContextSection::anchor("Required bounds", required.join("\n")));
    }
    sections
}

fn supporting_sections(needed: &NeededSet, patterns: &[PatternMatch]) -> Vec<ContextSection> {
    let mut sections: Vec<ContextSection> = patterns
        .iter()
        .map(|m| ContextSection {
            role: SectionRole::Supporting,
            title: format!("Pattern {}", m.id()),
            body: format!(
                "{}\nsuccess rate {:.2}, loci: {}",
                m.pattern.description,
                m.pattern.success_rate,
                m.loci.iter().map(|l| l.label()).collect::<Vec<_>>().join(", ")
            ),
            relevance: f64::from(1.0 - m.distance).clamp(0.0, 1.0),
        })
        .collect();

    for needed_node in needed.nodes.iter().filter(|n| !needed.seeds.contains(&n.node.uid)) {
        let node = &needed_node.node;
        let mut body = node.signature.clone();
        if !node.file_path.is_empty() {
            body = format!("// {}:{}\n{body}", node.file_path, node.line_start);
        }
        if let Some(summary) = &node.summary {
            body.push('\n');
            body.push_str(&summary.text);
        }
        sections.push(ContextSection {
            role: SectionRole::Supporting,
            title: format!("{} [{}, {}]", node.qualified_name(), node.kind, needed_node.provenance.as_str()),
            body,
            relevance: needed_node.score,
        });
    }
    sections
}
