//! Candidate generation: deterministic template instantiation from matched
//! patterns, with the reasoner as fallback when no template applies.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use mend_core::config::GeneratorConfig;
use mend_core::hash::content_hash;
use mend_core::types::{Diagnostic, GenericOrigin, InterfaceNode};
use mend_retrieve::signature::{missing_bounds, with_added_bounds};
use mend_retrieve::{ContextBundle, EditLocus, Pattern, PatternLibrary, PatternMatch, PatternTarget};

use crate::diff::{apply_patch, parse_patch};
use crate::services::{Reasoner, ReasonerReply};
use crate::types::{Candidate, CandidateOrigin, FileEdit, GenerateError, TemplateParams};

const MAX_LINEAGE: usize = 3;
/// Reasoner diffs have no formal postcondition to check against.
pub const REASONER_CONSISTENCY: f64 = 0.5;

/// What earlier attempts on the same target taught us.
#[derive(Debug, Clone, Default)]
pub struct GenerationFeedback {
    /// Candidate ids that already failed validation.
    pub exclude: HashSet<String>,
    /// Their diagnostics, forwarded to the reasoner.
    pub diagnostics: Vec<Diagnostic>,
}

pub struct CandidateGenerator {
    reasoner: Option<Arc<dyn Reasoner>>,
    max_candidates: usize,
    reasoner_timeout: Duration,
    repo_root: PathBuf,
}

impl CandidateGenerator {
    pub fn new(config: &GeneratorConfig, repo_root: &Path) -> Self {
        Self {
            reasoner: None,
            max_candidates: config.max_candidates.max(1),
            reasoner_timeout: Duration::from_secs(config.reasoner_timeout_secs),
            repo_root: repo_root.to_path_buf(),
        }
    }

    pub fn with_reasoner(mut self, reasoner: Arc<dyn Reasoner>) -> Self {
        self.reasoner = Some(reasoner);
        self
    }

    pub fn with_reasoner_timeout(mut self, timeout: Duration) -> Self {
        self.reasoner_timeout = timeout;
        self
    }

    pub fn has_reasoner(&self) -> bool {
        self.reasoner.is_some()
    }

    /// One candidate per (match, legal locus), in match order, capped at
    /// `max_candidates`. Falls back to a single reasoner candidate when no
    /// template instantiates.
    pub async fn generate(
        &self,
        bundle: &ContextBundle,
        matches: &[PatternMatch],
        target: PatternTarget<'_>,
        feedback: &GenerationFeedback,
    ) -> Result<Vec<Candidate>, GenerateError> {
        let mut candidates = Vec::new();
        let mut seen = HashSet::new();
        'matches: for m in matches {
            for locus in &m.loci {
                match self.instantiate(m, locus, target) {
                    Ok(candidate) => {
                        if feedback.exclude.contains(&candidate.id) || !seen.insert(candidate.id.clone()) {
                            continue;
                        }
                        candidates.push(candidate);
                        if candidates.len() >= self.max_candidates {
                            break 'matches;
                        }
                    }
                    Err(e) => {
                        debug!(pattern = %m.id(), locus = locus.label(), error = %e, "template not instantiated");
                    }
                }
            }
        }

        if !candidates.is_empty() {
            info!(
                target = %target.node.uid,
                count = candidates.len(),
                "template candidates generated"
            );
            return Ok(candidates);
        }

        let Some(reasoner) = &self.reasoner else {
            return Err(GenerateError::NoCandidates {
                target: target.node.uid.clone(),
            });
        };
        let candidate = self.ask_reasoner(reasoner.as_ref(), bundle, target, feedback).await?;
        if feedback.exclude.contains(&candidate.id) {
            return Err(GenerateError::NoCandidates {
                target: target.node.uid.clone(),
            });
        }
        Ok(vec![candidate])
    }

    /// Instantiate `m` at `locus` for `target`.
    pub fn instantiate(
        &self,
        m: &PatternMatch,
        locus: &EditLocus,
        target: PatternTarget<'_>,
    ) -> Result<Candidate, GenerateError> {
        let params = TemplateParams {
            param: m.param.clone(),
            bounds: m.bounds.clone(),
            placement: m.placement_at(locus, target.node),
        };
        self.instantiate_with(&m.pattern, locus, params, target)
    }

    /// Rebuild a template candidate from its `(pattern_id, locus, params)`.
    pub fn rederive(
        &self,
        candidate: &Candidate,
        library: &PatternLibrary,
        target: PatternTarget<'_>,
    ) -> Result<Candidate, GenerateError> {
        let CandidateOrigin::Template {
            pattern_id,
            locus,
            params,
        } = &candidate.origin
        else {
            return Err(GenerateError::NotDerivable(candidate.id.clone()));
        };
        let pattern = library
            .get(pattern_id)
            .ok_or_else(|| GenerateError::NoCandidates {
                target: target.node.uid.clone(),
            })?;
        self.instantiate_with(pattern, locus, params.clone(), target)
    }

    fn instantiate_with(
        &self,
        pattern: &Pattern,
        locus: &EditLocus,
        params: TemplateParams,
        target: PatternTarget<'_>,
    ) -> Result<Candidate, GenerateError> {
        let node = target.node;
        let (touched, predicted, rewritten) = match locus {
            EditLocus::Item => {
                let fixed = with_lineage(
                    with_added_bounds(node, &params.param, &params.bounds, params.placement)?,
                    node,
                );
                (vec![node.uid.clone()], vec![fixed.clone()], (node, fixed))
            }
            EditLocus::Impl { owner } => {
                let impl_node = target
                    .owner
                    .filter(|o| &o.uid == owner)
                    .ok_or_else(|| GenerateError::NoCandidates {
                        target: node.uid.clone(),
                    })?;
                let fixed_impl = with_lineage(
                    with_added_bounds(impl_node, &params.param, &params.bounds, params.placement)?,
                    impl_node,
                );
                let reowned = reown(node, &fixed_impl, &params.param, &params.bounds);
                (
                    vec![impl_node.uid.clone(), node.uid.clone()],
                    vec![fixed_impl.clone(), reowned],
                    (impl_node, fixed_impl),
                )
            }
        };

        let (before, after) = rewritten;
        if before.signature == after.signature {
            return Err(GenerateError::NoCandidates {
                target: node.uid.clone(),
            });
        }
        let edit = self.signature_edit(before, &after.signature, node)?;

        let post_target = predicted.last().unwrap_or(&after);
        let consistency = match pattern.verify(post_target, &params.param) {
            Ok(()) => 1.0,
            Err(reason) => {
                debug!(pattern = %pattern.id, %reason, "postcondition not met");
                0.0
            }
        };

        let origin = CandidateOrigin::Template {
            pattern_id: pattern.id.clone(),
            locus: locus.clone(),
            params,
        };
        let edits = vec![edit];
        Ok(Candidate {
            id: candidate_id(&node.uid, &origin, &edits),
            target: node.uid.clone(),
            origin,
            edits,
            touched,
            predicted,
            consistency,
        })
    }

    /// Replace `node`'s signature text in its source file.
    fn signature_edit(
        &self,
        node: &InterfaceNode,
        new_signature: &str,
        fallback: &InterfaceNode,
    ) -> Result<FileEdit, GenerateError> {
        let path = if node.file_path.is_empty() {
            &fallback.file_path
        } else {
            &node.file_path
        };
        let original = std::fs::read_to_string(self.repo_root.join(path))?;
        let updated = replace_signature(&original, node, new_signature).ok_or_else(|| {
            GenerateError::SignatureNotFound {
                path: path.clone(),
                name: node.qualified_name(),
            }
        })?;
        Ok(FileEdit {
            path: path.clone(),
            original,
            updated,
        })
    }

    async fn ask_reasoner(
        &self,
        reasoner: &dyn Reasoner,
        bundle: &ContextBundle,
        target: PatternTarget<'_>,
        feedback: &GenerationFeedback,
    ) -> Result<Candidate, GenerateError> {
        let reply = tokio::time::timeout(self.reasoner_timeout, reasoner.propose(bundle, &feedback.diagnostics))
            .await
            .map_err(|_| GenerateError::ReasonerTimeout {
                secs: self.reasoner_timeout.as_secs(),
            })??;

        let raw = match reply {
            ReasonerReply::Diff(raw) => raw,
            ReasonerReply::Refusal(reason) => {
                warn!(target = %target.node.uid, %reason, "reasoner refused");
                return Err(GenerateError::ReasonerRefusal(reason));
            }
        };

        let mut edits = Vec::new();
        for patch in parse_patch(&raw)? {
            let original = match std::fs::read_to_string(self.repo_root.join(&patch.path)) {
                Ok(text) => text,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(e) => return Err(e.into()),
            };
            let updated = apply_patch(&original, &patch)?;
            if updated != original {
                edits.push(FileEdit {
                    path: patch.path,
                    original,
                    updated,
                });
            }
        }
        if edits.is_empty() {
            return Err(GenerateError::Diff("reasoner diff changes nothing".to_string()));
        }

        let origin = CandidateOrigin::Reasoner { raw_response: raw };
        info!(target = %target.node.uid, files = edits.len(), "reasoner candidate generated");
        Ok(Candidate {
            id: candidate_id(&target.node.uid, &origin, &edits),
            target: target.node.uid.clone(),
            origin,
            edits,
            touched: vec![target.node.uid.clone()],
            predicted: Vec::new(),
            consistency: REASONER_CONSISTENCY,
        })
    }
}

fn candidate_id(target: &str, origin: &CandidateOrigin, edits: &[FileEdit]) -> String {
    let origin_key = match origin {
        CandidateOrigin::Template {
            pattern_id,
            locus,
            params,
        } => format!(
            "{pattern_id}@{}:{}:{}",
            locus.label(),
            params.param,
            params.bounds.join("+")
        ),
        CandidateOrigin::Reasoner { .. } => "reasoner".to_string(),
    };
    content_hash(
        [("\0target", target), ("\0origin", origin_key.as_str())]
            .into_iter()
            .chain(edits.iter().map(|e| (e.path.as_str(), e.updated.as_str()))),
    )
}

/// Record `old`'s UID in the lineage of its rewritten form.
pub(crate) fn with_lineage(mut fixed: InterfaceNode, old: &InterfaceNode) -> InterfaceNode {
    if fixed.uid != old.uid {
        let mut lineage = vec![old.uid.clone()];
        lineage.extend(old.previous_uids.iter().cloned());
        lineage.truncate(MAX_LINEAGE);
        fixed.previous_uids = lineage;
    }
    fixed
}

/// `node` moved under the rewritten impl, with the inherited bounds applied.
fn reown(node: &InterfaceNode, fixed_impl: &InterfaceNode, param: &str, bounds: &[String]) -> InterfaceNode {
    let added = missing_bounds(node, param, bounds);
    let mut out = node.clone();
    if let Some(generic) = out
        .generics
        .iter_mut()
        .find(|g| g.name == param && g.origin == GenericOrigin::Impl)
    {
        generic.bounds.extend(added);
    }
    out.owner = Some(fixed_impl.uid.clone());
    out.refresh_uid();
    with_lineage(out, node)
}

/// Swap the signature text, preferring a unique hit inside the node's line
/// range over a unique hit anywhere in the file.
pub(crate) fn replace_signature(source: &str, node: &InterfaceNode, new_signature: &str) -> Option<String> {
    let old = node.signature.as_str();
    if old.is_empty() {
        return None;
    }
    let at = line_span(source, node.line_start, node.line_end.max(node.line_start))
        .and_then(|(start, end)| unique_find(&source[start..end], old).map(|i| start + i))
        .or_else(|| unique_find(source, old))?;
    let mut out = String::with_capacity(source.len() + new_signature.len());
    out.push_str(&source[..at]);
    out.push_str(new_signature);
    out.push_str(&source[at + old.len()..]);
    Some(out)
}

fn unique_find(haystack: &str, needle: &str) -> Option<usize> {
    let mut hits = haystack.match_indices(needle);
    let (first, _) = hits.next()?;
    if hits.next().is_some() {
        return None;
    }
    Some(first)
}

/// Byte span of 1-based lines `first..=last`.
fn line_span(source: &str, first: u32, last: u32) -> Option<(usize, usize)> {
    if first == 0 {
        return None;
    }
    let mut offset = 0;
    let mut start = None;
    for (i, line) in source.split_inclusive('\n').enumerate() {
        let n = i as u32 + 1;
        if n == first {
            start = Some(offset);
        }
        offset += line.len();
        if n == last {
            break;
        }
    }
    start.map(|s| (s, offset))
}

#[cfg(test)]
#[path = "generator_tests.rs"]
mod tests;
