//! Fix-pattern library.
//!
//! A pattern pairs a diagnostic trigger with a structural precondition on
//! the target's generics, a parameterized transform, and the postcondition
//! the transform must establish. Applicability is decided on the node model,
//! never by matching signature text.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use mend_core::store::RepairLedger;
use mend_core::types::{Diagnostic, GenericKind, GenericOrigin, InterfaceNode, NodeKind, Uid};

use crate::signature::{missing_bounds, BoundPlacement};
use crate::types::PatternError;

const INITIAL_SUCCESS_RATE: f64 = 0.5;
const DEFAULT_MAX_DISTANCE: f32 = 0.35;

fn initial_rate() -> f64 {
    INITIAL_SUCCESS_RATE
}

fn default_max_distance() -> f32 {
    DEFAULT_MAX_DISTANCE
}

fn default_generic_kind() -> GenericKind {
    GenericKind::Type
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(default)]
    pub error_codes: Vec<String>,
    /// Lower-case phrases matched against diagnostic messages.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Embedding centroid of diagnostics this pattern has fixed.
    #[serde(default)]
    pub centroid: Option<Vec<f32>>,
    #[serde(default = "default_max_distance")]
    pub max_distance: f32,
}

/// Selects the generic parameter a pattern operates on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericSelector {
    #[serde(default = "default_generic_kind")]
    pub kind: GenericKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub position: Option<usize>,
}

impl Default for GenericSelector {
    fn default() -> Self {
        Self {
            kind: GenericKind::Type,
            name: None,
            position: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliesTo {
    pub kinds: Vec<NodeKind>,
    #[serde(default)]
    pub generic: GenericSelector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Transform {
    AddBounds {
        bounds: Vec<String>,
        #[serde(default)]
        placement: BoundPlacement,
    },
}

impl Transform {
    pub fn bounds(&self) -> &[String] {
        match self {
            Transform::AddBounds { bounds, .. } => bounds,
        }
    }

    pub fn placement(&self) -> BoundPlacement {
        match self {
            Transform::AddBounds { placement, .. } => *placement,
        }
    }
}

/// A structural predicate over the selected generic parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Condition {
    GenericPresent,
    /// At least one of `bounds` is absent.
    BoundsMissing { bounds: Vec<String> },
    /// Every one of `bounds` is present.
    BoundsPresent { bounds: Vec<String> },
    /// None of `bounds` is present.
    BoundsAbsent { bounds: Vec<String> },
}

impl Condition {
    pub fn check(&self, node: &InterfaceNode, param: &str) -> Result<(), String> {
        let have = node.effective_bounds(param);
        match self {
            Condition::GenericPresent => node
                .generic(param)
                .map(|_| ())
                .ok_or_else(|| format!("`{}` has no generic `{param}`", node.name)),
            Condition::BoundsMissing { bounds } => {
                if bounds.iter().any(|b| !have.contains(b.trim())) {
                    Ok(())
                } else {
                    Err(format!("`{param}` already has {}", bounds.join(" + ")))
                }
            }
            Condition::BoundsPresent { bounds } => {
                let absent: Vec<&str> = bounds
                    .iter()
                    .map(|b| b.trim())
                    .filter(|b| !have.contains(*b))
                    .collect();
                if absent.is_empty() {
                    Ok(())
                } else {
                    Err(format!("`{param}` lacks {}", absent.join(" + ")))
                }
            }
            Condition::BoundsAbsent { bounds } => match bounds.iter().find(|b| have.contains(b.trim())) {
                Some(b) => Err(format!("`{param}` already bounded by {b}")),
                None => Ok(()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub description: String,
    pub trigger: Trigger,
    pub applies_to: AppliesTo,
    pub transform: Transform,
    #[serde(default)]
    pub preconditions: Vec<Condition>,
    #[serde(default)]
    pub postconditions: Vec<Condition>,
    #[serde(default = "initial_rate")]
    pub success_rate: f64,
}

impl Pattern {
    /// Check postconditions against a predicted post-edit node.
    pub fn verify(&self, fixed: &InterfaceNode, param: &str) -> Result<(), String> {
        self.postconditions
            .iter()
            .try_for_each(|c| c.check(fixed, param))
    }
}

/// Where a bound may legally be inserted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "at", rename_all = "snake_case")]
pub enum EditLocus {
    /// On the target item: its own generic list or its `where` clause.
    Item,
    /// On the enclosing impl block that declares the parameter.
    Impl { owner: Uid },
}

impl EditLocus {
    pub fn label(&self) -> &'static str {
        match self {
            EditLocus::Item => "item",
            EditLocus::Impl { .. } => "impl",
        }
    }
}

/// The node being repaired plus its enclosing impl, if any.
#[derive(Debug, Clone, Copy)]
pub struct PatternTarget<'a> {
    pub node: &'a InterfaceNode,
    pub owner: Option<&'a InterfaceNode>,
}

impl<'a> PatternTarget<'a> {
    pub fn new(node: &'a InterfaceNode) -> Self {
        Self { node, owner: None }
    }

    pub fn with_owner(mut self, owner: Option<&'a InterfaceNode>) -> Self {
        self.owner = owner;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PatternMatch {
    pub pattern: Pattern,
    /// Trigger distance; lower is closer.
    pub distance: f32,
    /// The generic parameter the transform targets.
    pub param: String,
    /// Bounds the transform would add.
    pub bounds: Vec<String>,
    /// Legal insertion points, preferred first.
    pub loci: Vec<EditLocus>,
}

impl PatternMatch {
    pub fn id(&self) -> &str {
        &self.pattern.id
    }

    /// Placement to use at `locus`. Impl-declared parameters can only be
    /// bounded from the item through its `where` clause.
    pub fn placement_at(&self, locus: &EditLocus, target: &InterfaceNode) -> BoundPlacement {
        let origin = target.generic(&self.param).map(|g| g.origin).unwrap_or_default();
        match (locus, origin) {
            (EditLocus::Item, GenericOrigin::Impl) => BoundPlacement::WhereClause,
            _ => self.pattern.transform.placement(),
        }
    }
}

pub struct PatternLibrary {
    patterns: Vec<Pattern>,
    ema_alpha: f64,
}

impl PatternLibrary {
    pub fn new(patterns: Vec<Pattern>, ema_alpha: f64) -> Self {
        Self { patterns, ema_alpha }
    }

    /// Library seeded with the built-in concurrency and lifetime patterns.
    pub fn builtin(ema_alpha: f64) -> Self {
        Self::new(builtin_patterns(), ema_alpha)
    }

    /// Add patterns from a JSON array file. Entries replace built-ins with the same id.
    pub fn load_file(&mut self, path: &Path) -> Result<usize, PatternError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PatternError::Load(format!("{}: {e}", path.display())))?;
        let loaded: Vec<Pattern> = serde_json::from_str(&content)
            .map_err(|e| PatternError::Load(format!("{}: {e}", path.display())))?;
        let count = loaded.len();
        for pattern in loaded {
            self.insert(pattern);
        }
        info!(count, path = %path.display(), "patterns loaded");
        Ok(count)
    }

    pub fn insert(&mut self, pattern: Pattern) {
        match self.patterns.iter_mut().find(|p| p.id == pattern.id) {
            Some(existing) => *existing = pattern,
            None => self.patterns.push(pattern),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Pattern> {
        self.patterns.iter().find(|p| p.id == id)
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Load persisted success rates.
    pub fn hydrate<L: RepairLedger + ?Sized>(&mut self, ledger: &L) -> Result<(), PatternError> {
        let rates = ledger.pattern_success_rates()?;
        self.apply_rates(&rates);
        Ok(())
    }

    pub fn apply_rates(&mut self, rates: &HashMap<String, f64>) {
        for pattern in &mut self.patterns {
            if let Some(rate) = rates.get(&pattern.id) {
                pattern.success_rate = *rate;
            }
        }
    }

    /// Patterns whose trigger fires and whose preconditions hold on the target,
    /// closest first.
    pub fn match_patterns(
        &self,
        diagnostics: &[Diagnostic],
        embedding: Option<&[f32]>,
        target: PatternTarget<'_>,
    ) -> Vec<PatternMatch> {
        let mut matches: Vec<PatternMatch> = self
            .patterns
            .iter()
            .filter_map(|pattern| {
                let distance = trigger_distance(&pattern.trigger, diagnostics, embedding)?;
                match check_applicable(pattern, diagnostics, target) {
                    Ok((param, bounds, loci)) => Some(PatternMatch {
                        pattern: pattern.clone(),
                        distance,
                        param,
                        bounds,
                        loci,
                    }),
                    Err(e) => {
                        debug!(pattern = %pattern.id, error = %e, "pattern triggered but not applicable");
                        None
                    }
                }
            })
            .collect();

        matches.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| b.pattern.success_rate.total_cmp(&a.pattern.success_rate))
                .then_with(|| a.pattern.id.cmp(&b.pattern.id))
        });
        matches
    }

    /// Fold an outcome into the pattern's success rate (EMA). Returns the new rate.
    pub fn record_outcome(&mut self, pattern_id: &str, success: bool) -> Option<f64> {
        let alpha = self.ema_alpha;
        let pattern = self.patterns.iter_mut().find(|p| p.id == pattern_id)?;
        let observed = if success { 1.0 } else { 0.0 };
        pattern.success_rate = (1.0 - alpha) * pattern.success_rate + alpha * observed;
        Some(pattern.success_rate)
    }

    /// `record_outcome` plus persistence to the ledger.
    pub fn record_outcome_persisted<L: RepairLedger + ?Sized>(
        &mut self,
        ledger: &L,
        pattern_id: &str,
        success: bool,
    ) -> Result<Option<f64>, PatternError> {
        let Some(rate) = self.record_outcome(pattern_id, success) else {
            return Ok(None);
        };
        ledger.record_pattern_outcome(pattern_id, success, rate)?;
        Ok(Some(rate))
    }
}

/// Trigger distance in [0, 1], or `None` when the trigger does not fire.
fn trigger_distance(trigger: &Trigger, diagnostics: &[Diagnostic], embedding: Option<&[f32]>) -> Option<f32> {
    let code_hit = diagnostics.iter().any(|d| {
        d.code
            .as_deref()
            .is_some_and(|c| trigger.error_codes.iter().any(|t| t == c))
    });
    let text: String = diagnostics
        .iter()
        .map(|d| d.message.to_lowercase())
        .collect::<Vec<_>>()
        .join("\n");
    let keyword_hits = trigger.keywords.iter().filter(|k| text.contains(k.as_str())).count();
    let keyword_fraction = if trigger.keywords.is_empty() {
        0.0
    } else {
        keyword_hits as f32 / trigger.keywords.len() as f32
    };

    let embedded = match (&trigger.centroid, embedding) {
        (Some(centroid), Some(query)) if centroid.len() == query.len() => Some(cosine_distance(centroid, query)),
        _ => None,
    };

    let lexical = match (trigger.error_codes.is_empty(), trigger.keywords.is_empty()) {
        (false, true) => f32::from(u8::from(code_hit)),
        (true, false) => keyword_fraction,
        (false, false) => 0.5 * f32::from(u8::from(code_hit)) + 0.5 * keyword_fraction,
        (true, true) => 0.0,
    };

    // A shared error code only narrows; patterns with keywords need a keyword hit.
    let lexical_fired = keyword_hits > 0 || (trigger.keywords.is_empty() && code_hit);
    let fired = lexical_fired || embedded.is_some_and(|d| d <= trigger.max_distance);
    if !fired {
        return None;
    }
    Some(embedded.unwrap_or(1.0 - lexical))
}

/// Resolve the parameter, the missing bounds and the legal loci, or explain
/// why the pattern does not apply.
fn check_applicable(
    pattern: &Pattern,
    diagnostics: &[Diagnostic],
    target: PatternTarget<'_>,
) -> Result<(String, Vec<String>, Vec<EditLocus>), PatternError> {
    let node = target.node;
    let fail = |reason: String| PatternError::PreconditionFailed {
        pattern: pattern.id.clone(),
        reason,
    };
    if !pattern.applies_to.kinds.contains(&node.kind) {
        return Err(fail(format!("does not apply to {} nodes", node.kind)));
    }

    let candidates = select_params(&pattern.applies_to.generic, node, diagnostics);
    if candidates.is_empty() {
        return Err(fail(format!("`{}` has no matching generic parameter", node.name)));
    }

    let mut last_reason = String::new();
    for param in candidates {
        let checked = pattern
            .preconditions
            .iter()
            .try_for_each(|c| c.check(node, &param));
        if let Err(reason) = checked {
            last_reason = reason;
            continue;
        }
        let bounds = missing_bounds(node, &param, pattern.transform.bounds());
        if bounds.is_empty() {
            last_reason = format!("`{param}` already satisfies the transform");
            continue;
        }
        let loci = legal_loci(node, target.owner, &param);
        return Ok((param, bounds, loci));
    }
    Err(fail(last_reason))
}

/// Parameters matching the selector, those named in a diagnostic first.
fn select_params(selector: &GenericSelector, node: &InterfaceNode, diagnostics: &[Diagnostic]) -> Vec<String> {
    let of_kind: Vec<&str> = node
        .generics
        .iter()
        .filter(|g| g.kind == selector.kind)
        .map(|g| g.name.as_str())
        .collect();

    let mut picked: Vec<String> = match (&selector.name, selector.position) {
        (Some(name), _) => of_kind.iter().filter(|g| *g == name).map(|g| g.to_string()).collect(),
        (None, Some(pos)) => of_kind.get(pos).map(|g| vec![g.to_string()]).unwrap_or_default(),
        (None, None) => of_kind.iter().map(|g| g.to_string()).collect(),
    };

    let mentioned = |name: &str| {
        let quoted = format!("`{name}`");
        diagnostics.iter().any(|d| d.message.contains(&quoted))
    };
    picked.sort_by_key(|name| !mentioned(name));
    picked
}

fn legal_loci(node: &InterfaceNode, owner: Option<&InterfaceNode>, param: &str) -> Vec<EditLocus> {
    let origin = node.generic(param).map(|g| g.origin).unwrap_or_default();
    match (origin, owner) {
        (GenericOrigin::Impl, Some(owner)) if owner.generic(param).is_some() => vec![
            EditLocus::Impl {
                owner: owner.uid.clone(),
            },
            EditLocus::Item,
        ],
        _ => vec![EditLocus::Item],
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    (1.0 - dot / (na * nb)).clamp(0.0, 2.0)
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn add_bounds_pattern(
    id: &str,
    description: &str,
    error_codes: &[&str],
    keywords: &[&str],
    kinds: &[NodeKind],
    generic: GenericSelector,
    bounds: &[&str],
) -> Pattern {
    Pattern {
        id: id.to_string(),
        description: description.to_string(),
        trigger: Trigger {
            error_codes: strings(error_codes),
            keywords: strings(keywords),
            centroid: None,
            max_distance: DEFAULT_MAX_DISTANCE,
        },
        applies_to: AppliesTo {
            kinds: kinds.to_vec(),
            generic,
        },
        transform: Transform::AddBounds {
            bounds: strings(bounds),
            placement: BoundPlacement::Inline,
        },
        preconditions: vec![
            Condition::GenericPresent,
            Condition::BoundsMissing {
                bounds: strings(bounds),
            },
        ],
        postconditions: vec![Condition::BoundsPresent {
            bounds: strings(bounds),
        }],
        success_rate: INITIAL_SUCCESS_RATE,
    }
}

pub fn builtin_patterns() -> Vec<Pattern> {
    let items = [NodeKind::Function, NodeKind::Impl, NodeKind::Type];
    vec![
        add_bounds_pattern(
            "async_spawn_send",
            "Spawned futures must be Send + 'static",
            &["E0277"],
            &["cannot be sent between threads", "required by a bound in `spawn`"],
            &items,
            GenericSelector::default(),
            &["Send", "'static"],
        ),
        add_bounds_pattern(
            "shared_state_sync",
            "State shared across threads must be Sync",
            &["E0277"],
            &["cannot be shared between threads safely"],
            &items,
            GenericSelector::default(),
            &["Sync"],
        ),
        add_bounds_pattern(
            "static_lifetime",
            "Generic outlives the current scope: require 'static",
            &["E0310"],
            &["may not live long enough"],
            &items,
            GenericSelector::default(),
            &["'static"],
        ),
        add_bounds_pattern(
            "clone_bound",
            "Method requires Clone on the generic",
            &["E0599"],
            &["no method named `clone`"],
            &items,
            GenericSelector::default(),
            &["Clone"],
        ),
    ]
}

#[cfg(test)]
#[path = "patterns_tests.rs"]
mod tests;
