use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::hash::compute_uid;

/// Stable structural key of an interface node (11-char base62).
pub type Uid = String;

/// Monotonically increasing graph version. Version 0 is the empty graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Version(pub u64);

impl Version {
    pub const ZERO: Version = Version(0);

    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Kinds of code interfaces tracked in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Module,
    Function,
    Type,
    Trait,
    Impl,
    Const,
    Test,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Module => "module",
            NodeKind::Function => "function",
            NodeKind::Type => "type",
            NodeKind::Trait => "trait",
            NodeKind::Impl => "impl",
            NodeKind::Const => "const",
            NodeKind::Test => "test",
        }
    }

    pub fn parse(s: &str) -> Option<NodeKind> {
        match s {
            "module" => Some(NodeKind::Module),
            "function" => Some(NodeKind::Function),
            "type" => Some(NodeKind::Type),
            "trait" => Some(NodeKind::Trait),
            "impl" => Some(NodeKind::Impl),
            "const" => Some(NodeKind::Const),
            "test" => Some(NodeKind::Test),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Crate,
    #[default]
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenericKind {
    Type,
    Lifetime,
    Const,
}

/// Where a generic parameter is declared relative to the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenericOrigin {
    /// Declared on the item itself (`fn foo<T>`).
    #[default]
    Item,
    /// Inherited from the enclosing impl block (`impl<T> Foo<T>`).
    Impl,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericParam {
    pub name: String,
    pub kind: GenericKind,
    /// Inline bounds (`T: Clone + Send`).
    #[serde(default)]
    pub bounds: Vec<String>,
    #[serde(default)]
    pub origin: GenericOrigin,
}

impl GenericParam {
    pub fn ty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: GenericKind::Type,
            bounds: Vec::new(),
            origin: GenericOrigin::Item,
        }
    }

    pub fn lifetime(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: GenericKind::Lifetime,
            bounds: Vec::new(),
            origin: GenericOrigin::Item,
        }
    }

    pub fn with_bounds(mut self, bounds: &[&str]) -> Self {
        self.bounds = bounds.iter().map(|b| b.to_string()).collect();
        self
    }

    pub fn from_impl(mut self) -> Self {
        self.origin = GenericOrigin::Impl;
        self
    }
}

/// A `where`-clause predicate: `subject: bound + bound`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WherePredicate {
    pub subject: String,
    pub bounds: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryProvenance {
    RuleBased,
    Assisted,
}

/// Advisory natural-language description. Never used as a source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub text: String,
    pub provenance: SummaryProvenance,
}

/// One code interface (function, type, trait, impl, module-level item).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceNode {
    pub uid: Uid,
    pub kind: NodeKind,
    pub module_path: String,
    pub name: String,
    pub signature: String,
    #[serde(default)]
    pub generics: Vec<GenericParam>,
    #[serde(default)]
    pub bounds: Vec<WherePredicate>,
    #[serde(default)]
    pub visibility: Visibility,
    /// Conditional-compilation features that must be active for this item to exist.
    #[serde(default)]
    pub feature_flags: Vec<String>,
    #[serde(default)]
    pub summary: Option<Summary>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub line_start: u32,
    #[serde(default)]
    pub line_end: u32,
    /// UID of the enclosing impl block for associated items.
    #[serde(default)]
    pub owner: Option<Uid>,
    /// UIDs this node replaced after signature changes (most recent first, max 3).
    #[serde(default)]
    pub previous_uids: Vec<Uid>,
}

impl InterfaceNode {
    pub fn new(kind: NodeKind, module_path: &str, name: &str, signature: &str) -> Self {
        let mut node = Self {
            uid: String::new(),
            kind,
            module_path: module_path.to_string(),
            name: name.to_string(),
            signature: signature.to_string(),
            generics: Vec::new(),
            bounds: Vec::new(),
            visibility: Visibility::Public,
            feature_flags: Vec::new(),
            summary: None,
            embedding: None,
            file_path: String::new(),
            line_start: 0,
            line_end: 0,
            owner: None,
            previous_uids: Vec::new(),
        };
        node.refresh_uid();
        node
    }

    /// Regenerate the UID from the structural fields. Call after changing the signature.
    pub fn refresh_uid(&mut self) {
        self.uid = compute_uid(
            &self.module_path,
            self.kind,
            &self.name,
            &self.signature,
            self.owner.as_deref().unwrap_or(""),
        );
    }

    pub fn with_generic(mut self, param: GenericParam) -> Self {
        self.generics.push(param);
        self
    }

    pub fn with_where(mut self, subject: &str, bounds: &[&str]) -> Self {
        self.bounds.push(WherePredicate {
            subject: subject.to_string(),
            bounds: bounds.iter().map(|b| b.to_string()).collect(),
        });
        self
    }

    pub fn with_location(mut self, file_path: &str, line_start: u32, line_end: u32) -> Self {
        self.file_path = file_path.to_string();
        self.line_start = line_start;
        self.line_end = line_end;
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_features(mut self, features: &[&str]) -> Self {
        self.feature_flags = features.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_owner(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self.refresh_uid();
        self
    }

    pub fn with_summary(mut self, text: &str, provenance: SummaryProvenance) -> Self {
        self.summary = Some(Summary {
            text: text.to_string(),
            provenance,
        });
        self
    }

    pub fn qualified_name(&self) -> String {
        if self.module_path.is_empty() {
            self.name.clone()
        } else {
            format!("{}::{}", self.module_path, self.name)
        }
    }

    /// Logical identity used to trace a node across signature changes.
    /// `#[cfg]` variants of one item are distinct identities.
    pub fn identity(&self) -> NodeIdentity {
        let mut feature_flags = self.feature_flags.clone();
        feature_flags.sort();
        feature_flags.dedup();
        NodeIdentity {
            module_path: self.module_path.clone(),
            kind: self.kind,
            name: self.name.clone(),
            owner: self.owner.clone(),
            feature_flags,
        }
    }

    pub fn generic(&self, name: &str) -> Option<&GenericParam> {
        self.generics.iter().find(|g| g.name == name)
    }

    /// Inline plus `where`-clause bounds for a generic parameter.
    pub fn effective_bounds(&self, param: &str) -> BTreeSet<String> {
        let mut out: BTreeSet<String> = self
            .generic(param)
            .map(|g| g.bounds.iter().map(|b| b.trim().to_string()).collect())
            .unwrap_or_default();
        for pred in self.bounds.iter().filter(|p| p.subject == param) {
            out.extend(pred.bounds.iter().map(|b| b.trim().to_string()));
        }
        out
    }

    /// Content equality that ignores store-maintained lineage.
    pub fn content_eq(&self, other: &InterfaceNode) -> bool {
        let mut a = self.clone();
        a.previous_uids.clear();
        let mut b = other.clone();
        b.previous_uids.clear();
        a == b
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeIdentity {
    pub module_path: String,
    pub kind: NodeKind,
    pub name: String,
    pub owner: Option<Uid>,
    pub feature_flags: Vec<String>,
}

/// Edge types between interface nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeKind {
    Calls,
    Depends,
    Implements,
    WithinCrate,
    BetweenCrates,
    EnabledByFeature,
}

impl EdgeKind {
    pub const ALL: [EdgeKind; 6] = [
        EdgeKind::Calls,
        EdgeKind::Depends,
        EdgeKind::Implements,
        EdgeKind::WithinCrate,
        EdgeKind::BetweenCrates,
        EdgeKind::EnabledByFeature,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Calls => "CALLS",
            EdgeKind::Depends => "DEPENDS",
            EdgeKind::Implements => "IMPLEMENTS",
            EdgeKind::WithinCrate => "WITHIN_CRATE",
            EdgeKind::BetweenCrates => "BETWEEN_CRATES",
            EdgeKind::EnabledByFeature => "ENABLED_BY_FEATURE",
        }
    }

    pub fn parse(s: &str) -> Option<EdgeKind> {
        EdgeKind::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    /// Lower ranks first. Signature/type relationships outrank call sites.
    pub fn structural_rank(&self) -> u8 {
        match self {
            EdgeKind::Implements => 1,
            EdgeKind::Depends => 2,
            EdgeKind::EnabledByFeature => 3,
            EdgeKind::WithinCrate => 4,
            EdgeKind::BetweenCrates => 5,
            EdgeKind::Calls => 6,
        }
    }
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directed, typed edge. Endpoints are UIDs, held by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: Uid,
    pub target: Uid,
    pub kind: EdgeKind,
    /// Feature that must be active for this edge to be traversed.
    #[serde(default)]
    pub feature_gate: Option<String>,
}

impl Edge {
    pub fn new(source: &str, target: &str, kind: EdgeKind) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            kind,
            feature_gate: None,
        }
    }

    pub fn gated(mut self, feature: &str) -> Self {
        self.feature_gate = Some(feature.to_string());
        self
    }

    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            source: self.source.clone(),
            target: self.target.clone(),
            kind: self.kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeKey {
    pub source: Uid,
    pub target: Uid,
    pub kind: EdgeKind,
}

/// Direction for edge traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDirection {
    Incoming,
    Outgoing,
    Both,
}

/// The active conditional-compilation feature set, threaded explicitly
/// through retrieval and edge filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureContext {
    pub active: BTreeSet<String>,
}

impl FeatureContext {
    pub fn new<I, S>(features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            active: features.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_active(&self, feature: &str) -> bool {
        self.active.contains(feature)
    }

    pub fn allows_edge(&self, edge: &Edge) -> bool {
        edge.feature_gate
            .as_deref()
            .map_or(true, |f| self.is_active(f))
    }

    pub fn allows_node(&self, node: &InterfaceNode) -> bool {
        node.feature_flags.iter().all(|f| self.is_active(f))
    }
}

/// A batch of indexer output applied as one version.
#[derive(Debug, Clone, Default)]
pub struct IndexBatch {
    pub nodes: Vec<InterfaceNode>,
    pub edges: Vec<Edge>,
    pub removed: Vec<Uid>,
}

/// What a batch commit did.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub version: Version,
    pub nodes_written: usize,
    pub nodes_removed: usize,
    pub edges_written: usize,
    pub edges_pruned: usize,
    /// Edges whose endpoints were not live; the indexer must re-emit them.
    pub deferred_edges: Vec<Edge>,
    /// `(old_uid, new_uid)` pairs for signature changes traced to one identity.
    pub renamed: Vec<(Uid, Uid)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Note,
}

/// A diagnostic reported by the type-check or build service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
}

impl Diagnostic {
    pub fn error(code: Option<&str>, message: &str) -> Self {
        Self {
            severity: Severity::Error,
            code: code.map(str::to_string),
            message: message.to_string(),
            file: None,
            line: None,
        }
    }

    pub fn warning(message: &str) -> Self {
        Self {
            severity: Severity::Warning,
            code: None,
            message: message.to_string(),
            file: None,
            line: None,
        }
    }

    pub fn note(message: &str) -> Self {
        Self {
            severity: Severity::Note,
            code: None,
            message: message.to_string(),
            file: None,
            line: None,
        }
    }

    pub fn at(mut self, file: &str, line: u32) -> Self {
        self.file = Some(file.to_string());
        self.line = Some(line);
        self
    }
}

/// PreFlight stages in their fixed execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStage {
    InMemoryTypeCheck,
    FormatCheck,
    CompileCheck,
    SelectiveTests,
    LintCheck,
    PublicApiCheck,
}

impl ValidationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStage::InMemoryTypeCheck => "in_memory_type_check",
            ValidationStage::FormatCheck => "format_check",
            ValidationStage::CompileCheck => "compile_check",
            ValidationStage::SelectiveTests => "selective_tests",
            ValidationStage::LintCheck => "lint_check",
            ValidationStage::PublicApiCheck => "public_api_check",
        }
    }

    pub fn parse(s: &str) -> Option<ValidationStage> {
        [
            ValidationStage::InMemoryTypeCheck,
            ValidationStage::FormatCheck,
            ValidationStage::CompileCheck,
            ValidationStage::SelectiveTests,
            ValidationStage::LintCheck,
            ValidationStage::PublicApiCheck,
        ]
        .into_iter()
        .find(|stage| stage.as_str() == s)
    }

    pub fn is_optional(&self) -> bool {
        matches!(self, ValidationStage::LintCheck | ValidationStage::PublicApiCheck)
    }
}

impl std::fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pass,
    Fail,
    Error,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pass => "pass",
            StageStatus::Fail => "fail",
            StageStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<StageStatus> {
        match s {
            "pass" => Some(StageStatus::Pass),
            "fail" => Some(StageStatus::Fail),
            "error" => Some(StageStatus::Error),
            _ => None,
        }
    }
}

/// Outcome of one PreFlight stage for one candidate. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub candidate_id: String,
    pub stage: ValidationStage,
    pub status: StageStatus,
    pub diagnostics: Vec<Diagnostic>,
    pub duration_ms: u64,
}

impl ValidationResult {
    pub fn passed(&self) -> bool {
        self.status == StageStatus::Pass
    }
}

/// Errors that can occur during graph and ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Dangling edge {from} -[{kind}]-> {to}: endpoint is not a live node")]
    DanglingEdge {
        from: String,
        to: String,
        kind: EdgeKind,
    },

    #[error("Vector index is stale (index at {index}, graph at {head})")]
    IndexStale { index: Version, head: Version },

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Version not found: {0}")]
    VersionNotFound(Version),

    #[error("Repository halted: {0}")]
    RepositoryHalted(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for GraphError {
    fn from(e: rusqlite::Error) -> Self {
        GraphError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(e: serde_json::Error) -> Self {
        GraphError::Internal(format!("serialization: {e}"))
    }
}
