use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::graph::GraphState;
use crate::types::{
    BatchReport, Edge, EdgeDirection, EdgeKind, FeatureContext, GraphError, IndexBatch,
    InterfaceNode, Uid, ValidationResult, Version,
};

/// Parameters for a bounded neighborhood traversal.
#[derive(Debug, Clone)]
pub struct NeighborhoodQuery {
    pub seeds: Vec<Uid>,
    pub max_hops: u32,
    pub per_hop_cap: usize,
    /// `None` admits every edge kind.
    pub edge_kinds: Option<Vec<EdgeKind>>,
    pub direction: EdgeDirection,
    pub features: FeatureContext,
}

impl NeighborhoodQuery {
    pub fn new(seeds: Vec<Uid>) -> Self {
        Self {
            seeds,
            max_hops: 2,
            per_hop_cap: 50,
            edge_kinds: None,
            direction: EdgeDirection::Both,
            features: FeatureContext::default(),
        }
    }

    pub fn max_hops(mut self, hops: u32) -> Self {
        self.max_hops = hops;
        self
    }

    pub fn per_hop_cap(mut self, cap: usize) -> Self {
        self.per_hop_cap = cap;
        self
    }

    pub fn edge_kinds(mut self, kinds: &[EdgeKind]) -> Self {
        self.edge_kinds = Some(kinds.to_vec());
        self
    }

    pub fn direction(mut self, direction: EdgeDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn features(mut self, features: FeatureContext) -> Self {
        self.features = features;
        self
    }

    pub fn admits_kind(&self, kind: EdgeKind) -> bool {
        self.edge_kinds.as_ref().map_or(true, |k| k.contains(&kind))
    }
}

/// A node reached by traversal, with its hop distance from the seeds.
#[derive(Debug, Clone)]
pub struct ReachedNode {
    pub node: InterfaceNode,
    pub hop: u32,
    /// Edge kind that first admitted the node; `None` for seeds.
    pub via: Option<EdgeKind>,
}

/// Deduplicated traversal result, tagged with the version it was read from.
#[derive(Debug, Clone)]
pub struct NodeSet {
    pub version: Version,
    pub nodes: Vec<ReachedNode>,
}

impl NodeSet {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn uids(&self) -> Vec<Uid> {
        self.nodes.iter().map(|r| r.node.uid.clone()).collect()
    }
}

/// Versioned interface graph with vector search.
///
/// Reads observe a single published version and never block on writers.
/// Writes are serialized and each produces at most one new version.
pub trait InterfaceStore: Send + Sync {
    fn upsert_node(&self, node: InterfaceNode) -> Result<Version, GraphError>;

    /// Insert an edge. Both endpoints must already be live.
    fn upsert_edge(&self, edge: Edge) -> Result<Version, GraphError>;

    /// Remove a node and prune its incident edges in the same version.
    fn remove_node(&self, uid: &str) -> Result<Version, GraphError>;

    /// Apply indexer output as one version: removals, then nodes, then edges.
    /// Edges with non-live endpoints are deferred, not written.
    fn apply_batch(&self, batch: IndexBatch) -> Result<BatchReport, GraphError>;

    fn get_node(&self, uid: &str) -> Option<InterfaceNode>;

    fn edges_of(&self, uid: &str, direction: EdgeDirection) -> Vec<Edge>;

    fn get_neighborhood(&self, query: &NeighborhoodQuery) -> Result<NodeSet, GraphError>;

    /// Approximate k-NN over node embeddings, ascending by distance.
    fn vector_search(&self, query: &[f32], k: usize) -> Result<Vec<(Uid, f32)>, GraphError>;

    /// Nodes that reach `uids` through `kinds` edges within `max_hops` (blast radius).
    fn reverse_reachable(&self, uids: &[Uid], kinds: &[EdgeKind], max_hops: u32) -> Vec<InterfaceNode>;

    /// The version tag of the current published state.
    fn snapshot(&self) -> Version;

    /// Publish a new version whose content equals `version`'s. Returns the new version.
    fn restore(&self, version: Version) -> Result<Version, GraphError>;

    fn head_version(&self) -> Version;

    /// The current published state.
    fn current(&self) -> Arc<GraphState>;

    /// The state as of `version`.
    fn live_state(&self, version: Version) -> Result<Arc<GraphState>, GraphError>;

    /// Live nodes that have no embedding.
    fn embedding_gaps(&self) -> Vec<Uid>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Apply,
    ApplyFailed,
    Rollback,
    Hold,
    Reject,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Apply => "apply",
            AuditAction::ApplyFailed => "apply_failed",
            AuditAction::Rollback => "rollback",
            AuditAction::Hold => "hold",
            AuditAction::Reject => "reject",
        }
    }

    pub fn parse(s: &str) -> Option<AuditAction> {
        match s {
            "apply" => Some(AuditAction::Apply),
            "apply_failed" => Some(AuditAction::ApplyFailed),
            "rollback" => Some(AuditAction::Rollback),
            "hold" => Some(AuditAction::Hold),
            "reject" => Some(AuditAction::Reject),
            _ => None,
        }
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Option<i64>,
    pub version: Version,
    pub candidate_id: String,
    pub action: AuditAction,
    pub confidence: Option<f64>,
    pub validation: Vec<ValidationResult>,
    pub rationale: String,
    /// Set by the ledger on insert.
    pub recorded_at: Option<String>,
}

/// Pre/post contents of one file touched by an applied candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitFile {
    pub path: String,
    /// `None` when the file did not exist before the apply.
    pub before: Option<String>,
    pub after: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRecord {
    pub commit_id: String,
    pub candidate_id: String,
    pub pre_version: Version,
    pub post_version: Version,
    pub files: Vec<CommitFile>,
    pub rolled_back: bool,
}

/// Append-only history kept next to the graph: audit log, validation
/// results, pattern effectiveness, applied commits, staging and the halt latch.
pub trait RepairLedger: Send + Sync {
    fn append_audit(&self, entry: &AuditEntry) -> Result<i64, GraphError>;
    fn audit_for_candidate(&self, candidate_id: &str) -> Result<Vec<AuditEntry>, GraphError>;
    fn audit_for_version(&self, version: Version) -> Result<Vec<AuditEntry>, GraphError>;

    fn append_validation(&self, result: &ValidationResult) -> Result<(), GraphError>;
    fn validation_results(&self, candidate_id: &str) -> Result<Vec<ValidationResult>, GraphError>;

    fn record_pattern_outcome(&self, pattern_id: &str, success: bool, success_rate: f64) -> Result<(), GraphError>;
    /// Latest success rate per pattern id.
    fn pattern_success_rates(&self) -> Result<HashMap<String, f64>, GraphError>;

    fn record_commit(&self, record: &CommitRecord) -> Result<(), GraphError>;
    fn commit_record(&self, commit_id: &str) -> Result<Option<CommitRecord>, GraphError>;
    fn mark_rolled_back(&self, commit_id: &str) -> Result<(), GraphError>;

    fn stage_candidate(&self, candidate_id: &str, payload: &str) -> Result<(), GraphError>;
    fn staged_candidates(&self) -> Result<Vec<(String, String)>, GraphError>;
    fn clear_staged(&self, candidate_id: &str) -> Result<(), GraphError>;

    fn halt_reason(&self) -> Option<String>;
    fn set_halt(&self, reason: &str) -> Result<(), GraphError>;
    fn clear_halt(&self) -> Result<(), GraphError>;
}

/// Everything the repair pipeline needs from persistence.
pub trait MendStore: InterfaceStore + RepairLedger {}

impl<T: InterfaceStore + RepairLedger> MendStore for T {}
