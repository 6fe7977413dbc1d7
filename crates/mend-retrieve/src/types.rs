use serde::{Deserialize, Serialize};

use mend_core::config::{RetrievalConfig, WidenConfig};
use mend_core::types::{EdgeKind, FeatureContext, GraphError, InterfaceNode, Uid, Version};

/// Which retrieval path produced a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Graph,
    Vector,
    Both,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Graph => "graph",
            Provenance::Vector => "vector",
            Provenance::Both => "both",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NeededNode {
    pub node: InterfaceNode,
    pub score: f64,
    pub provenance: Provenance,
    /// Hop distance from the seeds, when reached by traversal.
    pub hop: Option<u32>,
    /// Cosine distance to the query, when found by vector search.
    pub distance: Option<f32>,
    /// Lower ranks first on equal score: seeds, then signature/type relations, then call sites.
    pub priority: u8,
}

/// Evidence features derived from one retrieval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalFeatures {
    /// Fraction of required context present in the Needed set.
    pub coverage: f64,
    /// Jaccard overlap of graph- and vector-sourced nodes.
    pub agreement: f64,
}

/// Ranked, size-bounded context set.
#[derive(Debug, Clone, Serialize)]
pub struct NeededSet {
    pub version: Version,
    pub seeds: Vec<Uid>,
    pub nodes: Vec<NeededNode>,
    /// Merged size before truncation to the budget.
    pub candidates_seen: usize,
    pub widened: bool,
    /// Vector search was skipped because the index was stale.
    pub graph_only: bool,
    pub features: RetrievalFeatures,
}

impl NeededSet {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, uid: &str) -> Option<&NeededNode> {
        self.nodes.iter().find(|n| n.node.uid == uid)
    }

    pub fn uids(&self) -> Vec<Uid> {
        self.nodes.iter().map(|n| n.node.uid.clone()).collect()
    }

    /// Seed nodes in seed order.
    pub fn seed_nodes(&self) -> Vec<&InterfaceNode> {
        self.seeds
            .iter()
            .filter_map(|s| self.get(s).map(|n| &n.node))
            .collect()
    }
}

/// Caller-provided retrieval hints.
#[derive(Debug, Clone, Default)]
pub struct RetrievalHints {
    /// Embedding of the diagnostic or query; defaults to the seed centroid.
    pub query_embedding: Option<Vec<f32>>,
    /// Nodes whose presence defines full coverage. Defaults to the seeds and
    /// their direct signature/type dependencies.
    pub required: Vec<Uid>,
}

/// Bounds for a single retrieval.
#[derive(Debug, Clone)]
pub struct RetrievalConstraints {
    pub max_hops: u32,
    pub per_hop_cap: usize,
    pub k: usize,
    pub budget: usize,
    pub edge_kinds: Option<Vec<EdgeKind>>,
    pub features: FeatureContext,
    /// Set once the single widening step has been taken.
    pub widened: bool,
}

impl RetrievalConstraints {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            max_hops: config.max_hops,
            per_hop_cap: config.per_hop_cap,
            k: config.k,
            budget: config.needed_budget,
            edge_kinds: None,
            features: FeatureContext::default(),
            widened: false,
        }
    }

    pub fn with_features(mut self, features: FeatureContext) -> Self {
        self.features = features;
        self
    }

    /// The one widening step: more hops, larger k.
    pub fn widen(&self, widen: &WidenConfig) -> Self {
        let mut next = self.clone();
        next.max_hops += widen.extra_hops;
        next.k = next.k.saturating_mul(widen.k_factor.max(1));
        next.widened = true;
        next
    }
}

impl Default for RetrievalConstraints {
    fn default() -> Self {
        Self::from_config(&RetrievalConfig::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Retrieval returned no context for seeds {seeds:?} after widening")]
    RetrievalEmpty { seeds: Vec<Uid> },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("Pattern {pattern} precondition failed: {reason}")]
    PreconditionFailed { pattern: String, reason: String },

    #[error("Signature rewrite failed: {0}")]
    Rewrite(String),

    #[error("Pattern library load failed: {0}")]
    Load(String),

    #[error(transparent)]
    Graph(#[from] GraphError),
}
