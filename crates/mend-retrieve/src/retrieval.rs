//! Hybrid graph + vector retrieval.
//!
//! Both paths read the same pinned graph version. Traversal and k-NN run in
//! parallel; results are merged by UID, scored, ranked deterministically and
//! truncated to the Needed budget.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use mend_core::config::{RetrievalConfig, WidenConfig};
use mend_core::graph::GraphState;
use mend_core::store::{InterfaceStore, NeighborhoodQuery, NodeSet};
use mend_core::types::{EdgeDirection, EdgeKind, GraphError, InterfaceNode, NodeKind, Uid};

use crate::types::{
    NeededNode, NeededSet, Provenance, RetrievalConstraints, RetrievalError, RetrievalFeatures,
    RetrievalHints,
};

pub struct RetrievalEngine<'a, S: InterfaceStore + ?Sized> {
    store: &'a S,
    w_graph: f64,
    w_vector: f64,
    widen: WidenConfig,
}

impl<'a, S: InterfaceStore + ?Sized> RetrievalEngine<'a, S> {
    pub fn new(store: &'a S, config: &RetrievalConfig) -> Self {
        Self {
            store,
            w_graph: config.w_graph,
            w_vector: config.w_vector,
            widen: config.widen.clone(),
        }
    }

    /// Constraints for the single permitted widening step.
    pub fn widened(&self, constraints: &RetrievalConstraints) -> RetrievalConstraints {
        constraints.widen(&self.widen)
    }

    /// Retrieve the Needed set for `seeds`. An empty result is widened once
    /// before failing with `RetrievalEmpty`.
    pub fn retrieve(
        &self,
        seeds: &[Uid],
        hints: &RetrievalHints,
        constraints: &RetrievalConstraints,
    ) -> Result<NeededSet, RetrievalError> {
        let set = self.retrieve_once(seeds, hints, constraints)?;
        if !set.is_empty() {
            return Ok(set);
        }
        if !constraints.widened {
            let wider = self.widened(constraints);
            info!(
                max_hops = wider.max_hops,
                k = wider.k,
                "retrieval empty; widening once"
            );
            let set = self.retrieve_once(seeds, hints, &wider)?;
            if !set.is_empty() {
                return Ok(set);
            }
        }
        Err(RetrievalError::RetrievalEmpty {
            seeds: seeds.to_vec(),
        })
    }

    fn retrieve_once(
        &self,
        seeds: &[Uid],
        hints: &RetrievalHints,
        constraints: &RetrievalConstraints,
    ) -> Result<NeededSet, RetrievalError> {
        let state = self.store.current();
        let query_embedding = hints
            .query_embedding
            .clone()
            .or_else(|| seed_centroid(&state, seeds));

        let mut neighborhood = NeighborhoodQuery::new(seeds.to_vec())
            .max_hops(constraints.max_hops)
            .per_hop_cap(constraints.per_hop_cap)
            .features(constraints.features.clone());
        if let Some(kinds) = &constraints.edge_kinds {
            neighborhood = neighborhood.edge_kinds(kinds);
        }

        let (graph, vector) = rayon::join(
            || {
                if seeds.is_empty() {
                    Ok(NodeSet {
                        version: state.version(),
                        nodes: Vec::new(),
                    })
                } else {
                    state.neighborhood(&neighborhood)
                }
            },
            || match &query_embedding {
                Some(query) => self.store.vector_search(query, constraints.k).map(Some),
                None => Ok(None),
            },
        );
        let graph = graph?;

        let mut graph_only = false;
        let vector_hits = match vector {
            Ok(hits) => hits.unwrap_or_default(),
            Err(GraphError::IndexStale { index, head }) => {
                warn!(%index, %head, "vector index stale; retrieving from graph only");
                graph_only = true;
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        let mut merged: BTreeMap<Uid, NeededNode> = BTreeMap::new();
        for reached in graph.nodes {
            let priority = match reached.via {
                None => 0,
                Some(kind) => kind.structural_rank(),
            };
            merged.insert(
                reached.node.uid.clone(),
                NeededNode {
                    score: self.w_graph / (1.0 + f64::from(reached.hop)),
                    provenance: Provenance::Graph,
                    hop: Some(reached.hop),
                    distance: None,
                    priority,
                    node: reached.node,
                },
            );
        }

        for (uid, distance) in vector_hits {
            let Some(node) = state.node(&uid) else {
                continue;
            };
            if !constraints.features.allows_node(node) {
                continue;
            }
            let similarity = self.w_vector * f64::from((1.0 - distance).clamp(0.0, 1.0));
            match merged.get_mut(&uid) {
                Some(existing) => {
                    existing.score += similarity;
                    existing.distance = Some(distance);
                    existing.provenance = Provenance::Both;
                }
                None => {
                    merged.insert(
                        uid,
                        NeededNode {
                            score: similarity,
                            provenance: Provenance::Vector,
                            hop: None,
                            distance: Some(distance),
                            priority: kind_priority(node.kind),
                            node: node.clone(),
                        },
                    );
                }
            }
        }

        let candidates_seen = merged.len();
        let mut nodes: Vec<NeededNode> = merged.into_values().collect();
        nodes.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.priority.cmp(&b.priority))
                .then_with(|| a.node.uid.cmp(&b.node.uid))
        });
        nodes.truncate(constraints.budget);

        let required = required_context(&state, seeds, hints, constraints);
        let features = evidence_features(&nodes, &required);

        debug!(
            version = %state.version(),
            seeds = seeds.len(),
            candidates_seen,
            kept = nodes.len(),
            coverage = features.coverage,
            agreement = features.agreement,
            "retrieval complete"
        );

        Ok(NeededSet {
            version: state.version(),
            seeds: seeds.to_vec(),
            nodes,
            candidates_seen,
            widened: constraints.widened,
            graph_only,
            features,
        })
    }
}

/// Mean of the seed embeddings, if any seed has one.
fn seed_centroid(state: &GraphState, seeds: &[Uid]) -> Option<Vec<f32>> {
    let embeddings: Vec<&Vec<f32>> = seeds
        .iter()
        .filter_map(|uid| state.node(uid))
        .filter_map(|node| node.embedding.as_ref())
        .collect();
    let dim = embeddings.first()?.len();
    let usable: Vec<&Vec<f32>> = embeddings.into_iter().filter(|e| e.len() == dim).collect();
    let mut centroid = vec![0.0f32; dim];
    for embedding in &usable {
        for (acc, x) in centroid.iter_mut().zip(embedding.iter()) {
            *acc += x;
        }
    }
    let n = usable.len() as f32;
    centroid.iter_mut().for_each(|x| *x /= n);
    Some(centroid)
}

fn kind_priority(kind: NodeKind) -> u8 {
    match kind {
        NodeKind::Trait | NodeKind::Impl => EdgeKind::Implements.structural_rank(),
        NodeKind::Type | NodeKind::Const => EdgeKind::Depends.structural_rank(),
        NodeKind::Module => EdgeKind::WithinCrate.structural_rank(),
        NodeKind::Function | NodeKind::Test => EdgeKind::Calls.structural_rank(),
    }
}

/// Explicit requirements, or the seeds plus their direct type and trait dependencies.
fn required_context(
    state: &GraphState,
    seeds: &[Uid],
    hints: &RetrievalHints,
    constraints: &RetrievalConstraints,
) -> BTreeSet<Uid> {
    if !hints.required.is_empty() {
        return hints.required.iter().cloned().collect();
    }
    let mut required: BTreeSet<Uid> = seeds.iter().cloned().collect();
    for seed in seeds {
        for edge in state.edges_of(seed, EdgeDirection::Outgoing) {
            let structural = matches!(edge.kind, EdgeKind::Implements | EdgeKind::Depends);
            let visible = constraints.features.allows_edge(&edge)
                && state
                    .node(&edge.target)
                    .is_some_and(|n: &InterfaceNode| constraints.features.allows_node(n));
            if structural && visible {
                required.insert(edge.target);
            }
        }
    }
    required
}

fn evidence_features(nodes: &[NeededNode], required: &BTreeSet<Uid>) -> RetrievalFeatures {
    let coverage = if required.is_empty() {
        0.0
    } else {
        let present = nodes.iter().filter(|n| required.contains(&n.node.uid)).count();
        present as f64 / required.len() as f64
    };
    let both = nodes.iter().filter(|n| n.provenance == Provenance::Both).count();
    let agreement = if nodes.is_empty() {
        0.0
    } else {
        both as f64 / nodes.len() as f64
    };
    RetrievalFeatures { coverage, agreement }
}

#[cfg(test)]
#[path = "retrieval_tests.rs"]
mod tests;
