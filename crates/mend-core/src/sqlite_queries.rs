use std::sync::Arc;

use tracing::{info, warn};

use crate::graph::{GraphState, NodeWrite};
use crate::sqlite::SqliteInterfaceStore;
use crate::store::{InterfaceStore, NeighborhoodQuery, NodeSet};
use crate::types::{
    BatchReport, Edge, EdgeDirection, EdgeKind, GraphError, IndexBatch, InterfaceNode, Uid,
    Version,
};

impl InterfaceStore for SqliteInterfaceStore {
    fn upsert_node(&self, node: InterfaceNode) -> Result<Version, GraphError> {
        let uid = node.uid.clone();
        let (version, write) = self.commit(&format!("upsert_node {uid}"), |state| {
            Ok(state.upsert_node(node))
        })?;
        if let NodeWrite::Replaced { old } = write {
            info!(old = %old, new = %uid, %version, "node signature changed; edges re-pointed");
        }
        Ok(version)
    }

    fn upsert_edge(&self, edge: Edge) -> Result<Version, GraphError> {
        let reason = format!("upsert_edge {}-{}->{}", edge.source, edge.kind, edge.target);
        let (version, _) = self.commit(&reason, |state| state.insert_edge(edge))?;
        Ok(version)
    }

    fn remove_node(&self, uid: &str) -> Result<Version, GraphError> {
        let (version, pruned) = self.commit(&format!("remove_node {uid}"), |state| {
            state
                .remove_node(uid)
                .map(|(_, pruned)| pruned.len())
                .ok_or_else(|| GraphError::NodeNotFound(uid.to_string()))
        })?;
        info!(uid, pruned, %version, "node removed");
        Ok(version)
    }

    fn apply_batch(&self, batch: IndexBatch) -> Result<BatchReport, GraphError> {
        let (version, mut report) = self.commit("apply_batch", |state| {
            let mut report = BatchReport::default();
            for uid in &batch.removed {
                if let Some((_, pruned)) = state.remove_node(uid) {
                    report.nodes_removed += 1;
                    report.edges_pruned += pruned.len();
                }
            }
            for node in batch.nodes {
                let uid = node.uid.clone();
                match state.upsert_node(node) {
                    NodeWrite::Unchanged => {}
                    NodeWrite::Inserted | NodeWrite::Updated => report.nodes_written += 1,
                    NodeWrite::Replaced { old } => {
                        report.nodes_written += 1;
                        report.renamed.push((old, uid));
                    }
                }
            }
            for edge in batch.edges {
                match state.insert_edge(edge.clone()) {
                    Ok(true) => report.edges_written += 1,
                    Ok(false) => {}
                    Err(GraphError::DanglingEdge { .. }) => report.deferred_edges.push(edge),
                    Err(e) => return Err(e),
                }
            }
            Ok(report)
        })?;
        report.version = version;
        if !report.deferred_edges.is_empty() {
            warn!(
                count = report.deferred_edges.len(),
                %version,
                "edges deferred: endpoints not live"
            );
        }
        Ok(report)
    }

    fn get_node(&self, uid: &str) -> Option<InterfaceNode> {
        self.head_state().node(uid).cloned()
    }

    fn edges_of(&self, uid: &str, direction: EdgeDirection) -> Vec<Edge> {
        self.head_state().edges_of(uid, direction)
    }

    fn get_neighborhood(&self, query: &NeighborhoodQuery) -> Result<NodeSet, GraphError> {
        self.head_state().neighborhood(query)
    }

    fn vector_search(&self, query: &[f32], k: usize) -> Result<Vec<(Uid, f32)>, GraphError> {
        let head = self.head_state().version();
        let index = self.read_index()?;
        if index.synced() != head {
            return Err(GraphError::IndexStale {
                index: index.synced(),
                head,
            });
        }
        index.search(query, k)
    }

    fn reverse_reachable(&self, uids: &[Uid], kinds: &[EdgeKind], max_hops: u32) -> Vec<InterfaceNode> {
        self.head_state().reverse_reachable(uids, kinds, max_hops)
    }

    fn snapshot(&self) -> Version {
        self.head_state().version()
    }

    fn restore(&self, version: Version) -> Result<Version, GraphError> {
        let target = self.load_version(version)?;
        let (new_version, _) = self.commit(&format!("restore {version}"), |state| {
            state.replace_contents(&target);
            Ok(())
        })?;
        info!(restored = %version, %new_version, "graph restored");
        Ok(new_version)
    }

    fn head_version(&self) -> Version {
        self.head_state().version()
    }

    fn current(&self) -> Arc<GraphState> {
        self.head_state()
    }

    fn live_state(&self, version: Version) -> Result<Arc<GraphState>, GraphError> {
        self.load_version(version)
    }

    fn embedding_gaps(&self) -> Vec<Uid> {
        let mut gaps: Vec<Uid> = self
            .head_state()
            .nodes()
            .filter(|n| n.embedding.is_none())
            .map(|n| n.uid.clone())
            .collect();
        gaps.sort();
        gaps
    }
}
