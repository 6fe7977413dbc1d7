//! Immutable-per-version graph state.
//!
//! Nodes and edges live in flat maps keyed by UID / edge key; adjacency holds
//! only keys. A [`GraphState`] is never mutated once published by the store:
//! writers clone the current state, mutate the clone, and swap it in.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use tracing::warn;

use crate::store::{NeighborhoodQuery, NodeSet, ReachedNode};
use crate::types::{
    Edge, EdgeDirection, EdgeKey, EdgeKind, GraphError, InterfaceNode, NodeIdentity, Uid, Version,
};

const MAX_PREVIOUS_UIDS: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct GraphState {
    version: Version,
    nodes: HashMap<Uid, InterfaceNode>,
    edges: BTreeMap<EdgeKey, Edge>,
    outgoing: HashMap<Uid, BTreeSet<EdgeKey>>,
    incoming: HashMap<Uid, BTreeSet<EdgeKey>>,
    identities: HashMap<NodeIdentity, Uid>,
}

/// Result of writing a single node into a state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeWrite {
    Unchanged,
    Inserted,
    Updated,
    /// Same logical identity, new UID; edges were re-pointed from `old`.
    Replaced { old: Uid },
}

/// Difference between two states, used to persist a commit.
#[derive(Debug, Clone, Default)]
pub struct GraphDiff {
    pub upserted_nodes: Vec<InterfaceNode>,
    pub removed_nodes: Vec<Uid>,
    pub upserted_edges: Vec<Edge>,
    pub removed_edges: Vec<EdgeKey>,
}

impl GraphDiff {
    pub fn is_empty(&self) -> bool {
        self.upserted_nodes.is_empty()
            && self.removed_nodes.is_empty()
            && self.upserted_edges.is_empty()
            && self.removed_edges.is_empty()
    }
}

impl GraphState {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }

    /// Build a state from raw node and edge lists (used when loading a version).
    /// Edges with missing endpoints are dropped with a warning.
    pub fn from_parts(version: Version, nodes: Vec<InterfaceNode>, edges: Vec<Edge>) -> Self {
        let mut state = GraphState::new(version);
        for node in nodes {
            state.identities.insert(node.identity(), node.uid.clone());
            state.nodes.insert(node.uid.clone(), node);
        }
        for edge in edges {
            let (source, target) = (edge.source.clone(), edge.target.clone());
            if let Err(e) = state.insert_edge(edge) {
                warn!(%version, %source, %target, error = %e, "skipping edge while loading graph state");
            }
        }
        state
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn node(&self, uid: &str) -> Option<&InterfaceNode> {
        self.nodes.get(uid)
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.nodes.contains_key(uid)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &InterfaceNode> {
        self.nodes.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Sorted UID set, for structural comparison between versions.
    pub fn uid_set(&self) -> BTreeSet<Uid> {
        self.nodes.keys().cloned().collect()
    }

    /// Sorted edge-key set, for structural comparison between versions.
    pub fn edge_set(&self) -> BTreeSet<EdgeKey> {
        self.edges.keys().cloned().collect()
    }

    /// True when both states hold the same UIDs and the same edge set.
    pub fn same_graph(&self, other: &GraphState) -> bool {
        self.uid_set() == other.uid_set() && self.edge_set() == other.edge_set()
    }

    pub fn find_by_identity(&self, identity: &NodeIdentity) -> Option<&InterfaceNode> {
        self.identities.get(identity).and_then(|uid| self.nodes.get(uid))
    }

    /// Insert or update a node. A node that shares its logical identity with a
    /// live node under a different UID replaces it and inherits its edges.
    pub fn upsert_node(&mut self, mut node: InterfaceNode) -> NodeWrite {
        let identity = node.identity();
        let traced = self.identities.get(&identity).cloned();

        if let Some(existing) = self.nodes.get(&node.uid) {
            if existing.content_eq(&node) {
                return NodeWrite::Unchanged;
            }
            node.previous_uids = existing.previous_uids.clone();
            self.identities.insert(identity, node.uid.clone());
            self.nodes.insert(node.uid.clone(), node);
            return NodeWrite::Updated;
        }

        match traced {
            Some(old_uid) if old_uid != node.uid => {
                let mut lineage = vec![old_uid.clone()];
                if let Some(old) = self.nodes.get(&old_uid) {
                    lineage.extend(old.previous_uids.iter().cloned());
                }
                lineage.truncate(MAX_PREVIOUS_UIDS);
                node.previous_uids = lineage;
                let new_uid = node.uid.clone();
                self.nodes.insert(new_uid.clone(), node);
                self.identities.insert(identity, new_uid.clone());
                self.repoint_edges(&old_uid, &new_uid);
                self.nodes.remove(&old_uid);
                NodeWrite::Replaced { old: old_uid }
            }
            _ => {
                self.identities.insert(identity, node.uid.clone());
                self.nodes.insert(node.uid.clone(), node);
                NodeWrite::Inserted
            }
        }
    }

    /// Move every edge incident to `old` onto `new`.
    fn repoint_edges(&mut self, old: &str, new: &str) {
        let mut incident: BTreeSet<EdgeKey> = BTreeSet::new();
        if let Some(keys) = self.outgoing.get(old) {
            incident.extend(keys.iter().cloned());
        }
        if let Some(keys) = self.incoming.get(old) {
            incident.extend(keys.iter().cloned());
        }
        for key in incident {
            if let Some(mut edge) = self.detach_edge(&key) {
                if edge.source == old {
                    edge.source = new.to_string();
                }
                if edge.target == old {
                    edge.target = new.to_string();
                }
                self.attach_edge(edge);
            }
        }
        self.outgoing.remove(old);
        self.incoming.remove(old);
    }

    /// Insert an edge. Both endpoints must be live. Returns `true` when the
    /// edge set changed.
    pub fn insert_edge(&mut self, edge: Edge) -> Result<bool, GraphError> {
        if !self.nodes.contains_key(&edge.source) || !self.nodes.contains_key(&edge.target) {
            return Err(GraphError::DanglingEdge {
                from: edge.source,
                to: edge.target,
                kind: edge.kind,
            });
        }
        let key = edge.key();
        if self.edges.get(&key) == Some(&edge) {
            return Ok(false);
        }
        self.attach_edge(edge);
        Ok(true)
    }

    fn attach_edge(&mut self, edge: Edge) {
        let key = edge.key();
        self.outgoing
            .entry(edge.source.clone())
            .or_default()
            .insert(key.clone());
        self.incoming
            .entry(edge.target.clone())
            .or_default()
            .insert(key.clone());
        self.edges.insert(key, edge);
    }

    fn detach_edge(&mut self, key: &EdgeKey) -> Option<Edge> {
        let edge = self.edges.remove(key)?;
        if let Some(keys) = self.outgoing.get_mut(&edge.source) {
            keys.remove(key);
        }
        if let Some(keys) = self.incoming.get_mut(&edge.target) {
            keys.remove(key);
        }
        Some(edge)
    }

    pub fn remove_edge(&mut self, key: &EdgeKey) -> Option<Edge> {
        self.detach_edge(key)
    }

    /// Remove a node together with every incident edge.
    /// Returns the removed node and the pruned edges.
    pub fn remove_node(&mut self, uid: &str) -> Option<(InterfaceNode, Vec<Edge>)> {
        let node = self.nodes.remove(uid)?;
        let mut incident: BTreeSet<EdgeKey> = BTreeSet::new();
        if let Some(keys) = self.outgoing.remove(uid) {
            incident.extend(keys);
        }
        if let Some(keys) = self.incoming.remove(uid) {
            incident.extend(keys);
        }
        let pruned: Vec<Edge> = incident.iter().filter_map(|k| self.detach_edge(k)).collect();
        if self.identities.get(&node.identity()).map(String::as_str) == Some(uid) {
            self.identities.remove(&node.identity());
        }
        Some((node, pruned))
    }

    pub fn edges_of(&self, uid: &str, direction: EdgeDirection) -> Vec<Edge> {
        let mut keys: BTreeSet<&EdgeKey> = BTreeSet::new();
        if matches!(direction, EdgeDirection::Outgoing | EdgeDirection::Both) {
            if let Some(out) = self.outgoing.get(uid) {
                keys.extend(out.iter());
            }
        }
        if matches!(direction, EdgeDirection::Incoming | EdgeDirection::Both) {
            if let Some(inc) = self.incoming.get(uid) {
                keys.extend(inc.iter());
            }
        }
        keys.into_iter()
            .filter_map(|k| self.edges.get(k).cloned())
            .collect()
    }

    /// Bounded breadth-first traversal from the seed set.
    ///
    /// Each hop admits at most `per_hop_cap` new nodes, chosen by structural
    /// rank of the connecting edge and then by UID, so the result is a pure
    /// function of the state and the query.
    pub fn neighborhood(&self, query: &NeighborhoodQuery) -> Result<NodeSet, GraphError> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut reached: Vec<ReachedNode> = Vec::new();
        let mut frontier: Vec<&str> = Vec::new();

        for seed in &query.seeds {
            let node = self
                .nodes
                .get(seed)
                .ok_or_else(|| GraphError::NodeNotFound(seed.clone()))?;
            if visited.insert(node.uid.as_str()) {
                frontier.push(node.uid.as_str());
                reached.push(ReachedNode {
                    node: node.clone(),
                    hop: 0,
                    via: None,
                });
            }
        }

        for hop in 1..=query.max_hops {
            if frontier.is_empty() {
                break;
            }
            // uid -> best (rank, kind) seen this hop
            let mut candidates: BTreeMap<&str, EdgeKind> = BTreeMap::new();
            for uid in &frontier {
                for (key, neighbor) in self.adjacent(uid, query.direction) {
                    if visited.contains(neighbor) || !query.admits_kind(key.kind) {
                        continue;
                    }
                    let Some(edge) = self.edges.get(key) else { continue };
                    if !query.features.allows_edge(edge) {
                        continue;
                    }
                    let Some(node) = self.nodes.get(neighbor) else { continue };
                    if !query.features.allows_node(node) {
                        continue;
                    }
                    candidates
                        .entry(node.uid.as_str())
                        .and_modify(|k| {
                            if key.kind.structural_rank() < k.structural_rank() {
                                *k = key.kind;
                            }
                        })
                        .or_insert(key.kind);
                }
            }

            let mut ordered: Vec<(&str, EdgeKind)> = candidates.into_iter().collect();
            ordered.sort_by(|a, b| {
                a.1.structural_rank()
                    .cmp(&b.1.structural_rank())
                    .then_with(|| a.0.cmp(b.0))
            });
            ordered.truncate(query.per_hop_cap);

            frontier = Vec::with_capacity(ordered.len());
            for (uid, kind) in ordered {
                visited.insert(uid);
                frontier.push(uid);
                if let Some(node) = self.nodes.get(uid) {
                    reached.push(ReachedNode {
                        node: node.clone(),
                        hop,
                        via: Some(kind),
                    });
                }
            }
        }

        Ok(NodeSet {
            version: self.version,
            nodes: reached,
        })
    }

    fn adjacent<'a>(
        &'a self,
        uid: &str,
        direction: EdgeDirection,
    ) -> impl Iterator<Item = (&'a EdgeKey, &'a str)> + 'a {
        let out = match direction {
            EdgeDirection::Outgoing | EdgeDirection::Both => self.outgoing.get(uid),
            EdgeDirection::Incoming => None,
        };
        let inc = match direction {
            EdgeDirection::Incoming | EdgeDirection::Both => self.incoming.get(uid),
            EdgeDirection::Outgoing => None,
        };
        out.into_iter()
            .flatten()
            .map(|k| (k, k.target.as_str()))
            .chain(inc.into_iter().flatten().map(|k| (k, k.source.as_str())))
    }

    /// Nodes that reach any of `uids` by following edges of `kinds` backwards,
    /// up to `max_hops`. The start nodes themselves are excluded.
    pub fn reverse_reachable(&self, uids: &[Uid], kinds: &[EdgeKind], max_hops: u32) -> Vec<InterfaceNode> {
        let mut visited: HashSet<&str> = uids.iter().map(String::as_str).collect();
        let mut queue: VecDeque<(&str, u32)> = uids
            .iter()
            .filter(|u| self.nodes.contains_key(u.as_str()))
            .map(|u| (u.as_str(), 0))
            .collect();
        let mut found: BTreeSet<&str> = BTreeSet::new();

        while let Some((uid, depth)) = queue.pop_front() {
            if depth >= max_hops {
                continue;
            }
            let Some(keys) = self.incoming.get(uid) else { continue };
            for key in keys {
                if !kinds.contains(&key.kind) {
                    continue;
                }
                let src = key.source.as_str();
                if visited.insert(src) {
                    found.insert(src);
                    queue.push_back((src, depth + 1));
                }
            }
        }

        found
            .into_iter()
            .filter_map(|uid| self.nodes.get(uid).cloned())
            .collect()
    }

    /// Edges whose endpoints are not live. Always empty for a consistent state.
    pub fn dangling_edges(&self) -> Vec<Edge> {
        self.edges
            .values()
            .filter(|e| !self.nodes.contains_key(&e.source) || !self.nodes.contains_key(&e.target))
            .cloned()
            .collect()
    }

    /// Replace the whole content with `other`'s nodes and edges.
    pub fn replace_contents(&mut self, other: &GraphState) {
        let version = self.version;
        *self = other.clone();
        self.version = version;
    }

    /// Compute what must be persisted to turn `old` into `new`.
    pub fn diff(old: &GraphState, new: &GraphState) -> GraphDiff {
        let mut diff = GraphDiff::default();

        let mut upserted: Vec<&InterfaceNode> = new
            .nodes
            .values()
            .filter(|n| old.nodes.get(&n.uid) != Some(*n))
            .collect();
        upserted.sort_by(|a, b| a.uid.cmp(&b.uid));
        diff.upserted_nodes = upserted.into_iter().cloned().collect();

        let mut removed: Vec<Uid> = old
            .nodes
            .keys()
            .filter(|uid| !new.nodes.contains_key(*uid))
            .cloned()
            .collect();
        removed.sort();
        diff.removed_nodes = removed;

        diff.upserted_edges = new
            .edges
            .iter()
            .filter(|(k, e)| old.edges.get(*k) != Some(*e))
            .map(|(_, e)| e.clone())
            .collect();
        diff.removed_edges = old
            .edges
            .keys()
            .filter(|k| !new.edges.contains_key(*k))
            .cloned()
            .collect();

        diff
    }
}

#[cfg(test)]
#[path = "graph_tests.rs"]
mod tests;
