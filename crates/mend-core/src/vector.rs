//! Approximate nearest-neighbor index over node embeddings.
//!
//! A single-layer navigable small-world graph with cosine distance. Inserts
//! link the new entry to its nearest live neighbors without touching the rest
//! of the index; removals tombstone the slot. [`VectorIndex::compact`] rebuilds
//! from live entries only. Small indexes are searched exactly.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::types::{GraphError, Uid, Version};

/// Neighbors kept per entry.
const MAX_NEIGHBORS: usize = 16;
/// Beam width for greedy search.
const EF_SEARCH: usize = 64;
/// Below this many live entries, search is an exact scan.
const EXACT_SCAN_LIMIT: usize = 256;

#[derive(Debug, Clone)]
struct Entry {
    uid: Uid,
    vector: Vec<f32>,
    neighbors: Vec<usize>,
    deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Dist(f32);

impl Eq for Dist {}

impl PartialOrd for Dist {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Dist {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    dim: usize,
    entries: Vec<Entry>,
    slots: HashMap<Uid, usize>,
    /// Graph version the index reflects.
    synced: Version,
}

impl VectorIndex {
    /// `dim == 0` adopts the dimension of the first inserted vector.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ..Self::default()
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn synced(&self) -> Version {
        self.synced
    }

    pub fn mark_synced(&mut self, version: Version) {
        self.synced = version;
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.slots.contains_key(uid)
    }

    /// Share of slots occupied by tombstones.
    pub fn tombstone_ratio(&self) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }
        (self.entries.len() - self.slots.len()) as f64 / self.entries.len() as f64
    }

    pub fn check_dim(&self, len: usize) -> Result<(), GraphError> {
        if self.dim != 0 && self.dim != len {
            return Err(GraphError::DimensionMismatch {
                expected: self.dim,
                actual: len,
            });
        }
        Ok(())
    }

    /// Insert or replace the vector for `uid`.
    pub fn insert(&mut self, uid: &str, vector: &[f32]) -> Result<(), GraphError> {
        self.check_dim(vector.len())?;
        if self.dim == 0 {
            self.dim = vector.len();
        }
        let normalized = normalize(vector);
        if let Some(&slot) = self.slots.get(uid) {
            if self.entries[slot].vector == normalized {
                return Ok(());
            }
            self.remove(uid);
        }

        let neighbors: Vec<usize> = self
            .nearest_slots(&normalized, MAX_NEIGHBORS)
            .into_iter()
            .map(|(_, slot)| slot)
            .collect();
        let slot = self.entries.len();
        self.entries.push(Entry {
            uid: uid.to_string(),
            vector: normalized,
            neighbors: neighbors.clone(),
            deleted: false,
        });
        self.slots.insert(uid.to_string(), slot);

        for n in neighbors {
            self.entries[n].neighbors.push(slot);
            if self.entries[n].neighbors.len() > MAX_NEIGHBORS * 2 {
                self.prune_neighbors(n);
            }
        }
        Ok(())
    }

    /// Tombstone the entry for `uid`. Returns whether it was present.
    pub fn remove(&mut self, uid: &str) -> bool {
        match self.slots.remove(uid) {
            Some(slot) => {
                self.entries[slot].deleted = true;
                true
            }
            None => false,
        }
    }

    /// Rebuild the index from live entries, dropping tombstones.
    pub fn compact(&mut self) {
        let live: Vec<(Uid, Vec<f32>)> = self
            .entries
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| (e.uid.clone(), e.vector.clone()))
            .collect();
        self.entries.clear();
        self.slots.clear();
        for (uid, vector) in live {
            // vectors are already normalized and dimension-checked
            let _ = self.insert(&uid, &vector);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.slots.clear();
    }

    /// The `k` live entries closest to `query`, ascending by cosine distance.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(Uid, f32)>, GraphError> {
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        self.check_dim(query.len())?;
        let q = normalize(query);
        let mut hits: Vec<(f32, usize)> = self.nearest_slots(&q, k);
        hits.sort_by(|a, b| {
            Dist(a.0)
                .cmp(&Dist(b.0))
                .then_with(|| self.entries[a.1].uid.cmp(&self.entries[b.1].uid))
        });
        Ok(hits
            .into_iter()
            .map(|(d, slot)| (self.entries[slot].uid.clone(), d))
            .collect())
    }

    fn nearest_slots(&self, query: &[f32], k: usize) -> Vec<(f32, usize)> {
        if self.slots.len() <= EXACT_SCAN_LIMIT {
            return self.exact(query, k);
        }
        let entries = self.entry_points();
        if entries.is_empty() {
            return Vec::new();
        }
        let found = self.beam_search(query, &entries, EF_SEARCH.max(k));
        if found.len() < k.min(self.slots.len()) {
            return self.exact(query, k);
        }
        let mut found = found;
        found.truncate(k);
        found
    }

    fn exact(&self, query: &[f32], k: usize) -> Vec<(f32, usize)> {
        let mut all: Vec<(f32, usize)> = self
            .slots
            .values()
            .map(|&slot| (cosine_distance(query, &self.entries[slot].vector), slot))
            .collect();
        all.sort_by(|a, b| {
            Dist(a.0)
                .cmp(&Dist(b.0))
                .then_with(|| self.entries[a.1].uid.cmp(&self.entries[b.1].uid))
        });
        all.truncate(k);
        all
    }

    /// Up to four live slots spread across insertion order.
    fn entry_points(&self) -> Vec<usize> {
        let n = self.entries.len();
        let mut out = Vec::new();
        for start in [0, n / 4, n / 2, 3 * n / 4] {
            if let Some(slot) = (start..n).find(|&s| !self.entries[s].deleted) {
                if !out.contains(&slot) {
                    out.push(slot);
                }
            }
        }
        out
    }

    /// Greedy best-first search. Tombstoned entries are traversed but not returned.
    fn beam_search(&self, query: &[f32], entries: &[usize], ef: usize) -> Vec<(f32, usize)> {
        let mut visited: HashSet<usize> = HashSet::new();
        let mut frontier: BinaryHeap<Reverse<(Dist, usize)>> = BinaryHeap::new();
        let mut best: BinaryHeap<(Dist, usize)> = BinaryHeap::new();

        for &entry in entries {
            let d = Dist(cosine_distance(query, &self.entries[entry].vector));
            visited.insert(entry);
            frontier.push(Reverse((d, entry)));
            best.push((d, entry));
        }

        while let Some(Reverse((dist, slot))) = frontier.pop() {
            if let Some(&(worst, _)) = best.peek() {
                if dist > worst && best.len() >= ef {
                    break;
                }
            }
            for &n in &self.entries[slot].neighbors {
                if !visited.insert(n) {
                    continue;
                }
                let nd = Dist(cosine_distance(query, &self.entries[n].vector));
                let admit = best.len() < ef || best.peek().map_or(true, |&(w, _)| nd < w);
                if admit {
                    frontier.push(Reverse((nd, n)));
                    best.push((nd, n));
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }

        let mut out: Vec<(f32, usize)> = best
            .into_iter()
            .filter(|(_, slot)| !self.entries[*slot].deleted)
            .map(|(d, slot)| (d.0, slot))
            .collect();
        out.sort_by(|a, b| Dist(a.0).cmp(&Dist(b.0)).then_with(|| a.1.cmp(&b.1)));
        out
    }

    fn prune_neighbors(&mut self, slot: usize) {
        let base = self.entries[slot].vector.clone();
        let mut scored: Vec<(Dist, usize)> = self.entries[slot]
            .neighbors
            .iter()
            .filter(|&&n| !self.entries[n].deleted)
            .map(|&n| (Dist(cosine_distance(&base, &self.entries[n].vector)), n))
            .collect();
        scored.sort();
        scored.dedup_by_key(|(_, n)| *n);
        scored.truncate(MAX_NEIGHBORS);
        self.entries[slot].neighbors = scored.into_iter().map(|(_, n)| n).collect();
    }
}

fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return vec![0.0; v.len()];
    }
    v.iter().map(|x| x / norm).collect()
}

/// Cosine distance between normalized vectors, in `[0, 2]`.
/// A zero vector is at distance 1 from everything.
fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    (1.0 - dot).clamp(0.0, 2.0)
}
