// Needed-set bounds, ranking and feature gating over generated graphs.

use mend_core::config::RetrievalConfig;
use mend_core::sqlite::SqliteInterfaceStore;
use mend_core::store::InterfaceStore;
use mend_core::types::{Edge, EdgeKind, FeatureContext, IndexBatch};
use mend_retrieve::{Provenance, RetrievalConstraints, RetrievalEngine, RetrievalHints};

use crate::common::function;
use crate::common::generators::fanout_batch;

#[test]
/// One seed, two hops, 50 per hop: at most 101 nodes are considered and the
/// ranked result is cut to the budget of 50.
fn test_two_hop_retrieval_is_bounded_before_truncation() {
    let store = SqliteInterfaceStore::in_memory().unwrap();
    let (batch, root) = fanout_batch(60, 0);
    assert!(batch.nodes.len() > 3000);
    store.apply_batch(batch).unwrap();

    let config = RetrievalConfig::default();
    let engine = RetrievalEngine::new(&store, &config);
    let constraints = RetrievalConstraints::from_config(&config);
    assert_eq!((constraints.max_hops, constraints.per_hop_cap, constraints.budget), (2, 50, 50));

    let needed = engine
        .retrieve(&[root.uid.clone()], &RetrievalHints::default(), &constraints)
        .unwrap();
    assert!(needed.candidates_seen <= 101, "saw {}", needed.candidates_seen);
    assert!(needed.candidates_seen > 50);
    assert_eq!(needed.len(), 50);
    assert_eq!(needed.nodes[0].node.uid, root.uid, "seed ranks first");
    assert!(needed
        .nodes
        .windows(2)
        .all(|w| w[0].score >= w[1].score));
    assert!(needed.nodes.iter().all(|n| n.provenance == Provenance::Graph));
    assert_eq!(needed.features.agreement, 0.0);
}

#[test]
/// With embeddings, nodes found by both traversal and vector search are
/// marked and raise agreement.
fn test_hybrid_retrieval_reports_agreement() {
    let store = SqliteInterfaceStore::in_memory().unwrap();
    let (batch, root) = fanout_batch(5, 8);
    store.apply_batch(batch).unwrap();

    let config = RetrievalConfig::default();
    let engine = RetrievalEngine::new(&store, &config);
    let needed = engine
        .retrieve(
            &[root.uid.clone()],
            &RetrievalHints::default(),
            &RetrievalConstraints::from_config(&config),
        )
        .unwrap();

    let seed = needed.get(&root.uid).unwrap();
    assert_eq!(seed.provenance, Provenance::Both, "seed is its own nearest neighbor");
    assert!(needed.features.agreement > 0.0 && needed.features.agreement <= 1.0);
    assert_eq!(needed.features.coverage, 1.0);
}

#[test]
/// Feature-gated edges and nodes only appear when the feature is active.
fn test_feature_context_gates_traversal() {
    let store = SqliteInterfaceStore::in_memory().unwrap();
    let spawn = function("runtime", "spawn", "pub fn spawn<F>(f: F)");
    let tracing_hook = function("runtime::trace", "on_spawn", "pub fn on_spawn()").with_features(&["tracing"]);
    let plain = function("runtime", "run", "pub fn run()");
    store
        .apply_batch(IndexBatch {
            edges: vec![
                Edge::new(&spawn.uid, &tracing_hook.uid, EdgeKind::Calls).gated("tracing"),
                Edge::new(&plain.uid, &spawn.uid, EdgeKind::Calls),
            ],
            nodes: vec![spawn.clone(), tracing_hook.clone(), plain.clone()],
            removed: vec![],
        })
        .unwrap();

    let config = RetrievalConfig::default();
    let engine = RetrievalEngine::new(&store, &config);
    let seeds = [spawn.uid.clone()];

    let off = engine
        .retrieve(&seeds, &RetrievalHints::default(), &RetrievalConstraints::from_config(&config))
        .unwrap();
    assert!(off.get(&tracing_hook.uid).is_none());
    assert!(off.get(&plain.uid).is_some());

    let on = engine
        .retrieve(
            &seeds,
            &RetrievalHints::default(),
            &RetrievalConstraints::from_config(&config).with_features(FeatureContext::new(["tracing"])),
        )
        .unwrap();
    assert!(on.get(&tracing_hook.uid).is_some());
}
