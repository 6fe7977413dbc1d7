// Retrieval, pattern matching and packing chained the way the repair loop
// chains them.

use mend_core::config::{PackerConfig, RetrievalConfig};
use mend_retrieve::{
    ContextPacker, EditLocus, PatternLibrary, PatternTarget, RetrievalConstraints, RetrievalEngine,
    RetrievalHints, SectionRole,
};

use crate::common::{ambiguous_diagnostics, in_memory_store, seed_runtime_graph, send_diagnostic};

#[test]
/// The scenario-one diagnostic selects exactly `async_spawn_send` and the
/// packed bundle opens and closes with the anchors.
fn test_send_diagnostic_assembles_anchored_bundle() {
    let store = in_memory_store();
    let graph = seed_runtime_graph(&store);
    let config = RetrievalConfig::default();
    let needed = RetrievalEngine::new(&*store, &config)
        .retrieve(
            &[graph.spawn.uid.clone()],
            &RetrievalHints::default(),
            &RetrievalConstraints::from_config(&config),
        )
        .unwrap();
    assert_eq!(needed.len(), 3);
    assert_eq!(needed.features.coverage, 1.0);

    let diagnostics = vec![send_diagnostic()];
    let library = PatternLibrary::builtin(0.1);
    let matches = library.match_patterns(&diagnostics, None, PatternTarget::new(&graph.spawn));
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].id(), "async_spawn_send");
    assert_eq!(matches[0].param, "F");
    assert_eq!(matches[0].bounds, vec!["Send".to_string(), "'static".to_string()]);
    assert_eq!(matches[0].loci, vec![EditLocus::Item]);

    let packer = ContextPacker::new(&PackerConfig::default());
    let bundle = packer.pack(&needed, &diagnostics, &matches, packer.default_budget());
    assert!(!bundle.over_budget);
    assert!(bundle.tokens_used <= bundle.token_budget);
    assert_eq!(bundle.head[0].title, "Diagnostic");
    assert_eq!(bundle.head[1].title, "Target signature");
    assert!(bundle.head.iter().all(|s| s.role == SectionRole::Anchor));
    assert_eq!(bundle.head.len(), bundle.tail.len());
    let rendered = bundle.render();
    assert!(rendered.contains("runtime::run"));
    assert!(rendered.contains("runtime::tests::spawn_runs"));
    assert!(rendered.trim_end().ends_with("F: Send + 'static (async_spawn_send)"));
}

#[test]
/// A future that is neither `Send` nor `Sync` triggers both bound patterns;
/// a plain `Send` error triggers only one even though both share E0277.
fn test_shared_error_code_needs_matching_text() {
    let store = in_memory_store();
    let graph = seed_runtime_graph(&store);
    let library = PatternLibrary::builtin(0.1);

    let matches = library.match_patterns(&ambiguous_diagnostics(), None, PatternTarget::new(&graph.spawn));
    let ids: Vec<&str> = matches.iter().map(|m| m.id()).collect();
    assert_eq!(ids, vec!["async_spawn_send", "shared_state_sync"]);
    assert!(matches.iter().all(|m| m.distance.abs() < 1e-6));

    let matches = library.match_patterns(&[send_diagnostic()], None, PatternTarget::new(&graph.spawn));
    let ids: Vec<&str> = matches.iter().map(|m| m.id()).collect();
    assert_eq!(ids, vec!["async_spawn_send"]);
}
