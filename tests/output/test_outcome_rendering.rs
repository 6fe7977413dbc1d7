// Rendering of applied and held outcomes produced by the engine.

use std::sync::Arc;

use mend_core::config::{GateMode, MendConfig};
use mend_output::human::HumanFormatter;
use mend_output::json::JsonFormatter;
use mend_output::OutputFormatter;
use mend_repair::{RepairEngine, RepairOutcome, RepairRequest};

use crate::common::{
    ambiguous_diagnostics, create_repo, in_memory_store, seed_runtime_graph, send_diagnostic, services, MockReviewer,
    MockToolchain, ScriptedReasoner, RUNTIME, RUNTIME_PATH,
};

const BOX_DIFF: &str = "--- a/src/runtime.rs\n+++ b/src/runtime.rs\n@@ -1,3 +1,3 @@\n-pub fn spawn<F>(future: F) {\n+pub fn spawn<F>(future: Box<F>) {\n     drop(future);\n }\n";

async fn applied_outcome() -> RepairOutcome {
    let (_dir, root) = create_repo(&[(RUNTIME_PATH, RUNTIME)]);
    let store = in_memory_store();
    let graph = seed_runtime_graph(&store);
    let engine = RepairEngine::new(
        store,
        &root,
        MendConfig::default(),
        services(Arc::new(MockToolchain::default()), MockReviewer::deferring(), None),
    )
    .unwrap();
    engine
        .repair(RepairRequest::new(&graph.spawn.uid, vec![send_diagnostic()]))
        .await
        .unwrap()
}

async fn held_outcome() -> RepairOutcome {
    let (_dir, root) = create_repo(&[(RUNTIME_PATH, RUNTIME)]);
    let store = in_memory_store();
    let graph = seed_runtime_graph(&store);
    let toolchain = Arc::new(MockToolchain {
        fail_compile_on: vec!["Send", "Sync", "Box<F>"],
        ..MockToolchain::default()
    });
    let mut config = MendConfig::default();
    config.confidence.mode = GateMode::Fast;
    let engine = RepairEngine::new(
        store,
        &root,
        config,
        services(toolchain, MockReviewer::deferring(), Some(ScriptedReasoner::new(BOX_DIFF))),
    )
    .unwrap();
    engine
        .repair(RepairRequest::new(&graph.spawn.uid, ambiguous_diagnostics()))
        .await
        .unwrap()
}

#[tokio::test]
/// The JSON rendering of an apply carries the commit, the pattern and every
/// validation stage.
async fn test_applied_outcome_json() {
    let outcome = applied_outcome().await;
    let RepairOutcome::Applied { commit, .. } = &outcome else {
        panic!("expected an apply, got {}", outcome.label());
    };

    let out = JsonFormatter.format_outcome(&outcome);
    let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert_eq!(parsed["outcome"], "applied");
    assert_eq!(parsed["commit"]["commit_id"], commit.commit_id.as_str());
    assert_eq!(parsed["commit"]["post_version"], commit.post_version.0);
    assert_eq!(parsed["rationale"]["pattern"], "async_spawn_send");
    assert_eq!(parsed["rationale"]["validation"].as_array().unwrap().len(), 4);
    assert_eq!(parsed["rationale"]["confidence"]["decision"], "proceed");
    let score = parsed["rationale"]["confidence"]["score"].as_f64().unwrap();
    assert!(score >= 0.90);
}

#[tokio::test]
/// The human rendering of an apply names the template, the commit and the
/// changed file.
async fn test_applied_outcome_human() {
    let outcome = applied_outcome().await;
    let RepairOutcome::Applied { commit, .. } = &outcome else {
        panic!("expected an apply, got {}", outcome.label());
    };

    let out = HumanFormatter.format_outcome(&outcome);
    assert!(out.starts_with("Applied template:async_spawn_send@item to "));
    assert!(out.contains(&format!("[commit {}]", commit.commit_id)));
    assert!(out.contains(&format!("graph: {} -> {}", commit.pre_version, commit.post_version)));
    assert!(out.contains("  changed: src/runtime.rs\n"));
    assert!(out.contains("  pattern: async_spawn_send\n"));
    assert!(out.contains("proceed"));
    assert!(out.contains("compile_check"));
    assert!(!out.contains("widened"));
}

#[tokio::test]
/// A held repair lists each candidate with its diff and the compiler error
/// that stopped it.
async fn test_held_outcome_human_lists_candidates() {
    let outcome = held_outcome().await;
    let RepairOutcome::Held { report, .. } = &outcome else {
        panic!("expected a hold, got {}", outcome.label());
    };

    let out = HumanFormatter.format_outcome(&outcome);
    assert!(out.starts_with(&format!("Held {}: validation failed (3 candidate(s))\n", report.target)));
    assert!(out.contains("\n1. template:async_spawn_send@item ["));
    assert!(out.contains("\n2. template:shared_state_sync@item ["));
    assert!(out.contains("\n3. reasoner ["));
    assert!(out.contains("+pub fn spawn<F>(future: Box<F>) {"));
    assert_eq!(out.matches("error[E0308]: mismatched types").count(), 3);
    assert!(out.contains("--> src/runtime.rs:1"));
    assert!(out.contains("  attempts: 2\n"));
    assert!(out.contains("   = awaiting review\n"));
}

#[tokio::test]
/// The JSON hold report keeps candidate order and per-candidate validation.
async fn test_held_outcome_json() {
    let outcome = held_outcome().await;
    let RepairOutcome::Held { report, .. } = &outcome else {
        panic!("expected a hold, got {}", outcome.label());
    };

    let parsed: serde_json::Value = serde_json::from_str(&JsonFormatter.format_hold(report)).unwrap();
    assert_eq!(parsed["reason"], "validation failed");
    let candidates = parsed["candidates"].as_array().unwrap();
    assert_eq!(candidates.len(), 3);
    for (json, held) in candidates.iter().zip(&report.candidates) {
        assert_eq!(json["candidate"]["id"], held.candidate.id.as_str());
        let last = json["validation"].as_array().unwrap().last().unwrap().clone();
        assert_eq!(last["stage"], "compile_check");
        assert_eq!(last["status"], "fail");
    }
}
