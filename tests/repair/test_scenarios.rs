// End-to-end repair scenarios against a real store and a mock toolchain.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use mend_core::config::{GateMode, MendConfig};
use mend_core::store::{AuditAction, InterfaceStore, RepairLedger};
use mend_core::types::{Diagnostic, ValidationStage};
use mend_repair::{GateDecision, RepairEngine, RepairOutcome, RepairRequest, ReviewDecision};

use crate::common::{
    ambiguous_diagnostics, create_repo, in_memory_store, init_tracing, read, seed_runtime_graph, send_diagnostic,
    services, MockReviewer, MockToolchain, ScriptedReasoner, RUNTIME, RUNTIME_PATH,
};

const BOX_DIFF: &str = "--- a/src/runtime.rs\n+++ b/src/runtime.rs\n@@ -1,3 +1,3 @@\n-pub fn spawn<F>(future: F) {\n+pub fn spawn<F>(future: Box<F>) {\n     drop(future);\n }\n";

const CENTROID_PATTERNS: &str = r#"[
  {
    "id": "send_bound",
    "description": "Require Send on the spawned value",
    "trigger": { "centroid": [0.88, 0.475, 0.0], "max_distance": 0.5 },
    "applies_to": { "kinds": ["function"] },
    "transform": { "op": "add_bounds", "bounds": ["Send"] },
    "preconditions": [{ "check": "bounds_missing", "bounds": ["Send"] }],
    "postconditions": [{ "check": "bounds_present", "bounds": ["Send"] }]
  },
  {
    "id": "unpin_bound",
    "description": "Require Unpin on the spawned value",
    "trigger": { "centroid": [0.69, 0.7238, 0.0], "max_distance": 0.5 },
    "applies_to": { "kinds": ["function"] },
    "transform": { "op": "add_bounds", "bounds": ["Unpin"] },
    "preconditions": [{ "check": "bounds_missing", "bounds": ["Unpin"] }],
    "postconditions": [{ "check": "bounds_present", "bounds": ["Unpin"] }]
  }
]"#;

fn approve_first(report: &mend_repair::HoldReport) -> ReviewDecision {
    ReviewDecision::Approve(report.candidates[0].candidate.id.clone())
}

fn candidate_ids(toolchain: &MockToolchain) -> BTreeSet<String> {
    toolchain.calls().into_iter().map(|c| c.candidate_id).collect()
}

#[tokio::test]
/// A single matching pattern with clean evidence is applied without review,
/// and only that candidate is ever built.
async fn test_single_match_applies_without_review() {
    init_tracing();
    let (_dir, root) = create_repo(&[(RUNTIME_PATH, RUNTIME)]);
    let store = in_memory_store();
    let graph = seed_runtime_graph(&store);
    let toolchain = Arc::new(MockToolchain::default());
    let reviewer = MockReviewer::deferring();
    let engine = RepairEngine::new(
        store.clone(),
        &root,
        MendConfig::default(),
        services(toolchain.clone(), reviewer.clone(), None),
    )
    .unwrap();
    let pre = store.head_version();

    let outcome = engine
        .repair(RepairRequest::new(&graph.spawn.uid, vec![send_diagnostic()]))
        .await
        .unwrap();
    let RepairOutcome::Applied {
        commit,
        candidate,
        rationale,
    } = outcome
    else {
        panic!("expected an apply, got {}", outcome.label());
    };

    assert!(read(&root, RUNTIME_PATH).starts_with("pub fn spawn<F: Send + 'static>(future: F) {"));
    assert_eq!(commit.pre_version, pre);
    assert_eq!(store.head_version(), commit.post_version);
    assert_eq!(rationale.pattern.as_deref(), Some("async_spawn_send"));
    let confidence = rationale.confidence.as_ref().unwrap();
    assert!(confidence.score >= 0.90, "score {}", confidence.score);
    assert_eq!(confidence.decision, GateDecision::Proceed);
    assert!(reviewer.reports().is_empty());

    assert_eq!(candidate_ids(&toolchain), BTreeSet::from([candidate.id.clone()]));
    assert_eq!(toolchain.stages_for(&candidate.id), vec!["format", "compile", "tests"]);
    let recorded: Vec<ValidationStage> = store
        .validation_results(&candidate.id)
        .unwrap()
        .into_iter()
        .map(|r| r.stage)
        .collect();
    assert_eq!(
        recorded,
        vec![
            ValidationStage::InMemoryTypeCheck,
            ValidationStage::FormatCheck,
            ValidationStage::CompileCheck,
            ValidationStage::SelectiveTests,
        ]
    );

    let fixed = store.get_node(&candidate.predicted[0].uid).unwrap();
    assert!(fixed.effective_bounds("F").contains("Send"));
    assert!(store.get_node(&graph.spawn.uid).is_none());
    assert!(store.staged_candidates().unwrap().is_empty());
}

#[tokio::test]
/// Two centroid-triggered patterns from a project library: both candidates
/// validate concurrently, the better one wins, and the slower sibling is
/// cancelled before it reaches compilation.
async fn test_parallel_preflight_cancels_slower_sibling() {
    init_tracing();
    let (_dir, root) = create_repo(&[
        (RUNTIME_PATH, RUNTIME),
        (
            ".mend/mend.json",
            r#"{"patterns":{"library_path":"patterns.json"},"preflight":{"parallelism":2}}"#,
        ),
        (".mend/patterns.json", CENTROID_PATTERNS),
    ]);
    let store = in_memory_store();
    let graph = seed_runtime_graph(&store);
    let toolchain = Arc::new(MockToolchain {
        slow_format_on: Some(("Unpin", Duration::from_millis(1500))),
        ..MockToolchain::default()
    });
    let engine = RepairEngine::open(store.clone(), &root, services(toolchain.clone(), MockReviewer::deferring(), None))
        .unwrap();

    let mut request = RepairRequest::new(
        &graph.spawn.uid,
        vec![Diagnostic::error(None, "opaque failure in spawn")],
    );
    request.embedding = Some(vec![1.0, 0.0, 0.0]);
    let outcome = engine.repair(request).await.unwrap();
    let RepairOutcome::Applied { candidate, .. } = &outcome else {
        panic!("expected an apply, got {}", outcome.label());
    };

    assert_eq!(candidate.origin.pattern_id(), Some("send_bound"));
    assert!(read(&root, RUNTIME_PATH).starts_with("pub fn spawn<F: Send>(future: F) {"));

    let calls = toolchain.calls();
    let unpin = calls
        .iter()
        .find(|c| c.source.contains("Unpin"))
        .map(|c| c.candidate_id.clone())
        .expect("unpin candidate was validated");
    assert_ne!(unpin, candidate.id);
    assert_eq!(toolchain.stages_for(&unpin), vec!["format"]);
    let unpin_stages: Vec<ValidationStage> = store
        .validation_results(&unpin)
        .unwrap()
        .into_iter()
        .map(|r| r.stage)
        .collect();
    assert_eq!(
        unpin_stages,
        vec![ValidationStage::InMemoryTypeCheck, ValidationStage::FormatCheck]
    );
    assert!(store.audit_for_candidate(&unpin).unwrap().is_empty());
    assert!(store.staged_candidates().unwrap().is_empty());
}

#[tokio::test]
/// An ambiguous diagnostic yields two candidates; the closer one fails to
/// compile, so the alternative is applied and the failure is learned.
async fn test_failed_candidate_falls_back_to_alternative() {
    init_tracing();
    let (_dir, root) = create_repo(&[(RUNTIME_PATH, RUNTIME)]);
    let store = in_memory_store();
    let graph = seed_runtime_graph(&store);
    let toolchain = Arc::new(MockToolchain {
        fail_compile_on: vec!["Send + 'static"],
        ..MockToolchain::default()
    });
    let engine = RepairEngine::new(
        store.clone(),
        &root,
        MendConfig::default(),
        services(toolchain.clone(), MockReviewer::deferring(), None),
    )
    .unwrap();

    let outcome = engine
        .repair(RepairRequest::new(&graph.spawn.uid, ambiguous_diagnostics()))
        .await
        .unwrap();
    let RepairOutcome::Applied {
        commit, candidate, ..
    } = &outcome
    else {
        panic!("expected an apply, got {}", outcome.label());
    };

    assert_eq!(candidate.origin.pattern_id(), Some("shared_state_sync"));
    let source = read(&root, RUNTIME_PATH);
    assert!(source.contains("F: Sync"));
    assert!(!source.contains("Send"));

    let record = store.commit_record(&commit.commit_id).unwrap().unwrap();
    assert_eq!(record.files.len(), 1);
    assert_eq!(record.files[0].before.as_deref(), Some(RUNTIME));

    let failed = toolchain
        .calls()
        .into_iter()
        .find(|c| c.stage == "compile" && c.source.contains("Send + 'static"))
        .map(|c| c.candidate_id)
        .expect("send candidate reached compilation");
    let failed_actions: Vec<AuditAction> = store
        .audit_for_candidate(&failed)
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert!(!failed_actions.contains(&AuditAction::Apply));
    let failed_results = store.validation_results(&failed).unwrap();
    assert_eq!(failed_results.last().unwrap().stage, ValidationStage::CompileCheck);
    assert!(!failed_results.last().unwrap().passed());

    let rates = store.pattern_success_rates().unwrap();
    assert!(rates["async_spawn_send"] < 0.5);
    assert!(rates["shared_state_sync"] > 0.5);
}

#[tokio::test]
/// Every template fails, the reasoner's fallback fails too, and the target
/// is escalated with all three candidates and their compiler output.
async fn test_exhausted_retries_escalate_with_full_report() {
    init_tracing();
    let (_dir, root) = create_repo(&[(RUNTIME_PATH, RUNTIME)]);
    let store = in_memory_store();
    let graph = seed_runtime_graph(&store);
    let toolchain = Arc::new(MockToolchain {
        fail_compile_on: vec!["Send", "Sync", "Box<F>"],
        ..MockToolchain::default()
    });
    let reviewer = MockReviewer::deferring();
    let reasoner = ScriptedReasoner::new(BOX_DIFF);
    let mut config = MendConfig::default();
    config.confidence.mode = GateMode::Fast;
    let engine = RepairEngine::new(
        store.clone(),
        &root,
        config,
        services(toolchain.clone(), reviewer.clone(), Some(reasoner.clone())),
    )
    .unwrap();
    let pre = store.head_version();

    let outcome = engine
        .repair(RepairRequest::new(&graph.spawn.uid, ambiguous_diagnostics()))
        .await
        .unwrap();
    let RepairOutcome::Held { report, rationale } = &outcome else {
        panic!("expected a hold, got {}", outcome.label());
    };

    assert_eq!(report.reason, "validation failed");
    assert_eq!(report.candidates.len(), 3);
    for held in &report.candidates {
        assert!(held.diff.contains("+pub fn spawn<F"), "diff: {}", held.diff);
        assert!(held
            .diagnostics()
            .iter()
            .any(|d| d.code.as_deref() == Some("E0308")));
        let actions: Vec<AuditAction> = store
            .audit_for_candidate(&held.candidate.id)
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec![AuditAction::Hold]);
    }
    assert_eq!(report.candidates[2].candidate.origin.label(), "reasoner");
    assert_eq!(rationale.attempts, 2);
    assert_eq!(rationale.failed_stage, Some(ValidationStage::CompileCheck));
    assert_eq!(reviewer.reports().len(), 1);

    assert_eq!(read(&root, RUNTIME_PATH), RUNTIME);
    assert_eq!(store.head_version(), pre);
    assert!(store.staged_candidates().unwrap().is_empty());

    let feedback = reasoner.feedback.lock().unwrap();
    assert_eq!(feedback.len(), 1);
    assert_eq!(feedback[0].len(), 2);
    assert!(feedback[0].iter().all(|d| d.code.as_deref() == Some("E0308")));
}

#[tokio::test]
/// Reviewer approval does not bypass PreFlight: a candidate that still fails
/// stays held and the tree is untouched.
async fn test_reviewer_approval_still_requires_preflight() {
    init_tracing();
    let (_dir, root) = create_repo(&[(RUNTIME_PATH, RUNTIME)]);
    let store = in_memory_store();
    let graph = seed_runtime_graph(&store);
    let toolchain = Arc::new(MockToolchain {
        fail_compile_on: vec!["Send", "Sync"],
        ..MockToolchain::default()
    });
    let reviewer = MockReviewer::new(approve_first);
    let engine = RepairEngine::new(
        store.clone(),
        &root,
        MendConfig::default(),
        services(toolchain.clone(), reviewer.clone(), None),
    )
    .unwrap();

    let outcome = engine
        .repair(RepairRequest::new(&graph.spawn.uid, ambiguous_diagnostics()))
        .await
        .unwrap();
    let RepairOutcome::Held { report, rationale } = &outcome else {
        panic!("expected a hold, got {}", outcome.label());
    };

    assert_eq!(report.reason, "no further candidates could be generated");
    assert_eq!(report.candidates.len(), 2);
    assert_eq!(
        rationale.notes.last().map(String::as_str),
        Some("reviewer-approved candidate failed validation")
    );
    assert_eq!(rationale.failed_stage, Some(ValidationStage::CompileCheck));

    let approved = &report.candidates[0].candidate.id;
    let compiles = toolchain
        .stages_for(approved)
        .into_iter()
        .filter(|s| *s == "compile")
        .count();
    assert_eq!(compiles, 2, "approved candidate was validated again");
    assert_eq!(read(&root, RUNTIME_PATH), RUNTIME);
    assert!(store
        .audit_for_candidate(approved)
        .unwrap()
        .iter()
        .all(|e| e.action != AuditAction::Apply));
}
