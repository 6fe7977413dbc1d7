// Rendering of the audit trail and of rollbacks.

use std::sync::Arc;

use mend_core::config::MendConfig;
use mend_core::store::{AuditEntry, RepairLedger};
use mend_output::human::HumanFormatter;
use mend_output::json::JsonFormatter;
use mend_output::OutputFormatter;
use mend_repair::{RepairEngine, RepairOutcome, RepairRequest};

use crate::common::{
    create_repo, in_memory_store, seed_runtime_graph, send_diagnostic, services, MockReviewer, MockToolchain, RUNTIME,
    RUNTIME_PATH,
};

#[tokio::test]
/// Apply then rollback leaves two audit lines; both renderings agree with
/// the ledger.
async fn test_apply_and_rollback_audit_trail() {
    let (_dir, root) = create_repo(&[(RUNTIME_PATH, RUNTIME)]);
    let store = in_memory_store();
    let graph = seed_runtime_graph(&store);
    let engine = RepairEngine::new(
        store.clone(),
        &root,
        MendConfig::default(),
        services(Arc::new(MockToolchain::default()), MockReviewer::deferring(), None),
    )
    .unwrap();

    let outcome = engine
        .repair(RepairRequest::new(&graph.spawn.uid, vec![send_diagnostic()]))
        .await
        .unwrap();
    let RepairOutcome::Applied { commit, candidate, .. } = outcome else {
        panic!("expected an apply, got {}", outcome.label());
    };
    let restored = engine.rollback(&commit).unwrap();

    let rollback = HumanFormatter.format_rollback(&commit, restored);
    assert_eq!(
        rollback,
        format!(
            "Rolled back commit {} (candidate {})\n  graph: {} restored as {}\n",
            commit.commit_id, candidate.id, commit.pre_version, restored
        )
    );
    let parsed: serde_json::Value = serde_json::from_str(&JsonFormatter.format_rollback(&commit, restored)).unwrap();
    assert_eq!(parsed["command"], "rollback");
    assert_eq!(parsed["restored_version"], restored.0);

    let entries = store.audit_for_candidate(&candidate.id).unwrap();
    let human = HumanFormatter.format_audit(&entries);
    let rows: Vec<&str> = human.lines().filter(|l| !l.starts_with("   = ")).collect();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].contains(" apply "));
    assert!(rows[0].contains("stages=4"));
    assert!(rows[0].contains("confidence=9"));
    assert!(rows[1].contains(" rollback "));
    assert!(rows[1].contains("confidence=-"));
    assert!(rows[1].starts_with(&restored.to_string()));

    let decoded: Vec<AuditEntry> = serde_json::from_str(&JsonFormatter.format_audit(&entries)).unwrap();
    assert_eq!(decoded.len(), 2);
    assert_eq!(decoded[0].action, entries[0].action);
    assert_eq!(decoded[1].version, restored);
}

#[test]
/// An empty trail still renders.
fn test_empty_audit_trail() {
    assert_eq!(HumanFormatter.format_audit(&[]), "No audit entries.\n");
    let parsed: serde_json::Value = serde_json::from_str(&JsonFormatter.format_audit(&[])).unwrap();
    assert_eq!(parsed, serde_json::json!([]));
}
