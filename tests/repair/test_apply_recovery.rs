// Apply atomicity, crash recovery and rollback through the public API.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mend_core::config::MendConfig;
use mend_core::sqlite::SqliteInterfaceStore;
use mend_core::store::{AuditAction, InterfaceStore, RepairLedger};
use mend_core::types::{InterfaceNode, StageStatus, ValidationResult, ValidationStage};
use mend_repair::{
    ApplyController, ApplyError, ApplyEvidence, Approval, Candidate, CandidateOrigin, FileEdit, FsWorkingTree,
    GateDecision, RepairEngine, RepairError, RepairOutcome, RepairRequest, WorkingTree,
};

use crate::common::{
    create_repo, in_memory_store, read, seed_runtime_graph, send_diagnostic, services, MockReviewer, MockToolchain,
    RUNTIME, RUNTIME_PATH,
};

const LIB: &str = "pub mod runtime;\n";
const LIB_FIXED: &str = "pub mod runtime;\npub use runtime::spawn;\n";
const RUNTIME_FIXED: &str = "pub fn spawn<F: Send + 'static>(future: F) {\n    drop(future);\n}\n";

/// The `fail_at`-th write fails. When `sticky`, every later write and
/// removal fails too, as if the disk filled up mid-apply.
struct FullDisk {
    inner: FsWorkingTree,
    writes: AtomicUsize,
    fail_at: usize,
    sticky: bool,
}

impl FullDisk {
    fn new(root: &Path, fail_at: usize, sticky: bool) -> Self {
        Self {
            inner: FsWorkingTree::new(root),
            writes: AtomicUsize::new(0),
            fail_at,
            sticky,
        }
    }

    fn full(&self) -> io::Error {
        io::Error::new(io::ErrorKind::Other, "no space left on device")
    }
}

impl WorkingTree for FullDisk {
    fn root(&self) -> &Path {
        self.inner.root()
    }

    fn read(&self, path: &str) -> io::Result<Option<String>> {
        self.inner.read(path)
    }

    fn write(&self, path: &str, content: &str) -> io::Result<()> {
        let n = self.writes.fetch_add(1, Ordering::SeqCst);
        if n == self.fail_at || (self.sticky && n > self.fail_at) {
            return Err(self.full());
        }
        self.inner.write(path, content)
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        if self.sticky && self.writes.load(Ordering::SeqCst) > self.fail_at {
            return Err(self.full());
        }
        self.inner.remove(path)
    }
}

/// `spawn` bounded by `Send + 'static`, re-exported from the crate root.
fn bounded_spawn(spawn: &InterfaceNode) -> Candidate {
    let mut fixed = spawn.clone();
    fixed.signature = "pub fn spawn<F: Send + 'static>(future: F)".to_string();
    fixed.generics[0].bounds = vec!["Send".to_string(), "'static".to_string()];
    fixed.refresh_uid();
    fixed.previous_uids = vec![spawn.uid.clone()];
    Candidate {
        id: "bounded-spawn".to_string(),
        target: spawn.uid.clone(),
        origin: CandidateOrigin::Reasoner {
            raw_response: String::new(),
        },
        edits: vec![
            FileEdit {
                path: RUNTIME_PATH.to_string(),
                original: RUNTIME.to_string(),
                updated: RUNTIME_FIXED.to_string(),
            },
            FileEdit {
                path: "src/lib.rs".to_string(),
                original: LIB.to_string(),
                updated: LIB_FIXED.to_string(),
            },
        ],
        touched: vec![spawn.uid.clone()],
        predicted: vec![fixed],
        consistency: 1.0,
    }
}

fn gate_evidence(candidate_id: &str) -> ApplyEvidence {
    let validation = [
        ValidationStage::InMemoryTypeCheck,
        ValidationStage::FormatCheck,
        ValidationStage::CompileCheck,
        ValidationStage::SelectiveTests,
    ]
    .into_iter()
    .map(|stage| ValidationResult {
        candidate_id: candidate_id.to_string(),
        stage,
        status: StageStatus::Pass,
        diagnostics: vec![],
        duration_ms: 3,
    })
    .collect();
    ApplyEvidence {
        validation,
        approval: Approval::Gate {
            score: 0.95,
            threshold: 0.90,
            decision: GateDecision::Proceed,
        },
        rationale: "reasoner; confidence 0.95".to_string(),
    }
}

fn engine(store: Arc<SqliteInterfaceStore>, root: &Path) -> RepairEngine {
    RepairEngine::new(
        store,
        root,
        MendConfig::default(),
        services(Arc::new(MockToolchain::default()), MockReviewer::deferring(), None),
    )
    .unwrap()
}

fn actions(store: &SqliteInterfaceStore, candidate_id: &str) -> Vec<AuditAction> {
    store
        .audit_for_candidate(candidate_id)
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect()
}

#[test]
/// A failed write is undone before the error returns: no file and no graph
/// version reflects the partial apply.
fn test_failed_write_leaves_no_partial_apply() {
    let (_dir, root) = create_repo(&[(RUNTIME_PATH, RUNTIME), ("src/lib.rs", LIB)]);
    let store = in_memory_store();
    let graph = seed_runtime_graph(&store);
    let candidate = bounded_spawn(&graph.spawn);
    let pre = store.head_version();

    // Second write fails; reverting the first still succeeds.
    let tree = Arc::new(FullDisk::new(&root, 1, false));
    let err = ApplyController::new(store.clone(), tree, &root.join(".mend/journal"))
        .apply(&candidate, &gate_evidence(&candidate.id))
        .unwrap_err();

    assert!(matches!(err, ApplyError::ApplyFailure { .. }), "got {err:?}");
    assert_eq!(read(&root, RUNTIME_PATH), RUNTIME);
    assert_eq!(read(&root, "src/lib.rs"), LIB);
    assert_eq!(store.head_version(), pre);
    assert!(store.get_node(&graph.spawn.uid).is_some());
    assert!(store.halt_reason().is_none());
    assert_eq!(actions(&store, &candidate.id), vec![AuditAction::ApplyFailed]);
}

#[tokio::test]
/// An apply that dies half-written leaves a journal; the next engine to open
/// the repository undoes it, and repairs resume once the halt is cleared.
async fn test_interrupted_apply_is_undone_on_restart() {
    let (_dir, root) = create_repo(&[(RUNTIME_PATH, RUNTIME), ("src/lib.rs", LIB)]);
    let store = in_memory_store();
    let graph = seed_runtime_graph(&store);
    let candidate = bounded_spawn(&graph.spawn);
    let pre = store.head_version();

    let tree = Arc::new(FullDisk::new(&root, 1, true));
    let crashed = ApplyController::new(store.clone(), tree, &root.join(".mend/journal"))
        .apply(&candidate, &gate_evidence(&candidate.id))
        .unwrap_err();
    assert!(matches!(crashed, ApplyError::RollbackFailure { .. }), "got {crashed:?}");
    assert!(store.halt_reason().is_some());
    assert_eq!(read(&root, RUNTIME_PATH), RUNTIME_FIXED);
    assert_eq!(read(&root, "src/lib.rs"), LIB);

    let engine = engine(store.clone(), &root);
    assert_eq!(read(&root, RUNTIME_PATH), RUNTIME);
    assert_eq!(read(&root, "src/lib.rs"), LIB);
    assert_eq!(store.head_version(), pre);

    let request = RepairRequest::new(&graph.spawn.uid, vec![send_diagnostic()]);
    assert!(matches!(
        engine.repair(request.clone()).await,
        Err(RepairError::Apply(ApplyError::RepositoryHalted(_)))
    ));
    assert_eq!(read(&root, RUNTIME_PATH), RUNTIME);

    store.clear_halt().unwrap();
    let outcome = engine.repair(request).await.unwrap();
    assert_eq!(outcome.label(), "applied");
    assert!(read(&root, RUNTIME_PATH).starts_with("pub fn spawn<F: Send + 'static>(future: F) {"));
    assert_eq!(read(&root, "src/lib.rs"), LIB);
}

#[tokio::test]
/// Rolling back an applied repair restores the files and the exact graph of
/// the pre-apply version, once.
async fn test_rollback_restores_pre_apply_graph() {
    let (_dir, root) = create_repo(&[(RUNTIME_PATH, RUNTIME)]);
    let store = in_memory_store();
    let graph = seed_runtime_graph(&store);
    let engine = engine(store.clone(), &root);

    let outcome = engine
        .repair(RepairRequest::new(&graph.spawn.uid, vec![send_diagnostic()]))
        .await
        .unwrap();
    let RepairOutcome::Applied { commit, candidate, .. } = outcome else {
        panic!("expected an apply, got {}", outcome.label());
    };
    assert_ne!(read(&root, RUNTIME_PATH), RUNTIME);

    let restored = engine.rollback(&commit).unwrap();
    assert!(restored > commit.post_version);
    assert_eq!(store.head_version(), restored);
    assert_eq!(read(&root, RUNTIME_PATH), RUNTIME);

    let before = store.live_state(commit.pre_version).unwrap();
    assert!(store.current().same_graph(&before));
    assert!(store.get_node(&graph.spawn.uid).is_some());
    assert!(store.get_node(&candidate.predicted[0].uid).is_none());
    assert!(store.current().dangling_edges().is_empty());

    assert_eq!(engine.rollback(&commit).unwrap(), restored);
    assert_eq!(actions(&store, &candidate.id), vec![AuditAction::Apply, AuditAction::Rollback]);
}

#[tokio::test]
/// A file edited by hand after the apply is still restored on rollback.
async fn test_rollback_overwrites_later_edits() {
    let (_dir, root) = create_repo(&[(RUNTIME_PATH, RUNTIME)]);
    let store = in_memory_store();
    let graph = seed_runtime_graph(&store);
    let engine = engine(store.clone(), &root);

    let outcome = engine
        .repair(RepairRequest::new(&graph.spawn.uid, vec![send_diagnostic()]))
        .await
        .unwrap();
    let RepairOutcome::Applied { commit, .. } = outcome else {
        panic!("expected an apply, got {}", outcome.label());
    };
    std::fs::write(root.join(RUNTIME_PATH), "// edited by hand\n").unwrap();

    engine.rollback(&commit).unwrap();
    assert_eq!(read(&root, RUNTIME_PATH), RUNTIME);
}

#[tokio::test]
/// Commit records live in the store, so a repair applied in one process can
/// be rolled back from another.
async fn test_rollback_after_reopening_store() {
    let (_dir, root) = create_repo(&[(RUNTIME_PATH, RUNTIME)]);
    let db = root.join(".mend").join("graph.db");
    std::fs::create_dir_all(db.parent().unwrap()).unwrap();
    let db = db.to_str().unwrap().to_string();

    let (commit, spawn_uid) = {
        let store = Arc::new(SqliteInterfaceStore::open(&db).unwrap());
        let graph = seed_runtime_graph(&store);
        let outcome = engine(store.clone(), &root)
            .repair(RepairRequest::new(&graph.spawn.uid, vec![send_diagnostic()]))
            .await
            .unwrap();
        let RepairOutcome::Applied { commit, .. } = outcome else {
            panic!("expected an apply, got {}", outcome.label());
        };
        (commit, graph.spawn.uid)
    };

    let store = Arc::new(SqliteInterfaceStore::open(&db).unwrap());
    assert_eq!(store.head_version(), commit.post_version);
    let engine = engine(store.clone(), &root);
    engine.rollback(&commit).unwrap();

    assert_eq!(read(&root, RUNTIME_PATH), RUNTIME);
    assert!(store.get_node(&spawn_uid).is_some());
    assert!(store.commit_record(&commit.commit_id).unwrap().unwrap().rolled_back);
}

#[tokio::test]
/// If the commit cannot be flagged as rolled back after the files and graph
/// were restored, the repository halts instead of reporting a plain error.
async fn test_unrecorded_rollback_halts_repository() {
    let (_dir, root) = create_repo(&[(RUNTIME_PATH, RUNTIME)]);
    let db = root.join(".mend").join("graph.db");
    std::fs::create_dir_all(db.parent().unwrap()).unwrap();
    let db = db.to_str().unwrap().to_string();
    let store = Arc::new(SqliteInterfaceStore::open(&db).unwrap());
    let graph = seed_runtime_graph(&store);
    let engine = engine(store.clone(), &root);

    let outcome = engine
        .repair(RepairRequest::new(&graph.spawn.uid, vec![send_diagnostic()]))
        .await
        .unwrap();
    let RepairOutcome::Applied { commit, .. } = outcome else {
        panic!("expected an apply, got {}", outcome.label());
    };

    // The commit log becomes read-only behind the store's back.
    let conn = rusqlite::Connection::open(&db).unwrap();
    conn.execute_batch(
        "CREATE TRIGGER commits_read_only BEFORE UPDATE ON commits
         BEGIN SELECT RAISE(ABORT, 'commit log is read-only'); END;",
    )
    .unwrap();
    drop(conn);

    let err = engine.rollback(&commit).unwrap_err();
    assert!(matches!(err, ApplyError::RollbackFailure { .. }), "got {err:?}");
    let reason = store.halt_reason().unwrap();
    assert!(reason.contains(&commit.commit_id));
    assert!(!store.commit_record(&commit.commit_id).unwrap().unwrap().rolled_back);
    assert_eq!(read(&root, RUNTIME_PATH), RUNTIME);

    let request = RepairRequest::new(&graph.spawn.uid, vec![send_diagnostic()]);
    assert!(matches!(
        engine.repair(request).await,
        Err(RepairError::Apply(ApplyError::RepositoryHalted(_)))
    ));
}
