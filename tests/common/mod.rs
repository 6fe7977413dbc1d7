
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use mend_core::sqlite::SqliteInterfaceStore;
use mend_core::store::InterfaceStore;
use mend_core::types::{Diagnostic, Edge, EdgeKind, GenericParam, InterfaceNode, NodeKind};
use mend_repair::services::{
    BuildContext, BuildService, Escalation, Reasoner, ReasonerReply, StageReport, TypeCheckService,
};
use mend_repair::types::ServiceError;
use mend_repair::{FileEdit, HoldReport, ReviewDecision, Services};
use mend_retrieve::ContextBundle;

pub const RUNTIME_PATH: &str = "src/runtime.rs";
pub const RUNTIME: &str = "pub fn spawn<F>(future: F) {\n    drop(future);\n}\n";

/// Route engine logs to the test harness; `RUST_LOG` picks the level.
#[allow(dead_code)]
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Create a repository from `(relative_path, content)` pairs.
///
/// Returns (TempDir, repo_root). Hold the TempDir to keep the directory alive.
#[allow(dead_code)]
pub fn create_repo(files: &[(&str, &str)]) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    for (path, content) in files {
        let full_path = dir.path().join(path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&full_path, content).unwrap();
    }
    let root = dir.path().to_path_buf();
    (dir, root)
}

#[allow(dead_code)]
pub fn in_memory_store() -> Arc<SqliteInterfaceStore> {
    Arc::new(SqliteInterfaceStore::in_memory().expect("Failed to create in-memory SqliteInterfaceStore"))
}

#[allow(dead_code)]
pub fn function(module: &str, name: &str, signature: &str) -> InterfaceNode {
    InterfaceNode::new(NodeKind::Function, module, name, signature)
}

/// `runtime::spawn` with its caller and a test, as the indexer would emit them.
#[allow(dead_code)]
pub struct RuntimeGraph {
    pub spawn: InterfaceNode,
    pub run: InterfaceNode,
    pub test: InterfaceNode,
}

#[allow(dead_code)]
pub fn seed_runtime_graph(store: &SqliteInterfaceStore) -> RuntimeGraph {
    let spawn = function("runtime", "spawn", "pub fn spawn<F>(future: F)")
        .with_generic(GenericParam::ty("F"))
        .with_location(RUNTIME_PATH, 1, 3);
    let run = function("runtime", "run", "pub fn run()");
    let test = InterfaceNode::new(NodeKind::Test, "runtime::tests", "spawn_runs", "fn spawn_runs()");
    for node in [&spawn, &run, &test] {
        store.upsert_node(node.clone()).unwrap();
    }
    store.upsert_edge(Edge::new(&run.uid, &spawn.uid, EdgeKind::Calls)).unwrap();
    store.upsert_edge(Edge::new(&test.uid, &spawn.uid, EdgeKind::Calls)).unwrap();
    RuntimeGraph { spawn, run, test }
}

/// rustc's E0277 for a spawned future that is not `Send`.
#[allow(dead_code)]
pub fn send_diagnostic() -> Diagnostic {
    Diagnostic::error(Some("E0277"), "future cannot be sent between threads safely")
}

/// A future that is neither `Send` nor shared safely: both
/// `async_spawn_send` and `shared_state_sync` apply.
#[allow(dead_code)]
pub fn ambiguous_diagnostics() -> Vec<Diagnostic> {
    vec![
        Diagnostic::error(
            Some("E0277"),
            "`F` cannot be sent between threads safely\nnote: required by a bound in `spawn`",
        ),
        Diagnostic::error(Some("E0277"), "`F` cannot be shared between threads safely"),
    ]
}

/// One build-service call as seen by the mock.
#[derive(Debug, Clone)]
pub struct ToolchainCall {
    pub candidate_id: String,
    pub stage: &'static str,
    /// Shadow copy of `src/runtime.rs` at the time of the call.
    pub source: String,
}

/// Type checker and build service driven by markers in `src/runtime.rs`.
#[derive(Default)]
pub struct MockToolchain {
    /// Overlay text that draws a type-check warning.
    pub warn_on: Option<&'static str>,
    /// Shadow source containing any of these fails compilation.
    pub fail_compile_on: Vec<&'static str>,
    /// Shadow source containing the marker stalls in format check.
    pub slow_format_on: Option<(&'static str, Duration)>,
    pub calls: Mutex<Vec<ToolchainCall>>,
}

#[allow(dead_code)]
impl MockToolchain {
    pub fn calls(&self) -> Vec<ToolchainCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn stages_for(&self, candidate_id: &str) -> Vec<&'static str> {
        self.calls()
            .into_iter()
            .filter(|c| c.candidate_id == candidate_id)
            .map(|c| c.stage)
            .collect()
    }

    fn record(&self, ctx: &BuildContext<'_>, stage: &'static str) -> String {
        let source = fs::read_to_string(ctx.workspace.join(RUNTIME_PATH)).unwrap_or_default();
        let candidate_id = ctx
            .cache_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.calls.lock().unwrap().push(ToolchainCall {
            candidate_id,
            stage,
            source: source.clone(),
        });
        source
    }
}

#[async_trait]
impl TypeCheckService for MockToolchain {
    async fn check_overlay(&self, _base: &Path, overlay: &[FileEdit]) -> Result<Vec<Diagnostic>, ServiceError> {
        match self.warn_on {
            Some(marker) if overlay.iter().any(|e| e.updated.contains(marker)) => {
                Ok(vec![Diagnostic::warning("bound is broader than the call sites need")])
            }
            _ => Ok(vec![]),
        }
    }
}

#[async_trait]
impl BuildService for MockToolchain {
    async fn format_check(&self, ctx: BuildContext<'_>) -> Result<StageReport, ServiceError> {
        let source = self.record(&ctx, "format");
        if let Some((marker, delay)) = self.slow_format_on {
            if source.contains(marker) {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(StageReport::pass())
    }

    async fn compile(&self, ctx: BuildContext<'_>) -> Result<StageReport, ServiceError> {
        let source = self.record(&ctx, "compile");
        if self.fail_compile_on.iter().any(|m| source.contains(m)) {
            let mut d = Diagnostic::error(Some("E0308"), "mismatched types");
            d.file = Some(RUNTIME_PATH.to_string());
            d.line = Some(1);
            return Ok(StageReport::fail(vec![d]));
        }
        Ok(StageReport::pass())
    }

    async fn run_tests(&self, ctx: BuildContext<'_>, _tests: &[String]) -> Result<StageReport, ServiceError> {
        self.record(&ctx, "tests");
        Ok(StageReport::pass())
    }
}

/// Escalation handler that records every report and answers with `decide`.
pub struct MockReviewer {
    decide: fn(&HoldReport) -> ReviewDecision,
    pub reports: Mutex<Vec<HoldReport>>,
}

#[allow(dead_code)]
impl MockReviewer {
    pub fn new(decide: fn(&HoldReport) -> ReviewDecision) -> Arc<Self> {
        Arc::new(Self {
            decide,
            reports: Mutex::new(Vec::new()),
        })
    }

    pub fn deferring() -> Arc<Self> {
        Self::new(|_| ReviewDecision::Defer)
    }

    pub fn reports(&self) -> Vec<HoldReport> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl Escalation for MockReviewer {
    async fn review(&self, report: &HoldReport) -> ReviewDecision {
        self.reports.lock().unwrap().push(report.clone());
        (self.decide)(report)
    }
}

/// Reasoner that always proposes the same diff and remembers its feedback.
pub struct ScriptedReasoner {
    pub diff: String,
    pub feedback: Mutex<Vec<Vec<Diagnostic>>>,
}

#[allow(dead_code)]
impl ScriptedReasoner {
    pub fn new(diff: &str) -> Arc<Self> {
        Arc::new(Self {
            diff: diff.to_string(),
            feedback: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn propose(&self, _bundle: &ContextBundle, feedback: &[Diagnostic]) -> Result<ReasonerReply, ServiceError> {
        self.feedback.lock().unwrap().push(feedback.to_vec());
        Ok(ReasonerReply::Diff(self.diff.clone()))
    }
}

#[allow(dead_code)]
pub fn services(
    toolchain: Arc<MockToolchain>,
    reviewer: Arc<MockReviewer>,
    reasoner: Option<Arc<ScriptedReasoner>>,
) -> Services {
    Services {
        type_check: toolchain.clone(),
        build: toolchain,
        reasoner: reasoner.map(|r| r as Arc<dyn Reasoner>),
        escalation: reviewer,
    }
}

#[allow(dead_code)]
pub fn read(root: &Path, path: &str) -> String {
    fs::read_to_string(root.join(path)).unwrap()
}
