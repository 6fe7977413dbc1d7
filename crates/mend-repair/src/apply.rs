//! Apply/Rollback Controller.
//!
//! A candidate reaches the working tree only with a full PreFlight pass and
//! an approval. Writes are journaled first so a crash mid-apply can be
//! undone on the next start, and every apply, failure and rollback lands in
//! the audit log.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use mend_core::graph::GraphState;
use mend_core::hash::content_hash;
use mend_core::store::{AuditAction, AuditEntry, CommitFile, CommitRecord, MendStore};
use mend_core::types::{
    Edge, EdgeDirection, EdgeKey, GenericOrigin, IndexBatch, InterfaceNode, NodeKind, Uid,
    ValidationResult, Version,
};

use crate::generator::with_lineage;
use crate::preflight::REQUIRED_STAGES;
use crate::types::{ApplyError, Candidate, CommitRef, GateDecision};
use crate::workspace::relative_path;

/// The repository files an apply writes to.
pub trait WorkingTree: Send + Sync {
    fn root(&self) -> &Path;

    /// `None` when the file does not exist.
    fn read(&self, path: &str) -> io::Result<Option<String>>;

    fn write(&self, path: &str, content: &str) -> io::Result<()>;

    fn remove(&self, path: &str) -> io::Result<()>;
}

/// The real repository on disk. Each write goes to a temporary sibling and
/// is renamed into place.
pub struct FsWorkingTree {
    root: PathBuf,
}

impl FsWorkingTree {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        Ok(self.root.join(relative_path(path)?))
    }
}

impl WorkingTree for FsWorkingTree {
    fn root(&self) -> &Path {
        &self.root
    }

    fn read(&self, path: &str) -> io::Result<Option<String>> {
        match std::fs::read_to_string(self.resolve(path)?) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&self, path: &str, content: &str) -> io::Result<()> {
        let dest = self.resolve(path)?;
        let parent = dest.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| e.error)?;
        Ok(())
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        match std::fs::remove_file(self.resolve(path)?) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Who allowed the apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum Approval {
    Gate {
        score: f64,
        threshold: f64,
        decision: GateDecision,
    },
    /// A human approved a held candidate.
    Reviewer { note: String },
}

impl Approval {
    pub fn confidence(&self) -> Option<f64> {
        match self {
            Approval::Gate { score, .. } => Some(*score),
            Approval::Reviewer { .. } => None,
        }
    }
}

/// What an apply must be shown before it writes anything.
#[derive(Debug, Clone)]
pub struct ApplyEvidence {
    pub validation: Vec<ValidationResult>,
    pub approval: Approval,
    /// Human-readable summary recorded in the audit log.
    pub rationale: String,
}

/// On-disk record of an apply in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ApplyJournal {
    commit_id: String,
    candidate_id: String,
    pre_version: Version,
    /// Set once the graph batch is committed.
    post_version: Option<Version>,
    files: Vec<CommitFile>,
}

pub struct ApplyController {
    store: Arc<dyn MendStore>,
    tree: Arc<dyn WorkingTree>,
    journal_dir: PathBuf,
}

impl ApplyController {
    pub fn new(store: Arc<dyn MendStore>, tree: Arc<dyn WorkingTree>, journal_dir: &Path) -> Self {
        Self {
            store,
            tree,
            journal_dir: journal_dir.to_path_buf(),
        }
    }

    /// Controller over the repository at `repo_root`, journaling under
    /// `.mend/journal`. Unfinished applies from an earlier run are undone first.
    pub fn open(store: Arc<dyn MendStore>, repo_root: &Path) -> Result<Self, ApplyError> {
        let tree: Arc<dyn WorkingTree> = Arc::new(FsWorkingTree::new(repo_root));
        let controller = Self::new(store, tree, &repo_root.join(".mend").join("journal"));
        let recovered = controller.recover()?;
        if recovered > 0 {
            warn!(count = recovered, "undid unfinished applies");
        }
        Ok(controller)
    }

    /// Write `candidate` to the working tree and commit its graph changes as
    /// one version. On any failure every written file is reverted.
    pub fn apply(&self, candidate: &Candidate, evidence: &ApplyEvidence) -> Result<CommitRef, ApplyError> {
        if let Some(reason) = self.store.halt_reason() {
            return Err(ApplyError::RepositoryHalted(reason));
        }
        check_validated(candidate, &evidence.validation)?;
        if let Approval::Gate {
            score,
            threshold,
            decision,
        } = &evidence.approval
        {
            if *decision != GateDecision::Proceed || score < threshold {
                return Err(ApplyError::ConfidenceBelowThreshold {
                    score: *score,
                    threshold: *threshold,
                });
            }
        }

        let files = self.snapshot_files(candidate)?;
        let pre_version = self.store.head_version();
        let commit_id = content_hash([
            ("\0candidate", candidate.id.as_str()),
            ("\0pre", pre_version.to_string().as_str()),
        ]);
        let mut journal = ApplyJournal {
            commit_id: commit_id.clone(),
            candidate_id: candidate.id.clone(),
            pre_version,
            post_version: None,
            files,
        };
        self.write_journal(&journal)
            .map_err(|e| self.fail(candidate, evidence, pre_version, format!("journal: {e}")))?;

        let mut written = 0;
        for file in &journal.files {
            if let Err(e) = self.tree.write(&file.path, &file.after) {
                return Err(self.undo(candidate, evidence, &journal, written, format!("write {}: {e}", file.path)));
            }
            written += 1;
        }

        let batch = graph_batch(candidate, &self.store.current());
        let report = match self.store.apply_batch(batch) {
            Ok(report) => report,
            Err(e) => return Err(self.undo(candidate, evidence, &journal, written, format!("graph commit: {e}"))),
        };
        journal.post_version = Some(report.version);
        if let Err(e) = self.write_journal(&journal) {
            return Err(self.undo(candidate, evidence, &journal, written, format!("journal: {e}")));
        }

        let record = CommitRecord {
            commit_id: commit_id.clone(),
            candidate_id: candidate.id.clone(),
            pre_version,
            post_version: report.version,
            files: journal.files.clone(),
            rolled_back: false,
        };
        if let Err(e) = self.store.record_commit(&record) {
            return Err(self.undo(candidate, evidence, &journal, written, format!("commit record: {e}")));
        }
        self.audit(&candidate.id, report.version, AuditAction::Apply, evidence);
        self.remove_journal(&commit_id);
        if let Err(e) = self.store.clear_staged(&candidate.id) {
            warn!(candidate = %candidate.id, error = %e, "failed to clear staged candidate");
        }

        info!(
            candidate = %candidate.id,
            commit = %commit_id,
            pre = %pre_version,
            post = %report.version,
            files = journal.files.len(),
            "candidate applied"
        );
        Ok(CommitRef {
            commit_id,
            candidate_id: candidate.id.clone(),
            pre_version,
            post_version: report.version,
        })
    }

    /// Restore the working tree and graph to their state before `commit`.
    /// Returns the version published by the restore.
    pub fn rollback(&self, commit: &CommitRef) -> Result<Version, ApplyError> {
        let record = self
            .store
            .commit_record(&commit.commit_id)?
            .ok_or_else(|| ApplyError::UnknownCommit(commit.commit_id.clone()))?;
        if record.rolled_back {
            info!(commit = %record.commit_id, "already rolled back");
            return Ok(self.store.head_version());
        }

        for file in &record.files {
            match self.tree.read(&file.path) {
                Ok(current) if current.as_deref() != Some(file.after.as_str()) => {
                    warn!(commit = %record.commit_id, path = %file.path, "file changed since apply; restoring anyway");
                }
                Err(e) => return Err(self.halt(&record.commit_id, format!("read {}: {e}", file.path))),
                _ => {}
            }
        }
        if let Err(reason) = self.restore_files(&record.files, record.files.len()) {
            return Err(self.halt(&record.commit_id, reason));
        }
        let version = match self.store.restore(record.pre_version) {
            Ok(version) => version,
            Err(e) => return Err(self.halt(&record.commit_id, format!("graph restore: {e}"))),
        };
        if let Err(e) = self.store.mark_rolled_back(&record.commit_id) {
            return Err(self.halt(&record.commit_id, format!("mark rolled back: {e}")));
        }

        let entry = AuditEntry {
            id: None,
            version,
            candidate_id: record.candidate_id.clone(),
            action: AuditAction::Rollback,
            confidence: None,
            validation: Vec::new(),
            rationale: format!("rolled back {} to {}", record.commit_id, record.pre_version),
            recorded_at: None,
        };
        if let Err(e) = self.store.append_audit(&entry) {
            warn!(commit = %record.commit_id, error = %e, "failed to record rollback");
        }
        info!(commit = %record.commit_id, restored = %record.pre_version, %version, "rolled back");
        Ok(version)
    }

    /// Undo every apply whose journal survived a crash. Returns how many
    /// were undone.
    pub fn recover(&self) -> Result<usize, ApplyError> {
        let entries = match std::fs::read_dir(&self.journal_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(self.halt("recovery", format!("read journal dir: {e}"))),
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().map_or(false, |ext| ext == "json"))
            .collect();
        paths.sort();

        let mut undone = 0;
        for path in paths {
            let journal: ApplyJournal = match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|raw| serde_json::from_str(&raw).map_err(|e| e.to_string()))
            {
                Ok(journal) => journal,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable apply journal skipped");
                    continue;
                }
            };
            if self.store.commit_record(&journal.commit_id)?.is_some() {
                self.remove_journal(&journal.commit_id);
                continue;
            }
            if let Err(reason) = self.restore_files(&journal.files, journal.files.len()) {
                return Err(self.halt(&journal.commit_id, reason));
            }
            if matches!(journal.post_version, Some(post) if post != journal.pre_version) {
                if let Err(e) = self.store.restore(journal.pre_version) {
                    return Err(self.halt(&journal.commit_id, format!("graph restore: {e}")));
                }
            }
            self.remove_journal(&journal.commit_id);
            warn!(candidate = %journal.candidate_id, commit = %journal.commit_id, "unfinished apply undone");
            undone += 1;
        }
        Ok(undone)
    }

    /// Current contents of every edited file, refusing if any has drifted
    /// from what the candidate was generated against.
    fn snapshot_files(&self, candidate: &Candidate) -> Result<Vec<CommitFile>, ApplyError> {
        let mut files = Vec::with_capacity(candidate.edits.len());
        for edit in &candidate.edits {
            let current = self.tree.read(&edit.path).map_err(|e| ApplyError::ApplyFailure {
                candidate: candidate.id.clone(),
                reason: format!("read {}: {e}", edit.path),
            })?;
            if current.as_deref().unwrap_or("") != edit.original {
                return Err(ApplyError::ApplyFailure {
                    candidate: candidate.id.clone(),
                    reason: format!("{} changed since the candidate was generated", edit.path),
                });
            }
            files.push(CommitFile {
                path: edit.path.clone(),
                before: current,
                after: edit.updated.clone(),
            });
        }
        Ok(files)
    }

    /// Put back the `before` contents of the first `count` files.
    fn restore_files(&self, files: &[CommitFile], count: usize) -> Result<(), String> {
        for file in files.iter().take(count).rev() {
            let restored = match &file.before {
                Some(before) => self.tree.write(&file.path, before),
                None => self.tree.remove(&file.path),
            };
            restored.map_err(|e| format!("restore {}: {e}", file.path))?;
        }
        Ok(())
    }

    /// Revert a partial apply and report it. A failed revert halts the repository.
    fn undo(
        &self,
        candidate: &Candidate,
        evidence: &ApplyEvidence,
        journal: &ApplyJournal,
        written: usize,
        reason: String,
    ) -> ApplyError {
        warn!(candidate = %candidate.id, %reason, "apply failed; reverting");
        if let Err(revert) = self.restore_files(&journal.files, written) {
            return self.halt(&journal.commit_id, format!("{reason}; revert: {revert}"));
        }
        if let Some(post) = journal.post_version {
            if post != journal.pre_version {
                if let Err(e) = self.store.restore(journal.pre_version) {
                    return self.halt(&journal.commit_id, format!("{reason}; graph restore: {e}"));
                }
            }
        }
        self.remove_journal(&journal.commit_id);
        self.fail(candidate, evidence, journal.pre_version, reason)
    }

    fn fail(&self, candidate: &Candidate, evidence: &ApplyEvidence, version: Version, reason: String) -> ApplyError {
        let failed = ApplyEvidence {
            rationale: format!("{}; apply failed: {reason}", evidence.rationale),
            ..evidence.clone()
        };
        self.audit(&candidate.id, version, AuditAction::ApplyFailed, &failed);
        ApplyError::ApplyFailure {
            candidate: candidate.id.clone(),
            reason,
        }
    }

    /// Latch the repository halt and surface a `RollbackFailure`.
    fn halt(&self, commit: &str, reason: String) -> ApplyError {
        error!(
            commit,
            %reason,
            journal = %self.journal_dir.display(),
            "rollback failed; automated apply halted until cleared"
        );
        if let Err(e) = self.store.set_halt(&format!("rollback of {commit} failed: {reason}")) {
            error!(commit, error = %e, "failed to persist halt flag");
        }
        ApplyError::RollbackFailure {
            commit: commit.to_string(),
            reason,
        }
    }

    fn audit(&self, candidate_id: &str, version: Version, action: AuditAction, evidence: &ApplyEvidence) {
        let entry = AuditEntry {
            id: None,
            version,
            candidate_id: candidate_id.to_string(),
            action,
            confidence: evidence.approval.confidence(),
            validation: evidence.validation.clone(),
            rationale: evidence.rationale.clone(),
            recorded_at: None,
        };
        if let Err(e) = self.store.append_audit(&entry) {
            warn!(candidate = candidate_id, action = action.as_str(), error = %e, "failed to append audit entry");
        }
    }

    fn journal_path(&self, commit_id: &str) -> PathBuf {
        self.journal_dir.join(format!("{commit_id}.json"))
    }

    fn write_journal(&self, journal: &ApplyJournal) -> io::Result<()> {
        std::fs::create_dir_all(&self.journal_dir)?;
        let json = serde_json::to_string_pretty(journal).map_err(io::Error::other)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.journal_dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.journal_path(&journal.commit_id)).map_err(|e| e.error)?;
        Ok(())
    }

    fn remove_journal(&self, commit_id: &str) {
        if let Err(e) = std::fs::remove_file(self.journal_path(commit_id)) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(commit = commit_id, error = %e, "failed to remove apply journal");
            }
        }
    }
}

fn check_validated(candidate: &Candidate, validation: &[ValidationResult]) -> Result<(), ApplyError> {
    let own: Vec<&ValidationResult> = validation
        .iter()
        .filter(|r| r.candidate_id == candidate.id)
        .collect();
    let complete = !own.is_empty()
        && own.iter().all(|r| r.passed())
        && REQUIRED_STAGES
            .iter()
            .all(|stage| own.iter().any(|r| r.stage == *stage));
    if complete {
        Ok(())
    } else {
        Err(ApplyError::NotValidated {
            candidate: candidate.id.clone(),
        })
    }
}

/// Graph changes implied by `candidate` against `state`: each touched node
/// is replaced by its predicted form, children of a re-signed impl move to
/// the new impl, and every edge of a replaced node is carried over.
pub fn graph_batch(candidate: &Candidate, state: &GraphState) -> IndexBatch {
    let mut replaced: BTreeMap<Uid, InterfaceNode> = BTreeMap::new();
    for (old, new) in candidate.touched.iter().zip(&candidate.predicted) {
        if state.contains(old) {
            replaced.insert(old.clone(), new.clone());
        }
    }

    let moved_impls: Vec<(Uid, InterfaceNode)> = replaced
        .iter()
        .filter(|(old, new)| new.kind == NodeKind::Impl && new.uid != **old)
        .map(|(old, new)| (old.clone(), new.clone()))
        .collect();
    for (old_impl, new_impl) in &moved_impls {
        let children: Vec<InterfaceNode> = state
            .nodes()
            .filter(|n| n.owner.as_deref() == Some(old_impl.as_str()) && !replaced.contains_key(&n.uid))
            .cloned()
            .collect();
        for child in children {
            let moved = with_lineage(reown_child(&child, new_impl), &child);
            replaced.insert(child.uid.clone(), moved);
        }
    }

    let renames: HashMap<&str, &str> = replaced
        .iter()
        .map(|(old, new)| (old.as_str(), new.uid.as_str()))
        .collect();
    let rename = |uid: &str| renames.get(uid).map_or_else(|| uid.to_string(), |u| u.to_string());

    let mut edges: BTreeMap<EdgeKey, Edge> = BTreeMap::new();
    for old in replaced.keys() {
        for edge in state.edges_of(old, EdgeDirection::Both) {
            let moved = Edge {
                source: rename(&edge.source),
                target: rename(&edge.target),
                ..edge
            };
            edges.insert(moved.key(), moved);
        }
    }

    let removed: Vec<Uid> = replaced
        .iter()
        .filter(|(old, new)| new.uid != **old)
        .map(|(old, _)| old.clone())
        .collect();
    let mut nodes: Vec<InterfaceNode> = replaced.into_values().collect();
    nodes.sort_by(|a, b| a.uid.cmp(&b.uid));

    IndexBatch {
        nodes,
        edges: edges.into_values().collect(),
        removed,
    }
}

/// `child` owned by `new_impl`, with impl generics taking the new impl's bounds.
fn reown_child(child: &InterfaceNode, new_impl: &InterfaceNode) -> InterfaceNode {
    let mut out = child.clone();
    for generic in out.generics.iter_mut().filter(|g| g.origin == GenericOrigin::Impl) {
        if let Some(from) = new_impl.generic(&generic.name) {
            for bound in &from.bounds {
                if !generic.bounds.contains(bound) {
                    generic.bounds.push(bound.clone());
                }
            }
        }
    }
    out.owner = Some(new_impl.uid.clone());
    out.refresh_uid();
    out
}

#[cfg(test)]
#[path = "apply_tests.rs"]
mod tests;
