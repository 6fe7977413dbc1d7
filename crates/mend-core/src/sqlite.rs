use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::config::{IndexPolicy, StoreConfig};
use crate::graph::{GraphDiff, GraphState};
use crate::types::{Edge, GraphError, InterfaceNode, Version};
use crate::vector::VectorIndex;

const SCHEMA_VERSION: u32 = 2;

/// SQLite-backed, versioned implementation of the InterfaceStore trait.
///
/// Every row carries the version that added it and, once superseded, the
/// version that removed it, so any past version can be reconstructed. The
/// head version is also held in memory as an immutable [`GraphState`] that
/// readers share through an `Arc`; a commit builds the next state on a copy
/// and swaps it in after the rows are durable.
pub struct SqliteInterfaceStore {
    /// Guards the connection. Holding it is the version-increment lock.
    pub(crate) conn: Mutex<Connection>,
    pub(crate) head: RwLock<Arc<GraphState>>,
    pub(crate) index: RwLock<VectorIndex>,
    pub(crate) settings: StoreConfig,
}

impl SqliteInterfaceStore {
    /// Open or create a store at the given path.
    pub fn open(path: &str) -> Result<Self, GraphError> {
        Self::open_with(path, StoreConfig::default())
    }

    pub fn open_with(path: &str, settings: StoreConfig) -> Result<Self, GraphError> {
        let conn = Connection::open(path)?;
        Self::set_performance_pragmas(&conn)?;
        Self::from_connection(conn, settings)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self, GraphError> {
        Self::in_memory_with(StoreConfig::default())
    }

    pub fn in_memory_with(settings: StoreConfig) -> Result<Self, GraphError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, settings)
    }

    fn from_connection(conn: Connection, settings: StoreConfig) -> Result<Self, GraphError> {
        initialize_schema(&conn)?;
        let head_version = read_head_version(&conn)?;
        let state = load_state(&conn, head_version)?;
        let mut index = VectorIndex::new(settings.embedding_dim);
        for node in state.nodes() {
            if let Some(embedding) = &node.embedding {
                index.insert(&node.uid, embedding)?;
            }
        }
        index.mark_synced(head_version);
        debug!(version = %head_version, nodes = state.node_count(), "store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            head: RwLock::new(Arc::new(state)),
            index: RwLock::new(index),
            settings,
        })
    }

    /// Apply SQLite performance pragmas for faster reads and writes.
    fn set_performance_pragmas(conn: &Connection) -> Result<(), GraphError> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -8000;
            PRAGMA temp_store = MEMORY;
            PRAGMA mmap_size = 268435456;
            ",
        )?;
        Ok(())
    }

    pub(crate) fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, GraphError> {
        self.conn
            .lock()
            .map_err(|_| GraphError::Internal("store connection lock poisoned".into()))
    }

    /// Get the current schema version.
    pub fn schema_version(&self) -> Result<u32, GraphError> {
        let conn = self.lock_conn()?;
        read_schema_version(&conn)
    }

    pub(crate) fn head_state(&self) -> Arc<GraphState> {
        match self.head.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Run `mutate` against a copy of the head state and publish the result
    /// as the next version. Returns the head version unchanged when the
    /// mutation leaves the graph identical.
    pub(crate) fn commit<R, F>(&self, reason: &str, mutate: F) -> Result<(Version, R), GraphError>
    where
        F: FnOnce(&mut GraphState) -> Result<R, GraphError>,
    {
        let mut conn = self.lock_conn()?;
        let current = self.head_state();
        let mut next = (*current).clone();
        let out = mutate(&mut next)?;

        let diff = GraphState::diff(&current, &next);
        if diff.is_empty() {
            return Ok((current.version(), out));
        }
        self.check_embeddings(&diff)?;

        let version = current.version().next();
        next.set_version(version);
        persist_diff(&mut conn, version, reason, &diff)?;
        self.sync_index(version, &diff, &next);

        match self.head.write() {
            Ok(mut guard) => *guard = Arc::new(next),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(next),
        }
        debug!(
            %version,
            reason,
            nodes = diff.upserted_nodes.len(),
            removed = diff.removed_nodes.len(),
            edges = diff.upserted_edges.len(),
            "commit"
        );
        Ok((version, out))
    }

    fn check_embeddings(&self, diff: &GraphDiff) -> Result<(), GraphError> {
        let index = self.read_index()?;
        let mut dim = index.dim();
        for node in &diff.upserted_nodes {
            if let Some(embedding) = &node.embedding {
                if dim == 0 {
                    dim = embedding.len();
                } else if embedding.len() != dim {
                    return Err(GraphError::DimensionMismatch {
                        expected: dim,
                        actual: embedding.len(),
                    });
                }
            }
        }
        Ok(())
    }

    fn sync_index(&self, version: Version, diff: &GraphDiff, next: &GraphState) {
        if self.settings.index_policy == IndexPolicy::Deferred {
            return;
        }
        let mut index = match self.index.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let previous = Version(version.0.saturating_sub(1));
        if index.synced() != previous {
            rebuild_index(&mut index, next);
        } else {
            for uid in &diff.removed_nodes {
                index.remove(uid);
            }
            for node in &diff.upserted_nodes {
                match &node.embedding {
                    Some(embedding) => {
                        if let Err(e) = index.insert(&node.uid, embedding) {
                            warn!(uid = %node.uid, error = %e, "vector index insert failed");
                        }
                    }
                    None => {
                        index.remove(&node.uid);
                    }
                }
            }
            if index.tombstone_ratio() > self.settings.compaction_ratio {
                index.compact();
            }
        }
        index.mark_synced(version);
    }

    pub(crate) fn read_index(&self) -> Result<std::sync::RwLockReadGuard<'_, VectorIndex>, GraphError> {
        self.index
            .read()
            .map_err(|_| GraphError::Internal("vector index lock poisoned".into()))
    }

    /// Bring the vector index up to the head version by rebuilding it.
    pub fn refresh_index(&self) -> Result<Version, GraphError> {
        let _conn = self.lock_conn()?;
        let state = self.head_state();
        let mut index = self
            .index
            .write()
            .map_err(|_| GraphError::Internal("vector index lock poisoned".into()))?;
        rebuild_index(&mut index, &state);
        index.mark_synced(state.version());
        info!(version = %state.version(), entries = index.len(), "vector index refreshed");
        Ok(state.version())
    }

    /// Reclaim tombstoned index entries. Also clears staleness.
    pub fn compact_index(&self) -> Result<usize, GraphError> {
        let _conn = self.lock_conn()?;
        let state = self.head_state();
        let mut index = self
            .index
            .write()
            .map_err(|_| GraphError::Internal("vector index lock poisoned".into()))?;
        if index.synced() == state.version() {
            index.compact();
        } else {
            rebuild_index(&mut index, &state);
            index.mark_synced(state.version());
        }
        Ok(index.len())
    }

    /// Version the vector index reflects.
    pub fn index_version(&self) -> Version {
        self.read_index().map(|i| i.synced()).unwrap_or_default()
    }

    /// Edges live at the head version whose endpoints are not live.
    /// Checked against the persisted rows, not the in-memory state.
    pub fn verify_integrity(&self) -> Result<Vec<Edge>, GraphError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT e.payload FROM edge_versions e
             WHERE e.version_removed IS NULL
               AND (NOT EXISTS (SELECT 1 FROM node_versions n
                                WHERE n.uid = e.source AND n.version_removed IS NULL)
                 OR NOT EXISTS (SELECT 1 FROM node_versions n
                                WHERE n.uid = e.target AND n.version_removed IS NULL))",
        )?;
        let payloads: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        let mut dangling = Vec::with_capacity(payloads.len());
        for p in payloads {
            dangling.push(serde_json::from_str(&p)?);
        }
        dangling.extend(self.head_state().dangling_edges());
        Ok(dangling)
    }

    /// All committed versions with their reason, oldest first.
    pub fn version_history(&self) -> Result<Vec<(Version, String)>, GraphError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT version, reason FROM versions ORDER BY version")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((Version(row.get::<_, i64>(0)? as u64), row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The live node that once carried `old_uid`, if any.
    pub fn resolve_previous_uid(&self, old_uid: &str) -> Result<Option<InterfaceNode>, GraphError> {
        let conn = self.lock_conn()?;
        let uid: Option<String> = conn
            .query_row(
                "SELECT uid FROM previous_uids WHERE previous_uid = ?1
                 ORDER BY version DESC LIMIT 1",
                params![old_uid],
                |row| row.get(0),
            )
            .optional()?;
        drop(conn);
        Ok(uid.and_then(|u| self.head_state().node(&u).cloned()))
    }

    pub(crate) fn load_version(&self, version: Version) -> Result<Arc<GraphState>, GraphError> {
        let head = self.head_state();
        if version == head.version() {
            return Ok(head);
        }
        if version > head.version() {
            return Err(GraphError::VersionNotFound(version));
        }
        let conn = self.lock_conn()?;
        Ok(Arc::new(load_state(&conn, version)?))
    }
}

fn rebuild_index(index: &mut VectorIndex, state: &GraphState) {
    index.clear();
    let mut nodes: Vec<&InterfaceNode> = state.nodes().filter(|n| n.embedding.is_some()).collect();
    nodes.sort_by(|a, b| a.uid.cmp(&b.uid));
    for node in nodes {
        if let Some(embedding) = &node.embedding {
            if let Err(e) = index.insert(&node.uid, embedding) {
                warn!(uid = %node.uid, error = %e, "vector index insert failed");
            }
        }
    }
}

fn initialize_schema(conn: &Connection) -> Result<(), GraphError> {
    conn.execute_batch(
        "
        -- Schema version tracking, head version, halt latch
        CREATE TABLE IF NOT EXISTS mend_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS versions (
            version INTEGER PRIMARY KEY,
            reason TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Node rows; a row is live for version_added <= v < version_removed
        CREATE TABLE IF NOT EXISTS node_versions (
            uid TEXT NOT NULL,
            version_added INTEGER NOT NULL,
            version_removed INTEGER,
            kind TEXT NOT NULL,
            module_path TEXT NOT NULL,
            name TEXT NOT NULL,
            payload TEXT NOT NULL,
            PRIMARY KEY (uid, version_added)
        );
        CREATE INDEX IF NOT EXISTS idx_node_versions_live ON node_versions(uid, version_removed);
        CREATE INDEX IF NOT EXISTS idx_node_versions_range ON node_versions(version_added, version_removed);

        CREATE TABLE IF NOT EXISTS edge_versions (
            source TEXT NOT NULL,
            target TEXT NOT NULL,
            kind TEXT NOT NULL,
            version_added INTEGER NOT NULL,
            version_removed INTEGER,
            payload TEXT NOT NULL,
            PRIMARY KEY (source, target, kind, version_added)
        );
        CREATE INDEX IF NOT EXISTS idx_edge_versions_live ON edge_versions(source, target, kind, version_removed);
        CREATE INDEX IF NOT EXISTS idx_edge_versions_range ON edge_versions(version_added, version_removed);

        -- Lineage for rename tracking
        CREATE TABLE IF NOT EXISTS previous_uids (
            uid TEXT NOT NULL,
            previous_uid TEXT NOT NULL,
            version INTEGER NOT NULL,
            PRIMARY KEY (uid, previous_uid)
        );
        CREATE INDEX IF NOT EXISTS idx_previous_uids_old ON previous_uids(previous_uid);

        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            candidate_id TEXT NOT NULL,
            action TEXT NOT NULL,
            confidence REAL,
            validation TEXT NOT NULL DEFAULT '[]',
            rationale TEXT NOT NULL,
            recorded_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_audit_candidate ON audit_log(candidate_id);
        CREATE INDEX IF NOT EXISTS idx_audit_version ON audit_log(version);

        CREATE TABLE IF NOT EXISTS validation_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            candidate_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('pass', 'fail', 'error')),
            diagnostics TEXT NOT NULL DEFAULT '[]',
            duration_ms INTEGER NOT NULL,
            recorded_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_validation_candidate ON validation_results(candidate_id);

        CREATE TABLE IF NOT EXISTS pattern_outcomes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pattern_id TEXT NOT NULL,
            success INTEGER NOT NULL,
            success_rate REAL NOT NULL,
            recorded_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_pattern_outcomes_pattern ON pattern_outcomes(pattern_id);

        CREATE TABLE IF NOT EXISTS commits (
            commit_id TEXT PRIMARY KEY,
            candidate_id TEXT NOT NULL,
            pre_version INTEGER NOT NULL,
            post_version INTEGER NOT NULL,
            rolled_back INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS commit_files (
            commit_id TEXT NOT NULL REFERENCES commits(commit_id) ON DELETE CASCADE,
            path TEXT NOT NULL,
            before TEXT,
            after TEXT NOT NULL,
            PRIMARY KEY (commit_id, path)
        );

        CREATE TABLE IF NOT EXISTS staged_candidates (
            candidate_id TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            staged_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;

    // New databases get the current version
    conn.execute(
        "INSERT OR IGNORE INTO mend_meta (key, value) VALUES ('schema_version', ?1)",
        params![SCHEMA_VERSION.to_string()],
    )?;
    run_migrations(conn)?;
    Ok(())
}

/// Run schema migrations from the stored version to SCHEMA_VERSION.
fn run_migrations(conn: &Connection) -> Result<(), GraphError> {
    let current = read_schema_version(conn)?;
    if current >= SCHEMA_VERSION {
        return Ok(());
    }
    if current < 2 {
        migrate_v1_to_v2(conn)?;
    }
    Ok(())
}

/// v2: lineage rows carry the version they were recorded at.
fn migrate_v1_to_v2(conn: &Connection) -> Result<(), GraphError> {
    match conn.execute_batch("ALTER TABLE previous_uids ADD COLUMN version INTEGER NOT NULL DEFAULT 0") {
        Ok(()) => {}
        // Fresh databases already carry the column
        Err(rusqlite::Error::SqliteFailure(_, Some(msg))) if msg.contains("duplicate column name") => {}
        Err(e) => return Err(e.into()),
    }
    conn.execute(
        "UPDATE mend_meta SET value = '2' WHERE key = 'schema_version'",
        [],
    )?;
    Ok(())
}

fn read_schema_version(conn: &Connection) -> Result<u32, GraphError> {
    let version: String = conn.query_row(
        "SELECT value FROM mend_meta WHERE key = 'schema_version'",
        [],
        |row| row.get(0),
    )?;
    version
        .parse()
        .map_err(|e| GraphError::Internal(format!("Invalid schema version: {}", e)))
}

fn read_head_version(conn: &Connection) -> Result<Version, GraphError> {
    let head: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM versions", [], |row| row.get(0))
        .optional()?
        .flatten();
    Ok(Version(head.unwrap_or(0) as u64))
}

/// Reconstruct the graph as of `version` from the versioned rows.
pub(crate) fn load_state(conn: &Connection, version: Version) -> Result<GraphState, GraphError> {
    if version != Version::ZERO {
        let exists: Option<i64> = conn
            .query_row(
                "SELECT version FROM versions WHERE version = ?1",
                params![version.0 as i64],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(GraphError::VersionNotFound(version));
        }
    }
    let v = version.0 as i64;

    let mut stmt = conn.prepare(
        "SELECT payload FROM node_versions
         WHERE version_added <= ?1 AND (version_removed IS NULL OR version_removed > ?1)",
    )?;
    let payloads: Vec<String> = stmt
        .query_map(params![v], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    let mut nodes: Vec<InterfaceNode> = Vec::with_capacity(payloads.len());
    for p in payloads {
        nodes.push(serde_json::from_str(&p)?);
    }

    let mut stmt = conn.prepare(
        "SELECT payload FROM edge_versions
         WHERE version_added <= ?1 AND (version_removed IS NULL OR version_removed > ?1)",
    )?;
    let payloads: Vec<String> = stmt
        .query_map(params![v], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    let mut edges: Vec<Edge> = Vec::with_capacity(payloads.len());
    for p in payloads {
        edges.push(serde_json::from_str(&p)?);
    }

    Ok(GraphState::from_parts(version, nodes, edges))
}

/// Write one version's diff in a single transaction.
fn persist_diff(
    conn: &mut Connection,
    version: Version,
    reason: &str,
    diff: &GraphDiff,
) -> Result<(), GraphError> {
    let v = version.0 as i64;
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO versions (version, reason) VALUES (?1, ?2)",
        params![v, reason],
    )?;
    {
        let mut close_node = tx.prepare(
            "UPDATE node_versions SET version_removed = ?1
             WHERE uid = ?2 AND version_removed IS NULL",
        )?;
        let mut insert_node = tx.prepare(
            "INSERT INTO node_versions (uid, version_added, version_removed, kind, module_path, name, payload)
             VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6)",
        )?;
        let mut insert_lineage = tx.prepare(
            "INSERT OR IGNORE INTO previous_uids (uid, previous_uid, version) VALUES (?1, ?2, ?3)",
        )?;
        for uid in &diff.removed_nodes {
            close_node.execute(params![v, uid])?;
        }
        for node in &diff.upserted_nodes {
            close_node.execute(params![v, node.uid])?;
            insert_node.execute(params![
                node.uid,
                v,
                node.kind.as_str(),
                node.module_path,
                node.name,
                serde_json::to_string(node)?,
            ])?;
            for prev in &node.previous_uids {
                insert_lineage.execute(params![node.uid, prev, v])?;
            }
        }

        let mut close_edge = tx.prepare(
            "UPDATE edge_versions SET version_removed = ?1
             WHERE source = ?2 AND target = ?3 AND kind = ?4 AND version_removed IS NULL",
        )?;
        let mut insert_edge = tx.prepare(
            "INSERT INTO edge_versions (source, target, kind, version_added, version_removed, payload)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5)",
        )?;
        for key in &diff.removed_edges {
            close_edge.execute(params![v, key.source, key.target, key.kind.as_str()])?;
        }
        for edge in &diff.upserted_edges {
            close_edge.execute(params![v, edge.source, edge.target, edge.kind.as_str()])?;
            insert_edge.execute(params![
                edge.source,
                edge.target,
                edge.kind.as_str(),
                v,
                serde_json::to_string(edge)?,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
#[path = "sqlite_tests.rs"]
mod tests;
