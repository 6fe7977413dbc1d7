//! Append-only repair history stored next to the graph.
//!
//! Audit entries, validation results and pattern outcomes are only ever
//! inserted. Commits are updated once, to flag a rollback.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::sqlite::SqliteInterfaceStore;
use crate::store::{AuditAction, AuditEntry, CommitFile, CommitRecord, RepairLedger};
use crate::types::{Diagnostic, GraphError, StageStatus, ValidationResult, ValidationStage, Version};

const HALT_KEY: &str = "halt_reason";

/// Counts over the whole audit log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditSummary {
    pub total: u64,
    pub by_action: HashMap<String, u64>,
    pub avg_applied_confidence: Option<f64>,
}

fn row_to_audit(row: &rusqlite::Row) -> rusqlite::Result<(AuditEntry, String, String)> {
    let action: String = row.get("action")?;
    let validation: String = row.get("validation")?;
    Ok((
        AuditEntry {
            id: Some(row.get("id")?),
            version: Version(row.get::<_, i64>("version")? as u64),
            candidate_id: row.get("candidate_id")?,
            // placeholder, resolved by the caller
            action: AuditAction::Reject,
            confidence: row.get("confidence")?,
            validation: Vec::new(),
            rationale: row.get("rationale")?,
            recorded_at: Some(row.get("recorded_at")?),
        },
        action,
        validation,
    ))
}

fn query_audit(conn: &Connection, sql: &str, key: &dyn rusqlite::ToSql) -> Result<Vec<AuditEntry>, GraphError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![key], row_to_audit)?;
    let mut entries = Vec::new();
    for row in rows {
        let (mut entry, action, validation) = row?;
        entry.action = AuditAction::parse(&action)
            .ok_or_else(|| GraphError::Internal(format!("unknown audit action: {action}")))?;
        entry.validation = serde_json::from_str(&validation)?;
        entries.push(entry);
    }
    Ok(entries)
}

impl SqliteInterfaceStore {
    pub fn audit_summary(&self) -> Result<AuditSummary, GraphError> {
        let conn = self.lock_conn()?;
        let total: u64 = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |r| r.get(0))?;
        let mut stmt = conn.prepare("SELECT action, COUNT(*) FROM audit_log GROUP BY action")?;
        let mut by_action = HashMap::new();
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))?;
        for row in rows {
            let (action, count) = row?;
            by_action.insert(action, count);
        }
        let avg_applied_confidence: Option<f64> = conn.query_row(
            "SELECT AVG(confidence) FROM audit_log WHERE action = 'apply'",
            [],
            |r| r.get(0),
        )?;
        Ok(AuditSummary {
            total,
            by_action,
            avg_applied_confidence,
        })
    }
}

impl RepairLedger for SqliteInterfaceStore {
    fn append_audit(&self, entry: &AuditEntry) -> Result<i64, GraphError> {
        let conn = self.lock_conn()?;
        let validation = serde_json::to_string(&entry.validation)?;
        conn.execute(
            "INSERT INTO audit_log (version, candidate_id, action, confidence, validation, rationale)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.version.0 as i64,
                entry.candidate_id,
                entry.action.as_str(),
                entry.confidence,
                validation,
                entry.rationale,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn audit_for_candidate(&self, candidate_id: &str) -> Result<Vec<AuditEntry>, GraphError> {
        let conn = self.lock_conn()?;
        query_audit(
            &conn,
            "SELECT * FROM audit_log WHERE candidate_id = ?1 ORDER BY id",
            &candidate_id,
        )
    }

    fn audit_for_version(&self, version: Version) -> Result<Vec<AuditEntry>, GraphError> {
        let conn = self.lock_conn()?;
        query_audit(
            &conn,
            "SELECT * FROM audit_log WHERE version = ?1 ORDER BY id",
            &(version.0 as i64),
        )
    }

    fn append_validation(&self, result: &ValidationResult) -> Result<(), GraphError> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO validation_results (candidate_id, stage, status, diagnostics, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                result.candidate_id,
                result.stage.as_str(),
                result.status.as_str(),
                serde_json::to_string(&result.diagnostics)?,
                result.duration_ms as i64,
            ],
        )?;
        Ok(())
    }

    fn validation_results(&self, candidate_id: &str) -> Result<Vec<ValidationResult>, GraphError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT stage, status, diagnostics, duration_ms FROM validation_results
             WHERE candidate_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![candidate_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        let mut results = Vec::new();
        for row in rows {
            let (stage, status, diagnostics, duration_ms) = row?;
            let diagnostics: Vec<Diagnostic> = serde_json::from_str(&diagnostics)?;
            results.push(ValidationResult {
                candidate_id: candidate_id.to_string(),
                stage: ValidationStage::parse(&stage)
                    .ok_or_else(|| GraphError::Internal(format!("unknown stage: {stage}")))?,
                status: StageStatus::parse(&status)
                    .ok_or_else(|| GraphError::Internal(format!("unknown status: {status}")))?,
                diagnostics,
                duration_ms: duration_ms as u64,
            });
        }
        Ok(results)
    }

    fn record_pattern_outcome(&self, pattern_id: &str, success: bool, success_rate: f64) -> Result<(), GraphError> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO pattern_outcomes (pattern_id, success, success_rate) VALUES (?1, ?2, ?3)",
            params![pattern_id, success as i32, success_rate],
        )?;
        Ok(())
    }

    fn pattern_success_rates(&self) -> Result<HashMap<String, f64>, GraphError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT p.pattern_id, p.success_rate FROM pattern_outcomes p
             WHERE p.id = (SELECT MAX(id) FROM pattern_outcomes q WHERE q.pattern_id = p.pattern_id)",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?;
        let mut rates = HashMap::new();
        for row in rows {
            let (id, rate) = row?;
            rates.insert(id, rate);
        }
        Ok(rates)
    }

    fn record_commit(&self, record: &CommitRecord) -> Result<(), GraphError> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO commits (commit_id, candidate_id, pre_version, post_version, rolled_back)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.commit_id,
                record.candidate_id,
                record.pre_version.0 as i64,
                record.post_version.0 as i64,
                record.rolled_back as i32,
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO commit_files (commit_id, path, before, after) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for file in &record.files {
                stmt.execute(params![record.commit_id, file.path, file.before, file.after])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn commit_record(&self, commit_id: &str) -> Result<Option<CommitRecord>, GraphError> {
        let conn = self.lock_conn()?;
        let head = conn
            .query_row(
                "SELECT candidate_id, pre_version, post_version, rolled_back FROM commits WHERE commit_id = ?1",
                params![commit_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i32>(3)? != 0,
                    ))
                },
            )
            .optional()?;
        let Some((candidate_id, pre, post, rolled_back)) = head else {
            return Ok(None);
        };
        let mut stmt = conn.prepare(
            "SELECT path, before, after FROM commit_files WHERE commit_id = ?1 ORDER BY path",
        )?;
        let files = stmt
            .query_map(params![commit_id], |row| {
                Ok(CommitFile {
                    path: row.get(0)?,
                    before: row.get(1)?,
                    after: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(CommitRecord {
            commit_id: commit_id.to_string(),
            candidate_id,
            pre_version: Version(pre as u64),
            post_version: Version(post as u64),
            files,
            rolled_back,
        }))
    }

    fn mark_rolled_back(&self, commit_id: &str) -> Result<(), GraphError> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE commits SET rolled_back = 1 WHERE commit_id = ?1",
            params![commit_id],
        )?;
        if updated == 0 {
            return Err(GraphError::Internal(format!("unknown commit: {commit_id}")));
        }
        Ok(())
    }

    fn stage_candidate(&self, candidate_id: &str, payload: &str) -> Result<(), GraphError> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO staged_candidates (candidate_id, payload) VALUES (?1, ?2)
             ON CONFLICT(candidate_id) DO UPDATE SET payload = excluded.payload",
            params![candidate_id, payload],
        )?;
        Ok(())
    }

    fn staged_candidates(&self) -> Result<Vec<(String, String)>, GraphError> {
        let conn = self.lock_conn()?;
        let mut stmt =
            conn.prepare("SELECT candidate_id, payload FROM staged_candidates ORDER BY candidate_id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn clear_staged(&self, candidate_id: &str) -> Result<(), GraphError> {
        let conn = self.lock_conn()?;
        conn.execute(
            "DELETE FROM staged_candidates WHERE candidate_id = ?1",
            params![candidate_id],
        )?;
        Ok(())
    }

    fn halt_reason(&self) -> Option<String> {
        let conn = self.lock_conn().ok()?;
        conn.query_row(
            "SELECT value FROM mend_meta WHERE key = ?1",
            params![HALT_KEY],
            |row| row.get(0),
        )
        .optional()
        .ok()
        .flatten()
    }

    fn set_halt(&self, reason: &str) -> Result<(), GraphError> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO mend_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![HALT_KEY, reason],
        )?;
        Ok(())
    }

    fn clear_halt(&self) -> Result<(), GraphError> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM mend_meta WHERE key = ?1", params![HALT_KEY])?;
        Ok(())
    }
}
