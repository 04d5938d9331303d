//! Append-only query audit log.

use super::InsightsStore;
use crate::{error::EngineResult, executor::QueryAuditEntry};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::params;

fn audit_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueryAuditEntry> {
    let executed_at: String = row.get(8)?;
    Ok(QueryAuditEntry {
        id: Some(row.get(0)?),
        query_name: row.get(1)?,
        requester_role: row.get(2)?,
        success: row.get::<_, i32>(3)? != 0,
        error_kind: row.get(4)?,
        epsilon_charged: row.get(5)?,
        delta_charged: row.get(6)?,
        budget_period: row.get(7)?,
        executed_at: DateTime::parse_from_rfc3339(&executed_at)
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    8,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?
            .with_timezone(&Utc),
    })
}

impl InsightsStore {
    // ── Query audit ────────────────────────────────────────────────

    pub fn append_query_audit(&self, e: &QueryAuditEntry) -> EngineResult<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO query_audit (
                query_name, requester_role, success, error_kind,
                epsilon_charged, delta_charged, budget_period, executed_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &e.query_name,
                &e.requester_role,
                if e.success { 1i32 } else { 0i32 },
                e.error_kind.as_deref(),
                e.epsilon_charged,
                e.delta_charged,
                &e.budget_period,
                e.executed_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest entries first.
    pub fn recent_query_audit(&self, limit: usize) -> EngineResult<Vec<QueryAuditEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, query_name, requester_role, success, error_kind,
                    epsilon_charged, delta_charged, budget_period, executed_at
             FROM query_audit ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit as i64], audit_row_mapper)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Total ε committed in one budget period, as recorded by the audit log.
    pub fn audited_epsilon(&self, budget_period: &str) -> EngineResult<f64> {
        Ok(self.conn()?.query_row(
            "SELECT COALESCE(SUM(epsilon_charged), 0.0) FROM query_audit
             WHERE budget_period = ?1 AND success = 1",
            params![budget_period],
            |row| row.get(0),
        )?)
    }

    pub fn query_audit_count(&self) -> EngineResult<i64> {
        Ok(self
            .conn()?
            .query_row("SELECT COUNT(*) FROM query_audit", [], |row| row.get(0))?)
    }
}
