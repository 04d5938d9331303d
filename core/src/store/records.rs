//! Raw record queries. The platform writes these rows; the engine reads them.

use super::{bad_enum, date_from_sql, date_to_sql, InsightsStore};
use crate::{
    error::EngineResult,
    record::{RecordFilter, RecordKind, RiskLevel, Severity, SourceRecord},
    source::RecordSource,
    types::SubjectId,
};
use rusqlite::params;
use std::collections::BTreeSet;

const RECORD_FILTER_SQL: &str = "(?1 IS NULL OR kind = ?1)
               AND (?2 IS NULL OR occurred_on >= ?2)
               AND (?3 IS NULL OR occurred_on <= ?3)
               AND (?4 IS NULL OR severity = ?4)";

fn record_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<SourceRecord> {
    let kind: String = row.get(2)?;
    let occurred_on: String = row.get(3)?;
    let severity: String = row.get(4)?;
    let risk_level: String = row.get(5)?;
    Ok(SourceRecord {
        record_id: row.get(0)?,
        subject_id: row.get(1)?,
        kind: RecordKind::parse(&kind).ok_or_else(|| bad_enum(2, &kind))?,
        occurred_on: date_from_sql(3, &occurred_on)?,
        severity: Severity::parse(&severity).ok_or_else(|| bad_enum(4, &severity))?,
        risk_level: RiskLevel::parse(&risk_level).ok_or_else(|| bad_enum(5, &risk_level))?,
        topic: row.get(6)?,
        sentiment: row.get(7)?,
    })
}

fn filter_params(filter: &RecordFilter) -> (Option<&'static str>, Option<String>, Option<String>, Option<&'static str>) {
    (
        filter.kind.map(|k| k.as_str()),
        filter.start_date.map(date_to_sql),
        filter.end_date.map(date_to_sql),
        filter.severity.map(|s| s.as_str()),
    )
}

impl InsightsStore {
    // ── Source records ─────────────────────────────────────────────

    /// Bulk insert inside one transaction.
    pub fn insert_source_records(&self, records: &[SourceRecord]) -> EngineResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO source_record (
                    record_id, subject_id, kind, occurred_on, severity, risk_level, topic, sentiment
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for r in records {
                stmt.execute(params![
                    &r.record_id,
                    &r.subject_id,
                    r.kind.as_str(),
                    date_to_sql(r.occurred_on),
                    r.severity.as_str(),
                    r.risk_level.as_str(),
                    r.topic.as_deref(),
                    r.sentiment,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn source_record_count(&self) -> EngineResult<i64> {
        Ok(self
            .conn()?
            .query_row("SELECT COUNT(*) FROM source_record", [], |row| row.get(0))?)
    }
}

impl RecordSource for InsightsStore {
    fn subjects_matching(&self, filter: &RecordFilter) -> EngineResult<BTreeSet<SubjectId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT subject_id FROM source_record WHERE {RECORD_FILTER_SQL}"
        ))?;
        let (kind, start, end, severity) = filter_params(filter);
        let subjects = stmt
            .query_map(params![kind, start, end, severity], |row| row.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(subjects)
    }

    fn records_for(
        &self,
        filter: &RecordFilter,
        subjects: &BTreeSet<SubjectId>,
    ) -> EngineResult<Vec<SourceRecord>> {
        if subjects.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT record_id, subject_id, kind, occurred_on, severity, risk_level, topic, sentiment
             FROM source_record WHERE {RECORD_FILTER_SQL}
             ORDER BY record_id ASC"
        ))?;
        let (kind, start, end, severity) = filter_params(filter);
        let mut records = Vec::new();
        for row in stmt.query_map(params![kind, start, end, severity], record_row_mapper)? {
            let record = row?;
            if subjects.contains(&record.subject_id) && filter.matches(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }
}
