use super::{bad_enum, date_from_sql, date_to_sql, InsightsStore};
use crate::{
    error::{EngineError, EngineResult},
    report::{InsightsReport, ReportType},
};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

const REPORT_COLUMNS: &str = "id, report_type, period_start, period_end, generated_at, summary,
     sentiment_data, trending_topics, assessment_count, high_risk_count";

/// One page of reports plus the total matching the type filter.
#[derive(Debug, Clone, Serialize)]
pub struct ReportPage {
    pub reports: Vec<InsightsReport>,
    pub total: u64,
}

fn json_column<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn report_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<InsightsReport> {
    let report_type: String = row.get(1)?;
    let period_start: String = row.get(2)?;
    let period_end: String = row.get(3)?;
    let generated_at: String = row.get(4)?;
    let sentiment_data: String = row.get(6)?;
    let trending_topics: String = row.get(7)?;
    Ok(InsightsReport {
        id: row.get(0)?,
        report_type: ReportType::parse(&report_type).ok_or_else(|| bad_enum(1, &report_type))?,
        period_start: date_from_sql(2, &period_start)?,
        period_end: date_from_sql(3, &period_end)?,
        generated_at: DateTime::parse_from_rfc3339(&generated_at)
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?
            .with_timezone(&Utc),
        summary: row.get(5)?,
        sentiment_data: json_column(6, &sentiment_data)?,
        trending_topics: json_column(7, &trending_topics)?,
        assessment_count: row.get::<_, i64>(8)? as u64,
        high_risk_count: row.get::<_, i64>(9)? as u64,
    })
}

impl InsightsStore {
    // ── Insights reports ───────────────────────────────────────────

    /// Insert a new report. Reports are immutable once written.
    pub fn create_report(&self, r: &InsightsReport) -> EngineResult<()> {
        let sentiment_data = serde_json::to_string(&r.sentiment_data)?;
        let trending_topics = serde_json::to_string(&r.trending_topics)?;
        self.conn()?
            .execute(
                &format!("INSERT INTO insights_report ({REPORT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
                params![
                    &r.id,
                    r.report_type.as_str(),
                    date_to_sql(r.period_start),
                    date_to_sql(r.period_end),
                    r.generated_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
                    &r.summary,
                    sentiment_data,
                    trending_topics,
                    r.assessment_count as i64,
                    r.high_risk_count as i64,
                ],
            )
            .map_err(|e| EngineError::PersistenceFailure(format!("insert report {}: {e}", r.id)))?;
        Ok(())
    }

    pub fn get_report(&self, id: &str) -> EngineResult<InsightsReport> {
        self.conn()?
            .query_row(
                &format!("SELECT {REPORT_COLUMNS} FROM insights_report WHERE id = ?1"),
                params![id],
                report_row_mapper,
            )
            .optional()?
            .ok_or_else(|| EngineError::ReportNotFound { id: id.to_string() })
    }

    /// Newest first; ties on generated_at break on id descending.
    pub fn list_reports(
        &self,
        report_type: Option<ReportType>,
        limit: u32,
        offset: u32,
    ) -> EngineResult<ReportPage> {
        let type_param = report_type.map(|t| t.as_str());
        let conn = self.conn()?;
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM insights_report WHERE (?1 IS NULL OR report_type = ?1)",
            params![type_param],
            |row| row.get(0),
        )?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {REPORT_COLUMNS} FROM insights_report
             WHERE (?1 IS NULL OR report_type = ?1)
             ORDER BY generated_at DESC, id DESC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let reports = stmt
            .query_map(params![type_param, limit as i64, offset as i64], report_row_mapper)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ReportPage {
            reports,
            total: total as u64,
        })
    }

    /// Most recent report of this type covering exactly [start, end].
    pub fn find_report_by_period(
        &self,
        report_type: ReportType,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> EngineResult<Option<InsightsReport>> {
        Ok(self
            .conn()?
            .query_row(
                &format!(
                    "SELECT {REPORT_COLUMNS} FROM insights_report
                     WHERE report_type = ?1 AND period_start = ?2 AND period_end = ?3
                     ORDER BY generated_at DESC, id DESC LIMIT 1"
                ),
                params![
                    report_type.as_str(),
                    date_to_sql(period_start),
                    date_to_sql(period_end)
                ],
                report_row_mapper,
            )
            .optional()?)
    }

    pub fn report_count(&self) -> EngineResult<i64> {
        Ok(self
            .conn()?
            .query_row("SELECT COUNT(*) FROM insights_report", [], |row| row.get(0))?)
    }
}
