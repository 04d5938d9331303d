//! Consent preference queries.

use super::InsightsStore;
use crate::{error::EngineResult, source::ConsentSource, types::SubjectId};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::params;
use std::collections::BTreeSet;

impl InsightsStore {
    // ── Consent ────────────────────────────────────────────────────

    /// Upsert a subject's analytics preference. In production the platform
    /// owns these rows; tests and the runner's seeding path use this.
    pub fn set_consent(
        &self,
        subject_id: &str,
        opted_in: bool,
        at: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.conn()?.execute(
            "INSERT INTO consent (subject_id, opted_in, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(subject_id) DO UPDATE SET
                opted_in = excluded.opted_in,
                updated_at = excluded.updated_at",
            params![
                subject_id,
                if opted_in { 1i32 } else { 0i32 },
                at.to_rfc3339_opts(SecondsFormat::Secs, true),
            ],
        )?;
        Ok(())
    }
}

impl ConsentSource for InsightsStore {
    fn opted_in_subjects(&self) -> EngineResult<BTreeSet<SubjectId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT subject_id FROM consent WHERE opted_in = 1")?;
        let subjects = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(subjects)
    }

    fn known_subject_count(&self) -> EngineResult<usize> {
        let n: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM consent", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}
