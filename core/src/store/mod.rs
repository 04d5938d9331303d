//! SQLite persistence layer.
//!
//! RULE: Only the store module talks to the database.
//! Everything else calls store methods and never executes SQL itself.
//!
//! The connection sits behind a mutex so one store can be shared by
//! every concurrent request. Each method holds the lock for its own
//! statements only.

use crate::error::{EngineError, EngineResult};
use chrono::NaiveDate;
use rusqlite::Connection;
use std::sync::{Mutex, MutexGuard};

mod audit;
mod consent;
mod records;
mod report;

pub use report::ReportPage;

pub struct InsightsStore {
    conn: Mutex<Connection>,
}

impl InsightsStore {
    pub fn open(path: &str) -> EngineResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> EngineResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> EngineResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        conn.execute_batch(include_str!("../../../migrations/002_insights_report.sql"))?;
        conn.execute_batch(include_str!("../../../migrations/003_query_audit.sql"))?;
        Ok(())
    }

    fn conn(&self) -> EngineResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::PersistenceFailure("store connection lock poisoned".into()))
    }
}

// ── Column helpers ─────────────────────────────────────────────────

const DATE_FORMAT: &str = "%Y-%m-%d";

fn date_to_sql(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn date_from_sql(idx: usize, raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn bad_enum(idx: usize, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unexpected value '{raw}'").into(),
    )
}
