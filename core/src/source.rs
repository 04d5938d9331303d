//! Collaborator contracts for data the engine reads but does not own.
//!
//! Raw records and consent preferences belong to the platform. The
//! engine only asks the two questions below. `store::InsightsStore`
//! implements both over SQLite.

use crate::{
    error::EngineResult,
    record::{RecordFilter, SourceRecord},
    types::SubjectId,
};
use std::collections::BTreeSet;

pub trait RecordSource: Send + Sync {
    /// Distinct subjects with at least one record matching `filter`.
    fn subjects_matching(&self, filter: &RecordFilter) -> EngineResult<BTreeSet<SubjectId>>;

    /// Records matching `filter` whose subject is in `subjects`.
    /// Nothing outside `subjects` may be returned.
    fn records_for(
        &self,
        filter: &RecordFilter,
        subjects: &BTreeSet<SubjectId>,
    ) -> EngineResult<Vec<SourceRecord>>;
}

pub trait ConsentSource: Send + Sync {
    /// Every subject currently opted in to analytics.
    fn opted_in_subjects(&self) -> EngineResult<BTreeSet<SubjectId>>;

    /// Every subject the preference store knows about.
    fn known_subject_count(&self) -> EngineResult<usize>;
}
