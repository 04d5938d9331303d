//! Consent registry: who may be counted.
//!
//! RULE: the executor filters through here before any aggregation.
//! A subject without a current opt-in never reaches a numerator,
//! a denominator, or a group-size check.

use crate::{error::EngineResult, source::ConsentSource, types::SubjectId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PopulationCounts {
    pub consented: usize,
    pub total:     usize,
}

#[derive(Clone)]
pub struct ConsentRegistry {
    source: Arc<dyn ConsentSource>,
}

impl ConsentRegistry {
    pub fn new(source: Arc<dyn ConsentSource>) -> Self {
        Self { source }
    }

    /// The subset of `subject_ids` that is opted in.
    pub fn filter_to_consented(
        &self,
        subject_ids: &BTreeSet<SubjectId>,
    ) -> EngineResult<BTreeSet<SubjectId>> {
        let opted_in = self.source.opted_in_subjects()?;
        let consented: BTreeSet<SubjectId> =
            subject_ids.intersection(&opted_in).cloned().collect();
        log::debug!(
            "consent filter kept {} of {} subjects",
            consented.len(),
            subject_ids.len()
        );
        Ok(consented)
    }

    pub fn is_eligible(&self, subject_id: &str) -> EngineResult<bool> {
        Ok(self.source.opted_in_subjects()?.contains(subject_id))
    }

    /// Consented is never reported above total, whatever the store says.
    pub fn population_counts(&self) -> EngineResult<PopulationCounts> {
        let consented = self.source.opted_in_subjects()?.len();
        let total = self.source.known_subject_count()?;
        Ok(PopulationCounts {
            consented: consented.min(total),
            total,
        })
    }
}
