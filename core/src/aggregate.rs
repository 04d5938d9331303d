//! Raw aggregation into grouped distinct-subject counts.
//!
//! A RawAggregate holds exact counts and lives only for the duration
//! of one request. It is never persisted and never returned as-is.

use crate::{
    catalog::{GroupKey, QueryKind},
    record::SourceRecord,
    types::SubjectId,
};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq)]
pub struct RawGroup {
    pub key:      GroupKey,
    pub subjects: BTreeSet<SubjectId>,
    /// Records that fell into this group (≥ subjects).
    pub records:  usize,
}

impl RawGroup {
    /// Distinct subjects represented. This is the k-anonymity group size
    /// and the statistic released for the group.
    pub fn size(&self) -> usize {
        self.subjects.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawAggregate {
    pub kind:   QueryKind,
    /// Sorted by group key.
    pub groups: Vec<RawGroup>,
}

/// Group `records` per the query's template, counting only subjects in
/// `consented`. Records from anyone else are skipped outright.
pub fn aggregate(
    kind: QueryKind,
    records: &[SourceRecord],
    consented: &BTreeSet<SubjectId>,
) -> RawAggregate {
    let mut groups: BTreeMap<GroupKey, RawGroup> = BTreeMap::new();
    let mut skipped = 0usize;

    for record in records {
        if !consented.contains(&record.subject_id) {
            skipped += 1;
            continue;
        }
        let Some(key) = kind.group_key(record) else {
            continue;
        };
        let group = groups.entry(key.clone()).or_insert_with(|| RawGroup {
            key,
            subjects: BTreeSet::new(),
            records: 0,
        });
        group.subjects.insert(record.subject_id.clone());
        group.records += 1;
    }

    if skipped > 0 {
        log::warn!(
            "{}: skipped {skipped} records from non-consented subjects",
            kind.name()
        );
    }

    RawAggregate {
        kind,
        groups: groups.into_values().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RecordKind, RiskLevel, Severity};
    use chrono::NaiveDate;

    fn assessment(id: &str, subject: &str, severity: Severity) -> SourceRecord {
        SourceRecord {
            record_id: id.into(),
            subject_id: subject.into(),
            kind: RecordKind::Assessment,
            occurred_on: NaiveDate::from_ymd_opt(2026, 10, 5).unwrap(),
            severity,
            risk_level: RiskLevel::Low,
            topic: None,
            sentiment: 0.0,
        }
    }

    #[test]
    fn counts_distinct_subjects_not_records() {
        let records = vec![
            assessment("a1", "s1", Severity::High),
            assessment("a2", "s1", Severity::High),
            assessment("a3", "s2", Severity::High),
        ];
        let consented: BTreeSet<_> = ["s1".to_string(), "s2".to_string()].into();
        let agg = aggregate(QueryKind::CaseDistribution, &records, &consented);
        assert_eq!(agg.groups.len(), 1);
        assert_eq!(agg.groups[0].size(), 2);
        assert_eq!(agg.groups[0].records, 3);
    }

    #[test]
    fn non_consented_subjects_never_count() {
        let records = vec![
            assessment("a1", "s1", Severity::Low),
            assessment("a2", "outsider", Severity::Low),
            assessment("a3", "outsider", Severity::Critical),
        ];
        let consented: BTreeSet<_> = ["s1".to_string()].into();
        let agg = aggregate(QueryKind::CaseDistribution, &records, &consented);
        assert_eq!(agg.groups.len(), 1);
        assert!(!agg.groups[0].subjects.contains("outsider"));
    }

    #[test]
    fn queries_ignore_other_record_kinds() {
        let mut convo = assessment("c1", "s1", Severity::Low);
        convo.kind = RecordKind::Conversation;
        let consented: BTreeSet<_> = ["s1".to_string()].into();
        let agg = aggregate(QueryKind::RiskFlagSummary, &[convo], &consented);
        assert!(agg.groups.is_empty());
    }
}
