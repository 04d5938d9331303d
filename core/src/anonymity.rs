//! k-anonymity enforcer.
//!
//! Groups smaller than k are dropped outright. They are not folded into
//! an "other" bucket: the bucket's size would still leak their existence.

use crate::{
    aggregate::{RawAggregate, RawGroup},
    types::K_THRESHOLD,
};

#[derive(Debug, Clone, PartialEq)]
pub struct SuppressionOutcome {
    pub released:          Vec<RawGroup>,
    pub suppressed_groups: usize,
    /// Smallest released group size; 0 when nothing was released.
    pub k_value:           usize,
    pub k_threshold:       usize,
}

impl SuppressionOutcome {
    /// True iff at least one group survived. Every survivor is ≥ k.
    pub fn k_anonymity_satisfied(&self) -> bool {
        !self.released.is_empty() && self.k_value >= self.k_threshold
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KAnonymityEnforcer {
    k_threshold: usize,
}

impl KAnonymityEnforcer {
    pub fn new(k_threshold: usize) -> Self {
        Self { k_threshold }
    }

    pub fn k_threshold(&self) -> usize {
        self.k_threshold
    }

    pub fn enforce(&self, aggregate: RawAggregate) -> SuppressionOutcome {
        let total = aggregate.groups.len();
        let released: Vec<RawGroup> = aggregate
            .groups
            .into_iter()
            .filter(|g| g.size() >= self.k_threshold)
            .collect();
        let suppressed_groups = total - released.len();
        let k_value = released.iter().map(RawGroup::size).min().unwrap_or(0);

        if suppressed_groups > 0 {
            log::debug!(
                "{}: suppressed {suppressed_groups} of {total} groups below k={}",
                aggregate.kind.name(),
                self.k_threshold
            );
        }

        SuppressionOutcome {
            released,
            suppressed_groups,
            k_value,
            k_threshold: self.k_threshold,
        }
    }
}

impl Default for KAnonymityEnforcer {
    fn default() -> Self {
        Self::new(K_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{GroupKey, QueryKind};

    fn group(label: &str, size: usize) -> RawGroup {
        let mut key = GroupKey::new();
        key.insert("severity", label.to_string());
        RawGroup {
            key,
            subjects: (0..size).map(|i| format!("{label}-{i}")).collect(),
            records: size,
        }
    }

    fn agg(groups: Vec<RawGroup>) -> RawAggregate {
        RawAggregate { kind: QueryKind::CaseDistribution, groups }
    }

    #[test]
    fn small_groups_are_dropped_not_merged() {
        let out = KAnonymityEnforcer::default().enforce(agg(vec![
            group("low", 12),
            group("high", 3),
            group("moderate", 5),
        ]));
        assert_eq!(out.released.len(), 2);
        assert_eq!(out.suppressed_groups, 1);
        assert_eq!(out.k_value, 5);
        assert!(out.k_anonymity_satisfied());
        assert!(out.released.iter().all(|g| g.key["severity"] != "high"));
    }

    #[test]
    fn total_suppression_is_not_satisfied() {
        let out = KAnonymityEnforcer::default().enforce(agg(vec![group("high", 3)]));
        assert!(out.released.is_empty());
        assert_eq!(out.k_value, 0);
        assert!(!out.k_anonymity_satisfied());
    }

    #[test]
    fn empty_aggregate_is_not_satisfied() {
        let out = KAnonymityEnforcer::default().enforce(agg(vec![]));
        assert!(!out.k_anonymity_satisfied());
    }
}
