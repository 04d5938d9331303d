//! Deterministic synthetic population for local runs and demos.
//!
//! Same seed, same subjects, same records. Never used on real data:
//! the runner only calls this when asked to with --demo-subjects.

use crate::{
    error::EngineResult,
    record::{RecordKind, RiskLevel, Severity, SourceRecord},
    rng::{NoiseRng, NoiseSource},
    store::InsightsStore,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;

const TOPICS: &[&str] = &[
    "Sleep", "Anxiety", "Work stress", "Relationships", "Exercise",
    "Loneliness", "Family", "Finances", "Grief", "Motivation",
];

/// Cumulative weights out of 100: low 40, moderate 35, high 18, critical 7.
const SEVERITY_WEIGHTS: [(u64, Severity); 4] = [
    (40, Severity::Low),
    (75, Severity::Moderate),
    (93, Severity::High),
    (100, Severity::Critical),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DemoPopulation {
    pub subjects: usize,
    pub opted_in: usize,
    pub records: usize,
}

fn pick_severity(rng: &mut NoiseRng) -> Severity {
    let roll = rng.next_u64_below(100);
    SEVERITY_WEIGHTS
        .iter()
        .find(|(upper, _)| roll < *upper)
        .map(|(_, s)| *s)
        .unwrap_or(Severity::Low)
}

fn risk_for(rng: &mut NoiseRng, severity: Severity) -> RiskLevel {
    // Risk tracks severity most of the time.
    if rng.chance(0.7) {
        return RiskLevel::parse(severity.as_str()).unwrap_or(RiskLevel::Low);
    }
    let all = [RiskLevel::Low, RiskLevel::Moderate, RiskLevel::High, RiskLevel::Critical];
    all[rng.next_u64_below(all.len() as u64) as usize]
}

/// Insert `subjects` synthetic subjects with records spread over
/// `days` days starting at `start`. Roughly 85% opt in.
pub fn seed_demo_population(
    store: &InsightsStore,
    seed: u64,
    subjects: usize,
    start: NaiveDate,
    days: u32,
    at: DateTime<Utc>,
) -> EngineResult<DemoPopulation> {
    let mut rng = NoiseRng::seeded(seed).with_name("demo");
    let span = u64::from(days.max(1));
    let mut records = Vec::new();
    let mut opted_in = 0;

    for n in 0..subjects {
        let subject_id = format!("subject-{n:05}");
        let consents = rng.chance(0.85);
        store.set_consent(&subject_id, consents, at)?;
        if consents {
            opted_in += 1;
        }

        let assessments = 1 + rng.next_u64_below(4);
        let conversations = rng.next_u64_below(4);
        for i in 0..(assessments + conversations) {
            let kind = if i < assessments {
                RecordKind::Assessment
            } else {
                RecordKind::Conversation
            };
            let severity = pick_severity(&mut rng);
            let risk_level = risk_for(&mut rng, severity);
            let occurred_on = start + Duration::days(rng.next_u64_below(span) as i64);
            let topic = match kind {
                RecordKind::Conversation => {
                    Some(TOPICS[rng.next_u64_below(TOPICS.len() as u64) as usize].to_string())
                }
                RecordKind::Assessment => None,
            };
            records.push(SourceRecord {
                record_id: format!("{subject_id}-{i:02}"),
                subject_id: subject_id.clone(),
                kind,
                occurred_on,
                severity,
                risk_level,
                topic,
                sentiment: rng.next_f64() * 2.0 - 1.0,
            });
        }
    }

    store.insert_source_records(&records)?;
    log::info!(
        "demo population seeded: {subjects} subjects ({opted_in} opted in), {} records",
        records.len()
    );
    Ok(DemoPopulation {
        subjects,
        opted_in,
        records: records.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_population() {
        let start = NaiveDate::from_ymd_opt(2026, 9, 1).unwrap();
        let at = Utc::now();
        let a = InsightsStore::in_memory().unwrap();
        a.migrate().unwrap();
        let b = InsightsStore::in_memory().unwrap();
        b.migrate().unwrap();

        let pa = seed_demo_population(&a, 7, 40, start, 30, at).unwrap();
        let pb = seed_demo_population(&b, 7, 40, start, 30, at).unwrap();
        assert_eq!(pa, pb);
        assert_eq!(pa.subjects, 40);
        assert!(pa.records >= 40);
        assert_eq!(a.source_record_count().unwrap(), pa.records as i64);
    }
}
