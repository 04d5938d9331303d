//! Insights report tests: storage round-trip, pagination, generation, scheduling.

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use insights_core::{
    clock::ManualClock,
    config::EngineConfig,
    executor::QueryExecutor,
    noise::NoiseInjector,
    record::{RecordKind, RiskLevel, Severity, SourceRecord},
    report::{InsightsReport, ReportGenerator, ReportType, SentimentData, TrendingTopic},
    rng::ConstantSource,
    scheduler::ReportScheduler,
    store::InsightsStore,
    EngineError,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Barrier};
use std::thread;

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn store() -> InsightsStore {
    let store = InsightsStore::in_memory().unwrap();
    store.migrate().unwrap();
    store
}

fn sample_report(id: &str, minutes: i64) -> InsightsReport {
    let mut severity_distribution = BTreeMap::new();
    severity_distribution.insert("low".to_string(), 12);
    severity_distribution.insert("moderate".to_string(), 7);
    InsightsReport {
        id: id.to_string(),
        report_type: ReportType::Weekly,
        period_start: d(2026, 10, 5),
        period_end: d(2026, 10, 11),
        generated_at: Utc.with_ymd_and_hms(2026, 10, 12, 6, 0, 0).unwrap()
            + Duration::minutes(minutes)
            + Duration::nanoseconds(123_456_789),
        summary: "weekly insights".into(),
        sentiment_data: SentimentData {
            avg_sentiment: Some(-0.25),
            avg_risk: Some(0.5),
            severity_distribution,
            detected_patterns: vec!["critical_cases_present".into()],
            recommendations: vec!["Confirm escalation coverage for critical cases".into()],
        },
        trending_topics: vec![
            TrendingTopic { topic: "sleep".into(), mentions: 9 },
            TrendingTopic { topic: "work stress".into(), mentions: 6 },
        ],
        assessment_count: 19,
        high_risk_count: 0,
    }
}

#[test]
fn stored_report_reads_back_identically() {
    let store = store();
    let report = sample_report("r-1", 0);
    store.create_report(&report).unwrap();
    assert_eq!(store.get_report("r-1").unwrap(), report);
}

#[test]
fn missing_report_is_not_found() {
    let store = store();
    assert!(matches!(
        store.get_report("nope"),
        Err(EngineError::ReportNotFound { ref id }) if id == "nope"
    ));
}

#[test]
fn reports_are_immutable() {
    let store = store();
    store.create_report(&sample_report("r-1", 0)).unwrap();
    // Same id again is a persistence failure, not an overwrite.
    assert!(matches!(
        store.create_report(&sample_report("r-1", 5)),
        Err(EngineError::PersistenceFailure(_))
    ));
    assert_eq!(store.report_count().unwrap(), 1);
}

/// Walking every page visits each report exactly once, newest first.
#[test]
fn pagination_is_an_exact_cover() {
    let store = store();
    // Two reports share each generated_at so the id tie-break matters.
    for i in 0..23 {
        let mut r = sample_report(&format!("r-{i:02}"), (i / 2) as i64);
        if i % 3 == 0 {
            r.report_type = ReportType::Monthly;
        }
        store.create_report(&r).unwrap();
    }

    let mut seen = Vec::new();
    let mut offset = 0;
    loop {
        let page = store.list_reports(None, 5, offset).unwrap();
        assert_eq!(page.total, 23);
        if page.reports.is_empty() {
            break;
        }
        offset += page.reports.len() as u32;
        seen.extend(page.reports);
    }
    assert_eq!(seen.len(), 23);
    let unique: HashSet<&str> = seen.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(unique.len(), 23);
    for pair in seen.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        assert!((a.generated_at, &a.id) > (b.generated_at, &b.id), "{} before {}", a.id, b.id);
    }

    let monthly = store.list_reports(Some(ReportType::Monthly), 100, 0).unwrap();
    assert_eq!(monthly.total, 8);
    assert!(monthly.reports.iter().all(|r| r.report_type == ReportType::Monthly));
}

// ── Generation ─────────────────────────────────────────────────────

/// Executor with exact counts over a week of assessments and conversations.
fn report_fixture(today: NaiveDate) -> (Arc<QueryExecutor>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at_date(today));
    let exec = QueryExecutor::build_test_with(
        &EngineConfig::default_test(),
        NoiseInjector::new(Box::new(ConstantSource(0.5))),
        clock.clone(),
    )
    .unwrap();
    let at = Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).unwrap();
    let mut records = Vec::new();
    // 10 low, 6 high, 5 critical assessments in the week of 2026-10-05.
    let cohorts = [(Severity::Low, 10), (Severity::High, 6), (Severity::Critical, 5)];
    let mut n = 0;
    for (severity, count) in cohorts {
        for _ in 0..count {
            let subject = format!("s-{n:02}");
            exec.store().set_consent(&subject, true, at).unwrap();
            records.push(SourceRecord {
                record_id: format!("{subject}-a"),
                subject_id: subject.clone(),
                kind: RecordKind::Assessment,
                occurred_on: d(2026, 10, 6),
                severity,
                risk_level: RiskLevel::parse(severity.as_str()).unwrap(),
                topic: None,
                sentiment: 0.0,
            });
            // The first 14 subjects also talked about sleep, negatively.
            if n < 14 {
                records.push(SourceRecord {
                    record_id: format!("{subject}-c"),
                    subject_id: subject,
                    kind: RecordKind::Conversation,
                    occurred_on: d(2026, 10, 8),
                    severity,
                    risk_level: RiskLevel::Low,
                    topic: Some("Sleep".into()),
                    sentiment: -0.7,
                });
            }
            n += 1;
        }
    }
    exec.store().insert_source_records(&records).unwrap();
    (Arc::new(exec), clock)
}

#[test]
fn generated_report_composes_released_sections() {
    let (exec, _clock) = report_fixture(d(2026, 10, 12));
    let generator = ReportGenerator::new(exec.clone(), EngineConfig::default_test().reports);

    let report = generator
        .generate(ReportType::AdHoc, d(2026, 10, 5), d(2026, 10, 11), "admin")
        .unwrap();

    assert_eq!(report.assessment_count, 21);
    assert_eq!(report.high_risk_count, 11);
    assert_eq!(report.sentiment_data.severity_distribution["critical"], 5);
    // (10·0.25 + 6·0.75 + 5·1.0) / 21
    assert_eq!(report.sentiment_data.avg_risk, Some(0.5714));
    assert_eq!(report.sentiment_data.avg_sentiment, Some(-0.6));
    assert_eq!(
        report.trending_topics,
        vec![TrendingTopic { topic: "sleep".into(), mentions: 14 }]
    );
    assert_eq!(
        report.sentiment_data.detected_patterns,
        vec![
            "elevated_high_risk_share".to_string(),
            "negative_sentiment_dominant".to_string(),
            "critical_cases_present".to_string(),
        ]
    );
    assert_eq!(report.sentiment_data.recommendations.len(), 3);
    assert_eq!(report.generated_at, exec.clock().now());

    assert_eq!(exec.store().get_report(&report.id).unwrap(), report);
    // Four section queries: 0.05 + 0.05 + 0.08 + 0.05.
    let used = exec.ledger().snapshot().epsilon_used;
    assert!((used - 0.23).abs() < 1e-9, "{used}");
}

#[test]
fn empty_period_stores_nothing() {
    let (exec, _clock) = report_fixture(d(2026, 10, 12));
    let generator = ReportGenerator::new(exec.clone(), EngineConfig::default_test().reports);

    let err = generator
        .generate(ReportType::AdHoc, d(2026, 1, 1), d(2026, 1, 31), "admin")
        .unwrap_err();
    assert!(err.is_insufficient_data(), "{err}");
    assert_eq!(exec.store().report_count().unwrap(), 0);
    assert_eq!(exec.ledger().snapshot().epsilon_used, 0.0);
}

#[test]
fn generation_stops_on_budget_exhaustion() {
    let (exec, _clock) = report_fixture(d(2026, 10, 12));
    // Leave less than one section's worth.
    exec.ledger().reserve(0.99, 0.0).unwrap().commit();
    let generator = ReportGenerator::new(exec.clone(), EngineConfig::default_test().reports);

    let err = generator
        .generate(ReportType::Weekly, d(2026, 10, 5), d(2026, 10, 11), "admin")
        .unwrap_err();
    assert!(matches!(err, EngineError::BudgetExhausted { .. }));
    assert_eq!(exec.store().report_count().unwrap(), 0);
}

/// Sections run one after another; the report must still be charged in full or not at all.
#[test]
fn report_that_cannot_be_paid_for_spends_nothing() {
    let (exec, _clock) = report_fixture(d(2026, 10, 12));
    // 0.20 left: enough for the first three sections (0.18), not all four.
    exec.ledger().reserve(0.80, 0.0).unwrap().commit();
    let generator = ReportGenerator::new(exec.clone(), EngineConfig::default_test().reports);

    let err = generator
        .generate(ReportType::Weekly, d(2026, 10, 5), d(2026, 10, 11), "admin")
        .unwrap_err();
    assert!(matches!(err, EngineError::BudgetExhausted { .. }), "{err}");
    let snap = exec.ledger().snapshot();
    assert!((snap.epsilon_used - 0.80).abs() < 1e-9, "{}", snap.epsilon_used);
    assert_eq!(snap.epsilon_used, snap.epsilon_committed);
    assert_eq!(snap.open_reservations, 0);
    assert_eq!(exec.store().report_count().unwrap(), 0);
    assert_eq!(exec.store().query_audit_count().unwrap(), 0);
}

/// Sections with insufficient data give their share of the hold back.
#[test]
fn empty_sections_are_not_charged() {
    let (exec, _clock) = report_fixture(d(2026, 10, 12));
    let generator = ReportGenerator::new(exec.clone(), EngineConfig::default_test().reports);

    // Conversations fall on 2026-10-08, outside this range.
    let report = generator
        .generate(ReportType::AdHoc, d(2026, 10, 5), d(2026, 10, 7), "admin")
        .unwrap();
    assert_eq!(report.assessment_count, 21);
    assert!(report.trending_topics.is_empty());
    assert_eq!(report.sentiment_data.avg_sentiment, None);

    let snap = exec.ledger().snapshot();
    assert!((snap.epsilon_used - 0.10).abs() < 1e-9, "{}", snap.epsilon_used);
    assert_eq!(snap.epsilon_used, snap.epsilon_committed);
    assert_eq!(snap.open_reservations, 0);
    let charged = exec.store().audited_epsilon("2026-10").unwrap();
    assert!((charged - 0.10).abs() < 1e-9, "{charged}");
}

#[test]
fn scheduler_does_not_double_generate() {
    // 2026-10-12 is a Monday.
    let (exec, _clock) = report_fixture(d(2026, 10, 12));
    let scheduler = ReportScheduler::new(ReportGenerator::new(
        exec.clone(),
        EngineConfig::default_test().reports,
    ));

    let first = scheduler.run_due(d(2026, 10, 12)).unwrap();
    assert_eq!(first.generated.len(), 1);
    let weekly = &first.generated[0];
    assert_eq!(weekly.report_type, ReportType::Weekly);
    assert_eq!(weekly.period_start, d(2026, 10, 5));
    assert_eq!(weekly.period_end, d(2026, 10, 11));

    let second = scheduler.run_due(d(2026, 10, 12)).unwrap();
    assert!(second.generated.is_empty());
    assert_eq!(second.already_present.len(), 1);
    assert_eq!(exec.store().report_count().unwrap(), 1);

    // Nothing is due mid-week.
    let midweek = scheduler.run_due(d(2026, 10, 14)).unwrap();
    assert!(midweek.generated.is_empty() && midweek.already_present.is_empty());
}

#[test]
fn scheduler_records_failed_periods() {
    // 2026-11-01 is a Sunday: only the October monthly report is due.
    let (exec, _clock) = report_fixture(d(2026, 11, 1));
    let scheduler = ReportScheduler::new(ReportGenerator::new(
        exec.clone(),
        EngineConfig::default_test().reports,
    ));
    let run = scheduler.run_due(d(2026, 11, 1)).unwrap();
    assert_eq!(run.generated.len(), 1);
    assert_eq!(run.generated[0].report_type, ReportType::Monthly);
    assert_eq!(run.generated[0].period_start, d(2026, 10, 1));
    assert_eq!(run.generated[0].period_end, d(2026, 10, 31));

    // September has no data: the attempt is recorded, nothing is stored.
    let (exec, _clock) = report_fixture(d(2026, 10, 1));
    let scheduler = ReportScheduler::new(ReportGenerator::new(
        exec.clone(),
        EngineConfig::default_test().reports,
    ));
    let run = scheduler.run_due(d(2026, 10, 1)).unwrap();
    assert!(run.generated.is_empty());
    assert_eq!(run.failed.len(), 1);
    assert_eq!(exec.store().report_count().unwrap(), 0);
}

#[test]
fn concurrent_schedule_runs_generate_once() {
    for _ in 0..10 {
        let (exec, _clock) = report_fixture(d(2026, 10, 12));
        let scheduler = Arc::new(ReportScheduler::new(ReportGenerator::new(
            exec.clone(),
            EngineConfig::default_test().reports,
        )));
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let scheduler = scheduler.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    scheduler.run_due(d(2026, 10, 12)).unwrap()
                })
            })
            .collect();
        let runs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let generated: usize = runs.iter().map(|r| r.generated.len()).sum();
        let present: usize = runs.iter().map(|r| r.already_present.len()).sum();
        assert_eq!((generated, present), (1, 1));
        assert_eq!(exec.store().report_count().unwrap(), 1);
        let used = exec.ledger().snapshot().epsilon_used;
        assert!((used - 0.23).abs() < 1e-9, "{used}");
    }
}
